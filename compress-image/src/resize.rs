use crate::store::public_url;
use anyhow::{Context, Result};
use fast_image_resize::{FilterType, PixelType, ResizeAlg};
use image::GenericImageView;
use jpeg_encoder::{ColorType, Encoder};
use tracing::{debug, error, info};

pub const MAX_DIMENSION: u32 = 4096;
pub const JPEG_QUALITY: u8 = 80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMetadata {
    pub width: u32,
    pub height: u32,
    pub format: String,
    pub size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct TargetDimensions {
    pub width: u32,
    pub height: u32,
}

/// Outcome of one processing run. A failed decode or encode is reported
/// here rather than as an `Err`.
#[derive(Debug)]
pub struct ProcessingResult {
    pub success: bool,
    pub original_key: String,
    pub new_dimensions: TargetDimensions,
    pub source: Option<ImageMetadata>,
    pub processed_buffer: Option<Vec<u8>>,
    pub destination_url: Option<String>,
    pub error: Option<String>,
}

impl ProcessingResult {
    fn failed(original_key: &str, error: String) -> Self {
        Self {
            success: false,
            original_key: original_key.to_string(),
            new_dimensions: TargetDimensions { width: 0, height: 0 },
            source: None,
            processed_buffer: None,
            destination_url: None,
            error: Some(error),
        }
    }
}

/// Scales `(width, height)` down so neither side exceeds `max_dimension`,
/// keeping the aspect ratio. Never upscales.
pub fn target_dimensions(width: u32, height: u32, max_dimension: u32) -> TargetDimensions {
    if width <= max_dimension && height <= max_dimension {
        return TargetDimensions { width, height };
    }

    let scale = |short: u32, long: u32| {
        ((short as f64 * max_dimension as f64 / long as f64).round() as u32).max(1)
    };
    if width > height {
        TargetDimensions {
            width: max_dimension,
            height: scale(height, width),
        }
    } else {
        TargetDimensions {
            width: scale(width, height),
            height: max_dimension,
        }
    }
}

struct Encoded {
    metadata: ImageMetadata,
    dimensions: TargetDimensions,
    data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ImageProcessor {
    destination_bucket: String,
    max_dimension: u32,
    quality: u8,
}

impl ImageProcessor {
    pub fn new(destination_bucket: &str) -> Self {
        Self {
            destination_bucket: destination_bucket.to_string(),
            max_dimension: MAX_DIMENSION,
            quality: JPEG_QUALITY,
        }
    }

    /// Decodes, downsizes and re-encodes `input` as JPEG. CPU work runs on
    /// the blocking pool.
    pub async fn process(&self, input: Vec<u8>, original_key: &str) -> ProcessingResult {
        info!(key = original_key, size = input.len(), "starting image processing");

        let processor = self.clone();
        let outcome = tokio::task::spawn_blocking(move || processor.transcode(&input))
            .await
            .context("image processing task failed")
            .and_then(|encoded| encoded);

        let encoded = match outcome {
            Ok(encoded) => encoded,
            Err(err) => {
                let error = format!("{err:#}");
                error!(key = original_key, error = %error, "image processing failed");
                return ProcessingResult::failed(original_key, error);
            }
        };

        let Encoded {
            metadata,
            dimensions,
            data,
        } = encoded;
        let compression_ratio = (metadata.size as f64 - data.len() as f64) / metadata.size as f64;
        info!(
            key = original_key,
            format = %metadata.format,
            original_width = metadata.width,
            original_height = metadata.height,
            width = dimensions.width,
            height = dimensions.height,
            original_size = metadata.size,
            new_size = data.len(),
            compression = %format!("{:.2}%", compression_ratio * 100.0),
            "image processing completed"
        );

        ProcessingResult {
            success: true,
            original_key: original_key.to_string(),
            new_dimensions: dimensions,
            source: Some(metadata),
            processed_buffer: Some(data),
            destination_url: Some(public_url(&self.destination_bucket, original_key)),
            error: None,
        }
    }

    fn transcode(&self, input: &[u8]) -> Result<Encoded> {
        let input_kb = input.len() as f32 / 1024.0;
        let format = image::guess_format(input).context("unrecognised image format")?;
        debug!("Input {format:?} size: {input_kb:.2}KiB");

        let loaded_image =
            image::load_from_memory_with_format(input, format).context("failed to decode image")?;
        let (width, height) = loaded_image.dimensions();
        let metadata = ImageMetadata {
            width,
            height,
            format: format!("{format:?}").to_lowercase(),
            size: input.len(),
        };
        debug!(?metadata, "image metadata read");

        let dimensions = target_dimensions(width, height, self.max_dimension);
        let pixels = loaded_image.to_rgb8().into_raw();

        let data = if dimensions == (TargetDimensions { width, height }) {
            self.encode_jpeg(&pixels, dimensions)?
        } else {
            let resized = resize_rgb(pixels, TargetDimensions { width, height }, dimensions)?;
            self.encode_jpeg(resized.buffer(), dimensions)?
        };

        let output_kb = data.len() as f32 / 1024.0;
        debug!("Output size: {output_kb:.2}KiB");

        Ok(Encoded {
            metadata,
            dimensions,
            data,
        })
    }

    /// Progressive JPEG with optimized Huffman tables.
    fn encode_jpeg(&self, pixels: &[u8], dimensions: TargetDimensions) -> Result<Vec<u8>> {
        let width = u16::try_from(dimensions.width).context("image too wide to encode")?;
        let height = u16::try_from(dimensions.height).context("image too tall to encode")?;

        let mut result_buf = Vec::new();
        let mut encoder = Encoder::new(&mut result_buf, self.quality);
        encoder.set_progressive(true);
        encoder.set_optimized_huffman_tables(true);
        encoder
            .encode(pixels, width, height, ColorType::Rgb)
            .context("failed to encode JPEG")?;
        Ok(result_buf)
    }
}

fn resize_rgb(
    pixels: Vec<u8>,
    source: TargetDimensions,
    target: TargetDimensions,
) -> Result<fast_image_resize::Image<'static>> {
    let src_image = fast_image_resize::Image::from_vec_u8(
        source.width.try_into()?,
        source.height.try_into()?,
        pixels,
        PixelType::U8x3,
    )?;

    let mut dst_image = fast_image_resize::Image::new(
        target.width.try_into()?,
        target.height.try_into()?,
        src_image.pixel_type(),
    );

    let mut resizer = fast_image_resize::Resizer::new(ResizeAlg::Convolution(FilterType::Lanczos3));

    debug!(
        "Resizing {}x{} -> {}x{} using:{:?} cpu:{:?}",
        src_image.width(),
        src_image.height(),
        dst_image.width(),
        dst_image.height(),
        resizer.algorithm,
        resizer.cpu_extensions()
    );

    resizer.resize(&src_image.view(), &mut dst_image.view_mut())?;

    Ok(dst_image)
}
