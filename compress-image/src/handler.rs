use crate::config::{Config, ConfigError};
use crate::error::{classify, is_client_error, ErrorKind, PipelineError};
use crate::resize::{ImageProcessor, ProcessingResult, TargetDimensions};
use crate::store::{ObjectStore, ObjectStoreClient};
use crate::validation::{validate_key, validate_notification, Notification};
use lambda_runtime::{Context, Error, LambdaEvent};
use serde::Serialize;
use serde_json::Value;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, field, info, info_span, Instrument, Level, Span};

/// Time kept back from the platform deadline to log and answer.
const DEADLINE_MARGIN: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validating,
    Downloading,
    Processing,
    Uploading,
    Done,
}

impl Stage {
    fn as_str(self) -> &'static str {
        match self {
            Stage::Validating => "validating",
            Stage::Downloading => "downloading",
            Stage::Processing => "processing",
            Stage::Uploading => "uploading",
            Stage::Done => "done",
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub status_code: u16,
    pub body: ResponseBody,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ResponseBody {
    Success(SuccessBody),
    Failure(FailureBody),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessBody {
    pub message: String,
    pub original_key: String,
    pub new_dimensions: TargetDimensions,
    pub destination_url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureBody {
    pub message: String,
    pub error: String,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<u64>,
}

impl Response {
    fn success(processed: Processed) -> Self {
        Self {
            status_code: 200,
            body: ResponseBody::Success(SuccessBody {
                message: "Image processed successfully".to_string(),
                original_key: processed.original_key,
                new_dimensions: processed.new_dimensions,
                destination_url: processed.destination_url,
            }),
        }
    }

    fn bad_request(error: String, request_id: String) -> Self {
        Self {
            status_code: 400,
            body: ResponseBody::Failure(FailureBody {
                message: "Validation error".to_string(),
                error,
                request_id,
                processing_time_ms: None,
            }),
        }
    }

    fn internal_error(error: String, request_id: String, processing_time_ms: u64) -> Self {
        Self {
            status_code: 500,
            body: ResponseBody::Failure(FailureBody {
                message: "Internal server error".to_string(),
                error,
                request_id,
                processing_time_ms: Some(processing_time_ms),
            }),
        }
    }
}

struct Processed {
    original_key: String,
    new_dimensions: TargetDimensions,
    destination_url: String,
}

pub(crate) async fn function_handler<S: ObjectStore>(event: LambdaEvent<Value>, store: &S) -> Result<Response, Error> {
    let LambdaEvent { payload, context } = event;
    Ok(handle(payload, &context, Config::from_env(), store).await)
}

/// Runs one invocation and turns every expected failure into a response.
pub(crate) async fn handle<S: ObjectStore + ?Sized>(
    payload: Value,
    context: &Context,
    config: Result<Config, ConfigError>,
    store: &S,
) -> Response {
    let span = info_span!(
        "image_compression",
        request_id = %context.request_id,
        stage = field::Empty,
    );
    invoke(payload, context, config, store).instrument(span).await
}

async fn invoke<S: ObjectStore + ?Sized>(
    payload: Value,
    context: &Context,
    config: Result<Config, ConfigError>,
    store: &S,
) -> Response {
    let started = std::time::Instant::now();
    let deadline = invocation_deadline(context);
    info!(
        remaining_ms = ?deadline.map(|d| d.saturating_duration_since(Instant::now()).as_millis() as u64),
        "invocation started"
    );

    let mut pipeline = Pipeline {
        store,
        stage: Stage::Validating,
        source: None,
    };
    // Validation is pure and runs outside the deadline so that a bad event
    // always gets its 400.
    let outcome = match pipeline.validate(payload, config) {
        Err(err) => Err(err),
        Ok((config, notification)) => match deadline {
            Some(deadline) => timeout_at(deadline, pipeline.run(&config, notification, Some(deadline)))
                .await
                .unwrap_or_else(|_| {
                    Err(anyhow::Error::new(PipelineError::non_retryable(
                        ErrorKind::Network,
                        "processing deadline exceeded (timeout)",
                    )))
                }),
            None => pipeline.run(&config, notification, None).await,
        },
    };

    let request_id = context.request_id.clone();
    let processing_time_ms = started.elapsed().as_millis() as u64;
    match outcome {
        Ok(processed) => {
            info!(
                key = %processed.original_key,
                width = processed.new_dimensions.width,
                height = processed.new_dimensions.height,
                destination_url = %processed.destination_url,
                processing_time_ms,
                "image processing completed successfully"
            );
            Response::success(processed)
        }
        Err(err) if is_client_error(&err) => {
            let error = format!("{err:#}");
            error!(stage = pipeline.stage.as_str(), error = %error, "validation error");
            Response::bad_request(error, request_id)
        }
        Err(err) => {
            let error = format!("{err:#}");
            let classification = classify(&err);
            let (bucket, key) = pipeline
                .source
                .as_ref()
                .map(|n| (n.bucket.as_str(), n.key.as_str()))
                .unwrap_or_default();
            error!(
                stage = pipeline.stage.as_str(),
                kind = %classification.kind,
                retryable = classification.retryable,
                bucket,
                key,
                processing_time_ms,
                error = %error,
                "invocation failed"
            );
            Response::internal_error(error, request_id, processing_time_ms)
        }
    }
}

/// Converts the platform's epoch-millisecond deadline to a monotonic
/// instant, less [`DEADLINE_MARGIN`]. Zero means no deadline.
fn invocation_deadline(context: &Context) -> Option<Instant> {
    if context.deadline == 0 {
        return None;
    }
    let deadline = UNIX_EPOCH + Duration::from_millis(context.deadline);
    let remaining = deadline.duration_since(SystemTime::now()).unwrap_or_default();
    Some(Instant::now() + remaining.saturating_sub(DEADLINE_MARGIN))
}

struct Pipeline<'a, S: ?Sized> {
    store: &'a S,
    stage: Stage,
    source: Option<Notification>,
}

impl<'a, S: ObjectStore + ?Sized> Pipeline<'a, S> {
    fn enter(&mut self, stage: Stage) {
        self.stage = stage;
        Span::current().record("stage", stage.as_str());
        debug!(stage = stage.as_str(), "entering stage");
    }

    fn validate(
        &mut self,
        payload: Value,
        config: Result<Config, ConfigError>,
    ) -> anyhow::Result<(Config, Notification)> {
        self.enter(Stage::Validating);
        let config = config?;
        let notification = validate_notification(payload)?;
        validate_key(&notification.key)?;
        info!(bucket = %notification.bucket, key = %notification.key, "processing S3 event");
        self.source = Some(notification.clone());
        Ok((config, notification))
    }

    async fn run(
        &mut self,
        config: &Config,
        notification: Notification,
        deadline: Option<Instant>,
    ) -> anyhow::Result<Processed> {
        let Notification { bucket, key } = notification;

        let store = ObjectStoreClient::new(self.store, &config.destination_bucket).with_deadline(deadline);
        let processor = ImageProcessor::new(&config.destination_bucket);

        self.enter(Stage::Downloading);
        let original = store.download(&bucket, &key).await?;

        self.enter(Stage::Processing);
        let result = processor.process(original, &key).await;
        if !result.success {
            let error = result
                .error
                .unwrap_or_else(|| "Image processing failed".to_string());
            return Err(PipelineError::non_retryable(ErrorKind::ImageProcessing, error).into());
        }
        let ProcessingResult {
            original_key,
            new_dimensions,
            source,
            processed_buffer,
            destination_url,
            ..
        } = result;
        debug!(?source, "source image decoded");
        let buffer = processed_buffer.ok_or_else(|| {
            PipelineError::non_retryable(
                ErrorKind::ImageProcessing,
                "No processed image buffer available for upload",
            )
        })?;

        self.enter(Stage::Uploading);
        // Costs a HeadObject, so only probed when someone is reading debug logs.
        if tracing::enabled!(Level::DEBUG) && store.exists(&config.destination_bucket, &original_key).await {
            debug!(key = %original_key, "destination object exists and will be replaced");
        }
        debug!(destination_url = ?destination_url, "uploading processed image");
        let destination_url = store.upload(&original_key, buffer).await?;

        self.enter(Stage::Done);
        Ok(Processed {
            original_key,
            new_dimensions,
            destination_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DESTINATION_BUCKET_VAR;
    use crate::resize::tests::sample_image;
    use crate::store::testing::{Call, MemoryStore};
    use image::ImageOutputFormat;
    use serde_json::json;

    fn event(bucket: &str, key: &str) -> Value {
        json!({ "Records": [{ "s3": { "bucket": { "name": bucket }, "object": { "key": key } } }] })
    }

    fn context() -> Context {
        let mut context = Context::default();
        context.request_id = "req-123".to_string();
        context
    }

    fn config() -> Result<Config, ConfigError> {
        Ok(Config {
            destination_bucket: "dst".to_string(),
        })
    }

    fn puts(store: &MemoryStore) -> usize {
        store.calls().iter().filter(|c| matches!(c, Call::Put { .. })).count()
    }

    #[tokio::test]
    async fn processes_and_uploads_an_image() {
        let input = sample_image(640, 480, ImageOutputFormat::Png);
        let store = MemoryStore::default().with_object("src", "photos/cat.png", input);

        let response = handle(event("src", "photos/cat.png"), &context(), config(), &store).await;
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({
                "statusCode": 200,
                "body": {
                    "message": "Image processed successfully",
                    "originalKey": "photos/cat.png",
                    "newDimensions": { "width": 640, "height": 480 },
                    "destinationUrl": "https://dst.s3.amazonaws.com/photos/cat.png"
                }
            })
        );

        let output = store.object("dst", "photos/cat.png").unwrap();
        assert_eq!(image::guess_format(&output).unwrap(), image::ImageFormat::Jpeg);
        assert_eq!(puts(&store), 1);
    }

    #[tokio::test]
    async fn decodes_the_key_before_fetching() {
        let input = sample_image(8, 8, ImageOutputFormat::Png);
        let store = MemoryStore::default().with_object("src", "photos/my cat.png", input);

        let response = handle(event("src", "photos/my+cat.png"), &context(), config(), &store).await;
        assert_eq!(response.status_code, 200);
        assert!(store.object("dst", "photos/my cat.png").is_some());
    }

    #[tokio::test]
    async fn missing_config_fails_before_any_io() {
        let store = MemoryStore::default();
        let config = Config::from_lookup(|_| None);

        let response = handle(event("src", "photos/cat.png"), &context(), config, &store).await;
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({
                "statusCode": 400,
                "body": {
                    "message": "Validation error",
                    "error": format!("{DESTINATION_BUCKET_VAR} environment variable is not set"),
                    "requestId": "req-123"
                }
            })
        );
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn malformed_events_are_rejected() {
        let store = MemoryStore::default();
        for payload in [json!({}), json!({ "Records": [] }), json!({ "Records": [{ "s3": {} }] })] {
            let response = handle(payload, &context(), config(), &store).await;
            assert_eq!(response.status_code, 400);
        }
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn keys_outside_the_prefix_are_rejected() {
        let store = MemoryStore::default();
        let response = handle(event("src", "images/cat.png"), &context(), config(), &store).await;

        assert_eq!(response.status_code, 400);
        let ResponseBody::Failure(body) = response.body else {
            panic!("expected a failure body");
        };
        assert_eq!(body.error, "Image key 'images/cat.png' is not in the photos/ prefix");
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn undecodable_images_fail_without_upload() {
        let store = MemoryStore::default().with_object("src", "photos/cat.jpg", &b"not a jpeg"[..]);

        let response = handle(event("src", "photos/cat.jpg"), &context(), config(), &store).await;
        assert_eq!(response.status_code, 500);
        let ResponseBody::Failure(body) = response.body else {
            panic!("expected a failure body");
        };
        assert_eq!(body.message, "Internal server error");
        assert_eq!(body.request_id, "req-123");
        assert!(body.error.contains("unrecognised image format"));
        assert!(body.processing_time_ms.is_some());
        assert_eq!(puts(&store), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_download_retries_become_a_server_error() {
        let store = MemoryStore::default().failing_gets(&["connection reset"; 4]);

        let response = handle(event("src", "photos/cat.jpg"), &context(), config(), &store).await;
        assert_eq!(response.status_code, 500);
        let gets = store.calls().iter().filter(|c| matches!(c, Call::Get { .. })).count();
        assert_eq!(gets, 4);
        assert_eq!(puts(&store), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_stop_at_the_invocation_deadline() {
        let store = MemoryStore::default().failing_gets(&["connection reset"; 4]);
        let mut context = context();
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap();
        context.deadline = (now + Duration::from_secs(3)).as_millis() as u64;

        let response = handle(event("src", "photos/cat.jpg"), &context, config(), &store).await;
        assert_eq!(response.status_code, 500);
        // 1s backoff fits before the deadline, the following 2s backoff does not.
        let gets = store.calls().iter().filter(|c| matches!(c, Call::Get { .. })).count();
        assert_eq!(gets, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn validation_errors_win_over_an_expired_deadline() {
        let store = MemoryStore::default();
        let mut context = context();
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap();
        context.deadline = (now + Duration::from_millis(100)).as_millis() as u64;

        let response = handle(event("src", "images/cat.png"), &context, config(), &store).await;
        assert_eq!(response.status_code, 400);

        let response = handle(event("src", "photos/cat.png"), &context, Config::from_lookup(|_| None), &store).await;
        assert_eq!(response.status_code, 400);
        assert!(store.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn an_expired_deadline_fails_valid_events() {
        let store = MemoryStore::default();
        let mut context = context();
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap();
        context.deadline = (now + Duration::from_millis(100)).as_millis() as u64;

        let response = handle(event("src", "photos/cat.png"), &context, config(), &store).await;
        assert_eq!(response.status_code, 500);
        assert_eq!(puts(&store), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn replaces_an_existing_destination_object() {
        let input = sample_image(8, 8, ImageOutputFormat::Png);
        let store = MemoryStore::default()
            .with_object("src", "photos/cat.png", input)
            .with_object("dst", "photos/cat.png", &b"stale"[..])
            .failing_puts(&["S3 SlowDown"]);

        let response = handle(event("src", "photos/cat.png"), &context(), config(), &store).await;
        assert_eq!(response.status_code, 200);
        assert_eq!(puts(&store), 2);
        assert_ne!(store.object("dst", "photos/cat.png").unwrap(), &b"stale"[..]);
    }
}
