use crate::error::{ErrorKind, PipelineError};
use crate::retry::{with_retry, RetryPolicy};
use anyhow::Context;
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

pub const TRANSFER_RETRY_POLICY: RetryPolicy =
    RetryPolicy::new(3, Duration::from_millis(1000), Duration::from_millis(5000), 2.0);

pub const OUTPUT_CONTENT_TYPE: &str = "image/jpeg";
pub const OUTPUT_CACHE_CONTROL: &str = "max-age=31536000";
const PROCESSED_BY: &str = env!("CARGO_PKG_NAME");

/// Headers and user metadata stored alongside an uploaded object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub content_type: String,
    pub cache_control: String,
    pub metadata: Vec<(String, String)>,
}

/// The raw blob store calls the pipeline needs.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_object(&self, bucket: &str, key: &str) -> anyhow::Result<Bytes>;

    async fn put_object(&self, bucket: &str, key: &str, body: Bytes, meta: &ObjectMeta) -> anyhow::Result<()>;

    async fn head_object(&self, bucket: &str, key: &str) -> anyhow::Result<()>;
}

#[async_trait]
impl ObjectStore for aws_sdk_s3::Client {
    async fn get_object(&self, bucket: &str, key: &str) -> anyhow::Result<Bytes> {
        let s3object = self
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .context("S3 GetObject request failed")?;
        let data = s3object
            .body
            .collect()
            .await
            .context("S3 GetObject body could not be read")?;

        Ok(data.into_bytes())
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Bytes, meta: &ObjectMeta) -> anyhow::Result<()> {
        let mut command = self
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(&meta.content_type)
            .cache_control(&meta.cache_control);
        for (name, value) in &meta.metadata {
            command = command.metadata(name, value);
        }
        command.send().await.context("S3 PutObject request failed")?;

        Ok(())
    }

    async fn head_object(&self, bucket: &str, key: &str) -> anyhow::Result<()> {
        self.head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .context("S3 HeadObject request failed")?;

        Ok(())
    }
}

pub fn public_url(bucket: &str, key: &str) -> String {
    format!("https://{bucket}.s3.amazonaws.com/{key}")
}

/// Download/upload with retries on top of an injected [`ObjectStore`].
pub struct ObjectStoreClient<'a, S: ?Sized> {
    store: &'a S,
    destination_bucket: &'a str,
    policy: RetryPolicy,
}

impl<'a, S: ObjectStore + ?Sized> ObjectStoreClient<'a, S> {
    pub fn new(store: &'a S, destination_bucket: &'a str) -> Self {
        Self {
            store,
            destination_bucket,
            policy: TRANSFER_RETRY_POLICY,
        }
    }

    pub fn with_deadline(self, deadline: Option<Instant>) -> Self {
        Self {
            policy: self.policy.until(deadline),
            ..self
        }
    }

    pub async fn download(&self, bucket: &str, key: &str) -> anyhow::Result<Vec<u8>> {
        let data = with_retry("download", &self.policy, || async {
            debug!(bucket, key, "downloading image");
            let data = self.store.get_object(bucket, key).await?;
            if data.is_empty() {
                return Err(PipelineError::non_retryable(
                    ErrorKind::ObjectStore,
                    "No image data received from S3",
                )
                .into());
            }
            Ok::<_, anyhow::Error>(data)
        })
        .await?;

        info!(bucket, key, size_kib = data.len() as f32 / 1024.0, "image downloaded");
        Ok(Vec::from(data))
    }

    /// Stores the processed image under `key` in the destination bucket and
    /// returns its public URL.
    pub async fn upload(&self, key: &str, image: Vec<u8>) -> anyhow::Result<String> {
        let bucket = self.destination_bucket;
        let body = Bytes::from(image);
        let meta = ObjectMeta {
            content_type: OUTPUT_CONTENT_TYPE.to_string(),
            cache_control: OUTPUT_CACHE_CONTROL.to_string(),
            metadata: vec![
                ("processed-by".to_string(), PROCESSED_BY.to_string()),
                (
                    "processed-at".to_string(),
                    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                ),
            ],
        };

        with_retry("upload", &self.policy, || async {
            debug!(bucket, key, size = body.len(), "uploading processed image");
            self.store.put_object(bucket, key, body.clone(), &meta).await
        })
        .await?;

        let url = public_url(bucket, key);
        info!(bucket, key, url = %url, "processed image uploaded");
        Ok(url)
    }

    /// Best-effort probe; every failure, including "not found", is `false`.
    pub async fn exists(&self, bucket: &str, key: &str) -> bool {
        match self.store.head_object(bucket, key).await {
            Ok(()) => true,
            Err(err) => {
                debug!(bucket, key, error = %format!("{err:#}"), "object not found");
                false
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use anyhow::anyhow;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        Get { bucket: String, key: String },
        Put { bucket: String, key: String, size: usize, meta: ObjectMeta },
        Head { bucket: String, key: String },
    }

    /// In-memory store that records every call and can be told to fail.
    #[derive(Default)]
    pub struct MemoryStore {
        objects: Mutex<HashMap<(String, String), Bytes>>,
        calls: Mutex<Vec<Call>>,
        get_failures: Mutex<Vec<String>>,
        put_failures: Mutex<Vec<String>>,
    }

    impl MemoryStore {
        pub fn with_object(self, bucket: &str, key: &str, data: impl Into<Bytes>) -> Self {
            self.objects
                .lock()
                .unwrap()
                .insert((bucket.to_string(), key.to_string()), data.into());
            self
        }

        /// The next `get_object` calls fail with these messages, in order.
        pub fn failing_gets(self, messages: &[&str]) -> Self {
            *self.get_failures.lock().unwrap() = messages.iter().rev().map(|m| m.to_string()).collect();
            self
        }

        pub fn failing_puts(self, messages: &[&str]) -> Self {
            *self.put_failures.lock().unwrap() = messages.iter().rev().map(|m| m.to_string()).collect();
            self
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
            self.objects
                .lock()
                .unwrap()
                .get(&(bucket.to_string(), key.to_string()))
                .cloned()
        }
    }

    #[async_trait]
    impl ObjectStore for MemoryStore {
        async fn get_object(&self, bucket: &str, key: &str) -> anyhow::Result<Bytes> {
            self.calls.lock().unwrap().push(Call::Get {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
            if let Some(message) = self.get_failures.lock().unwrap().pop() {
                return Err(anyhow!(message));
            }
            self.object(bucket, key)
                .ok_or_else(|| anyhow!("NoSuchKey: the specified key does not exist"))
        }

        async fn put_object(&self, bucket: &str, key: &str, body: Bytes, meta: &ObjectMeta) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(Call::Put {
                bucket: bucket.to_string(),
                key: key.to_string(),
                size: body.len(),
                meta: meta.clone(),
            });
            if let Some(message) = self.put_failures.lock().unwrap().pop() {
                return Err(anyhow!(message));
            }
            self.objects
                .lock()
                .unwrap()
                .insert((bucket.to_string(), key.to_string()), body);
            Ok(())
        }

        async fn head_object(&self, bucket: &str, key: &str) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(Call::Head {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
            self.object(bucket, key)
                .map(|_| ())
                .ok_or_else(|| anyhow!("NotFound"))
        }
    }
}
