use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

pub const KEY_PREFIX: &str = "photos/";
pub const ALLOWED_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".webp", ".gif", ".bmp", ".tiff"];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid event structure: {0}")]
    MalformedEvent(String),
    #[error("Invalid event structure: Records array is missing")]
    RecordsMissing,
    #[error("No records found in event")]
    NoRecords,
    #[error("Invalid S3 event record: s3 object is missing")]
    EntityMissing,
    #[error("Invalid S3 event record: bucket name is missing")]
    BucketNameMissing,
    #[error("Invalid S3 event record: object key is missing")]
    ObjectKeyMissing,
    #[error("Invalid S3 event record: object key '{0}' is not valid URL encoding")]
    UndecodableKey(String),
    #[error("Image key is empty")]
    EmptyKey,
    #[error("Image key '{0}' is not in the photos/ prefix")]
    OutsidePrefix(String),
    #[error("Image key '{0}' does not have a valid image extension")]
    UnsupportedExtension(String),
}

// Wire schema of an S3 notification. Every level is optional so that a
// missing field maps to a named error instead of a serde message. Records
// stay untyped until picked, so extra records are never parsed.
#[derive(Debug, Deserialize)]
struct EventPayload {
    #[serde(rename = "Records")]
    records: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct EventRecord {
    s3: Option<S3Entity>,
}

#[derive(Debug, Deserialize)]
struct S3Entity {
    bucket: Option<S3Bucket>,
    object: Option<S3Object>,
}

#[derive(Debug, Deserialize)]
struct S3Bucket {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct S3Object {
    key: Option<String>,
}

/// The one object this invocation works on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub bucket: String,
    pub key: String,
}

/// Checks the raw event and extracts the first record.
///
/// Additional records are ignored: the function is wired to receive one
/// object per invocation.
pub fn validate_notification(raw: Value) -> Result<Notification, ValidationError> {
    let payload: EventPayload =
        serde_json::from_value(raw).map_err(|e| ValidationError::MalformedEvent(e.to_string()))?;

    let mut records = payload.records.ok_or(ValidationError::RecordsMissing)?;
    if records.is_empty() {
        return Err(ValidationError::NoRecords);
    }
    if records.len() > 1 {
        warn!(records = records.len(), "event carries several records; only the first is processed");
    }

    let record: EventRecord = serde_json::from_value(records.swap_remove(0))
        .map_err(|e| ValidationError::MalformedEvent(e.to_string()))?;
    let entity = record.s3.ok_or(ValidationError::EntityMissing)?;
    let bucket = entity
        .bucket
        .and_then(|bucket| bucket.name)
        .filter(|name| !name.is_empty())
        .ok_or(ValidationError::BucketNameMissing)?;
    let raw_key = entity
        .object
        .and_then(|object| object.key)
        .filter(|key| !key.is_empty())
        .ok_or(ValidationError::ObjectKeyMissing)?;

    Ok(Notification {
        bucket,
        key: decode_key(&raw_key)?,
    })
}

/// S3 sends keys form-urlencoded: `+` is a space, the rest is percent-encoded.
fn decode_key(raw_key: &str) -> Result<String, ValidationError> {
    urlencoding::decode(&raw_key.replace('+', " "))
        .map(|key| key.into_owned())
        .map_err(|_| ValidationError::UndecodableKey(raw_key.to_string()))
}

pub fn validate_key(key: &str) -> Result<(), ValidationError> {
    if key.is_empty() {
        return Err(ValidationError::EmptyKey);
    }
    if !key.starts_with(KEY_PREFIX) {
        return Err(ValidationError::OutsidePrefix(key.to_string()));
    }

    let lowercase = key.to_lowercase();
    if !ALLOWED_EXTENSIONS.iter().any(|ext| lowercase.ends_with(ext)) {
        return Err(ValidationError::UnsupportedExtension(key.to_string()));
    }

    Ok(())
}
