use crate::config::ConfigError;
use crate::validation::ValidationError;
use std::fmt;
use thiserror::Error;

/// Failure taxonomy used for retry and logging policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    ObjectStore,
    ImageProcessing,
    Network,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::ObjectStore => "object_store",
            ErrorKind::ImageProcessing => "image_processing",
            ErrorKind::Network => "network",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Default retry verdict when the raising site did not decide.
    pub fn is_retryable(self) -> bool {
        match self {
            ErrorKind::Validation | ErrorKind::ImageProcessing => false,
            ErrorKind::ObjectStore | ErrorKind::Network | ErrorKind::Unknown => true,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorClassification {
    pub kind: ErrorKind,
    pub retryable: bool,
}

/// An error raised by a pipeline layer that already knows what it is.
///
/// The `retryable` flag overrides whatever the classification table would
/// say, e.g. an empty download body is an object-store failure that will
/// not fix itself on retry.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct PipelineError {
    message: String,
    kind: ErrorKind,
    retryable: bool,
}

impl PipelineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind,
            retryable: kind.is_retryable(),
        }
    }

    pub fn non_retryable(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind,
            retryable: false,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn retryable(&self) -> bool {
        self.retryable
    }
}

// Keyword families, checked in this order.
const VALIDATION_TERMS: &[&str] = &["validation", "invalid"];
const OBJECT_STORE_TERMS: &[&str] = &["s3", "bucket", "aws"];
const IMAGE_TERMS: &[&str] = &["image", "format", "decode", "encode"];
const NETWORK_TERMS: &[&str] = &["network", "timeout", "timed out", "connection", "dispatch"];

/// Classifies an error, preferring typed errors found anywhere in its chain
/// and falling back to scanning the chain's text.
pub fn classify(err: &anyhow::Error) -> ErrorClassification {
    for cause in err.chain() {
        if let Some(pipeline) = cause.downcast_ref::<PipelineError>() {
            return ErrorClassification {
                kind: pipeline.kind(),
                retryable: pipeline.retryable(),
            };
        }
        if cause.is::<ValidationError>() || cause.is::<ConfigError>() {
            return ErrorClassification {
                kind: ErrorKind::Validation,
                retryable: false,
            };
        }
    }

    let kind = classify_message(&format!("{err:#}"));
    ErrorClassification {
        kind,
        retryable: kind.is_retryable(),
    }
}

pub fn classify_message(message: &str) -> ErrorKind {
    let message = message.to_lowercase();
    let mentions = |terms: &[&str]| terms.iter().any(|term| message.contains(term));

    if mentions(VALIDATION_TERMS) {
        ErrorKind::Validation
    } else if mentions(OBJECT_STORE_TERMS) {
        ErrorKind::ObjectStore
    } else if mentions(IMAGE_TERMS) {
        ErrorKind::ImageProcessing
    } else if mentions(NETWORK_TERMS) {
        ErrorKind::Network
    } else {
        ErrorKind::Unknown
    }
}

/// True when a layer raised the error with its retryable flag cleared.
/// Keyword classification never stops a retry on its own.
pub fn is_marked_non_retryable(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<PipelineError>())
        .any(|pipeline| !pipeline.retryable())
}

/// True when the error is a caller mistake that should produce a 400.
pub fn is_client_error(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.is::<ValidationError>() || cause.is::<ConfigError>())
}
