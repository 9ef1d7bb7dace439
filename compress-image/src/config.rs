use thiserror::Error;

pub const DESTINATION_BUCKET_VAR: &str = "DESTINATION_BUCKET";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} environment variable is not set")]
    MissingVar(&'static str),
}

/// Per-invocation settings read from the function's environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub destination_bucket: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let destination_bucket = lookup(DESTINATION_BUCKET_VAR)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or(ConfigError::MissingVar(DESTINATION_BUCKET_VAR))?;

        Ok(Self { destination_bucket })
    }
}
