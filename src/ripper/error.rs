//! Error taxonomy for the download orchestration core

use std::error::Error as StdError;

use thiserror::Error;

use crate::ripper::config_loader::ConfigError;
use crate::ripper::store::StoreError;

/// Errors raised while scanning galleries, resolving hosts and transferring files
#[derive(Error, Debug)]
pub enum RipperError {
    #[error("Network error: {0}")]
    TransientNetwork(String),

    #[error("Unexpected response code {status} for {url}")]
    Http { status: u16, url: String },

    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("Unsupported host for {0}")]
    UnsupportedHost(String),

    #[error("Scan error: {0}")]
    Scan(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Result type for core operations
pub type RipperResult<T> = Result<T, RipperError>;

impl RipperError {
    /// Whether the retry policy should attempt the operation again
    pub fn is_retryable(&self) -> bool {
        match self {
            RipperError::TransientNetwork(_) | RipperError::Io(_) => true,
            RipperError::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RipperError::Cancelled)
    }
}

impl From<reqwest::Error> for RipperError {
    fn from(error: reqwest::Error) -> Self {
        match error.status() {
            Some(status) => RipperError::Http {
                status: status.as_u16(),
                url: error.url().map(|u| u.to_string()).unwrap_or_default(),
            },
            None => RipperError::TransientNetwork(error_chain(&error)),
        }
    }
}

/// Render an error and all of its sources as one line
pub fn error_chain(error: &dyn StdError) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let cause_text = cause.to_string();
        if !message.contains(&cause_text) {
            message.push_str(": ");
            message.push_str(&cause_text);
        }
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(RipperError::TransientNetwork("reset".into()).is_retryable());
        assert!(RipperError::Http { status: 503, url: "u".into() }.is_retryable());
        assert!(RipperError::Http { status: 429, url: "u".into() }.is_retryable());
        assert!(!RipperError::Http { status: 404, url: "u".into() }.is_retryable());
        assert!(!RipperError::Extraction("no node".into()).is_retryable());
        assert!(!RipperError::UnsupportedHost("x".into()).is_retryable());
        assert!(!RipperError::Cancelled.is_retryable());
    }

    #[test]
    fn test_error_chain_includes_sources() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err = RipperError::from(io);
        assert_eq!(error_chain(&err), "IO error: disk full");
    }
}
