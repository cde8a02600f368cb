//! Error types for transport operations

use thiserror::Error;

/// Transport layer error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("Broker error: {0}")]
    Broker(#[from] lapin::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Core domain error: {0}")]
    Core(#[from] stockfleet_core::Error),

    #[error("Operation timeout: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Transport unavailable: {0}")]
    Unavailable(String),
}

impl Error {
    pub fn timeout<S: Into<String>>(operation: S, timeout: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Whether retrying the same operation later could succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Broker(_) | Error::Io(_) | Error::Timeout { .. } | Error::Unavailable(_)
        )
    }
}

/// Convenience result type for transport operations
pub type Result<T> = std::result::Result<T, Error>;
