//! Error types for the core domain

use thiserror::Error;

/// Core error type for domain operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unknown message type: {message_type}")]
    UnknownMessageType { message_type: String },

    #[error("Unknown command type: {command_type}")]
    UnknownCommand { command_type: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("State transition error: {message}")]
    StateTransition { message: String },

    #[error("Operation timeout: {operation} exceeded {timeout_seconds}s")]
    Timeout {
        operation: String,
        timeout_seconds: u64,
    },
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Configuration {
            message: err.to_string(),
        }
    }
}

impl Error {
    /// Create a validation error with a formatted message
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a not found error for a specific entity type and ID
    pub fn not_found<S1: Into<String>, S2: Into<String>>(entity_type: S1, id: S2) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    /// Create an unknown command error
    pub fn unknown_command<S: Into<String>>(command_type: S) -> Self {
        Self::UnknownCommand {
            command_type: command_type.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a state transition error
    pub fn state_transition<S: Into<String>>(message: S) -> Self {
        Self::StateTransition {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S, timeout_seconds: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_seconds,
        }
    }

    /// Check if this error is a validation error
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation { .. })
    }

    /// Check if this error is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Check if this error is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// Check if this error came from decoding a message off the wire
    pub fn is_decode(&self) -> bool {
        matches!(
            self,
            Error::Serialization(_) | Error::UnknownMessageType { .. }
        )
    }

    /// Get the error category for logging and metrics
    pub fn category(&self) -> &'static str {
        match self {
            Error::Validation { .. } => "validation",
            Error::NotFound { .. } => "not_found",
            Error::Serialization(_) => "serialization",
            Error::UnknownMessageType { .. } => "unknown_message_type",
            Error::UnknownCommand { .. } => "unknown_command",
            Error::Configuration { .. } => "configuration",
            Error::StateTransition { .. } => "state_transition",
            Error::Timeout { .. } => "timeout",
        }
    }
}

/// Convenience result type for core operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let validation_err = Error::validation("Test validation error");
        assert!(validation_err.is_validation());
        assert!(!validation_err.is_not_found());
        assert_eq!(validation_err.category(), "validation");

        let not_found_err = Error::not_found("Workflow", "123");
        assert!(not_found_err.is_not_found());
        assert_eq!(not_found_err.category(), "not_found");

        let timeout_err = Error::timeout("broker_publish", 5);
        assert!(timeout_err.is_timeout());
        assert_eq!(timeout_err.category(), "timeout");
    }

    #[test]
    fn test_decode_errors() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let core_err: Error = json_err.into();
        assert!(core_err.is_decode());
        assert_eq!(core_err.category(), "serialization");

        let unknown = Error::UnknownMessageType {
            message_type: "gossip".to_string(),
        };
        assert!(unknown.is_decode());
        assert!(!Error::unknown_command("dance").is_decode());
    }

    #[test]
    fn test_error_display() {
        let err = Error::unknown_command("rebalance portfolio");
        let display_str = format!("{}", err);
        assert!(display_str.contains("Unknown command type"));
        assert!(display_str.contains("rebalance portfolio"));
    }
}
