//! Error types for the orchestrator

use stockfleet_core::command::CommandType;
use thiserror::Error;

/// Orchestrator error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("concurrency limit reached: {limit} workflows already active")]
    ConcurrencyLimitReached { limit: usize },

    #[error("Unknown command: {command_type}")]
    UnknownCommand { command_type: String },

    #[error("{entity_type} not found: {id}")]
    NotFound { entity_type: String, id: String },

    #[error("no handler registered for {command_type}")]
    HandlerMissing { command_type: CommandType },

    #[error("Transport error: {0}")]
    Transport(#[from] stockfleet_transport::Error),

    #[error("Core domain error: {0}")]
    Core(#[from] stockfleet_core::Error),

    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl Error {
    pub fn not_found<S1: Into<String>, S2: Into<String>>(entity_type: S1, id: S2) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Whether the error rejected a command before any workflow was created
    pub fn is_admission(&self) -> bool {
        match self {
            Error::ConcurrencyLimitReached { .. } | Error::UnknownCommand { .. } => true,
            Error::Core(e) => matches!(e, stockfleet_core::Error::UnknownCommand { .. }),
            _ => false,
        }
    }

    /// Whether retrying the same operation later could succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Transport(e) => e.is_transient(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Core(e) => e.is_not_found(),
            _ => false,
        }
    }

    /// Short machine-readable label used in error envelopes
    pub fn code(&self) -> &'static str {
        match self {
            Error::ConcurrencyLimitReached { .. } => "concurrency_limit_reached",
            Error::UnknownCommand { .. } => "unknown_command",
            Error::NotFound { .. } => "not_found",
            Error::HandlerMissing { .. } => "handler_missing",
            Error::Transport(_) => "transport",
            Error::Core(e) => e.category(),
            Error::Configuration { .. } => "configuration",
        }
    }
}

impl From<Error> for stockfleet_transport::DeliveryError {
    fn from(error: Error) -> Self {
        if error.is_transient() {
            Self::Transient(error.to_string())
        } else {
            Self::Permanent(error.to_string())
        }
    }
}

/// Convenience result type for orchestrator operations
pub type Result<T> = std::result::Result<T, Error>;
