//! Command handlers and the progress channel they report through
//!
//! A [`CommandHandler`] does the actual work of a workflow. It receives the
//! command parameters and a [`ProgressReporter`]; the engine drains the
//! reporter's channel while the handler runs and publishes every event.
//!
//! # Examples
//!
//! ```rust
//! use stockfleet_core::command::{CommandType, Parameters};
//! use stockfleet_orchestrator::handler::{handler_fn, CommandRegistry};
//!
//! let mut registry = CommandRegistry::new();
//! registry.register(
//!     CommandType::ClearCache,
//!     handler_fn(|_params: Parameters, progress| async move {
//!         progress.report("flush cache", 0.5).await;
//!         Ok(Parameters::new())
//!     }),
//! );
//! assert!(registry.get(CommandType::ClearCache).is_some());
//! ```

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use stockfleet_core::command::{CommandType, Parameters};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Capacity of each workflow's progress channel
pub const PROGRESS_CHANNEL_CAPACITY: usize = 64;

/// Failure returned by a handler
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    /// Step that failed, when the handler knows it
    pub step: Option<String>,
    pub message: String,
}

impl HandlerError {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            step: None,
            message: message.into(),
        }
    }

    pub fn at_step<S1: Into<String>, S2: Into<String>>(step: S1, message: S2) -> Self {
        Self {
            step: Some(step.into()),
            message: message.into(),
        }
    }
}

impl From<crate::Error> for HandlerError {
    fn from(error: crate::Error) -> Self {
        Self::new(error.to_string())
    }
}

pub type HandlerResult = std::result::Result<Parameters, HandlerError>;

/// One progress report from a running handler
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub step: String,
    pub progress: f64,
}

/// Handle a running handler uses to report progress and observe cancellation
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    workflow_id: Uuid,
    sender: mpsc::Sender<ProgressEvent>,
    cancelled: Arc<AtomicBool>,
}

impl ProgressReporter {
    /// Create a reporter and the receiving end of its channel
    pub fn channel(workflow_id: Uuid, capacity: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let reporter = Self {
            workflow_id,
            sender,
            cancelled: Arc::new(AtomicBool::new(false)),
        };
        (reporter, receiver)
    }

    pub fn workflow_id(&self) -> Uuid {
        self.workflow_id
    }

    /// Report that `step` was reached with overall `progress` in [0, 1]
    pub async fn report<S: Into<String>>(&self, step: S, progress: f64) {
        let event = ProgressEvent {
            step: step.into(),
            progress,
        };
        if self.sender.send(event).await.is_err() {
            debug!(workflow_id = %self.workflow_id, "Progress report dropped, workflow already finished");
        }
    }

    /// Raise the cancellation flag seen by every clone of this reporter
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// The work behind one command type
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, parameters: Parameters, progress: ProgressReporter) -> HandlerResult;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> CommandHandler for FnHandler<F>
where
    F: Fn(Parameters, ProgressReporter) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, parameters: Parameters, progress: ProgressReporter) -> HandlerResult {
        (self.0)(parameters, progress).await
    }
}

/// Wrap an async closure as a [`CommandHandler`]
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn CommandHandler>
where
    F: Fn(Parameters, ProgressReporter) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Command type to handler lookup, built once at startup
#[derive(Clone, Default)]
pub struct CommandRegistry {
    handlers: HashMap<CommandType, Arc<dyn CommandHandler>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `command_type`
    pub fn register(
        &mut self,
        command_type: CommandType,
        handler: Arc<dyn CommandHandler>,
    ) -> &mut Self {
        self.handlers.insert(command_type, handler);
        self
    }

    pub fn with(mut self, command_type: CommandType, handler: Arc<dyn CommandHandler>) -> Self {
        self.register(command_type, handler);
        self
    }

    pub fn get(&self, command_type: CommandType) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(&command_type).cloned()
    }

    pub fn contains(&self, command_type: CommandType) -> bool {
        self.handlers.contains_key(&command_type)
    }

    /// Command types that would fail for lack of a handler.
    ///
    /// `EmergencyStop` is executed by the engine itself and never listed.
    pub fn missing(&self) -> Vec<CommandType> {
        CommandType::ALL
            .into_iter()
            .filter(|kind| *kind != CommandType::EmergencyStop && !self.contains(*kind))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut registered: Vec<_> = self.handlers.keys().map(CommandType::as_str).collect();
        registered.sort_unstable();
        f.debug_struct("CommandRegistry")
            .field("registered", &registered)
            .finish()
    }
}
