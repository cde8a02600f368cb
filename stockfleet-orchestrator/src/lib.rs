//! Workflow orchestration for the stock-discovery agent fleet
//!
//! The orchestrator receives `command` envelopes from management agents,
//! runs each one as a tracked workflow and reports progress back over the
//! same transport. It also keeps a registry of the fleet agents it hears
//! from.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use stockfleet_orchestrator::{
//!     builtin_handlers, AgentRegistry, DispatchTable, EngineConfig, WorkflowEngine,
//! };
//! use stockfleet_transport::{MemoryTransport, Transport};
//!
//! let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
//! let agents = Arc::new(AgentRegistry::new(Duration::from_secs(120)));
//! let handlers = builtin_handlers("orchestrator", transport.clone(), agents.clone());
//! let engine = WorkflowEngine::new(EngineConfig::default(), transport.clone(), handlers, agents);
//! let _table = DispatchTable::orchestrator(engine, transport);
//! ```

pub mod dispatch;
pub mod engine;
pub mod error;
pub mod handler;
pub mod handlers;
pub mod registry;
pub mod telemetry;


pub use dispatch::{DispatchTable, EnvelopeHandler};
pub use engine::{EmergencyStopReport, EngineConfig, EngineStats, WorkflowEngine, WorkflowEvent};
pub use error::{Error, Result};
pub use handler::{
    handler_fn, CommandHandler, CommandRegistry, HandlerError, HandlerResult, ProgressEvent,
    ProgressReporter,
};
pub use handlers::builtin_handlers;
pub use registry::{AgentRegistry, RecipientCheck, RegistryHealth};

pub use stockfleet_core as core;
pub use stockfleet_transport as transport;
