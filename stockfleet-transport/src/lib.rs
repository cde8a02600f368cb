//! Message transport for the Stockfleet orchestrator
//!
//! Every sink implements [`Transport`]. The orchestrator publishes through a
//! [`FailoverTransport`] whose primary is the AMQP broker and whose fallback
//! is a bounded JSON file queue on local disk. Inbound deliveries are
//! settled by [`consumer::settle`] against an [`EnvelopeSink`].
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use stockfleet_transport::*;
//!
//! let broker = Arc::new(AmqpTransport::new(AmqpSettings::from(
//!     &stockfleet_core::config::BrokerSettings::default(),
//! )));
//! let queue = Arc::new(FileQueue::new("fallback_messages.json", 1000));
//! let fallback = Arc::new(FallbackTransport::new(queue, "orchestrator"));
//! let transport = FailoverTransport::new(broker, fallback, Duration::from_secs(5));
//! ```

pub mod amqp;
pub mod consumer;
pub mod error;
pub mod failover;
pub mod file_queue;
pub mod memory;
pub mod transport;

pub use amqp::{AmqpSettings, AmqpTransport};
pub use consumer::{DeliveryError, Disposition, EnvelopeSink};
pub use error::{Error, Result};
pub use failover::{FailoverStats, FailoverTransport};
pub use file_queue::{FallbackEntry, FallbackTransport, FileQueue};
pub use memory::MemoryTransport;
pub use transport::{PublishReceipt, SinkKind, Transport};

/// Re-export core types for convenience
pub use stockfleet_core as core;
