//! The transport abstraction shared by every message sink

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use stockfleet_core::envelope::Envelope;

/// Which sink accepted a published envelope
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    Broker,
    FallbackFile,
    Memory,
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SinkKind::Broker => "broker",
            SinkKind::FallbackFile => "fallback_file",
            SinkKind::Memory => "memory",
        };
        f.write_str(label)
    }
}

/// Acknowledgment that a sink took ownership of an envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub sink: SinkKind,
    pub envelope_id: String,
    pub routing_key: String,
}

impl PublishReceipt {
    pub fn new(sink: SinkKind, envelope: &Envelope) -> Self {
        Self {
            sink,
            envelope_id: envelope.id.clone(),
            routing_key: envelope.routing_key.clone(),
        }
    }
}

/// A place envelopes can be published to
#[async_trait]
pub trait Transport: Send + Sync {
    /// Kind of sink this transport writes to
    fn kind(&self) -> SinkKind;

    /// Check that the sink can currently accept envelopes
    async fn health_check(&self) -> Result<()>;

    /// Publish one envelope
    async fn publish(&self, envelope: &Envelope) -> Result<PublishReceipt>;
}
