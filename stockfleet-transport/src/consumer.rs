//! Consumer-side settlement of incoming deliveries
//!
//! The broker consumer hands every raw delivery to [`settle`], which decodes
//! it, passes it to an [`EnvelopeSink`] and returns the [`Disposition`] the
//! consumer must apply:
//!
//! | Outcome | Disposition |
//! |---------|-------------|
//! | payload does not decode | [`Disposition::Reject`] |
//! | sink accepted | [`Disposition::Ack`] |
//! | sink failed transiently | [`Disposition::Requeue`] |
//! | sink failed permanently | [`Disposition::Reject`] |

use async_trait::async_trait;
use stockfleet_core::envelope::Envelope;
use thiserror::Error;
use tracing::{debug, warn};

/// Failure reported by an [`EnvelopeSink`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// Redelivery may succeed later
    #[error("transient delivery failure: {0}")]
    Transient(String),

    /// Redelivering the same message can never succeed
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

impl DeliveryError {
    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self::Transient(message.into())
    }

    pub fn permanent<S: Into<String>>(message: S) -> Self {
        Self::Permanent(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, DeliveryError::Transient(_))
    }
}

/// Receiver of decoded envelopes
#[async_trait]
pub trait EnvelopeSink: Send + Sync {
    async fn deliver(&self, envelope: Envelope) -> Result<(), DeliveryError>;
}

/// What the consumer does with a delivery once it has been handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Drop without redelivery
    Reject,
    /// Return to the queue for redelivery
    Requeue,
}

/// Decode `raw` and hand it to `sink`
pub async fn settle(raw: &[u8], sink: &dyn EnvelopeSink) -> Disposition {
    let envelope = match Envelope::decode(raw) {
        Ok(envelope) => envelope,
        Err(stockfleet_core::Error::UnknownMessageType { message_type }) => {
            warn!(message_type = %message_type, "Rejecting envelope with unknown message type");
            return Disposition::Reject;
        }
        Err(e) => {
            warn!(error = %e, bytes = raw.len(), "Rejecting malformed envelope");
            return Disposition::Reject;
        }
    };

    let envelope_id = envelope.id.clone();
    let message_type = envelope.message_type;
    match sink.deliver(envelope).await {
        Ok(()) => {
            debug!(envelope_id = %envelope_id, message_type = %message_type, "Envelope handled");
            Disposition::Ack
        }
        Err(DeliveryError::Transient(reason)) => {
            warn!(envelope_id = %envelope_id, reason = %reason, "Requeueing envelope after transient failure");
            Disposition::Requeue
        }
        Err(DeliveryError::Permanent(reason)) => {
            warn!(envelope_id = %envelope_id, reason = %reason, "Rejecting envelope after permanent failure");
            Disposition::Reject
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use stockfleet_core::envelope::MessageType;

    struct ScriptedSink {
        outcome: Result<(), DeliveryError>,
        seen: Mutex<Vec<String>>,
    }

    impl ScriptedSink {
        fn new(outcome: Result<(), DeliveryError>) -> Self {
            Self {
                outcome,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl EnvelopeSink for ScriptedSink {
        async fn deliver(&self, envelope: Envelope) -> Result<(), DeliveryError> {
            self.seen.lock().push(envelope.id);
            self.outcome.clone()
        }
    }

    fn raw_envelope() -> Vec<u8> {
        Envelope::builder()
            .message_type(MessageType::Heartbeat)
            .sender("cache_agent")
            .recipient("orchestrator")
            .payload(json!({"metrics": {"entries": 10}}))
            .build()
            .unwrap()
            .encode()
            .unwrap()
    }

    #[tokio::test]
    async fn test_success_is_acked() {
        let sink = ScriptedSink::new(Ok(()));
        assert_eq!(settle(&raw_envelope(), &sink).await, Disposition::Ack);
        assert_eq!(sink.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_is_requeued() {
        let sink = ScriptedSink::new(Err(DeliveryError::transient("registry busy")));
        assert_eq!(settle(&raw_envelope(), &sink).await, Disposition::Requeue);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_rejected() {
        let sink = ScriptedSink::new(Err(DeliveryError::permanent("bad command payload")));
        assert_eq!(settle(&raw_envelope(), &sink).await, Disposition::Reject);
    }

    #[tokio::test]
    async fn test_undecodable_payloads_never_reach_sink() {
        let sink = ScriptedSink::new(Ok(()));

        assert_eq!(settle(b"not json", &sink).await, Disposition::Reject);

        let mut value: serde_json::Value = serde_json::from_slice(&raw_envelope()).unwrap();
        value["message_type"] = json!("gossip");
        let raw = serde_json::to_vec(&value).unwrap();
        assert_eq!(settle(&raw, &sink).await, Disposition::Reject);

        assert!(sink.seen.lock().is_empty());
    }
}
