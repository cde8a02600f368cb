//! In-process transport
//!
//! Records every published envelope. Used when the orchestrator runs in a
//! single process with its collaborators, and as the primary sink in tests,
//! where [`MemoryTransport::set_available`] simulates a broker outage.

use crate::transport::{PublishReceipt, SinkKind, Transport};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use stockfleet_core::envelope::{Envelope, MessageType};
use tokio::time::Instant;

/// Transport that keeps published envelopes in memory
#[derive(Debug)]
pub struct MemoryTransport {
    published: Mutex<Vec<Envelope>>,
    available: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            published: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Toggle whether publishes succeed
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Snapshot of everything published so far, in publish order
    pub fn published(&self) -> Vec<Envelope> {
        self.published.lock().clone()
    }

    /// Envelopes addressed to `recipient`
    pub fn published_to(&self, recipient: &str) -> Vec<Envelope> {
        self.published
            .lock()
            .iter()
            .filter(|e| e.recipient == recipient)
            .cloned()
            .collect()
    }

    /// Envelopes of one message type
    pub fn published_of(&self, message_type: MessageType) -> Vec<Envelope> {
        self.published
            .lock()
            .iter()
            .filter(|e| e.message_type == message_type)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.published.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.published.lock().clear();
    }

    /// Poll until `predicate` holds over the published envelopes or `timeout` elapses
    pub async fn wait_until<F>(&self, timeout: Duration, predicate: F) -> bool
    where
        F: Fn(&[Envelope]) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if predicate(&self.published.lock()) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn kind(&self) -> SinkKind {
        SinkKind::Memory
    }

    async fn health_check(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Unavailable("memory transport disabled".to_string()))
        }
    }

    async fn publish(&self, envelope: &Envelope) -> Result<PublishReceipt> {
        self.health_check().await?;
        self.published.lock().push(envelope.clone());
        Ok(PublishReceipt::new(SinkKind::Memory, envelope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(recipient: &str) -> Envelope {
        Envelope::builder()
            .message_type(MessageType::Data)
            .sender("orchestrator")
            .recipient(recipient)
            .payload(json!({"n": 1}))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_records_in_order() {
        let transport = MemoryTransport::new();
        transport.publish(&envelope("a")).await.unwrap();
        transport.publish(&envelope("b")).await.unwrap();

        let recipients: Vec<_> = transport
            .published()
            .into_iter()
            .map(|e| e.recipient)
            .collect();
        assert_eq!(recipients, vec!["a", "b"]);
        assert_eq!(transport.published_to("b").len(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_rejects_publish() {
        let transport = MemoryTransport::new();
        transport.set_available(false);

        let err = transport.publish(&envelope("a")).await.unwrap_err();
        assert!(err.is_transient());
        assert!(transport.is_empty());
    }
}
