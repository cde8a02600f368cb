//! Runtime selection between the broker and the fallback sink
//!
//! [`FailoverTransport`] publishes to its primary when the primary is
//! healthy and falls back otherwise. A publish succeeds when either sink
//! accepted the envelope; the receipt says which one did.

use crate::transport::{PublishReceipt, SinkKind, Transport};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stockfleet_core::envelope::Envelope;
use tracing::{error, warn};

/// Publish counters for a [`FailoverTransport`]
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct FailoverStats {
    pub primary_published: u64,
    pub fallback_published: u64,
    /// Envelopes neither sink accepted
    pub lost: u64,
}

#[derive(Debug, Default)]
struct Counters {
    primary: AtomicU64,
    fallback: AtomicU64,
    lost: AtomicU64,
}

/// Primary sink with a fallback
pub struct FailoverTransport {
    primary: Arc<dyn Transport>,
    fallback: Arc<dyn Transport>,
    primary_timeout: Duration,
    counters: Counters,
}

impl FailoverTransport {
    pub fn new(
        primary: Arc<dyn Transport>,
        fallback: Arc<dyn Transport>,
        primary_timeout: Duration,
    ) -> Self {
        Self {
            primary,
            fallback,
            primary_timeout,
            counters: Counters::default(),
        }
    }

    pub fn stats(&self) -> FailoverStats {
        FailoverStats {
            primary_published: self.counters.primary.load(Ordering::Relaxed),
            fallback_published: self.counters.fallback.load(Ordering::Relaxed),
            lost: self.counters.lost.load(Ordering::Relaxed),
        }
    }

    async fn try_primary(&self, envelope: &Envelope) -> Result<PublishReceipt> {
        let attempt = async {
            self.primary.health_check().await?;
            self.primary.publish(envelope).await
        };
        match tokio::time::timeout(self.primary_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(
                format!("{} publish", self.primary.kind()),
                self.primary_timeout,
            )),
        }
    }
}

#[async_trait]
impl Transport for FailoverTransport {
    fn kind(&self) -> SinkKind {
        self.primary.kind()
    }

    async fn health_check(&self) -> Result<()> {
        match self.primary.health_check().await {
            Ok(()) => Ok(()),
            Err(_) => self.fallback.health_check().await,
        }
    }

    async fn publish(&self, envelope: &Envelope) -> Result<PublishReceipt> {
        let primary_error = match self.try_primary(envelope).await {
            Ok(receipt) => {
                self.counters.primary.fetch_add(1, Ordering::Relaxed);
                return Ok(receipt);
            }
            Err(e) => e,
        };

        warn!(
            envelope_id = %envelope.id,
            sink = %self.primary.kind(),
            error = %primary_error,
            "Primary sink unavailable, using fallback"
        );

        match self.fallback.publish(envelope).await {
            Ok(receipt) => {
                self.counters.fallback.fetch_add(1, Ordering::Relaxed);
                Ok(receipt)
            }
            Err(e) => {
                self.counters.lost.fetch_add(1, Ordering::Relaxed);
                error!(
                    envelope_id = %envelope.id,
                    error = %e,
                    "Fallback sink failed, envelope not delivered"
                );
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_queue::{FallbackTransport, FileQueue};
    use crate::memory::MemoryTransport;
    use serde_json::json;
    use stockfleet_core::envelope::MessageType;
    use tempfile::TempDir;

    struct StalledTransport;

    #[async_trait]
    impl Transport for StalledTransport {
        fn kind(&self) -> SinkKind {
            SinkKind::Broker
        }

        async fn health_check(&self) -> Result<()> {
            Ok(())
        }

        async fn publish(&self, _envelope: &Envelope) -> Result<PublishReceipt> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Err(Error::Unavailable("never".to_string()))
        }
    }

    fn envelope() -> Envelope {
        Envelope::builder()
            .message_type(MessageType::StatusUpdate)
            .sender("orchestrator")
            .recipient("management_agent")
            .payload(json!({"status": "RUNNING"}))
            .build()
            .unwrap()
    }

    fn fallback(dir: &TempDir) -> (Arc<FileQueue>, Arc<dyn Transport>) {
        let queue = Arc::new(FileQueue::new(dir.path().join("fallback.json"), 100));
        let transport = Arc::new(FallbackTransport::new(queue.clone(), "orchestrator"));
        (queue, transport)
    }

    #[tokio::test]
    async fn test_healthy_primary_is_used() {
        let dir = TempDir::new().unwrap();
        let (queue, fallback) = fallback(&dir);
        let primary = Arc::new(MemoryTransport::new());
        let transport = FailoverTransport::new(primary.clone(), fallback, Duration::from_secs(1));

        let receipt = transport.publish(&envelope()).await.unwrap();
        assert_eq!(receipt.sink, SinkKind::Memory);
        assert_eq!(primary.len(), 1);
        assert!(queue.is_empty().await.unwrap());
        assert_eq!(transport.stats().primary_published, 1);
    }

    #[tokio::test]
    async fn test_outage_goes_to_fallback_file() {
        let dir = TempDir::new().unwrap();
        let (queue, fallback) = fallback(&dir);
        let primary = Arc::new(MemoryTransport::new());
        primary.set_available(false);
        let transport = FailoverTransport::new(primary.clone(), fallback, Duration::from_secs(1));

        let env = envelope();
        let receipt = transport.publish(&env).await.unwrap();
        assert_eq!(receipt.sink, SinkKind::FallbackFile);

        let entries = queue.entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message.id, env.id);
        assert_eq!(entries[0].agent_name, "orchestrator");
        assert!(primary.is_empty());

        primary.set_available(true);
        transport.publish(&envelope()).await.unwrap();
        let stats = transport.stats();
        assert_eq!(stats.fallback_published, 1);
        assert_eq!(stats.primary_published, 1);
    }

    #[tokio::test]
    async fn test_slow_primary_times_out_to_fallback() {
        let dir = TempDir::new().unwrap();
        let (queue, fallback) = fallback(&dir);
        let transport = FailoverTransport::new(
            Arc::new(StalledTransport),
            fallback,
            Duration::from_millis(50),
        );

        let receipt = transport.publish(&envelope()).await.unwrap();
        assert_eq!(receipt.sink, SinkKind::FallbackFile);
        assert_eq!(queue.len().await.unwrap(), 1);
    }
}
