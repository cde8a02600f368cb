//! Fallback file queue
//!
//! When the broker cannot be reached, envelopes are appended to a single
//! JSON document on local disk:
//!
//! ```json
//! {"messages": [{"agent_name": "orchestrator", "timestamp": "...", "message": {...}}]}
//! ```
//!
//! The queue is bounded. Once `max_messages` entries are stored the oldest
//! entry is evicted to admit the newest (drop-head), mirroring the broker's
//! `x-overflow = drop-head` policy. Entries are never replayed into the
//! broker automatically; [`FileQueue::drain`] exists for operators.

use crate::transport::{PublishReceipt, SinkKind, Transport};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stockfleet_core::envelope::Envelope;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Default capacity of the fallback queue
pub const DEFAULT_MAX_MESSAGES: usize = 1000;

/// One envelope parked in the fallback file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FallbackEntry {
    /// Local agent that wrote the entry
    pub agent_name: String,
    /// When the entry was written
    pub timestamp: DateTime<Utc>,
    pub message: Envelope,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueDocument {
    #[serde(default)]
    messages: VecDeque<FallbackEntry>,
}

/// Bounded, append-only JSON file queue
#[derive(Debug)]
pub struct FileQueue {
    path: PathBuf,
    max_messages: usize,
    lock: Mutex<()>,
}

impl FileQueue {
    /// Create a queue backed by `path`; a `max_messages` of 0 is treated as 1
    pub fn new<P: Into<PathBuf>>(path: P, max_messages: usize) -> Self {
        Self {
            path: path.into(),
            max_messages: max_messages.max(1),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max_messages(&self) -> usize {
        self.max_messages
    }

    /// Append an envelope, returning how many old entries were evicted
    pub async fn append(&self, agent_name: &str, envelope: &Envelope) -> Result<usize> {
        let _guard = self.lock.lock().await;
        let mut document = self.read().await?;

        let mut evicted = 0;
        while document.messages.len() >= self.max_messages {
            document.messages.pop_front();
            evicted += 1;
        }
        document.messages.push_back(FallbackEntry {
            agent_name: agent_name.to_string(),
            timestamp: Utc::now(),
            message: envelope.clone(),
        });

        self.write(&document).await?;

        if evicted > 0 {
            warn!(
                path = %self.path.display(),
                evicted,
                "Fallback queue full, dropped oldest entries"
            );
        }
        debug!(
            envelope_id = %envelope.id,
            queued = document.messages.len(),
            "Envelope written to fallback queue"
        );
        Ok(evicted)
    }

    /// All queued entries, oldest first
    pub async fn entries(&self) -> Result<Vec<FallbackEntry>> {
        let _guard = self.lock.lock().await;
        Ok(self.read().await?.messages.into_iter().collect())
    }

    pub async fn len(&self) -> Result<usize> {
        let _guard = self.lock.lock().await;
        Ok(self.read().await?.messages.len())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Remove and return every queued entry
    pub async fn drain(&self) -> Result<Vec<FallbackEntry>> {
        let _guard = self.lock.lock().await;
        let document = self.read().await?;
        self.write(&QueueDocument::default()).await?;
        Ok(document.messages.into_iter().collect())
    }

    pub async fn clear(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.write(&QueueDocument::default()).await
    }

    async fn read(&self) -> Result<QueueDocument> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(QueueDocument::default())
            }
            Err(e) => return Err(Error::Io(e)),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(QueueDocument::default());
        }
        match serde_json::from_slice(&bytes) {
            Ok(document) => Ok(document),
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Fallback queue file is corrupt, starting a new one"
                );
                Ok(QueueDocument::default())
            }
        }
    }

    async fn write(&self, document: &QueueDocument) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let bytes = serde_json::to_vec_pretty(document)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// [`Transport`] that writes to a [`FileQueue`]
#[derive(Debug, Clone)]
pub struct FallbackTransport {
    queue: Arc<FileQueue>,
    agent_name: String,
}

impl FallbackTransport {
    pub fn new<S: Into<String>>(queue: Arc<FileQueue>, agent_name: S) -> Self {
        Self {
            queue,
            agent_name: agent_name.into(),
        }
    }

    pub fn queue(&self) -> Arc<FileQueue> {
        self.queue.clone()
    }
}

#[async_trait]
impl Transport for FallbackTransport {
    fn kind(&self) -> SinkKind {
        SinkKind::FallbackFile
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    async fn publish(&self, envelope: &Envelope) -> Result<PublishReceipt> {
        self.queue.append(&self.agent_name, envelope).await?;
        Ok(PublishReceipt::new(SinkKind::FallbackFile, envelope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stockfleet_core::envelope::MessageType;
    use tempfile::TempDir;

    fn envelope(n: usize) -> Envelope {
        Envelope::builder()
            .message_type(MessageType::StatusUpdate)
            .sender("orchestrator")
            .recipient("management_agent")
            .payload(json!({"n": n}))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_append_adds_metadata() {
        let dir = TempDir::new().unwrap();
        let queue = FileQueue::new(dir.path().join("fallback.json"), 10);

        let env = envelope(1);
        queue.append("orchestrator", &env).await.unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(queue.path()).unwrap()).unwrap();
        let entry = &raw["messages"][0];
        assert_eq!(entry["agent_name"], "orchestrator");
        assert!(entry["timestamp"].is_string());
        assert_eq!(entry["message"]["id"], env.id);
    }

    #[tokio::test]
    async fn test_drop_head_eviction() {
        let dir = TempDir::new().unwrap();
        let queue = FileQueue::new(dir.path().join("fallback.json"), 3);

        for n in 0..3 {
            assert_eq!(queue.append("orchestrator", &envelope(n)).await.unwrap(), 0);
        }
        assert_eq!(queue.append("orchestrator", &envelope(3)).await.unwrap(), 1);

        let ns: Vec<_> = queue
            .entries()
            .await
            .unwrap()
            .iter()
            .map(|e| e.message.payload["n"].as_u64().unwrap())
            .collect();
        assert_eq!(ns, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_default_capacity_evicts_first_entry() {
        let dir = TempDir::new().unwrap();
        let queue = FileQueue::new(dir.path().join("fallback.json"), DEFAULT_MAX_MESSAGES);

        let first = envelope(0);
        queue.append("orchestrator", &first).await.unwrap();
        for n in 1..DEFAULT_MAX_MESSAGES {
            queue.append("orchestrator", &envelope(n)).await.unwrap();
        }
        assert_eq!(queue.len().await.unwrap(), DEFAULT_MAX_MESSAGES);

        let evicted = queue
            .append("orchestrator", &envelope(DEFAULT_MAX_MESSAGES))
            .await
            .unwrap();
        assert_eq!(evicted, 1);

        let entries = queue.entries().await.unwrap();
        assert_eq!(entries.len(), DEFAULT_MAX_MESSAGES);
        assert!(entries.iter().all(|e| e.message.id != first.id));
        assert_eq!(
            entries.last().unwrap().message.payload["n"],
            json!(DEFAULT_MAX_MESSAGES)
        );
    }

    #[tokio::test]
    async fn test_corrupt_file_is_replaced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fallback.json");
        std::fs::write(&path, b"{ definitely not json").unwrap();

        let queue = FileQueue::new(&path, 10);
        queue.append("orchestrator", &envelope(1)).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_drain_empties_queue() {
        let dir = TempDir::new().unwrap();
        let queue = FileQueue::new(dir.path().join("nested/dir/fallback.json"), 10);
        queue.append("orchestrator", &envelope(1)).await.unwrap();
        queue.append("orchestrator", &envelope(2)).await.unwrap();

        let drained = queue.drain().await.unwrap();
        assert_eq!(drained.len(), 2);
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_fallback_transport_receipt() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(FileQueue::new(dir.path().join("fallback.json"), 10));
        let transport = FallbackTransport::new(queue.clone(), "orchestrator");

        let env = envelope(1);
        let receipt = transport.publish(&env).await.unwrap();
        assert_eq!(receipt.sink, SinkKind::FallbackFile);
        assert_eq!(receipt.routing_key, "status_update.management_agent");
        assert_eq!(queue.len().await.unwrap(), 1);
    }
}
