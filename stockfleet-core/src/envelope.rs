//! Message envelope and wire codec
//!
//! Every agent in the fleet exchanges [`Envelope`]s. The JSON form is a
//! contract shared with agents written in other languages, so field names,
//! the `message_type` vocabulary and the integer priority must stay stable.
//!
//! # Examples
//!
//! Building a command envelope:
//!
//! ```rust
//! use stockfleet_core::envelope::*;
//! use serde_json::json;
//!
//! let envelope = Envelope::builder()
//!     .message_type(MessageType::Command)
//!     .sender("orchestrator")
//!     .recipient("discovery_agent")
//!     .payload(json!({"action": "start"}))
//!     .priority(Priority::High)
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(envelope.routing_key, "command.discovery_agent");
//! ```

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Self-describing message unit exchanged between agents
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub id: String,
    pub message_type: MessageType,
    pub sender: String,
    pub recipient: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub routing_key: String,
}

/// Kind of message carried by an envelope
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Command,
    Response,
    StatusUpdate,
    Heartbeat,
    Error,
    Data,
}

/// Delivery priority, carried on the wire as an integer in 1..=4
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(try_from = "u8", into = "u8")]
pub enum Priority {
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl MessageType {
    pub const ALL: [MessageType; 6] = [
        MessageType::Command,
        MessageType::Response,
        MessageType::StatusUpdate,
        MessageType::Heartbeat,
        MessageType::Error,
        MessageType::Data,
    ];

    /// Wire name of the message type
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Command => "command",
            MessageType::Response => "response",
            MessageType::StatusUpdate => "status_update",
            MessageType::Heartbeat => "heartbeat",
            MessageType::Error => "error",
            MessageType::Data => "data",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        MessageType::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::UnknownMessageType {
                message_type: s.to_string(),
            })
    }
}

impl TryFrom<u8> for Priority {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Priority::Low),
            2 => Ok(Priority::Normal),
            3 => Ok(Priority::High),
            4 => Ok(Priority::Critical),
            other => Err(Error::validation(format!(
                "Priority must be between 1 and 4, got {}",
                other
            ))),
        }
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> Self {
        priority as u8
    }
}

/// Routing key convention shared by every publisher: `{message_type}.{recipient}`
pub fn routing_key(message_type: MessageType, recipient: &str) -> String {
    format!("{}.{}", message_type, recipient)
}

impl Envelope {
    /// Create a builder for constructing an Envelope
    pub fn builder() -> EnvelopeBuilder {
        EnvelopeBuilder::new()
    }

    /// Create a builder for a reply to `original`.
    ///
    /// The reply goes to the original `reply_to` address when present and to
    /// the sender otherwise, and is correlated with the original id.
    pub fn reply_builder(original: &Envelope) -> EnvelopeBuilder {
        let recipient = original
            .reply_to
            .clone()
            .unwrap_or_else(|| original.sender.clone());
        EnvelopeBuilder::new()
            .sender(original.recipient.clone())
            .recipient(recipient)
            .correlation_id(original.correlation_id.clone().unwrap_or_else(|| original.id.clone()))
    }

    /// Serialize the envelope to its JSON wire form
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode an envelope from its JSON wire form.
    ///
    /// An unrecognised `message_type` is reported as
    /// [`Error::UnknownMessageType`]; anything else that does not parse is
    /// [`Error::Serialization`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)?;
        let kind = value
            .get("message_type")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Serialization("missing message_type".to_string()))?;
        kind.parse::<MessageType>()?;

        let mut envelope: Envelope = serde_json::from_value(value)?;
        if !envelope.payload.is_object() {
            return Err(Error::Serialization(
                "payload must be a JSON object".to_string(),
            ));
        }
        if envelope.routing_key.is_empty() {
            envelope.routing_key = routing_key(envelope.message_type, &envelope.recipient);
        }
        Ok(envelope)
    }

    /// Fetch a string field from the payload
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Get the age of the envelope in seconds
    pub fn age_seconds(&self) -> i64 {
        Utc::now()
            .signed_duration_since(self.timestamp)
            .num_seconds()
    }
}

/// Builder for constructing Envelope instances with validation
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    message_type: Option<MessageType>,
    sender: Option<String>,
    recipient: Option<String>,
    payload: Value,
    correlation_id: Option<String>,
    priority: Priority,
    reply_to: Option<String>,
}

impl EnvelopeBuilder {
    pub fn new() -> Self {
        Self {
            message_type: None,
            sender: None,
            recipient: None,
            payload: Value::Object(Default::default()),
            correlation_id: None,
            priority: Priority::Normal,
            reply_to: None,
        }
    }

    pub fn message_type(mut self, message_type: MessageType) -> Self {
        self.message_type = Some(message_type);
        self
    }

    pub fn sender<S: Into<String>>(mut self, sender: S) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn recipient<S: Into<String>>(mut self, recipient: S) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn correlation_id<S: Into<String>>(mut self, id: S) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn reply_to<S: Into<String>>(mut self, address: S) -> Self {
        self.reply_to = Some(address.into());
        self
    }

    /// Build the Envelope instance
    pub fn build(self) -> Result<Envelope> {
        let message_type = self
            .message_type
            .ok_or_else(|| Error::validation("Message type is required"))?;
        let sender = self
            .sender
            .ok_or_else(|| Error::validation("Sender is required"))?;
        let recipient = self
            .recipient
            .ok_or_else(|| Error::validation("Recipient is required"))?;

        if sender.trim().is_empty() {
            return Err(Error::validation("Sender cannot be empty"));
        }
        if recipient.trim().is_empty() {
            return Err(Error::validation("Recipient cannot be empty"));
        }
        if !self.payload.is_object() {
            return Err(Error::validation("Payload must be a JSON object"));
        }

        Ok(Envelope {
            id: Uuid::new_v4().to_string(),
            routing_key: routing_key(message_type, &recipient),
            message_type,
            sender,
            recipient,
            payload: self.payload,
            timestamp: Utc::now(),
            correlation_id: self.correlation_id,
            priority: self.priority,
            reply_to: self.reply_to,
        })
    }
}

impl Default for EnvelopeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
