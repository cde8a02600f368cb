//! Routing of inbound envelopes by message type
//!
//! [`DispatchTable`] holds one [`EnvelopeHandler`] per [`MessageType`] and
//! selects it with an exhaustive `match`, so adding a message type fails to
//! compile until it is routed. The table is the [`EnvelopeSink`] the broker
//! consumer delivers to.
//!
//! Orchestrator routing:
//!
//! | Type | Effect |
//! |------|--------|
//! | `command` | admit a workflow, or cancel / query one via `action` |
//! | `heartbeat` | record heartbeat metrics and capabilities |
//! | `response`, `status_update` | touch the sender, apply a reported status |
//! | `error` | record the error against the sender |
//! | `data` | touch the sender |

use crate::engine::WorkflowEngine;
use crate::registry::AgentRegistry;
use crate::Error;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use stockfleet_core::agent::AgentStatus;
use stockfleet_core::command::Command;
use stockfleet_core::envelope::{Envelope, MessageType, Priority};
use stockfleet_transport::{DeliveryError, EnvelopeSink, Transport};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Handles every envelope of one message type
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    async fn handle(&self, envelope: Envelope) -> Result<(), DeliveryError>;
}

/// Accepts and logs envelopes nothing else is interested in
pub struct IgnoreHandler;

#[async_trait]
impl EnvelopeHandler for IgnoreHandler {
    async fn handle(&self, envelope: Envelope) -> Result<(), DeliveryError> {
        debug!(
            envelope_id = %envelope.id,
            message_type = %envelope.message_type,
            sender = %envelope.sender,
            "Envelope ignored"
        );
        Ok(())
    }
}

/// One handler per message type
pub struct DispatchTable {
    command: Arc<dyn EnvelopeHandler>,
    response: Arc<dyn EnvelopeHandler>,
    status_update: Arc<dyn EnvelopeHandler>,
    heartbeat: Arc<dyn EnvelopeHandler>,
    error: Arc<dyn EnvelopeHandler>,
    data: Arc<dyn EnvelopeHandler>,
}

impl DispatchTable {
    /// Create a builder where every type starts out ignored
    pub fn builder() -> DispatchTableBuilder {
        DispatchTableBuilder::new()
    }

    /// Routing used by the orchestrator process
    pub fn orchestrator(engine: WorkflowEngine, transport: Arc<dyn Transport>) -> Self {
        let agents = engine.agents();
        let activity = |kind| -> Arc<dyn EnvelopeHandler> {
            Arc::new(AgentActivityHandler {
                agents: agents.clone(),
                kind,
            })
        };
        Self::builder()
            .handler(
                MessageType::Command,
                Arc::new(CommandIntakeHandler { engine, transport }),
            )
            .handler(MessageType::Heartbeat, activity(Activity::Heartbeat))
            .handler(MessageType::Response, activity(Activity::Report))
            .handler(MessageType::StatusUpdate, activity(Activity::Report))
            .handler(MessageType::Error, activity(Activity::Error))
            .handler(MessageType::Data, activity(Activity::Data))
            .build()
    }

    fn route(&self, message_type: MessageType) -> &Arc<dyn EnvelopeHandler> {
        match message_type {
            MessageType::Command => &self.command,
            MessageType::Response => &self.response,
            MessageType::StatusUpdate => &self.status_update,
            MessageType::Heartbeat => &self.heartbeat,
            MessageType::Error => &self.error,
            MessageType::Data => &self.data,
        }
    }

    pub async fn dispatch(&self, envelope: Envelope) -> Result<(), DeliveryError> {
        let handler = self.route(envelope.message_type).clone();
        handler.handle(envelope).await
    }
}

#[async_trait]
impl EnvelopeSink for DispatchTable {
    async fn deliver(&self, envelope: Envelope) -> Result<(), DeliveryError> {
        self.dispatch(envelope).await
    }
}

/// Builder for [`DispatchTable`]
pub struct DispatchTableBuilder {
    command: Arc<dyn EnvelopeHandler>,
    response: Arc<dyn EnvelopeHandler>,
    status_update: Arc<dyn EnvelopeHandler>,
    heartbeat: Arc<dyn EnvelopeHandler>,
    error: Arc<dyn EnvelopeHandler>,
    data: Arc<dyn EnvelopeHandler>,
}

impl DispatchTableBuilder {
    pub fn new() -> Self {
        let ignore: Arc<dyn EnvelopeHandler> = Arc::new(IgnoreHandler);
        Self {
            command: ignore.clone(),
            response: ignore.clone(),
            status_update: ignore.clone(),
            heartbeat: ignore.clone(),
            error: ignore.clone(),
            data: ignore,
        }
    }

    pub fn handler(mut self, message_type: MessageType, handler: Arc<dyn EnvelopeHandler>) -> Self {
        let slot = match message_type {
            MessageType::Command => &mut self.command,
            MessageType::Response => &mut self.response,
            MessageType::StatusUpdate => &mut self.status_update,
            MessageType::Heartbeat => &mut self.heartbeat,
            MessageType::Error => &mut self.error,
            MessageType::Data => &mut self.data,
        };
        *slot = handler;
        self
    }

    pub fn build(self) -> DispatchTable {
        DispatchTable {
            command: self.command,
            response: self.response,
            status_update: self.status_update,
            heartbeat: self.heartbeat,
            error: self.error,
            data: self.data,
        }
    }
}

impl Default for DispatchTableBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Turns `command` envelopes into engine calls
struct CommandIntakeHandler {
    engine: WorkflowEngine,
    transport: Arc<dyn Transport>,
}

impl CommandIntakeHandler {
    /// Answer the sender with an `error` envelope correlated to `original`
    async fn reply_error(&self, original: &Envelope, error: &Error) {
        let reply = Envelope::reply_builder(original)
            .message_type(MessageType::Error)
            .payload(json!({
                "error": error.code(),
                "message": error.to_string(),
                "original_message_id": original.id,
            }))
            .priority(Priority::High)
            .build();
        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                warn!(envelope_id = %original.id, error = %e, "Could not build error reply");
                return;
            }
        };
        if let Err(e) = self.transport.publish(&reply).await {
            warn!(envelope_id = %original.id, error = %e, "Failed to publish error reply");
        }
    }

    async fn reply_status(&self, original: &Envelope, workflow_id: Uuid) -> Result<(), Error> {
        let workflow = self.engine.get_status(workflow_id)?;
        let reply = Envelope::reply_builder(original)
            .message_type(MessageType::Response)
            .payload(workflow.status_payload())
            .build()?;
        self.transport.publish(&reply).await?;
        Ok(())
    }

    /// Operator actions on existing workflows: `{"action": "cancel" | "status", "workflow_id": ...}`
    async fn handle_action(&self, envelope: &Envelope, action: &str) -> Result<(), Error> {
        let workflow_id = envelope
            .payload_str("workflow_id")
            .and_then(|id| Uuid::parse_str(id).ok())
            .ok_or_else(|| {
                Error::Core(stockfleet_core::Error::validation(
                    "workflow action requires a valid workflow_id",
                ))
            })?;

        match action {
            "cancel" => {
                self.engine.cancel(workflow_id).await?;
                Ok(())
            }
            "status" => self.reply_status(envelope, workflow_id).await,
            other => Err(Error::Core(stockfleet_core::Error::validation(format!(
                "unsupported workflow action: {}",
                other
            )))),
        }
    }
}

#[async_trait]
impl EnvelopeHandler for CommandIntakeHandler {
    async fn handle(&self, envelope: Envelope) -> Result<(), DeliveryError> {
        if let Some(action) = envelope.payload_str("action") {
            let action = action.to_string();
            return match self.handle_action(&envelope, &action).await {
                Ok(()) => Ok(()),
                Err(e) if e.is_transient() => Err(e.into()),
                Err(e) => {
                    warn!(envelope_id = %envelope.id, action = %action, error = %e, "Workflow action refused");
                    self.reply_error(&envelope, &e).await;
                    Ok(())
                }
            };
        }

        let command = match Command::from_payload(&envelope.payload, &envelope.id) {
            Ok(command) => command,
            Err(e @ stockfleet_core::Error::UnknownCommand { .. }) => {
                let error = Error::Core(e);
                warn!(envelope_id = %envelope.id, sender = %envelope.sender, error = %error, "Unknown command");
                self.reply_error(&envelope, &error).await;
                return Ok(());
            }
            Err(e) => return Err(DeliveryError::permanent(e.to_string())),
        };

        match self.engine.submit(command, &envelope.sender).await {
            Ok(workflow_id) => {
                info!(
                    envelope_id = %envelope.id,
                    workflow_id = %workflow_id,
                    sender = %envelope.sender,
                    "Command accepted"
                );
                Ok(())
            }
            Err(e) if e.is_admission() => {
                self.reply_error(&envelope, &e).await;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Activity {
    Heartbeat,
    /// `response` and `status_update`
    Report,
    Error,
    Data,
}

/// Keeps the agent registry current from inbound traffic
struct AgentActivityHandler {
    agents: Arc<AgentRegistry>,
    kind: Activity,
}

impl AgentActivityHandler {
    fn apply(&self, envelope: &Envelope) -> crate::Result<()> {
        let sender = envelope.sender.as_str();
        match self.kind {
            Activity::Heartbeat => {
                let metrics = match envelope.payload.get("metrics") {
                    Some(Value::Object(metrics)) => metrics.clone(),
                    _ => Map::new(),
                };
                self.agents.record_heartbeat(sender, metrics)?;
                if let Some(Value::Array(capabilities)) = envelope.payload.get("capabilities") {
                    let capabilities: Vec<String> = capabilities
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect();
                    self.agents.register(sender, capabilities)?;
                }
                self.apply_reported_status(envelope)
            }
            Activity::Report => {
                self.agents.record_response(sender)?;
                self.apply_reported_status(envelope)
            }
            Activity::Error => {
                let message = envelope
                    .payload_str("message")
                    .or_else(|| envelope.payload_str("error"))
                    .unwrap_or("unspecified error");
                self.agents.record_error(sender, message)
            }
            Activity::Data => {
                debug!(
                    envelope_id = %envelope.id,
                    sender = %sender,
                    bytes = envelope.payload.to_string().len(),
                    "Data envelope received"
                );
                self.agents.record_response(sender)
            }
        }
    }

    fn apply_reported_status(&self, envelope: &Envelope) -> crate::Result<()> {
        if let Some(status) = envelope
            .payload_str("status")
            .and_then(AgentStatus::from_report)
        {
            self.agents.record_status(&envelope.sender, status)?;
        }
        Ok(())
    }
}

#[async_trait]
impl EnvelopeHandler for AgentActivityHandler {
    async fn handle(&self, envelope: Envelope) -> Result<(), DeliveryError> {
        self.apply(&envelope).map_err(|e| {
            warn!(
                envelope_id = %envelope.id,
                sender = %envelope.sender,
                error = %e,
                "Could not record agent activity"
            );
            DeliveryError::from(e)
        })
    }
}
