//! Built-in command handlers
//!
//! The orchestrator does no stock analysis itself. Apart from the health
//! check, every command is carried out by sending `command` envelopes to the
//! fleet agents that own the work, one step at a time.

use crate::handler::{
    CommandHandler, CommandRegistry, HandlerError, HandlerResult, ProgressReporter,
};
use crate::registry::AgentRegistry;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use stockfleet_core::command::{CommandType, Parameters};
use stockfleet_core::envelope::{Envelope, MessageType, Priority};
use stockfleet_transport::Transport;
use tracing::{debug, info};

pub const DISCOVERY_AGENT: &str = "discovery_agent";
pub const VALIDATION_AGENT: &str = "validation_agent";
pub const BACKTESTING_AGENT: &str = "backtesting_agent";
pub const CACHE_AGENT: &str = "cache_agent";
pub const MONITORING_AGENT: &str = "monitoring_agent";

/// Reports the state of the agent registry
pub struct HealthCheckHandler {
    agents: Arc<AgentRegistry>,
}

impl HealthCheckHandler {
    pub fn new(agents: Arc<AgentRegistry>) -> Self {
        Self { agents }
    }
}

#[async_trait]
impl CommandHandler for HealthCheckHandler {
    async fn handle(&self, _parameters: Parameters, progress: ProgressReporter) -> HandlerResult {
        progress.report("inspect agent registry", 0.5).await;

        let health = self.agents.health();
        let stale = self.agents.stale_agents();
        let agents: serde_json::Map<String, Value> = self
            .agents
            .status()
            .into_iter()
            .map(|(name, agent)| {
                let summary = json!({
                    "status": agent.status,
                    "stale": stale.contains(&name),
                    "last_heartbeat": agent.last_heartbeat,
                    "heartbeat_age_seconds": agent.heartbeat_age_seconds(),
                    "error_count": agent.error_count,
                    "last_error": agent.last_error,
                });
                (name, summary)
            })
            .collect();

        let mut result = Parameters::new();
        result.insert(
            "status".into(),
            json!(if health.is_healthy() { "healthy" } else { "degraded" }),
        );
        result.insert("total_agents".into(), json!(health.total));
        result.insert("healthy_agents".into(), json!(health.healthy));
        result.insert("stale_agents".into(), json!(health.stale));
        result.insert("errored_agents".into(), json!(health.errored));
        result.insert("agents".into(), Value::Object(agents));
        Ok(result)
    }
}

/// One envelope sent by an [`AgentCommandHandler`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentStep {
    /// Step name recorded on the workflow
    pub label: String,
    pub agent: String,
    pub action: String,
}

impl AgentStep {
    pub fn new(label: &str, agent: &str, action: &str) -> Self {
        Self {
            label: label.to_string(),
            agent: agent.to_string(),
            action: action.to_string(),
        }
    }
}

/// Drives a command by messaging fleet agents step by step
pub struct AgentCommandHandler {
    sender: String,
    steps: Vec<AgentStep>,
    transport: Arc<dyn Transport>,
    agents: Arc<AgentRegistry>,
}

impl AgentCommandHandler {
    pub fn new<S: Into<String>>(
        sender: S,
        steps: Vec<AgentStep>,
        transport: Arc<dyn Transport>,
        agents: Arc<AgentRegistry>,
    ) -> Self {
        Self {
            sender: sender.into(),
            steps,
            transport,
            agents,
        }
    }

    /// Step plan for a command type, if it is carried out by fleet agents
    pub fn plan(command_type: CommandType) -> Option<Vec<AgentStep>> {
        let steps = match command_type {
            CommandType::RestartDiscoverySystem => vec![
                AgentStep::new("stop discovery", DISCOVERY_AGENT, "stop"),
                AgentStep::new("clear cache", CACHE_AGENT, "clear_cache"),
                AgentStep::new("start discovery", DISCOVERY_AGENT, "start"),
            ],
            CommandType::ValidateAlgorithms => vec![AgentStep::new(
                "validate algorithms",
                VALIDATION_AGENT,
                "validate_algorithms",
            )],
            CommandType::RunBacktest => vec![AgentStep::new(
                "run backtest",
                BACKTESTING_AGENT,
                "run_backtest",
            )],
            CommandType::ClearCache => {
                vec![AgentStep::new("clear cache", CACHE_AGENT, "clear_cache")]
            }
            CommandType::GenerateReport => vec![AgentStep::new(
                "generate report",
                MONITORING_AGENT,
                "generate_report",
            )],
            CommandType::HealthCheck | CommandType::EmergencyStop => return None,
        };
        Some(steps)
    }

    pub fn steps(&self) -> &[AgentStep] {
        &self.steps
    }
}

#[async_trait]
impl CommandHandler for AgentCommandHandler {
    async fn handle(&self, parameters: Parameters, progress: ProgressReporter) -> HandlerResult {
        let total = self.steps.len().max(1) as f64;
        let mut dispatched = Vec::with_capacity(self.steps.len());

        for (index, step) in self.steps.iter().enumerate() {
            if progress.is_cancelled() {
                return Err(HandlerError::at_step(&step.label, "cancelled"));
            }

            self.agents.check_recipient(&step.agent);
            let envelope = Envelope::builder()
                .message_type(MessageType::Command)
                .sender(self.sender.clone())
                .recipient(step.agent.clone())
                .payload(json!({
                    "action": step.action,
                    "parameters": parameters,
                    "workflow_id": progress.workflow_id().to_string(),
                }))
                .correlation_id(progress.workflow_id().to_string())
                .reply_to(self.sender.clone())
                .priority(Priority::High)
                .build()
                .map_err(|e| HandlerError::at_step(&step.label, e.to_string()))?;

            let receipt = self.transport.publish(&envelope).await.map_err(|e| {
                HandlerError::at_step(
                    &step.label,
                    format!("failed to send {} to {}: {}", step.action, step.agent, e),
                )
            })?;
            debug!(
                workflow_id = %progress.workflow_id(),
                agent = %step.agent,
                action = %step.action,
                sink = %receipt.sink,
                "Step dispatched"
            );

            dispatched.push(json!({
                "step": step.label,
                "agent": step.agent,
                "action": step.action,
                "envelope_id": envelope.id,
                "sink": receipt.sink,
            }));
            progress
                .report(step.label.clone(), (index + 1) as f64 / total)
                .await;
        }

        let mut result = Parameters::new();
        result.insert("dispatched".into(), Value::Array(dispatched));
        Ok(result)
    }
}

/// Handlers for every command the orchestrator understands
pub fn builtin_handlers(
    sender: &str,
    transport: Arc<dyn Transport>,
    agents: Arc<AgentRegistry>,
) -> CommandRegistry {
    let mut registry = CommandRegistry::new();
    registry.register(
        CommandType::HealthCheck,
        Arc::new(HealthCheckHandler::new(agents.clone())),
    );
    for command_type in CommandType::ALL {
        if let Some(steps) = AgentCommandHandler::plan(command_type) {
            registry.register(
                command_type,
                Arc::new(AgentCommandHandler::new(
                    sender,
                    steps,
                    transport.clone(),
                    agents.clone(),
                )),
            );
        }
    }
    info!(handlers = registry.len(), "Built-in command handlers registered");
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use stockfleet_core::agent::AgentStatus;
    use stockfleet_transport::MemoryTransport;
    use uuid::Uuid;

    fn registry() -> Arc<AgentRegistry> {
        Arc::new(AgentRegistry::new(Duration::from_secs(120)))
    }

    #[tokio::test]
    async fn test_restart_sends_steps_in_order() {
        let transport = Arc::new(MemoryTransport::new());
        let agents = registry();
        let steps = AgentCommandHandler::plan(CommandType::RestartDiscoverySystem).unwrap();
        let handler = AgentCommandHandler::new("orchestrator", steps, transport.clone(), agents);

        let workflow_id = Uuid::new_v4();
        let (reporter, mut events) = ProgressReporter::channel(workflow_id, 8);
        let result = handler.handle(Parameters::new(), reporter).await.unwrap();

        let sent: Vec<(String, String)> = transport
            .published()
            .iter()
            .map(|e| {
                (
                    e.recipient.clone(),
                    e.payload["action"].as_str().unwrap().to_string(),
                )
            })
            .collect();
        assert_eq!(
            sent,
            vec![
                (DISCOVERY_AGENT.to_string(), "stop".to_string()),
                (CACHE_AGENT.to_string(), "clear_cache".to_string()),
                (DISCOVERY_AGENT.to_string(), "start".to_string()),
            ]
        );
        assert!(transport
            .published()
            .iter()
            .all(|e| e.payload["workflow_id"] == json!(workflow_id.to_string())));
        assert_eq!(result["dispatched"].as_array().unwrap().len(), 3);

        let mut last = 0.0;
        while let Ok(event) = events.try_recv() {
            assert!(event.progress > last);
            last = event.progress;
        }
        assert_eq!(last, 1.0);
    }

    #[tokio::test]
    async fn test_cancelled_handler_stops_before_next_step() {
        let transport = Arc::new(MemoryTransport::new());
        let steps = AgentCommandHandler::plan(CommandType::ClearCache).unwrap();
        let handler = AgentCommandHandler::new("orchestrator", steps, transport.clone(), registry());

        let (reporter, _events) = ProgressReporter::channel(Uuid::new_v4(), 8);
        reporter.cancel();
        let err = handler.handle(Parameters::new(), reporter).await.unwrap_err();

        assert_eq!(err.step.as_deref(), Some("clear cache"));
        assert!(transport.is_empty());
    }

    #[tokio::test]
    async fn test_send_failure_names_the_step() {
        let transport = Arc::new(MemoryTransport::new());
        transport.set_available(false);
        let steps = AgentCommandHandler::plan(CommandType::RunBacktest).unwrap();
        let handler = AgentCommandHandler::new("orchestrator", steps, transport, registry());

        let (reporter, _events) = ProgressReporter::channel(Uuid::new_v4(), 8);
        let err = handler.handle(Parameters::new(), reporter).await.unwrap_err();
        assert_eq!(err.step.as_deref(), Some("run backtest"));
        assert!(err.message.contains(BACKTESTING_AGENT));
    }

    #[tokio::test]
    async fn test_health_check_reports_degraded_agents() {
        let agents = registry();
        agents.register(CACHE_AGENT, ["cache"]).unwrap();
        let handler = HealthCheckHandler::new(agents.clone());

        let (reporter, _events) = ProgressReporter::channel(Uuid::new_v4(), 8);
        let healthy = handler.handle(Parameters::new(), reporter).await.unwrap();
        assert_eq!(healthy["status"], "healthy");
        assert_eq!(healthy["total_agents"], 1);

        agents.record_error(VALIDATION_AGENT, "model drift").unwrap();
        let (reporter, _events) = ProgressReporter::channel(Uuid::new_v4(), 8);
        let degraded = handler.handle(Parameters::new(), reporter).await.unwrap();
        assert_eq!(degraded["status"], "degraded");
        assert_eq!(degraded["errored_agents"], json!([VALIDATION_AGENT]));
        assert_eq!(
            degraded["agents"][VALIDATION_AGENT]["status"],
            json!(AgentStatus::Error)
        );
    }

    #[test]
    fn test_builtin_handlers_cover_every_command() {
        let registry = builtin_handlers(
            "orchestrator",
            Arc::new(MemoryTransport::new()),
            registry(),
        );
        assert!(registry.missing().is_empty());
    }
}
