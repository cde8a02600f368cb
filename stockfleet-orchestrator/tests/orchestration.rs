//! End-to-end flows through the dispatch table, engine and transports

use proptest::prelude::*;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use stockfleet_core::envelope::{Envelope, MessageType};
use stockfleet_orchestrator::handlers::{CACHE_AGENT, DISCOVERY_AGENT};
use stockfleet_orchestrator::{
    builtin_handlers, AgentRegistry, DispatchTable, EngineConfig, WorkflowEngine,
};
use stockfleet_transport::{
    FailoverTransport, FallbackTransport, FileQueue, MemoryTransport, Transport,
};
use tempfile::TempDir;

const MANAGEMENT: &str = "management_agent";
const WAIT: Duration = Duration::from_secs(5);

struct Node {
    table: DispatchTable,
    engine: WorkflowEngine,
    agents: Arc<AgentRegistry>,
}

fn node(transport: Arc<dyn Transport>) -> Node {
    let agents = Arc::new(AgentRegistry::new(Duration::from_secs(120)));
    let handlers = builtin_handlers("orchestrator", transport.clone(), agents.clone());
    let engine = WorkflowEngine::new(
        EngineConfig::default(),
        transport.clone(),
        handlers,
        agents.clone(),
    );
    Node {
        table: DispatchTable::orchestrator(engine.clone(), transport),
        engine,
        agents,
    }
}

fn inbound(message_type: MessageType, sender: &str, payload: Value) -> Envelope {
    Envelope::builder()
        .message_type(message_type)
        .sender(sender)
        .recipient("orchestrator")
        .payload(payload)
        .build()
        .unwrap()
}

fn has_event(envelopes: &[Envelope], event: &str) -> bool {
    envelopes
        .iter()
        .any(|e| e.message_type == MessageType::StatusUpdate && e.payload["event"] == event)
}

#[tokio::test]
async fn restart_command_runs_to_completion() {
    let transport = Arc::new(MemoryTransport::new());
    let node = node(transport.clone());

    node.table
        .dispatch(inbound(
            MessageType::Command,
            MANAGEMENT,
            json!({"command": "Restart Discovery System", "parameters": {"reason": "stale universe"}}),
        ))
        .await
        .unwrap();

    assert!(
        transport
            .wait_until(WAIT, |sent| has_event(sent, "completed"))
            .await
    );

    let ack = transport
        .published_of(MessageType::Response)
        .into_iter()
        .find(|e| e.recipient == MANAGEMENT)
        .unwrap();
    assert_eq!(ack.payload["status"], "accepted");
    assert_eq!(ack.payload["command_type"], "restart_discovery_system");

    let agent_commands: Vec<(String, String)> = transport
        .published_of(MessageType::Command)
        .into_iter()
        .map(|e| {
            (
                e.recipient.clone(),
                e.payload["action"].as_str().unwrap_or_default().to_string(),
            )
        })
        .collect();
    assert_eq!(
        agent_commands,
        vec![
            (DISCOVERY_AGENT.to_string(), "stop".to_string()),
            (CACHE_AGENT.to_string(), "clear_cache".to_string()),
            (DISCOVERY_AGENT.to_string(), "start".to_string()),
        ]
    );

    let history = node.engine.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].steps_completed.len(), 3);
    assert_eq!(history[0].progress, 1.0);
    assert_eq!(history[0].parameters["reason"], "stale universe");
}

#[tokio::test]
async fn broker_outage_parks_envelopes_in_fallback_file() {
    let dir = TempDir::new().unwrap();
    let queue = Arc::new(FileQueue::new(dir.path().join("fallback.json"), 100));
    let broker = Arc::new(MemoryTransport::new());
    broker.set_available(false);
    let failover = Arc::new(FailoverTransport::new(
        broker.clone(),
        Arc::new(FallbackTransport::new(queue.clone(), "orchestrator")),
        Duration::from_millis(200),
    ));
    let node = node(failover.clone());

    node.table
        .dispatch(inbound(
            MessageType::Command,
            MANAGEMENT,
            json!({"command_type": "health_check"}),
        ))
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + WAIT;
    while node.engine.active_count() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(node.engine.active_count(), 0);

    let parked: Vec<Envelope> = queue
        .entries()
        .await
        .unwrap()
        .into_iter()
        .map(|entry| entry.message)
        .collect();
    assert!(broker.is_empty());
    assert!(parked.iter().any(|e| e.payload["status"] == "accepted"));
    assert!(has_event(&parked, "completed"));
    assert_eq!(failover.stats().fallback_published as usize, parked.len());
    assert_eq!(failover.stats().lost, 0);
}

#[tokio::test]
async fn heartbeats_feed_the_health_check() {
    let transport = Arc::new(MemoryTransport::new());
    let node = node(transport.clone());

    for agent in [DISCOVERY_AGENT, CACHE_AGENT] {
        node.table
            .dispatch(inbound(
                MessageType::Heartbeat,
                agent,
                json!({"capabilities": [agent.trim_end_matches("_agent")], "metrics": {"load": 0.2}}),
            ))
            .await
            .unwrap();
    }
    assert_eq!(node.agents.len(), 2);

    node.table
        .dispatch(inbound(
            MessageType::Command,
            MANAGEMENT,
            json!({"command_type": "health check"}),
        ))
        .await
        .unwrap();
    assert!(
        transport
            .wait_until(WAIT, |sent| has_event(sent, "completed"))
            .await
    );

    let workflow = node.engine.history().pop().unwrap();
    let result = workflow.result.unwrap();
    assert_eq!(result["status"], "healthy");
    assert_eq!(result["total_agents"], 2);
    assert!(result["agents"][CACHE_AGENT].is_object());
}

#[tokio::test]
async fn emergency_stop_over_the_wire_halts_running_work() {
    let transport = Arc::new(MemoryTransport::new());
    let node = node(transport.clone());
    node.agents.register(DISCOVERY_AGENT, ["discovery"]).unwrap();

    let accepted = node
        .engine
        .receive_command_str("run backtest", serde_json::Map::new(), MANAGEMENT)
        .await;
    assert!(accepted.is_ok());

    node.table
        .dispatch(inbound(
            MessageType::Command,
            MANAGEMENT,
            json!({"command_type": "emergency_stop"}),
        ))
        .await
        .unwrap();

    assert!(
        transport
            .wait_until(WAIT, |sent| has_event(sent, "cancelled"))
            .await
    );
    let stops = transport
        .published_to(DISCOVERY_AGENT)
        .into_iter()
        .filter(|e| e.payload["action"] == "stop")
        .count();
    assert_eq!(stops, 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn arbitrary_command_names_are_acked(name in "[a-zA-Z _-]{1,24}") {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let transport = Arc::new(MemoryTransport::new());
            let node = node(transport.clone());
            let outcome = node
                .table
                .dispatch(inbound(MessageType::Command, MANAGEMENT, json!({"command_type": name})))
                .await;

            prop_assert!(outcome.is_ok());
            let admitted = node.engine.stats().pending + node.engine.stats().running
                + node.engine.history().len();
            let refused = transport.published_of(MessageType::Error).len();
            prop_assert_eq!(admitted + refused, 1);
            node.engine.emergency_stop_all().await;
            Ok(())
        })?;
    }
}
