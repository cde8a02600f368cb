use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use stockfleet_core::config::OrchestratorConfig;
use stockfleet_orchestrator::{
    builtin_handlers, telemetry, AgentRegistry, DispatchTable, EngineConfig, WorkflowEngine,
};
use stockfleet_transport::{
    AmqpSettings, AmqpTransport, EnvelopeSink, FailoverTransport, FallbackTransport, FileQueue,
    Transport,
};
use tracing::{error, info, warn};

const MIN_RETRY_DELAY: Duration = Duration::from_secs(1);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "stockfleet")]
#[command(about = "Workflow orchestrator for the stock-discovery agent fleet")]
#[command(version)]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, env = "STOCKFLEET_CONFIG")]
    config: Option<PathBuf>,

    /// Log level, overrides the configured one
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = OrchestratorConfig::load(args.config.as_deref())
        .context("failed to load configuration")?;

    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.logging.json |= args.json_logs;
    telemetry::init_from_settings(&config.logging)?;

    info!("Starting Stockfleet orchestrator");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        agent = %config.agent_name,
        broker = %format!("{}:{}", config.broker.host, config.broker.port),
        exchange = %config.broker.exchange,
        fallback = %config.fallback.path.display(),
        "Configuration loaded"
    );

    let broker = Arc::new(AmqpTransport::new(AmqpSettings::from(&config.broker)));
    let queue = Arc::new(FileQueue::new(
        config.fallback.path.clone(),
        config.fallback.max_messages,
    ));
    let fallback = Arc::new(FallbackTransport::new(queue, config.agent_name.clone()));
    let transport: Arc<dyn Transport> = Arc::new(FailoverTransport::new(
        broker.clone(),
        fallback,
        config.broker.publish_timeout(),
    ));

    if let Err(e) = broker.health_check().await {
        warn!(error = %e, "Broker unavailable at startup; publishing to fallback file");
    }

    let agents = Arc::new(AgentRegistry::new(config.registry.heartbeat_stale_after()));
    let handlers = builtin_handlers(&config.agent_name, transport.clone(), agents.clone());
    let missing = handlers.missing();
    if !missing.is_empty() {
        warn!(missing = ?missing, "Command types without a handler");
    }

    let engine = WorkflowEngine::new(
        EngineConfig::from_settings(config.agent_name.clone(), &config.workflows),
        transport.clone(),
        handlers,
        agents,
    );
    let table: Arc<dyn EnvelopeSink> =
        Arc::new(DispatchTable::orchestrator(engine.clone(), transport));

    let consumer = tokio::spawn(consume_forever(
        broker,
        config.agent_name.clone(),
        table,
    ));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    consumer.abort();
    let active = engine.active_count();
    if active > 0 {
        let report = engine.emergency_stop_all().await;
        info!(
            cancelled = report.cancelled_workflows.len(),
            agents_notified = report.agents_notified.len(),
            "Active workflows cancelled on shutdown"
        );
    }

    let stats = engine.stats();
    info!(stats = ?stats, "Stockfleet orchestrator stopped");
    Ok(())
}

/// Keep a consumer attached to the orchestrator queue, reconnecting with backoff
async fn consume_forever(broker: Arc<AmqpTransport>, agent_name: String, sink: Arc<dyn EnvelopeSink>) {
    let mut delay = MIN_RETRY_DELAY;
    loop {
        match broker.consume(&agent_name, sink.clone()).await {
            Ok(()) => {
                info!(agent = %agent_name, "Consumer finished");
                delay = MIN_RETRY_DELAY;
            }
            Err(e) => {
                error!(
                    agent = %agent_name,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "Consumer stopped; retrying"
                );
            }
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(MAX_RETRY_DELAY);
    }
}
