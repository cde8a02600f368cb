//! Workflow engine
//!
//! Turns admitted commands into tracked [`CommandWorkflow`]s, runs each one
//! on its own tokio task and reports every state change to the management
//! agent.
//!
//! Bookkeeping (the active set and the bounded history) sits behind a
//! single mutex that is never held across an `.await`, so admission is an
//! atomic check-then-insert and envelopes are always published outside the
//! lock.
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use stockfleet_core::command::{CommandType, Parameters};
//! use stockfleet_orchestrator::engine::{EngineConfig, WorkflowEngine};
//! use stockfleet_orchestrator::handler::{handler_fn, CommandRegistry};
//! use stockfleet_orchestrator::registry::AgentRegistry;
//! use stockfleet_transport::MemoryTransport;
//!
//! # async fn demo() -> stockfleet_orchestrator::Result<()> {
//! let handlers = CommandRegistry::new().with(
//!     CommandType::ClearCache,
//!     handler_fn(|_params: Parameters, _progress| async { Ok(Parameters::new()) }),
//! );
//! let engine = WorkflowEngine::new(
//!     EngineConfig::default(),
//!     Arc::new(MemoryTransport::new()),
//!     handlers,
//!     Arc::new(AgentRegistry::new(Duration::from_secs(120))),
//! );
//!
//! let id = engine
//!     .receive_command(CommandType::ClearCache, Parameters::new(), "management_agent")
//!     .await?;
//! println!("{:?}", engine.get_status(id)?.status);
//! # Ok(())
//! # }
//! ```

use crate::handler::{
    CommandRegistry, HandlerError, HandlerResult, ProgressEvent, ProgressReporter,
    PROGRESS_CHANNEL_CAPACITY,
};
use crate::registry::AgentRegistry;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use stockfleet_core::command::{Command, CommandType, Parameters};
use stockfleet_core::config::WorkflowSettings;
use stockfleet_core::envelope::{Envelope, MessageType, Priority};
use stockfleet_core::workflow::{CommandWorkflow, WorkflowStatus};
use stockfleet_transport::Transport;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinError;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Step recorded as failed when a workflow runs out of time
pub const TIMEOUT_STEP: &str = "timeout";

/// Runtime settings of the engine
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Sender name on every envelope the engine publishes
    pub agent_name: String,
    /// Recipient of progress and final status envelopes
    pub management_recipient: String,
    pub max_concurrent_workflows: usize,
    pub workflow_timeout: Duration,
    pub progress_update_interval: Duration,
    pub history_limit: usize,
}

impl EngineConfig {
    pub fn from_settings<S: Into<String>>(agent_name: S, settings: &WorkflowSettings) -> Self {
        Self {
            agent_name: agent_name.into(),
            management_recipient: settings.management_recipient.clone(),
            max_concurrent_workflows: settings.max_concurrent_workflows,
            workflow_timeout: settings.workflow_timeout(),
            progress_update_interval: settings.progress_update_interval(),
            history_limit: settings.history_limit,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_settings("orchestrator", &WorkflowSettings::default())
    }
}

/// What a status envelope reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowEvent {
    Started,
    Progress,
    /// Periodic update while the handler is quiet
    StillRunning,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowEvent::Started => "started",
            WorkflowEvent::Progress => "progress",
            WorkflowEvent::StillRunning => "still_running",
            WorkflowEvent::Completed => "completed",
            WorkflowEvent::Failed => "failed",
            WorkflowEvent::Cancelled => "cancelled",
        }
    }
}

/// Outcome of [`WorkflowEngine::emergency_stop_all`]
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EmergencyStopReport {
    pub cancelled_workflows: Vec<Uuid>,
    pub agents_notified: Vec<String>,
    pub stopped_at: DateTime<Utc>,
}

/// Workflow counts by status
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct EngineStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

struct ActiveWorkflow {
    record: CommandWorkflow,
    reporter: ProgressReporter,
    cancel: watch::Sender<bool>,
}

impl ActiveWorkflow {
    fn signal_cancel(&self) {
        self.reporter.cancel();
        // The execution task may already be gone
        let _ = self.cancel.send(true);
    }
}

struct Book {
    active: HashMap<Uuid, ActiveWorkflow>,
    history: VecDeque<CommandWorkflow>,
    history_limit: usize,
}

impl Book {
    fn archive(&mut self, workflow: CommandWorkflow) {
        self.history.push_back(workflow);
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
    }

    fn find(&self, id: Uuid) -> Option<&CommandWorkflow> {
        self.active
            .get(&id)
            .map(|entry| &entry.record)
            .or_else(|| self.history.iter().rev().find(|wf| wf.id == id))
    }
}

enum Outcome {
    Finished(HandlerResult),
    TimedOut,
    Cancelled,
}

struct EngineInner {
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    handlers: CommandRegistry,
    agents: Arc<AgentRegistry>,
    book: Mutex<Book>,
}

/// Admits, runs and tracks command workflows
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        handlers: CommandRegistry,
        agents: Arc<AgentRegistry>,
    ) -> Self {
        let book = Book {
            active: HashMap::new(),
            history: VecDeque::new(),
            history_limit: config.history_limit,
        };
        Self {
            inner: Arc::new(EngineInner {
                config,
                transport,
                handlers,
                agents,
                book: Mutex::new(book),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn agents(&self) -> Arc<AgentRegistry> {
        self.inner.agents.clone()
    }

    /// Admit a command by name; unknown names create no workflow
    pub async fn receive_command_str(
        &self,
        command_type: &str,
        parameters: Parameters,
        requester: &str,
    ) -> Result<Uuid> {
        let command_type = command_type
            .parse::<CommandType>()
            .map_err(|_| Error::UnknownCommand {
                command_type: command_type.to_string(),
            })?;
        self.receive_command(command_type, parameters, requester).await
    }

    /// Admit a parsed [`Command`]
    pub async fn submit(&self, command: Command, requester: &str) -> Result<Uuid> {
        debug!(request_id = %command.request_id, requester = %requester, "Command submitted");
        self.receive_command(command.command_type, command.payload, requester)
            .await
    }

    /// Admit a command and start executing it in the background.
    ///
    /// Fails with [`Error::ConcurrencyLimitReached`] when the number of
    /// active workflows is already at the configured limit.
    pub async fn receive_command(
        &self,
        command_type: CommandType,
        parameters: Parameters,
        requester: &str,
    ) -> Result<Uuid> {
        if command_type.bypasses_concurrency_limit() {
            return self.run_emergency_stop(parameters, requester).await;
        }

        let limit = self.inner.config.max_concurrent_workflows;
        let (workflow, reporter, progress, cancel) = {
            let mut book = self.inner.book.lock();
            if book.active.len() >= limit {
                warn!(
                    command_type = %command_type,
                    requester = %requester,
                    limit,
                    "Command rejected, concurrency limit reached"
                );
                return Err(Error::ConcurrencyLimitReached { limit });
            }

            let workflow = CommandWorkflow::new(command_type, parameters, requester);
            let (reporter, progress) =
                ProgressReporter::channel(workflow.id, PROGRESS_CHANNEL_CAPACITY);
            let (cancel_tx, cancel_rx) = watch::channel(false);
            book.active.insert(
                workflow.id,
                ActiveWorkflow {
                    record: workflow.clone(),
                    reporter: reporter.clone(),
                    cancel: cancel_tx,
                },
            );
            (workflow, reporter, progress, cancel_rx)
        };

        info!(
            workflow_id = %workflow.id,
            command_type = %command_type,
            requester = %requester,
            "Workflow admitted"
        );
        self.publish_acknowledgment(&workflow).await;

        let engine = self.clone();
        let workflow_id = workflow.id;
        tokio::spawn(async move {
            engine
                .execute(workflow_id, reporter, progress, cancel)
                .await;
        });

        Ok(workflow_id)
    }

    /// Stop everything, then record the emergency stop as its own completed workflow
    async fn run_emergency_stop(&self, parameters: Parameters, requester: &str) -> Result<Uuid> {
        warn!(requester = %requester, "Emergency stop requested");
        let report = self.emergency_stop_all().await;

        let mut workflow = CommandWorkflow::new(CommandType::EmergencyStop, parameters, requester);
        self.publish_acknowledgment(&workflow).await;

        workflow.start()?;
        self.publish_status(&workflow, WorkflowEvent::Started).await;
        workflow.record_progress("stop all workflows", 1.0)?;
        let result = match serde_json::to_value(&report) {
            Ok(Value::Object(map)) => map,
            _ => Parameters::new(),
        };
        workflow.complete(result)?;

        let workflow_id = workflow.id;
        self.inner.book.lock().archive(workflow.clone());
        self.publish_status(&workflow, WorkflowEvent::Completed).await;

        info!(
            workflow_id = %workflow_id,
            cancelled = report.cancelled_workflows.len(),
            agents_notified = report.agents_notified.len(),
            "Emergency stop completed"
        );
        Ok(workflow_id)
    }

    async fn execute(
        &self,
        id: Uuid,
        reporter: ProgressReporter,
        mut progress: mpsc::Receiver<ProgressEvent>,
        mut cancel: watch::Receiver<bool>,
    ) {
        let Some(started) = self.update(id, CommandWorkflow::start) else {
            debug!(workflow_id = %id, "Workflow cancelled before it started");
            return;
        };
        info!(
            workflow_id = %id,
            command_type = %started.command_type,
            "Workflow started"
        );
        self.publish_status(&started, WorkflowEvent::Started).await;

        let command_type = started.command_type;
        let Some(handler) = self.inner.handlers.get(command_type) else {
            let message = Error::HandlerMissing { command_type }.to_string();
            error!(workflow_id = %id, command_type = %command_type, "{}", message);
            self.finish_failed(id, HandlerError::at_step(command_type.as_str(), message))
                .await;
            return;
        };

        let timeout = self.inner.config.workflow_timeout;
        // interval_at panics on a zero period
        let period = self
            .inner
            .config
            .progress_update_interval
            .max(Duration::from_millis(1));
        let mut ticker = Instant::now().checked_add(period).map(|first| {
            let mut ticker = interval_at(first, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker
        });

        let parameters = started.parameters.clone();
        let mut run = tokio::spawn(async move { handler.handle(parameters, reporter).await });
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.changed() => break Outcome::Cancelled,
                Some(event) = progress.recv() => self.apply_progress(id, event).await,
                joined = &mut run => break Outcome::Finished(Self::handler_result(joined)),
                _ = &mut deadline => break Outcome::TimedOut,
                _ = next_tick(&mut ticker) => self.publish_still_running(id).await,
            }
        };

        if !matches!(outcome, Outcome::Finished(_)) {
            run.abort();
        }
        if let Outcome::Cancelled = outcome {
            debug!(workflow_id = %id, "Handler abandoned after cancellation");
            return;
        }

        while let Ok(event) = progress.try_recv() {
            self.apply_progress(id, event).await;
        }

        match outcome {
            Outcome::Finished(Ok(result)) => {
                if let Some(done) = self.retire(id, |wf| wf.complete(result)) {
                    info!(
                        workflow_id = %id,
                        duration_seconds = done.duration_seconds().unwrap_or_default(),
                        "Workflow completed"
                    );
                    self.publish_status(&done, WorkflowEvent::Completed).await;
                }
            }
            Outcome::Finished(Err(e)) => self.finish_failed(id, e).await,
            Outcome::TimedOut => {
                let message = format!(
                    "workflow timeout: exceeded {}s",
                    timeout.as_secs_f64()
                );
                warn!(workflow_id = %id, "{}", message);
                self.finish_failed(id, HandlerError::at_step(TIMEOUT_STEP, message))
                    .await;
            }
            Outcome::Cancelled => {}
        }
    }

    /// Map the handler task's exit to a handler result; a panic fails the workflow
    fn handler_result(joined: std::result::Result<HandlerResult, JoinError>) -> HandlerResult {
        match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                let payload = e.into_panic();
                let detail = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "no message".to_string());
                Err(HandlerError::new(format!("handler panicked: {}", detail)))
            }
            Err(e) => Err(HandlerError::new(format!("handler task aborted: {}", e))),
        }
    }

    /// Fail an active workflow. Without a step named by the handler the
    /// command wire name is recorded, so reported steps stay completed.
    async fn finish_failed(&self, id: Uuid, failure: HandlerError) {
        let retired = self.retire(id, |wf| {
            let step = failure
                .step
                .clone()
                .unwrap_or_else(|| wf.command_type.as_str().to_string());
            wf.fail(Some(step.as_str()), failure.message.clone())
        });
        if let Some(failed) = retired {
            warn!(
                workflow_id = %id,
                error = %failure.message,
                steps_failed = ?failed.steps_failed,
                "Workflow failed"
            );
            self.publish_status(&failed, WorkflowEvent::Failed).await;
        }
    }

    async fn apply_progress(&self, id: Uuid, event: ProgressEvent) {
        match self.update(id, |wf| wf.record_progress(&event.step, event.progress)) {
            Some(snapshot) => {
                debug!(
                    workflow_id = %id,
                    step = %event.step,
                    progress = snapshot.progress,
                    "Workflow progress"
                );
                self.publish_status(&snapshot, WorkflowEvent::Progress).await;
            }
            None => debug!(workflow_id = %id, step = %event.step, "Progress ignored"),
        }
    }

    async fn publish_still_running(&self, id: Uuid) {
        let snapshot = {
            let book = self.inner.book.lock();
            book.active
                .get(&id)
                .filter(|entry| entry.record.status == WorkflowStatus::Running)
                .map(|entry| entry.record.clone())
        };
        if let Some(snapshot) = snapshot {
            self.publish_status(&snapshot, WorkflowEvent::StillRunning)
                .await;
        }
    }

    /// Apply a non-terminal transition to an active workflow, returning a snapshot
    fn update<F>(&self, id: Uuid, transition: F) -> Option<CommandWorkflow>
    where
        F: FnOnce(&mut CommandWorkflow) -> stockfleet_core::Result<()>,
    {
        let mut book = self.inner.book.lock();
        let entry = book.active.get_mut(&id)?;
        match transition(&mut entry.record) {
            Ok(()) => Some(entry.record.clone()),
            Err(e) => {
                debug!(workflow_id = %id, error = %e, "Transition skipped");
                None
            }
        }
    }

    /// Apply a terminal transition and move the workflow into history
    fn retire<F>(&self, id: Uuid, transition: F) -> Option<CommandWorkflow>
    where
        F: FnOnce(&mut CommandWorkflow) -> stockfleet_core::Result<()>,
    {
        let mut book = self.inner.book.lock();
        let mut entry = book.active.remove(&id)?;
        if let Err(e) = transition(&mut entry.record) {
            warn!(workflow_id = %id, error = %e, "Terminal transition rejected");
            book.active.insert(id, entry);
            return None;
        }
        let snapshot = entry.record.clone();
        book.archive(entry.record);
        Some(snapshot)
    }

    /// Cancel a pending or running workflow and tell every agent to stop
    pub async fn cancel(&self, id: Uuid) -> Result<CommandWorkflow> {
        let cancelled = {
            let mut book = self.inner.book.lock();
            let Some(mut entry) = book.active.remove(&id) else {
                return Err(match book.find(id) {
                    Some(done) => Error::Core(stockfleet_core::Error::state_transition(format!(
                        "Workflow {} is already {}",
                        id, done.status
                    ))),
                    None => Error::not_found("Workflow", id.to_string()),
                });
            };
            if let Err(e) = entry.record.cancel("cancelled by request") {
                book.active.insert(id, entry);
                return Err(e.into());
            }
            entry.signal_cancel();
            let snapshot = entry.record.clone();
            book.archive(entry.record);
            snapshot
        };

        info!(workflow_id = %id, command_type = %cancelled.command_type, "Workflow cancelled");
        self.publish_status(&cancelled, WorkflowEvent::Cancelled).await;
        self.broadcast_stop("workflow_cancelled", Some(id)).await;
        Ok(cancelled)
    }

    /// Cancel every active workflow and broadcast one stop command per agent
    pub async fn emergency_stop_all(&self) -> EmergencyStopReport {
        let cancelled: Vec<CommandWorkflow> = {
            let mut book = self.inner.book.lock();
            let ids: Vec<Uuid> = book.active.keys().copied().collect();
            let mut cancelled = Vec::with_capacity(ids.len());
            for id in ids {
                let Some(mut entry) = book.active.remove(&id) else {
                    continue;
                };
                match entry.record.cancel("cancelled by emergency stop") {
                    Ok(()) => {
                        entry.signal_cancel();
                        cancelled.push(entry.record.clone());
                        book.archive(entry.record);
                    }
                    Err(e) => {
                        warn!(workflow_id = %id, error = %e, "Could not cancel workflow");
                        book.active.insert(id, entry);
                    }
                }
            }
            cancelled
        };

        for workflow in &cancelled {
            self.publish_status(workflow, WorkflowEvent::Cancelled).await;
        }
        let agents_notified = self.broadcast_stop("emergency_stop", None).await;

        warn!(
            cancelled = cancelled.len(),
            agents_notified = agents_notified.len(),
            "Emergency stop issued"
        );
        EmergencyStopReport {
            cancelled_workflows: cancelled.iter().map(|wf| wf.id).collect(),
            agents_notified,
            stopped_at: Utc::now(),
        }
    }

    /// Send one stop command to every registered agent
    async fn broadcast_stop(&self, reason: &str, workflow_id: Option<Uuid>) -> Vec<String> {
        let agents = self.inner.agents.agent_names();
        for agent in &agents {
            let envelope = Envelope::builder()
                .message_type(MessageType::Command)
                .sender(self.inner.config.agent_name.clone())
                .recipient(agent.clone())
                .payload(json!({
                    "action": "stop",
                    "reason": reason,
                    "workflow_id": workflow_id.map(|id| id.to_string()),
                }))
                .priority(Priority::Critical)
                .build();
            self.publish_built(envelope).await;
        }
        agents
    }

    async fn publish_acknowledgment(&self, workflow: &CommandWorkflow) {
        let envelope = Envelope::builder()
            .message_type(MessageType::Response)
            .sender(self.inner.config.agent_name.clone())
            .recipient(workflow.requester.clone())
            .payload(json!({
                "workflow_id": workflow.id.to_string(),
                "command_type": workflow.command_type.as_str(),
                "status": "accepted",
                "estimated_duration_seconds": workflow.command_type.estimated_duration().as_secs(),
            }))
            .correlation_id(workflow.id.to_string())
            .build();
        self.publish_built(envelope).await;
    }

    async fn publish_status(&self, workflow: &CommandWorkflow, event: WorkflowEvent) {
        let mut payload = workflow.status_payload();
        payload["event"] = json!(event.as_str());
        let priority = match event {
            WorkflowEvent::Failed | WorkflowEvent::Cancelled => Priority::High,
            _ => Priority::Normal,
        };
        let envelope = Envelope::builder()
            .message_type(MessageType::StatusUpdate)
            .sender(self.inner.config.agent_name.clone())
            .recipient(self.inner.config.management_recipient.clone())
            .payload(payload)
            .correlation_id(workflow.id.to_string())
            .priority(priority)
            .build();
        self.publish_built(envelope).await;
    }

    async fn publish_built(&self, envelope: stockfleet_core::Result<Envelope>) {
        let envelope = match envelope {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(error = %e, "Could not build envelope");
                return;
            }
        };
        match self.inner.transport.publish(&envelope).await {
            Ok(receipt) => debug!(
                envelope_id = %receipt.envelope_id,
                routing_key = %receipt.routing_key,
                sink = %receipt.sink,
                "Envelope published"
            ),
            Err(e) => error!(
                envelope_id = %envelope.id,
                routing_key = %envelope.routing_key,
                error = %e,
                "Failed to publish envelope"
            ),
        }
    }

    /// Current record of a workflow, active or archived
    pub fn get_status(&self, id: Uuid) -> Result<CommandWorkflow> {
        self.inner
            .book
            .lock()
            .find(id)
            .cloned()
            .ok_or_else(|| Error::not_found("Workflow", id.to_string()))
    }

    /// Pending and running workflows, oldest first
    pub fn list_active(&self) -> Vec<CommandWorkflow> {
        let mut active: Vec<CommandWorkflow> = self
            .inner
            .book
            .lock()
            .active
            .values()
            .map(|entry| entry.record.clone())
            .collect();
        active.sort_by_key(|wf| wf.created_at);
        active
    }

    /// Archived workflows, oldest first
    pub fn history(&self) -> Vec<CommandWorkflow> {
        self.inner.book.lock().history.iter().cloned().collect()
    }

    pub fn running_count(&self) -> usize {
        self.inner
            .book
            .lock()
            .active
            .values()
            .filter(|entry| entry.record.status == WorkflowStatus::Running)
            .count()
    }

    pub fn active_count(&self) -> usize {
        self.inner.book.lock().active.len()
    }

    pub fn stats(&self) -> EngineStats {
        let book = self.inner.book.lock();
        let mut stats = EngineStats::default();
        let records = book
            .active
            .values()
            .map(|entry| &entry.record)
            .chain(book.history.iter());
        for workflow in records {
            match workflow.status {
                WorkflowStatus::Pending => stats.pending += 1,
                WorkflowStatus::Running => stats.running += 1,
                WorkflowStatus::Completed => stats.completed += 1,
                WorkflowStatus::Failed => stats.failed += 1,
                WorkflowStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }
}

/// Next still-running tick; never fires when the first tick is out of range
async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("config", &self.inner.config)
            .field("handlers", &self.inner.handlers)
            .finish()
    }
}
