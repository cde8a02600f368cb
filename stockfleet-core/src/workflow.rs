//! Command workflow record and its state machine
//!
//! A [`CommandWorkflow`] tracks one command from admission to a terminal
//! outcome. Legal transitions:
//!
//! ```text
//! PENDING ──> RUNNING ──> COMPLETED | FAILED | CANCELLED
//!    │
//!    └──────> CANCELLED
//! ```
//!
//! Every mutating method checks the current status and returns
//! [`Error::StateTransition`] instead of applying an illegal change.

use crate::command::{CommandType, Parameters};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use uuid::Uuid;

/// Lifecycle status of a workflow
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "PENDING",
            WorkflowStatus::Running => "RUNNING",
            WorkflowStatus::Completed => "COMPLETED",
            WorkflowStatus::Failed => "FAILED",
            WorkflowStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn can_transition_to(&self, next: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit of tracked work
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandWorkflow {
    pub id: Uuid,
    pub command_type: CommandType,
    pub parameters: Parameters,
    pub requester: String,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: f64,
    pub current_step: Option<String>,
    pub steps_completed: Vec<String>,
    pub steps_failed: Vec<String>,
    pub error_messages: Vec<String>,
    pub result: Option<Parameters>,
}

impl CommandWorkflow {
    /// Create a new workflow in PENDING
    pub fn new<S: Into<String>>(
        command_type: CommandType,
        parameters: Parameters,
        requester: S,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            command_type,
            parameters,
            requester: requester.into(),
            status: WorkflowStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            progress: 0.0,
            current_step: None,
            steps_completed: Vec::new(),
            steps_failed: Vec::new(),
            error_messages: Vec::new(),
            result: None,
        }
    }

    fn transition(&mut self, next: WorkflowStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::state_transition(format!(
                "Workflow {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    /// PENDING -> RUNNING
    pub fn start(&mut self) -> Result<()> {
        self.transition(WorkflowStatus::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Apply a progress report from the running handler.
    ///
    /// Progress never moves backwards and is capped at 1.0. The step label
    /// becomes the current step and is appended to `steps_completed` once.
    pub fn record_progress(&mut self, step: &str, progress: f64) -> Result<()> {
        if self.status != WorkflowStatus::Running {
            return Err(Error::state_transition(format!(
                "Workflow {} is {} and cannot report progress",
                self.id, self.status
            )));
        }
        let bounded = if progress.is_finite() {
            progress.clamp(0.0, 1.0)
        } else {
            self.progress
        };
        self.progress = self.progress.max(bounded);
        self.current_step = Some(step.to_string());
        if !self.steps_completed.iter().any(|s| s == step)
            && !self.steps_failed.iter().any(|s| s == step)
        {
            self.steps_completed.push(step.to_string());
        }
        Ok(())
    }

    /// RUNNING -> COMPLETED
    pub fn complete(&mut self, result: Parameters) -> Result<()> {
        self.transition(WorkflowStatus::Completed)?;
        self.progress = 1.0;
        self.result = Some(result);
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// RUNNING -> FAILED
    pub fn fail<S: Into<String>>(&mut self, step: Option<&str>, message: S) -> Result<()> {
        self.transition(WorkflowStatus::Failed)?;
        if let Some(step) = step {
            self.mark_step_failed(step);
        }
        self.error_messages.push(message.into());
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// PENDING | RUNNING -> CANCELLED
    pub fn cancel<S: Into<String>>(&mut self, reason: S) -> Result<()> {
        self.transition(WorkflowStatus::Cancelled)?;
        self.error_messages.push(reason.into());
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    fn mark_step_failed(&mut self, step: &str) {
        self.steps_completed.retain(|s| s != step);
        if !self.steps_failed.iter().any(|s| s == step) {
            self.steps_failed.push(step.to_string());
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall-clock runtime so far, or total runtime once terminal
    pub fn duration_seconds(&self) -> Option<f64> {
        let started = self.started_at?;
        let end = self.completed_at.unwrap_or_else(Utc::now);
        Some(end.signed_duration_since(started).num_milliseconds() as f64 / 1000.0)
    }

    /// Payload used for progress and final status envelopes
    pub fn status_payload(&self) -> Value {
        json!({
            "workflow_id": self.id.to_string(),
            "command_type": self.command_type.as_str(),
            "status": self.status.as_str(),
            "progress": self.progress,
            "current_step": self.current_step,
            "steps_completed": self.steps_completed,
            "steps_failed": self.steps_failed,
            "error_messages": self.error_messages,
            "result": self.result,
            "started_at": self.started_at,
            "completed_at": self.completed_at,
            "duration_seconds": self.duration_seconds(),
        })
    }
}
