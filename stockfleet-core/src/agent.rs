//! Agent registration record
//!
//! One [`AgentRegistration`] exists per fleet agent the orchestrator has
//! heard from. Records are never removed; an agent whose heartbeat is older
//! than the configured threshold is reported as stale instead.
//!
//! # Examples
//!
//! ```rust
//! use stockfleet_core::agent::*;
//!
//! let mut agent = AgentRegistration::new("discovery_agent", ["discovery", "scoring"]).unwrap();
//! agent.record_error("upstream quote feed timed out");
//!
//! assert!(agent.has_capability("scoring"));
//! assert_eq!(agent.error_count, 1);
//! ```

use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;

/// Reported status of a fleet agent
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Online,
    Busy,
    Degraded,
    Error,
    Offline,
}

impl AgentStatus {
    /// Parse a status reported by an agent; unknown values map to `None`
    pub fn from_report(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "online" | "healthy" | "running" | "idle" => Some(AgentStatus::Online),
            "busy" | "working" => Some(AgentStatus::Busy),
            "degraded" | "warning" => Some(AgentStatus::Degraded),
            "error" | "failed" | "unhealthy" => Some(AgentStatus::Error),
            "offline" | "stopped" => Some(AgentStatus::Offline),
            _ => None,
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AgentStatus::Online => "online",
            AgentStatus::Busy => "busy",
            AgentStatus::Degraded => "degraded",
            AgentStatus::Error => "error",
            AgentStatus::Offline => "offline",
        };
        f.write_str(label)
    }
}

/// What the orchestrator knows about one agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentRegistration {
    pub name: String,
    pub capabilities: BTreeSet<String>,
    pub status: AgentStatus,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub metrics: Map<String, Value>,
    pub error_count: u64,
    pub last_error: Option<String>,
}

impl AgentRegistration {
    /// Create a new registration with validation
    pub fn new<S, I, C>(name: S, capabilities: I) -> Result<Self>
    where
        S: Into<String>,
        I: IntoIterator<Item = C>,
        C: Into<String>,
    {
        let name = name.into();
        Self::validate_name(&name)?;
        let capabilities = capabilities
            .into_iter()
            .map(Into::into)
            .collect::<BTreeSet<String>>();
        Self::validate_capabilities(&capabilities)?;

        let now = Utc::now();
        Ok(Self {
            name,
            capabilities,
            status: AgentStatus::Online,
            registered_at: now,
            last_heartbeat: now,
            metrics: Map::new(),
            error_count: 0,
            last_error: None,
        })
    }

    /// Validate agent name
    pub fn validate_name(name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(Error::validation("Agent name cannot be empty"));
        }
        if name.len() > 100 {
            return Err(Error::validation("Agent name cannot exceed 100 characters"));
        }
        if !name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(Error::validation(
                "Agent name can only contain alphanumeric characters, dots, hyphens, and underscores",
            ));
        }
        Ok(())
    }

    fn validate_capabilities(capabilities: &BTreeSet<String>) -> Result<()> {
        for capability in capabilities {
            if capability.trim().is_empty() {
                return Err(Error::validation("Capability cannot be empty"));
            }
            if capability.len() > 50 {
                return Err(Error::validation(
                    "Capability name cannot exceed 50 characters",
                ));
            }
        }
        Ok(())
    }

    /// Replace the capability set
    pub fn set_capabilities<I, C>(&mut self, capabilities: I) -> Result<()>
    where
        I: IntoIterator<Item = C>,
        C: Into<String>,
    {
        let capabilities: BTreeSet<String> = capabilities.into_iter().map(Into::into).collect();
        Self::validate_capabilities(&capabilities)?;
        self.capabilities = capabilities;
        Ok(())
    }

    /// Record a heartbeat, merging reported metrics
    pub fn record_heartbeat(&mut self, metrics: Map<String, Value>) {
        self.metrics.extend(metrics);
        self.touch();
        if matches!(self.status, AgentStatus::Offline) {
            self.status = AgentStatus::Online;
        }
    }

    /// Record an error reported by (or about) the agent
    pub fn record_error<S: Into<String>>(&mut self, message: S) {
        self.error_count += 1;
        self.last_error = Some(message.into());
        self.status = AgentStatus::Error;
        self.touch();
    }

    /// Update the agent's status
    pub fn set_status(&mut self, status: AgentStatus) {
        self.status = status;
        self.touch();
    }

    /// Mark the agent as seen now
    pub fn touch(&mut self) {
        self.last_heartbeat = Utc::now();
    }

    /// Check whether the agent has a specific capability
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    /// Seconds since the last heartbeat
    pub fn heartbeat_age_seconds(&self) -> i64 {
        Utc::now()
            .signed_duration_since(self.last_heartbeat)
            .num_seconds()
    }

    /// Whether the last heartbeat is older than `threshold`
    pub fn is_stale(&self, threshold: Duration) -> bool {
        Utc::now().signed_duration_since(self.last_heartbeat) > threshold
    }

    /// Whether the agent is fresh and not reporting trouble
    pub fn is_healthy(&self, threshold: Duration) -> bool {
        !self.is_stale(threshold)
            && matches!(self.status, AgentStatus::Online | AgentStatus::Busy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_registration_creation() {
        let agent =
            AgentRegistration::new("validation_agent", ["validation", "validation"]).unwrap();
        assert_eq!(agent.capabilities.len(), 1);
        assert_eq!(agent.status, AgentStatus::Online);
        assert_eq!(agent.error_count, 0);
        assert!(agent.is_healthy(Duration::seconds(60)));
    }

    #[test]
    fn test_name_validation() {
        assert!(AgentRegistration::new("", Vec::<String>::new()).is_err());
        assert!(AgentRegistration::new("bad name!", Vec::<String>::new()).is_err());
        assert!(AgentRegistration::new("a".repeat(101), Vec::<String>::new()).is_err());
        assert!(AgentRegistration::new("cache-agent.eu_1", Vec::<String>::new()).is_ok());
    }

    #[test]
    fn test_heartbeat_merges_metrics() {
        let mut agent = AgentRegistration::new("cache_agent", ["cache"]).unwrap();
        agent.set_status(AgentStatus::Offline);

        let mut metrics = Map::new();
        metrics.insert("hit_rate".into(), json!(0.93));
        agent.record_heartbeat(metrics);

        let mut metrics = Map::new();
        metrics.insert("entries".into(), json!(1200));
        agent.record_heartbeat(metrics);

        assert_eq!(agent.metrics.len(), 2);
        assert_eq!(agent.status, AgentStatus::Online);
    }

    #[test]
    fn test_error_tracking() {
        let mut agent = AgentRegistration::new("backtest_agent", ["backtesting"]).unwrap();
        agent.record_error("out of memory");
        agent.record_error("worker crashed");

        assert_eq!(agent.error_count, 2);
        assert_eq!(agent.last_error.as_deref(), Some("worker crashed"));
        assert!(!agent.is_healthy(Duration::seconds(60)));
    }

    #[test]
    fn test_staleness() {
        let mut agent = AgentRegistration::new("monitoring_agent", ["monitoring"]).unwrap();
        agent.last_heartbeat = Utc::now() - Duration::seconds(300);

        assert!(agent.is_stale(Duration::seconds(120)));
        assert!(!agent.is_stale(Duration::seconds(600)));
        assert!(agent.heartbeat_age_seconds() >= 300);
    }

    #[test]
    fn test_status_reports() {
        assert_eq!(AgentStatus::from_report("Healthy"), Some(AgentStatus::Online));
        assert_eq!(AgentStatus::from_report("busy"), Some(AgentStatus::Busy));
        assert_eq!(AgentStatus::from_report("???"), None);
    }
}
