//! In-memory registry of fleet agents
//!
//! Records are created the first time an agent is heard from and are never
//! removed. Agents whose last heartbeat is older than the configured
//! threshold are reported as stale.

use crate::Result;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;
use stockfleet_core::agent::{AgentRegistration, AgentStatus};
use tracing::{debug, info, warn};

/// Outcome of checking a recipient before sending to it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipientCheck {
    Registered,
    /// The envelope is still sent; the queue holds it until the agent appears
    Unregistered,
}

/// Aggregate view used by the health check
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RegistryHealth {
    pub total: usize,
    pub healthy: usize,
    pub stale: Vec<String>,
    pub errored: Vec<String>,
}

impl RegistryHealth {
    pub fn is_healthy(&self) -> bool {
        self.stale.is_empty() && self.errored.is_empty()
    }
}

/// Concurrent agent registry
#[derive(Debug)]
pub struct AgentRegistry {
    agents: DashMap<String, AgentRegistration>,
    stale_after: chrono::Duration,
}

impl AgentRegistry {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            agents: DashMap::new(),
            stale_after: chrono::Duration::from_std(stale_after)
                .unwrap_or_else(|_| chrono::Duration::days(365)),
        }
    }

    /// Register an agent, or replace the capabilities of a known one
    pub fn register<I, C>(&self, name: &str, capabilities: I) -> Result<AgentRegistration>
    where
        I: IntoIterator<Item = C>,
        C: Into<String>,
    {
        match self.agents.entry(name.to_string()) {
            Entry::Occupied(mut entry) => {
                let agent = entry.get_mut();
                agent.set_capabilities(capabilities)?;
                agent.touch();
                debug!(agent = %name, "Updated agent capabilities");
                Ok(agent.clone())
            }
            Entry::Vacant(entry) => {
                let registration = AgentRegistration::new(name, capabilities)?;
                info!(
                    agent = %name,
                    capabilities = ?registration.capabilities,
                    "Agent registered"
                );
                Ok(entry.insert(registration).clone())
            }
        }
    }

    /// Apply `update` to the record for `name`, registering it first if unknown
    fn upsert<F>(&self, name: &str, update: F) -> Result<()>
    where
        F: FnOnce(&mut AgentRegistration),
    {
        match self.agents.entry(name.to_string()) {
            Entry::Occupied(mut entry) => update(entry.get_mut()),
            Entry::Vacant(entry) => {
                let mut registration = AgentRegistration::new(name, Vec::<String>::new())?;
                update(&mut registration);
                info!(agent = %name, "Auto-registered agent on first contact");
                entry.insert(registration);
            }
        }
        Ok(())
    }

    pub fn record_heartbeat(&self, name: &str, metrics: Map<String, Value>) -> Result<()> {
        self.upsert(name, |agent| agent.record_heartbeat(metrics))?;
        debug!(agent = %name, "Heartbeat recorded");
        Ok(())
    }

    pub fn record_response(&self, name: &str) -> Result<()> {
        self.upsert(name, AgentRegistration::touch)
    }

    pub fn record_status(&self, name: &str, status: AgentStatus) -> Result<()> {
        self.upsert(name, |agent| agent.set_status(status))?;
        debug!(agent = %name, status = %status, "Agent status recorded");
        Ok(())
    }

    pub fn record_error(&self, name: &str, message: &str) -> Result<()> {
        self.upsert(name, |agent| agent.record_error(message))?;
        warn!(agent = %name, error = %message, "Agent reported an error");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<AgentRegistration> {
        self.agents.get(name).map(|agent| agent.clone())
    }

    /// Snapshot of every registration
    pub fn status(&self) -> HashMap<String, AgentRegistration> {
        self.agents
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Registered agent names, sorted
    pub fn agent_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    /// Agents whose heartbeat is older than the stale threshold, sorted
    pub fn stale_agents(&self) -> Vec<String> {
        let mut stale: Vec<String> = self
            .agents
            .iter()
            .filter(|entry| entry.value().is_stale(self.stale_after))
            .map(|entry| entry.key().clone())
            .collect();
        stale.sort();
        stale
    }

    /// Warn when sending to an agent the registry has never heard from
    pub fn check_recipient(&self, name: &str) -> RecipientCheck {
        if self.agents.contains_key(name) {
            RecipientCheck::Registered
        } else {
            warn!(recipient = %name, "unregistered recipient");
            RecipientCheck::Unregistered
        }
    }

    pub fn health(&self) -> RegistryHealth {
        let mut health = RegistryHealth {
            total: 0,
            healthy: 0,
            stale: Vec::new(),
            errored: Vec::new(),
        };
        for entry in self.agents.iter() {
            let agent = entry.value();
            health.total += 1;
            if agent.is_stale(self.stale_after) {
                health.stale.push(agent.name.clone());
            } else if agent.status == AgentStatus::Error {
                health.errored.push(agent.name.clone());
            } else if agent.is_healthy(self.stale_after) {
                health.healthy += 1;
            }
        }
        health.stale.sort();
        health.errored.sort();
        health
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
