//! Command model
//!
//! A [`Command`] is the high-level request a management agent sends to the
//! orchestrator. Command types form a closed set; anything else is rejected
//! before a workflow is created.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Parameters passed to a command handler
pub type Parameters = Map<String, Value>;

/// Closed set of commands the orchestrator understands
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    RestartDiscoverySystem,
    ValidateAlgorithms,
    RunBacktest,
    ClearCache,
    GenerateReport,
    HealthCheck,
    EmergencyStop,
}

impl CommandType {
    pub const ALL: [CommandType; 7] = [
        CommandType::RestartDiscoverySystem,
        CommandType::ValidateAlgorithms,
        CommandType::RunBacktest,
        CommandType::ClearCache,
        CommandType::GenerateReport,
        CommandType::HealthCheck,
        CommandType::EmergencyStop,
    ];

    /// Wire name of the command type
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::RestartDiscoverySystem => "restart_discovery_system",
            CommandType::ValidateAlgorithms => "validate_algorithms",
            CommandType::RunBacktest => "run_backtest",
            CommandType::ClearCache => "clear_cache",
            CommandType::GenerateReport => "generate_report",
            CommandType::HealthCheck => "health_check",
            CommandType::EmergencyStop => "emergency_stop",
        }
    }

    /// Rough duration reported back in the acknowledgment
    pub fn estimated_duration(&self) -> Duration {
        let seconds = match self {
            CommandType::RestartDiscoverySystem => 120,
            CommandType::ValidateAlgorithms => 300,
            CommandType::RunBacktest => 900,
            CommandType::ClearCache => 30,
            CommandType::GenerateReport => 60,
            CommandType::HealthCheck => 10,
            CommandType::EmergencyStop => 5,
        };
        Duration::from_secs(seconds)
    }

    /// Whether the command must be admitted even when the fleet is saturated
    pub fn bypasses_concurrency_limit(&self) -> bool {
        matches!(self, CommandType::EmergencyStop)
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandType {
    type Err = Error;

    /// Accepts wire names and human phrasing alike:
    /// `"health_check"`, `"Health Check"` and `"health-check"` are equal.
    fn from_str(s: &str) -> Result<Self> {
        let normalized = s
            .trim()
            .to_lowercase()
            .split(|c: char| c.is_whitespace() || c == '-' || c == '_')
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("_");

        CommandType::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| Error::unknown_command(s))
    }
}

/// A request to run one workflow
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Command {
    pub command_type: CommandType,
    pub payload: Parameters,
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
}

impl Command {
    pub fn new(command_type: CommandType, payload: Parameters) -> Self {
        Self {
            command_type,
            payload,
            timestamp: Utc::now(),
            request_id: Uuid::new_v4().to_string(),
        }
    }

    /// Parse the payload of a `command` envelope.
    ///
    /// Expected shape: `{"command_type": "<name>", "parameters": {...}}`.
    /// `"command"` is accepted in place of `"command_type"`, and missing
    /// parameters mean an empty map. `request_id` defaults to `fallback_id`.
    pub fn from_payload(payload: &Value, fallback_id: &str) -> Result<Self> {
        let name = payload
            .get("command_type")
            .or_else(|| payload.get("command"))
            .and_then(Value::as_str)
            .ok_or_else(|| Error::validation("Command payload is missing command_type"))?;
        let command_type = name.parse::<CommandType>()?;

        let parameters = match payload.get("parameters") {
            None | Some(Value::Null) => Parameters::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => return Err(Error::validation("Command parameters must be an object")),
        };

        let request_id = payload
            .get("request_id")
            .and_then(Value::as_str)
            .unwrap_or(fallback_id)
            .to_string();

        Ok(Self {
            command_type,
            payload: parameters,
            timestamp: Utc::now(),
            request_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_wire_and_human_names() {
        assert_eq!(
            "restart_discovery_system".parse::<CommandType>().unwrap(),
            CommandType::RestartDiscoverySystem
        );
        assert_eq!(
            "Restart Discovery System".parse::<CommandType>().unwrap(),
            CommandType::RestartDiscoverySystem
        );
        assert_eq!(
            "health-check".parse::<CommandType>().unwrap(),
            CommandType::HealthCheck
        );
        assert_eq!(
            "  emergency   stop ".parse::<CommandType>().unwrap(),
            CommandType::EmergencyStop
        );
    }

    #[test]
    fn test_unknown_command_is_rejected() {
        let err = "rebalance portfolio".parse::<CommandType>().unwrap_err();
        assert!(matches!(err, Error::UnknownCommand { .. }));
    }

    #[test]
    fn test_every_type_round_trips_its_wire_name() {
        for kind in CommandType::ALL {
            assert_eq!(kind.as_str().parse::<CommandType>().unwrap(), kind);
            let encoded = serde_json::to_value(kind).unwrap();
            assert_eq!(encoded, json!(kind.as_str()));
        }
    }

    #[test]
    fn test_from_payload() {
        let payload = json!({
            "command_type": "validate algorithms",
            "parameters": {"universe": "sp500"},
            "request_id": "req-7"
        });
        let command = Command::from_payload(&payload, "fallback").unwrap();
        assert_eq!(command.command_type, CommandType::ValidateAlgorithms);
        assert_eq!(command.payload["universe"], "sp500");
        assert_eq!(command.request_id, "req-7");

        let payload = json!({"command": "clear_cache"});
        let command = Command::from_payload(&payload, "env-1").unwrap();
        assert!(command.payload.is_empty());
        assert_eq!(command.request_id, "env-1");
    }

    #[test]
    fn test_from_payload_rejects_bad_shapes() {
        assert!(Command::from_payload(&json!({}), "x").is_err());
        assert!(Command::from_payload(
            &json!({"command_type": "health_check", "parameters": [1]}),
            "x"
        )
        .is_err());
    }

    #[test]
    fn test_only_emergency_stop_bypasses_limit() {
        let bypassing: Vec<_> = CommandType::ALL
            .into_iter()
            .filter(CommandType::bypasses_concurrency_limit)
            .collect();
        assert_eq!(bypassing, vec![CommandType::EmergencyStop]);
    }
}
