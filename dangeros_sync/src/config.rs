// Timing knobs of the election protocol.
//
// All durations are stored in milliseconds so the config reads naturally as
// JSON, e.g.
//
//   { "join_timeout_ms": 4000, "migration_step_ms": 1500 }
//
// Missing fields take the defaults below, which are the values the board has
// always run with. Every participant of a room should use the same values:
// the migration backoff only orders participants correctly if everybody's
// `migration_step_ms` agrees.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiatorConfig {
    /// How long a joining participant waits for the relay before claiming
    /// the relay address itself.
    pub join_timeout_ms: u64,
    /// Migration backoff per roster position.
    pub migration_step_ms: u64,
    /// Backoff for a participant missing from the roster.
    pub migration_fallback_ms: u64,
    /// While waiting out the backoff, how often to dial the relay address to
    /// see whether somebody else already took over.
    pub migration_probe_interval_ms: u64,
    /// Delay before retrying as a client after a failed claim.
    pub claim_retry_delay_ms: u64,
    /// How long a handle may stay unopened before it is given up on and the
    /// participant retries as a client.
    pub open_timeout_ms: u64,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            join_timeout_ms: 4000,
            migration_step_ms: 1500,
            migration_fallback_ms: 8000,
            migration_probe_interval_ms: 500,
            claim_retry_delay_ms: 1000,
            open_timeout_ms: 10_000,
        }
    }
}

impl NegotiatorConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn migration_step(&self) -> Duration {
        Duration::from_millis(self.migration_step_ms)
    }

    pub fn migration_fallback(&self) -> Duration {
        Duration::from_millis(self.migration_fallback_ms)
    }

    pub fn migration_probe_interval(&self) -> Duration {
        Duration::from_millis(self.migration_probe_interval_ms)
    }

    pub fn claim_retry_delay(&self) -> Duration {
        Duration::from_millis(self.claim_retry_delay_ms)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    /// Backoff before claiming the relay address after the relay vanished.
    /// `position` is our index in the last known roster.
    pub fn migration_wait(&self, position: Option<usize>) -> Duration {
        match position {
            Some(index) => self.migration_step() * u32::try_from(index).unwrap_or(u32::MAX),
            None => self.migration_fallback(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = NegotiatorConfig::from_json(r#"{ "join_timeout_ms": 250 }"#).unwrap();
        assert_eq!(config.join_timeout(), Duration::from_millis(250));
        assert_eq!(config.migration_step_ms, 1500);
        assert_eq!(config.claim_retry_delay_ms, 1000);
        assert_eq!(config.open_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn bad_json_is_an_error() {
        assert!(NegotiatorConfig::from_json("{ nope").is_err());
        assert!(NegotiatorConfig::from_json(r#"{ "join_timeout_ms": "soon" }"#).is_err());
    }

    #[test]
    fn wait_grows_with_roster_position() {
        let config = NegotiatorConfig::default();
        assert_eq!(config.migration_wait(Some(0)), Duration::ZERO);
        assert_eq!(config.migration_wait(Some(2)), Duration::from_millis(3000));
        assert_eq!(config.migration_wait(None), Duration::from_millis(8000));
    }
}
