//! Fleet manager configuration.
//!
//! Loaded from a TOML file, overridden from `FLEET_*` environment variables,
//! with defaults suitable for a production deployment. Nanosecond-valued
//! thresholds are plain `u64` fields so they serialize without precision loss.

use std::env;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::utils::error::{FleetError, FleetResult};

const NS_PER_SECOND: u64 = 1_000_000_000;

/// Configuration for the agent fleet manager
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FleetConfig {
    pub agent: AgentConfig,
    pub feed: FeedConfig,
    pub cursor: CursorConfig,
    pub store: StoreConfig,
    pub sweep: SweepConfig,
}

/// Agent liveness thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Heartbeat age after which an agent is considered unhealthy
    pub expiry_threshold_ns: u64,
    /// Heartbeat age after which an agent is deleted by the sweeper
    pub death_threshold_ns: u64,
}

/// Change-feed retention
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Minimum retention of change-feed entries
    pub retention_ns: u64,
}

/// Cursor retention
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CursorConfig {
    /// Maximum idle time before an unused cursor is garbage-collected
    pub idle_retention_ns: u64,
}

/// Datastore batch behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Bound on each persisted batch in milliseconds
    pub write_timeout_ms: u64,
    /// Retries for transient store failures before surfacing the error
    pub retry_attempts: u32,
    /// Base backoff between retries in milliseconds (scaled per attempt)
    pub retry_backoff_ms: u64,
    /// Retention of process records
    pub process_ttl_ns: u64,
}

/// Background sweeper cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Interval between sweeper iterations in milliseconds
    pub interval_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            expiry_threshold_ns: 60 * NS_PER_SECOND,
            death_threshold_ns: 240 * NS_PER_SECOND,
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            retention_ns: 24 * 3600 * NS_PER_SECOND,
        }
    }
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            idle_retention_ns: 2 * 3600 * NS_PER_SECOND,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            write_timeout_ms: 5_000,
            retry_attempts: 3,
            retry_backoff_ms: 50,
            process_ttl_ns: 24 * 3600 * NS_PER_SECOND,
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self { interval_ms: 10_000 }
    }
}

impl FleetConfig {
    /// Load configuration from a TOML file, then apply environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> FleetResult<Self> {
        let raw = fs::read_to_string(path.as_ref()).map_err(|e| FleetError::ConfigError {
            reason: format!("failed to read {}: {e}", path.as_ref().display()),
        })?;
        let mut config: FleetConfig = toml::from_str(&raw).map_err(|e| FleetError::ConfigError {
            reason: format!("failed to parse {}: {e}", path.as_ref().display()),
        })?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> FleetResult<Self> {
        let mut config = FleetConfig::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `FLEET_*` environment variable overrides
    ///
    /// Unparseable values are ignored so a typo cannot take the manager down.
    pub fn apply_env_overrides(&mut self) {
        override_u64(
            "FLEET_AGENT_EXPIRY_THRESHOLD_NS",
            &mut self.agent.expiry_threshold_ns,
        );
        override_u64(
            "FLEET_AGENT_DEATH_THRESHOLD_NS",
            &mut self.agent.death_threshold_ns,
        );
        override_u64("FLEET_FEED_RETENTION_NS", &mut self.feed.retention_ns);
        override_u64(
            "FLEET_CURSOR_IDLE_RETENTION_NS",
            &mut self.cursor.idle_retention_ns,
        );
        override_u64("FLEET_STORE_WRITE_TIMEOUT_MS", &mut self.store.write_timeout_ms);
        override_u64("FLEET_STORE_PROCESS_TTL_NS", &mut self.store.process_ttl_ns);
        override_u64("FLEET_SWEEP_INTERVAL_MS", &mut self.sweep.interval_ms);
        if let Some(v) = env_u64("FLEET_STORE_RETRY_ATTEMPTS") {
            self.store.retry_attempts = v as u32;
        }
    }

    /// Reject configurations that would make the manager misbehave
    pub fn validate(&self) -> FleetResult<()> {
        if self.agent.expiry_threshold_ns == 0 {
            return Err(FleetError::ConfigError {
                reason: "agent.expiry_threshold_ns must be non-zero".to_string(),
            });
        }
        if self.agent.death_threshold_ns < self.agent.expiry_threshold_ns {
            return Err(FleetError::ConfigError {
                reason: "agent.death_threshold_ns must be >= agent.expiry_threshold_ns"
                    .to_string(),
            });
        }
        if self.feed.retention_ns == 0 {
            return Err(FleetError::ConfigError {
                reason: "feed.retention_ns must be non-zero".to_string(),
            });
        }
        if self.store.write_timeout_ms == 0 {
            return Err(FleetError::ConfigError {
                reason: "store.write_timeout_ms must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

fn env_u64(name: &str) -> Option<u64> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

fn override_u64(name: &str, target: &mut u64) {
    if let Some(v) = env_u64(name) {
        *target = v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = FleetConfig::default();
        assert_eq!(config.agent.expiry_threshold_ns, 60 * NS_PER_SECOND);
        assert!(config.agent.death_threshold_ns >= config.agent.expiry_threshold_ns);
        assert_eq!(config.store.write_timeout_ms, 5_000);
        config.validate().unwrap();
    }

    #[test]
    fn test_from_file_partial_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[agent]\nexpiry_threshold_ns = 5000000000\ndeath_threshold_ns = 20000000000\n\n[sweep]\ninterval_ms = 250"
        )
        .unwrap();

        let config = FleetConfig::from_file(file.path()).unwrap();
        assert_eq!(config.agent.expiry_threshold_ns, 5_000_000_000);
        assert_eq!(config.sweep.interval_ms, 250);
        // Untouched sections keep their defaults
        assert_eq!(config.store.retry_attempts, 3);
    }

    #[test]
    fn test_validate_rejects_inverted_thresholds() {
        let mut config = FleetConfig::default();
        config.agent.death_threshold_ns = config.agent.expiry_threshold_ns - 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_retention() {
        let mut config = FleetConfig::default();
        config.feed.retention_ns = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = FleetConfig::from_file("/nonexistent/fleet.toml").unwrap_err();
        assert!(matches!(err, FleetError::ConfigError { .. }));
    }
}
