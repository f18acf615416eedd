//! # Agent Records
//!
//! Core types describing one agent in the fleet: its stable UUID identity,
//! the short ASID assigned by the manager, its host identity, and the two
//! nanosecond timestamps liveness is derived from.
//!
//! ## Identity keying
//!
//! Data-collecting agents are tied to a physical host and keyed by IP alone;
//! non-collecting aggregators may coexist on a host and are keyed by
//! `(hostname, ip)`. [`HostKey`] encodes that capability-dependent rule in
//! one place so the registry and the index keyspace cannot disagree.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Host identity as reported by the agent at registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HostInfo {
    pub hostname: String,
    pub host_ip: String,
}

impl HostInfo {
    #[must_use]
    pub fn new(hostname: impl Into<String>, host_ip: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            host_ip: host_ip.into(),
        }
    }
}

/// Capability-dependent host-index key
///
/// At most one live agent may claim a given key. Collectors drop the
/// hostname so a restarted collector on the same IP always collides with
/// its prior incarnation regardless of pod naming.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostKey {
    pub hostname: String,
    pub host_ip: String,
}

impl HostKey {
    /// Key for an agent with the given host identity and capability
    #[must_use]
    pub fn from_parts(host: &HostInfo, collects_data: bool) -> Self {
        if collects_data {
            Self {
                hostname: String::new(),
                host_ip: host.host_ip.clone(),
            }
        } else {
            Self {
                hostname: host.hostname.clone(),
                host_ip: host.host_ip.clone(),
            }
        }
    }
}

/// One registered agent
///
/// `asid` is dense and unique among live agents; `create_time_ns` survives
/// re-registration while `last_heartbeat_ns` is overwritten on every
/// heartbeat. Liveness is derived from heartbeat age, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    /// Stable 128-bit identity, declared by the agent
    pub id: Uuid,
    /// Agent short id assigned by the manager
    pub asid: u32,
    /// Host identity
    pub host: HostInfo,
    /// Kubernetes namespace of the agent pod, empty when not applicable
    pub namespace: String,
    /// Pod name, empty when the agent runs outside an orchestrator
    pub pod_name: String,
    /// Whether this agent collects data (vs. a non-collecting aggregator)
    pub collects_data: bool,
    pub create_time_ns: u64,
    pub last_heartbeat_ns: u64,
}

impl Agent {
    /// Host-index key for this agent
    #[must_use]
    pub fn host_key(&self) -> HostKey {
        HostKey::from_parts(&self.host, self.collects_data)
    }

    /// Age of the last heartbeat relative to `now_ns`
    #[must_use]
    pub fn heartbeat_age_ns(&self, now_ns: u64) -> u64 {
        now_ns.saturating_sub(self.last_heartbeat_ns)
    }

    /// Whether the heartbeat is fresh enough for the agent to count as healthy
    #[must_use]
    pub fn is_healthy(&self, now_ns: u64, expiry_threshold_ns: u64) -> bool {
        self.heartbeat_age_ns(now_ns) < expiry_threshold_ns
    }
}

/// Declared registration payload
///
/// Carries the agent's self-reported identity. The declared timestamps are
/// ignored by the registry: new registrations stamp both from the clock and
/// re-registrations preserve the stored creation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub id: Uuid,
    pub host: HostInfo,
    pub namespace: String,
    pub pod_name: String,
    pub collects_data: bool,
    pub create_time_ns: u64,
    pub last_heartbeat_ns: u64,
}

impl AgentRegistration {
    /// Host-index key this registration resolves through
    #[must_use]
    pub fn host_key(&self) -> HostKey {
        HostKey::from_parts(&self.host, self.collects_data)
    }
}
