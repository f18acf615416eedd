use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error types for the agent fleet manager
///
/// Covers every failure surface of the system: registry lookups, cursor
/// bookkeeping, datastore batches, and bus publishes. Variants carry named
/// fields so callers can match without parsing messages.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum FleetError {
    /// Operation targeted a UUID or pod identity that is not registered
    #[error("Agent not found: {id}")]
    AgentNotFound { id: String },

    /// Cursor id is unregistered or was deleted
    #[error("Cursor not found: {id}")]
    CursorNotFound { id: String },

    /// Host identity already claimed by a different live agent
    ///
    /// Never surfaced from `register_agent`; registration resolves the
    /// conflict internally by evicting the occupant.
    #[error("Host identity ({hostname}, {host_ip}) held by {occupant}")]
    HostConflict {
        hostname: String,
        host_ip: String,
        occupant: String,
    },

    /// Deadline reached before the batch committed; no partial state
    #[error("Operation cancelled: {operation}")]
    Cancelled { operation: String },

    /// Retriable store failure; surfaced once the retry budget is spent
    #[error("Transient storage failure in {operation}: {reason}")]
    Transient { operation: String, reason: String },

    /// Record bytes failed to deserialize
    #[error("Corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },

    /// Non-retriable storage failure
    #[error("Storage error in {operation}: {reason}")]
    Storage { operation: String, reason: String },

    /// Message bus publish failed
    #[error("Bus publish failed on {subject}: {reason}")]
    Bus { subject: String, reason: String },

    /// Configuration loading or validation failure
    #[error("Configuration error: {reason}")]
    ConfigError { reason: String },
}

impl FleetError {
    /// True when retrying the same operation may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, FleetError::Transient { .. })
    }

    pub(crate) fn agent_not_found(id: impl ToString) -> Self {
        FleetError::AgentNotFound { id: id.to_string() }
    }

    pub(crate) fn corrupt(key: &[u8], reason: impl ToString) -> Self {
        FleetError::Corrupt {
            key: String::from_utf8_lossy(key).into_owned(),
            reason: reason.to_string(),
        }
    }
}

/// Result type alias used throughout the fleet manager
pub type FleetResult<T> = Result<T, FleetError>;
