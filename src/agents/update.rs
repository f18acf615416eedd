//! Streaming update payloads and change-feed events.
//!
//! [`AgentUpdate`] is the envelope an agent pushes on every report cycle:
//! optional schema replacement, process lifecycle records, and the metadata
//! data-info blob. [`FeedEvent`] is what the manager appends to the durable
//! change feed for cursor consumers.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agents::agent::Agent;
use crate::agents::schema::TableSchema;
use crate::agents::upid::Upid;

/// One reported update from an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AgentUpdate {
    /// Full replacement set of announced tables; only applied when
    /// `does_update_schema` is set
    pub schema: Vec<TableSchema>,
    pub does_update_schema: bool,
    pub process_created: Vec<ProcessCreated>,
    pub process_terminated: Vec<ProcessTerminated>,
    pub data_info: Option<AgentDataInfo>,
}

/// Process start observed by the agent
///
/// The UPID is composed server-side from the owning agent's ASID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessCreated {
    pub pid: u32,
    pub start_time_ns: u64,
    pub cmdline: String,
}

/// Process exit observed by the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessTerminated {
    pub upid: Upid,
    pub stop_time_ns: u64,
}

/// Persisted process record
///
/// `stop_time_ns == 0` means the process is still running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub upid: Upid,
    pub cmdline: String,
    pub start_time_ns: u64,
    pub stop_time_ns: u64,
}

impl ProcessInfo {
    #[must_use]
    pub fn running(upid: Upid, cmdline: String, start_time_ns: u64) -> Self {
        Self {
            upid,
            cmdline,
            start_time_ns,
            stop_time_ns: 0,
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.stop_time_ns == 0
    }
}

/// Metadata bloom-filter blob reported by one agent
///
/// The filter bytes are opaque to the manager; only downstream metadata
/// filtering interprets them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AgentDataInfo {
    pub metadata_fields: Vec<String>,
    pub bloom_filter: Vec<u8>,
}

/// One durable change-feed entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedEntry {
    /// Strictly increasing commit-order sequence number
    pub sequence: u64,
    pub event: FeedEvent,
}

/// Agent-level change event delivered to cursor consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FeedEvent {
    AgentCreated { agent: Agent },
    AgentUpdated { agent: Agent },
    AgentDeleted { agent_id: Uuid },
    DataInfoUpdated { agent_id: Uuid, data_info: AgentDataInfo },
}

impl FeedEvent {
    /// UUID of the agent the event concerns
    #[must_use]
    pub fn agent_id(&self) -> Uuid {
        match self {
            FeedEvent::AgentCreated { agent } | FeedEvent::AgentUpdated { agent } => agent.id,
            FeedEvent::AgentDeleted { agent_id }
            | FeedEvent::DataInfoUpdated { agent_id, .. } => *agent_id,
        }
    }
}
