//! Domain types for the agent fleet: agent records, process identifiers,
//! table schemas, and streaming update payloads.

/// Agent records and host-identity keying
pub mod agent;
/// Per-agent table announcements and the derived cluster schema
pub mod schema;
/// Streaming update payloads and change-feed events
pub mod update;
/// 128-bit unique process identifiers
pub mod upid;

pub use agent::{Agent, AgentRegistration, HostInfo, HostKey};
pub use schema::{ColumnSchema, ComputedSchema, DataType, TableOwners, TableSchema};
pub use update::{
    AgentDataInfo, AgentUpdate, FeedEntry, FeedEvent, ProcessCreated, ProcessInfo,
    ProcessTerminated,
};
pub use upid::Upid;
