//! # Agent Fleet Manager
//!
//! Authoritative registry and update-propagation engine for a cluster-wide
//! fleet of telemetry agents. The manager keeps durable per-agent state in a
//! byte-ordered key-value store, resolves agent identity across restarts and
//! host collisions, maintains the derived cluster-wide schema view, ingests
//! process-lifecycle updates, serves incremental change feeds through
//! resumable cursors, and pushes configuration commands to live agents over
//! a message bus.
//!
//! ## Architecture Overview
//!
//! - [`core`]: the manager facade and its subsystems (registration,
//!   ingestion, change feed, background sweepers)
//! - [`agents`]: domain types (agent records, UPIDs, schemas, updates)
//! - [`infrastructure`]: keyspace layout, the key-value store contract, and
//!   the typed datastore
//! - [`communication`]: the message-bus seam and agent-addressed commands
//! - [`utils`]: configuration, clocks, and error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use agent_fleet::{AgentManager, FleetConfig, FleetSweeper, InProcessBus, SledStore, SystemClock};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let clock = Arc::new(SystemClock);
//!     let store = Arc::new(SledStore::open("/var/lib/fleet/db", clock.clone())?);
//!     let bus = Arc::new(InProcessBus::new());
//!     let config = FleetConfig::from_env()?;
//!
//!     let manager = Arc::new(AgentManager::new(store, bus, clock, config.clone()).await?);
//!
//!     let sweeper = FleetSweeper::new(&config);
//!     sweeper.start(manager.clone()).await;
//!
//!     Ok(())
//! }
//! ```

/// Domain types for agents, processes, schemas, and updates
pub mod agents;
/// Message-bus seam and agent-addressed commands
pub mod communication;
/// Manager facade and core subsystems
pub mod core;
/// Persistence: keyspace, store contract, typed datastore
pub mod infrastructure;
/// Configuration, clocks, and errors
pub mod utils;

pub use agents::{
    Agent, AgentDataInfo, AgentRegistration, AgentUpdate, ComputedSchema, FeedEntry, FeedEvent,
    HostInfo, HostKey, ProcessCreated, ProcessInfo, ProcessTerminated, TableSchema, Upid,
};
pub use communication::{CommandPublisher, InProcessBus, MessageBus};
pub use core::{AgentManager, AgentUpdatesBatch, FleetSweeper};
pub use infrastructure::{Datastore, KeyValueStore, MemoryStore, SledStore};
pub use utils::{Clock, FixedClock, FleetConfig, FleetError, FleetResult, SystemClock};
