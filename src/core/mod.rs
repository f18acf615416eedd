//! # Fleet Core
//!
//! The manager and its subsystems, composed from focused modules:
//!
//! - **`manager`**: the facade callers hold; serializes mutations
//! - **`registration`**: identity resolution and ASID allocation
//! - **`ingest`**: streamed agent-report application
//! - **`feed`**: durable change feed consumed through cursors
//! - **`sweepers`**: background expiry and trim duties

/// Cursor and change-feed engine
pub mod feed;
/// Streamed update ingestion
pub mod ingest;
/// Manager facade and public API
pub mod manager;
/// Identity resolution and ASID allocation
pub mod registration;
/// Background sweep tasks
pub mod sweepers;

pub use feed::{AgentUpdatesBatch, CursorEngine};
pub use ingest::UpdateIngestor;
pub use manager::AgentManager;
pub use registration::{first_free_asid, Registration};
pub use sweepers::FleetSweeper;
