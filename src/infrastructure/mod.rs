//! Persistence layer: keyspace layout, the raw key-value store contract,
//! and the typed datastore facade the manager mutates through.

/// Typed datastore facade and cursor state records
pub mod datastore;
/// Byte keyspace layout
pub mod keys;
/// Key-value store contract with sled and in-memory backends
pub mod store;

pub use datastore::{CursorState, Datastore, STORE_VERSION};
pub use store::{BatchOp, KeyValueStore, MemoryStore, SledStore};
