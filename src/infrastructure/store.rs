//! # Key-Value Store Abstraction
//!
//! The manager persists everything through [`KeyValueStore`]: a byte-keyed
//! store contract requiring ordered prefix scans, atomic batches, and
//! TTL-stamped records. Two backends are provided:
//!
//! - [`SledStore`]: durable, backed by sled; batch atomicity comes from
//!   `apply_batch`, and TTLs are realized with an expiry-stamped value
//!   envelope filtered on read and reaped by [`KeyValueStore::delete_expired`].
//! - [`MemoryStore`]: BTreeMap-backed, for unit tests.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::utils::clock::Clock;
use crate::utils::error::{FleetError, FleetResult};

/// One operation in an atomic batch
#[derive(Debug, Clone)]
pub enum BatchOp {
    Put {
        key: Vec<u8>,
        value: Vec<u8>,
        /// Absolute expiry in ns; `None` means the record never expires
        expires_at_ns: Option<u64>,
    },
    Delete {
        key: Vec<u8>,
    },
}

impl BatchOp {
    #[must_use]
    pub fn put(key: Vec<u8>, value: Vec<u8>) -> Self {
        BatchOp::Put {
            key,
            value,
            expires_at_ns: None,
        }
    }

    #[must_use]
    pub fn put_with_ttl(key: Vec<u8>, value: Vec<u8>, expires_at_ns: u64) -> Self {
        BatchOp::Put {
            key,
            value,
            expires_at_ns: Some(expires_at_ns),
        }
    }

    #[must_use]
    pub fn delete(key: Vec<u8>) -> Self {
        BatchOp::Delete { key }
    }
}

/// Contract the fleet manager requires of its persistent store
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read one key; expired records read as absent
    async fn get(&self, key: &[u8]) -> FleetResult<Option<Vec<u8>>>;

    /// All live records under a prefix, in byte order
    async fn scan_prefix(&self, prefix: &[u8]) -> FleetResult<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Apply every operation atomically: all or none survive a crash
    async fn apply_batch(&self, ops: Vec<BatchOp>) -> FleetResult<()>;

    /// Physically remove records whose TTL has passed; returns the count
    async fn delete_expired(&self, now_ns: u64) -> FleetResult<usize>;
}

/// On-disk value envelope carrying the expiry stamp
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredValue {
    /// Absolute expiry in ns; 0 means no expiry
    expires_at_ns: u64,
    payload: Vec<u8>,
}

impl StoredValue {
    fn new(payload: Vec<u8>, expires_at_ns: Option<u64>) -> Self {
        Self {
            expires_at_ns: expires_at_ns.unwrap_or(0),
            payload,
        }
    }

    fn is_expired(&self, now_ns: u64) -> bool {
        self.expires_at_ns != 0 && self.expires_at_ns <= now_ns
    }

    fn encode(&self, key: &[u8]) -> FleetResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| FleetError::corrupt(key, e))
    }

    fn decode(key: &[u8], bytes: &[u8]) -> FleetResult<Self> {
        bincode::deserialize(bytes).map_err(|e| FleetError::corrupt(key, e))
    }
}

/// Durable store backed by sled
pub struct SledStore {
    db: sled::Db,
    clock: Arc<dyn Clock>,
}

impl SledStore {
    pub fn open<P: AsRef<Path>>(path: P, clock: Arc<dyn Clock>) -> FleetResult<Self> {
        let db = sled::open(path.as_ref()).map_err(|e| FleetError::Storage {
            operation: "open".to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { db, clock })
    }

    fn map_err(operation: &str, err: sled::Error) -> FleetError {
        match err {
            // IO failures are worth retrying; the rest are not
            sled::Error::Io(e) => FleetError::Transient {
                operation: operation.to_string(),
                reason: e.to_string(),
            },
            other => FleetError::Storage {
                operation: operation.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

#[async_trait]
impl KeyValueStore for SledStore {
    async fn get(&self, key: &[u8]) -> FleetResult<Option<Vec<u8>>> {
        let Some(bytes) = self.db.get(key).map_err(|e| Self::map_err("get", e))? else {
            return Ok(None);
        };
        let stored = StoredValue::decode(key, &bytes)?;
        if stored.is_expired(self.clock.now_ns()) {
            return Ok(None);
        }
        Ok(Some(stored.payload))
    }

    async fn scan_prefix(&self, prefix: &[u8]) -> FleetResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let now_ns = self.clock.now_ns();
        let mut results = Vec::new();
        for item in self.db.scan_prefix(prefix) {
            let (key, bytes) = item.map_err(|e| Self::map_err("scan_prefix", e))?;
            let stored = StoredValue::decode(&key, &bytes)?;
            if !stored.is_expired(now_ns) {
                results.push((key.to_vec(), stored.payload));
            }
        }
        Ok(results)
    }

    async fn apply_batch(&self, ops: Vec<BatchOp>) -> FleetResult<()> {
        let mut batch = sled::Batch::default();
        for op in ops {
            match op {
                BatchOp::Put {
                    key,
                    value,
                    expires_at_ns,
                } => {
                    let stored = StoredValue::new(value, expires_at_ns);
                    batch.insert(key.clone(), stored.encode(&key)?);
                }
                BatchOp::Delete { key } => batch.remove(key),
            }
        }
        self.db
            .apply_batch(batch)
            .map_err(|e| Self::map_err("apply_batch", e))?;
        self.db
            .flush_async()
            .await
            .map_err(|e| Self::map_err("flush", e))?;
        Ok(())
    }

    async fn delete_expired(&self, now_ns: u64) -> FleetResult<usize> {
        let mut reaped = 0;
        for item in self.db.iter() {
            let (key, bytes) = item.map_err(|e| Self::map_err("delete_expired", e))?;
            let Ok(stored) = StoredValue::decode(&key, &bytes) else {
                // Corrupt envelopes are skipped here and surfaced by readers
                continue;
            };
            if stored.is_expired(now_ns) {
                self.db
                    .remove(&key)
                    .map_err(|e| Self::map_err("delete_expired", e))?;
                reaped += 1;
            }
        }
        if reaped > 0 {
            self.db
                .flush_async()
                .await
                .map_err(|e| Self::map_err("flush", e))?;
        }
        Ok(reaped)
    }
}

/// In-memory store for unit tests
pub struct MemoryStore {
    records: RwLock<BTreeMap<Vec<u8>, StoredValue>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            clock,
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &[u8]) -> FleetResult<Option<Vec<u8>>> {
        let records = self.records.read().await;
        Ok(records
            .get(key)
            .filter(|stored| !stored.is_expired(self.clock.now_ns()))
            .map(|stored| stored.payload.clone()))
    }

    async fn scan_prefix(&self, prefix: &[u8]) -> FleetResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let now_ns = self.clock.now_ns();
        let records = self.records.read().await;
        Ok(records
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter(|(_, stored)| !stored.is_expired(now_ns))
            .map(|(key, stored)| (key.clone(), stored.payload.clone()))
            .collect())
    }

    async fn apply_batch(&self, ops: Vec<BatchOp>) -> FleetResult<()> {
        let mut records = self.records.write().await;
        for op in ops {
            match op {
                BatchOp::Put {
                    key,
                    value,
                    expires_at_ns,
                } => {
                    records.insert(key, StoredValue::new(value, expires_at_ns));
                }
                BatchOp::Delete { key } => {
                    records.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn delete_expired(&self, now_ns: u64) -> FleetResult<usize> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, stored| !stored.is_expired(now_ns));
        Ok(before - records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::clock::FixedClock;

    type StoreCase = (&'static str, Arc<dyn KeyValueStore>, Arc<FixedClock>);

    fn stores() -> (Vec<StoreCase>, tempfile::TempDir) {
        let clock = FixedClock::new(1_000);
        let memory: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new(clock.clone()));

        let sled_clock = FixedClock::new(1_000);
        let dir = tempfile::tempdir().unwrap();
        let sled: Arc<dyn KeyValueStore> =
            Arc::new(SledStore::open(dir.path().join("db"), sled_clock.clone()).unwrap());

        (
            vec![("memory", memory, clock), ("sled", sled, sled_clock)],
            dir,
        )
    }

    #[tokio::test]
    async fn test_get_put_delete_round_trip() {
        let (cases, _dir) = stores();
        for (name, store, _) in cases {
            store
                .apply_batch(vec![BatchOp::put(b"/agent/a".to_vec(), b"one".to_vec())])
                .await
                .unwrap();
            assert_eq!(
                store.get(b"/agent/a").await.unwrap(),
                Some(b"one".to_vec()),
                "{name}"
            );

            store
                .apply_batch(vec![BatchOp::delete(b"/agent/a".to_vec())])
                .await
                .unwrap();
            assert_eq!(store.get(b"/agent/a").await.unwrap(), None, "{name}");
        }
    }

    #[tokio::test]
    async fn test_scan_prefix_is_ordered_and_scoped() {
        let (cases, _dir) = stores();
        for (name, store, _) in cases {
            store
                .apply_batch(vec![
                    BatchOp::put(b"/feed/b".to_vec(), b"2".to_vec()),
                    BatchOp::put(b"/feed/a".to_vec(), b"1".to_vec()),
                    BatchOp::put(b"/agent/x".to_vec(), b"other".to_vec()),
                ])
                .await
                .unwrap();

            let scanned = store.scan_prefix(b"/feed/").await.unwrap();
            let keys: Vec<&[u8]> = scanned.iter().map(|(k, _)| k.as_slice()).collect();
            assert_eq!(keys, vec![&b"/feed/a"[..], &b"/feed/b"[..]], "{name}");
        }
    }

    #[tokio::test]
    async fn test_ttl_expiry_and_reap() {
        let (cases, _dir) = stores();
        for (name, store, clock) in cases {
            store
                .apply_batch(vec![
                    BatchOp::put_with_ttl(b"/proc/1".to_vec(), b"p".to_vec(), 2_000),
                    BatchOp::put(b"/agent/a".to_vec(), b"keep".to_vec()),
                ])
                .await
                .unwrap();

            assert!(store.get(b"/proc/1").await.unwrap().is_some(), "{name}");

            clock.set(2_000);
            assert!(store.get(b"/proc/1").await.unwrap().is_none(), "{name}");
            assert!(
                store.scan_prefix(b"/proc/").await.unwrap().is_empty(),
                "{name}"
            );

            let reaped = store.delete_expired(clock.now_ns()).await.unwrap();
            assert_eq!(reaped, 1, "{name}");
            assert!(store.get(b"/agent/a").await.unwrap().is_some(), "{name}");
        }
    }

    #[tokio::test]
    async fn test_batch_overwrites_in_order() {
        let (cases, _dir) = stores();
        for (name, store, _) in cases {
            store
                .apply_batch(vec![
                    BatchOp::put(b"/k".to_vec(), b"first".to_vec()),
                    BatchOp::put(b"/k".to_vec(), b"second".to_vec()),
                ])
                .await
                .unwrap();
            assert_eq!(
                store.get(b"/k").await.unwrap(),
                Some(b"second".to_vec()),
                "{name}"
            );
        }
    }

    #[tokio::test]
    async fn test_sled_survives_reopen() {
        let clock = FixedClock::new(1_000);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");

        {
            let store = SledStore::open(&path, clock.clone()).unwrap();
            store
                .apply_batch(vec![BatchOp::put(b"/agent/a".to_vec(), b"one".to_vec())])
                .await
                .unwrap();
        }

        let store = SledStore::open(&path, clock).unwrap();
        assert_eq!(store.get(b"/agent/a").await.unwrap(), Some(b"one".to_vec()));
    }
}
