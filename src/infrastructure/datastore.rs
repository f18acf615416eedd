//! # Typed Datastore
//!
//! Facade mapping domain entities onto the byte keyspace of
//! [`KeyValueStore`]. Owns serialization (bincode envelopes), TTL stamping of
//! ephemeral records, and the atomic-batch discipline: every high-level
//! mutation commits as one batch so the host index, ASID index, schema view,
//! and change feed can never disagree after a crash.
//!
//! The feed head and schema-change marker are cached in atomics; mutations
//! are serialized by the manager's write lock, so the caches only race with
//! readers, never with each other.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agents::{
    Agent, AgentDataInfo, ComputedSchema, FeedEntry, FeedEvent, HostInfo, HostKey, ProcessInfo,
    TableSchema, Upid,
};
use crate::infrastructure::keys;
use crate::infrastructure::store::{BatchOp, KeyValueStore};
use crate::utils::clock::Clock;
use crate::utils::config::FleetConfig;
use crate::utils::error::{FleetError, FleetResult};

/// Current on-disk format version, stamped under `/meta/version`
pub const STORE_VERSION: u32 = 1;

/// Persisted state of one change-feed cursor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorState {
    pub id: Uuid,
    /// Last feed sequence delivered through this cursor
    pub last_sequence: u64,
    /// Schema-change marker value as of the last delivery
    pub schema_marker: u64,
    /// Whether the initial fleet snapshot has been read
    pub snapshot_delivered: bool,
    pub created_ns: u64,
    pub last_polled_ns: u64,
}

/// Typed facade over the raw key-value store
pub struct Datastore {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    config: FleetConfig,
    feed_head: AtomicU64,
    schema_marker: AtomicU64,
}

impl std::fmt::Debug for Datastore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Datastore")
            .field("config", &self.config)
            .field("feed_head", &self.feed_head)
            .field("schema_marker", &self.schema_marker)
            .finish()
    }
}

fn encode<T: Serialize>(key: &[u8], value: &T) -> FleetResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| FleetError::corrupt(key, e))
}

fn decode<T: DeserializeOwned>(key: &[u8], bytes: &[u8]) -> FleetResult<T> {
    bincode::deserialize(bytes).map_err(|e| FleetError::corrupt(key, e))
}

impl Datastore {
    /// Open the datastore, stamping or checking the format version and
    /// recovering the feed head and schema marker
    pub async fn open(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        config: FleetConfig,
    ) -> FleetResult<Self> {
        match store.get(keys::META_VERSION_KEY).await? {
            None => {
                let value = encode(keys::META_VERSION_KEY, &STORE_VERSION)?;
                store
                    .apply_batch(vec![BatchOp::put(keys::META_VERSION_KEY.to_vec(), value)])
                    .await?;
            }
            Some(bytes) => {
                let version: u32 = decode(keys::META_VERSION_KEY, &bytes)?;
                if version > STORE_VERSION {
                    return Err(FleetError::Storage {
                        operation: "open".to_string(),
                        reason: format!(
                            "store version {version} is newer than supported {STORE_VERSION}"
                        ),
                    });
                }
            }
        }

        let head = store
            .scan_prefix(keys::FEED_PREFIX)
            .await?
            .last()
            .map(|(key, _)| keys::sequence_from_key(key))
            .transpose()?
            .unwrap_or(0);

        let marker = match store.get(keys::META_SCHEMA_MARKER_KEY).await? {
            Some(bytes) => decode(keys::META_SCHEMA_MARKER_KEY, &bytes)?,
            None => 0,
        };

        Ok(Self {
            store,
            clock,
            config,
            feed_head: AtomicU64::new(head),
            schema_marker: AtomicU64::new(marker),
        })
    }

    /// Sequence of the most recent feed entry
    #[must_use]
    pub fn feed_head(&self) -> u64 {
        self.feed_head.load(Ordering::SeqCst)
    }

    /// Current schema-change marker
    #[must_use]
    pub fn schema_marker(&self) -> u64 {
        self.schema_marker.load(Ordering::SeqCst)
    }

    /// Commit one atomic batch, bounded by the write timeout and retried on
    /// transient failures
    async fn commit(&self, operation: &'static str, ops: Vec<BatchOp>) -> FleetResult<()> {
        let timeout = Duration::from_millis(self.config.store.write_timeout_ms);
        let mut attempt = 0u32;
        loop {
            match tokio::time::timeout(timeout, self.store.apply_batch(ops.clone())).await {
                Err(_) => {
                    return Err(FleetError::Cancelled {
                        operation: operation.to_string(),
                    })
                }
                Ok(Ok(())) => return Ok(()),
                Ok(Err(err))
                    if err.is_transient() && attempt < self.config.store.retry_attempts =>
                {
                    attempt += 1;
                    tracing::warn!(%err, operation, attempt, "retrying transient store failure");
                    tokio::time::sleep(Duration::from_millis(
                        self.config.store.retry_backoff_ms * u64::from(attempt),
                    ))
                    .await;
                }
                Ok(Err(err)) => return Err(err),
            }
        }
    }

    fn feed_op(&self, sequence: u64, event: FeedEvent) -> FleetResult<BatchOp> {
        let key = keys::feed_key(sequence);
        let entry = FeedEntry { sequence, event };
        let expires_at = self
            .clock
            .now_ns()
            .saturating_add(self.config.feed.retention_ns);
        Ok(BatchOp::put_with_ttl(
            key.clone(),
            encode(&key, &entry)?,
            expires_at,
        ))
    }

    // ---- agents -----------------------------------------------------------

    /// Persist a brand-new agent: record, host index, ASID index, and the
    /// `AgentCreated` feed entry, all in one batch
    pub async fn create_agent(&self, agent: &Agent) -> FleetResult<()> {
        let sequence = self.feed_head() + 1;
        let agent_key = keys::agent_key(&agent.id);
        let host_key = agent.host_key();
        let index_key = keys::host_key(&host_key.hostname, &host_key.host_ip);
        let asid_key = keys::asid_key(agent.asid);

        let ops = vec![
            BatchOp::put(agent_key.clone(), encode(&agent_key, agent)?),
            BatchOp::put(index_key.clone(), encode(&index_key, &agent.id)?),
            BatchOp::put(asid_key.clone(), encode(&asid_key, &agent.id)?),
            self.feed_op(
                sequence,
                FeedEvent::AgentCreated {
                    agent: agent.clone(),
                },
            )?,
        ];
        self.commit("create_agent", ops).await?;
        self.feed_head.store(sequence, Ordering::SeqCst);
        Ok(())
    }

    /// Overwrite an agent record; `emit_event` appends an `AgentUpdated`
    /// entry (heartbeats pass `false`)
    pub async fn update_agent(&self, agent: &Agent, emit_event: bool) -> FleetResult<()> {
        let agent_key = keys::agent_key(&agent.id);
        let mut ops = vec![BatchOp::put(agent_key.clone(), encode(&agent_key, agent)?)];

        if emit_event {
            let sequence = self.feed_head() + 1;
            ops.push(self.feed_op(
                sequence,
                FeedEvent::AgentUpdated {
                    agent: agent.clone(),
                },
            )?);
            self.commit("update_agent", ops).await?;
            self.feed_head.store(sequence, Ordering::SeqCst);
        } else {
            self.commit("update_agent", ops).await?;
        }
        Ok(())
    }

    /// Remove an agent and every record keyed to it; idempotent
    ///
    /// Returns `false` when no such agent existed. Cleans both indices, the
    /// data-info blob, and the per-agent schemas, recomputing the cluster
    /// schema in the same batch, then appends `AgentDeleted`.
    pub async fn delete_agent(&self, agent_id: &Uuid) -> FleetResult<bool> {
        let Some(agent) = self.get_agent(agent_id).await? else {
            return Ok(false);
        };

        let host_key = agent.host_key();
        let mut ops = vec![
            BatchOp::delete(keys::agent_key(agent_id)),
            BatchOp::delete(keys::host_key(&host_key.hostname, &host_key.host_ip)),
            BatchOp::delete(keys::asid_key(agent.asid)),
            BatchOp::delete(keys::data_info_key(agent_id)),
        ];

        for (key, _) in self.store.scan_prefix(&keys::schema_prefix(agent_id)).await? {
            ops.push(BatchOp::delete(key));
        }

        let mut computed = self.get_computed_schema().await?;
        let schema_changed = computed.remove_agent(*agent_id);
        let new_marker = if schema_changed {
            Some(self.push_computed_schema(&mut ops, &computed)?)
        } else {
            None
        };

        let sequence = self.feed_head() + 1;
        ops.push(self.feed_op(sequence, FeedEvent::AgentDeleted { agent_id: *agent_id })?);

        self.commit("delete_agent", ops).await?;
        self.feed_head.store(sequence, Ordering::SeqCst);
        if let Some(marker) = new_marker {
            self.schema_marker.store(marker, Ordering::SeqCst);
        }
        Ok(true)
    }

    pub async fn get_agent(&self, agent_id: &Uuid) -> FleetResult<Option<Agent>> {
        let key = keys::agent_key(agent_id);
        match self.store.get(&key).await? {
            Some(bytes) => Ok(Some(decode(&key, &bytes)?)),
            None => Ok(None),
        }
    }

    /// Every agent record; corrupt records are logged and skipped
    pub async fn get_agents(&self) -> FleetResult<Vec<Agent>> {
        let mut agents = Vec::new();
        for (key, bytes) in self.store.scan_prefix(keys::AGENT_PREFIX).await? {
            match decode::<Agent>(&key, &bytes) {
                Ok(agent) => agents.push(agent),
                Err(err) => {
                    tracing::error!(%err, "skipping undecodable agent record");
                }
            }
        }
        Ok(agents)
    }

    /// Resolve a host-identity key to the claiming agent, if any
    pub async fn get_agent_id_for_host(&self, host_key: &HostKey) -> FleetResult<Option<Uuid>> {
        let key = keys::host_key(&host_key.hostname, &host_key.host_ip);
        match self.store.get(&key).await? {
            Some(bytes) => Ok(Some(decode(&key, &bytes)?)),
            None => Ok(None),
        }
    }

    /// Agents registered for a hostname pair: the collector slot and the
    /// non-collector slot, in that order
    pub async fn get_agents_for_host(&self, host: &HostInfo) -> FleetResult<Vec<Uuid>> {
        let mut found = Vec::new();
        for collects_data in [true, false] {
            let host_key = HostKey::from_parts(host, collects_data);
            if let Some(id) = self.get_agent_id_for_host(&host_key).await? {
                found.push(id);
            }
        }
        found.dedup();
        Ok(found)
    }

    pub async fn get_asid_for_agent(&self, agent_id: &Uuid) -> FleetResult<Option<u32>> {
        Ok(self.get_agent(agent_id).await?.map(|agent| agent.asid))
    }

    /// All allocated ASIDs in ascending order, from the index keyspace
    pub async fn allocated_asids(&self) -> FleetResult<Vec<u32>> {
        self.store
            .scan_prefix(keys::ASID_PREFIX)
            .await?
            .iter()
            .map(|(key, _)| keys::asid_from_key(key))
            .collect()
    }

    // ---- schemas ----------------------------------------------------------

    pub async fn get_computed_schema(&self) -> FleetResult<ComputedSchema> {
        match self.store.get(keys::COMPUTED_SCHEMA_KEY).await? {
            Some(bytes) => decode(keys::COMPUTED_SCHEMA_KEY, &bytes),
            None => Ok(ComputedSchema::default()),
        }
    }

    /// Queue ops replacing an agent's schema entries and updating the
    /// cluster view; returns the new marker when the view changed
    async fn schema_ops(
        &self,
        ops: &mut Vec<BatchOp>,
        agent_id: &Uuid,
        tables: &[TableSchema],
    ) -> FleetResult<Option<u64>> {
        let prefix = keys::schema_prefix(agent_id);
        let announced: Vec<&[u8]> = tables.iter().map(|t| t.name.as_bytes()).collect();
        for (key, _) in self.store.scan_prefix(&prefix).await? {
            let name = key.strip_prefix(prefix.as_slice()).unwrap_or_default();
            if !announced.contains(&name) {
                ops.push(BatchOp::delete(key));
            }
        }
        for table in tables {
            let key = keys::schema_key(agent_id, &table.name);
            ops.push(BatchOp::put(key.clone(), encode(&key, table)?));
        }

        let mut computed = self.get_computed_schema().await?;
        if computed.set_agent_tables(*agent_id, tables) {
            Ok(Some(self.push_computed_schema(ops, &computed)?))
        } else {
            Ok(None)
        }
    }

    fn push_computed_schema(
        &self,
        ops: &mut Vec<BatchOp>,
        computed: &ComputedSchema,
    ) -> FleetResult<u64> {
        let marker = self.schema_marker() + 1;
        ops.push(BatchOp::put(
            keys::COMPUTED_SCHEMA_KEY.to_vec(),
            encode(keys::COMPUTED_SCHEMA_KEY, computed)?,
        ));
        ops.push(BatchOp::put(
            keys::META_SCHEMA_MARKER_KEY.to_vec(),
            encode(keys::META_SCHEMA_MARKER_KEY, &marker)?,
        ));
        Ok(marker)
    }

    /// Replace an agent's announced schema set; returns whether the cluster
    /// view changed
    pub async fn update_schemas(
        &self,
        agent_id: &Uuid,
        tables: &[TableSchema],
    ) -> FleetResult<bool> {
        let mut ops = Vec::new();
        let marker = self.schema_ops(&mut ops, agent_id, tables).await?;
        self.commit("update_schemas", ops).await?;
        if let Some(marker) = marker {
            self.schema_marker.store(marker, Ordering::SeqCst);
        }
        Ok(marker.is_some())
    }

    // ---- processes --------------------------------------------------------

    fn process_ops(&self, ops: &mut Vec<BatchOp>, processes: &[ProcessInfo]) -> FleetResult<()> {
        let expires_at = self
            .clock
            .now_ns()
            .saturating_add(self.config.store.process_ttl_ns);
        for process in processes {
            let key = keys::process_key(&process.upid);
            ops.push(BatchOp::put_with_ttl(
                key.clone(),
                encode(&key, process)?,
                expires_at,
            ));
        }
        Ok(())
    }

    /// Persist process records under their UPID keys, TTL-bound
    pub async fn update_processes(&self, processes: &[ProcessInfo]) -> FleetResult<()> {
        let mut ops = Vec::new();
        self.process_ops(&mut ops, processes)?;
        self.commit("update_processes", ops).await
    }

    /// Look up process records; absent or expired UPIDs yield `None`
    pub async fn get_processes(&self, upids: &[Upid]) -> FleetResult<Vec<Option<ProcessInfo>>> {
        let mut found = Vec::with_capacity(upids.len());
        for upid in upids {
            let key = keys::process_key(upid);
            let record = match self.store.get(&key).await? {
                Some(bytes) => Some(decode(&key, &bytes)?),
                None => None,
            };
            found.push(record);
        }
        Ok(found)
    }

    // ---- data info --------------------------------------------------------

    /// Overwrite an agent's data-info blob and append `DataInfoUpdated`
    pub async fn update_agent_data_info(
        &self,
        agent_id: &Uuid,
        data_info: &AgentDataInfo,
    ) -> FleetResult<()> {
        let key = keys::data_info_key(agent_id);
        let sequence = self.feed_head() + 1;
        let ops = vec![
            BatchOp::put(key.clone(), encode(&key, data_info)?),
            self.feed_op(
                sequence,
                FeedEvent::DataInfoUpdated {
                    agent_id: *agent_id,
                    data_info: data_info.clone(),
                },
            )?,
        ];
        self.commit("update_agent_data_info", ops).await?;
        self.feed_head.store(sequence, Ordering::SeqCst);
        Ok(())
    }

    /// Data-info blobs for the whole fleet, keyed by agent UUID
    pub async fn get_agents_data_info(
        &self,
    ) -> FleetResult<std::collections::BTreeMap<Uuid, AgentDataInfo>> {
        let mut blobs = std::collections::BTreeMap::new();
        for (key, bytes) in self.store.scan_prefix(keys::DATA_INFO_PREFIX).await? {
            let suffix = key
                .strip_prefix(keys::DATA_INFO_PREFIX)
                .unwrap_or_default();
            let agent_id = std::str::from_utf8(suffix)
                .ok()
                .and_then(|s| Uuid::parse_str(s).ok())
                .ok_or_else(|| FleetError::corrupt(&key, "malformed data-info key"))?;
            blobs.insert(agent_id, decode(&key, &bytes)?);
        }
        Ok(blobs)
    }

    // ---- composite update -------------------------------------------------

    /// Apply one agent report as a single atomic batch: optional schema
    /// replacement, process records, and the data-info blob (with its feed
    /// entry). Returns whether the cluster schema changed.
    pub async fn apply_agent_update(
        &self,
        agent_id: &Uuid,
        schema: Option<&[TableSchema]>,
        processes: &[ProcessInfo],
        data_info: Option<&AgentDataInfo>,
    ) -> FleetResult<bool> {
        let mut ops = Vec::new();

        let marker = match schema {
            Some(tables) => self.schema_ops(&mut ops, agent_id, tables).await?,
            None => None,
        };

        self.process_ops(&mut ops, processes)?;

        let sequence = data_info
            .map(|info| {
                let key = keys::data_info_key(agent_id);
                ops.push(BatchOp::put(key.clone(), encode(&key, info)?));
                let sequence = self.feed_head() + 1;
                ops.push(self.feed_op(
                    sequence,
                    FeedEvent::DataInfoUpdated {
                        agent_id: *agent_id,
                        data_info: info.clone(),
                    },
                )?);
                Ok::<u64, FleetError>(sequence)
            })
            .transpose()?;

        self.commit("apply_agent_update", ops).await?;
        if let Some(sequence) = sequence {
            self.feed_head.store(sequence, Ordering::SeqCst);
        }
        if let Some(marker) = marker {
            self.schema_marker.store(marker, Ordering::SeqCst);
        }
        Ok(marker.is_some())
    }

    // ---- change feed + cursors -------------------------------------------

    /// Feed entries with sequence strictly greater than `after`, in order
    pub async fn feed_entries_after(&self, after: u64) -> FleetResult<Vec<FeedEntry>> {
        let mut entries = Vec::new();
        for (key, bytes) in self.store.scan_prefix(keys::FEED_PREFIX).await? {
            if keys::sequence_from_key(&key)? > after {
                entries.push(decode(&key, &bytes)?);
            }
        }
        Ok(entries)
    }

    pub async fn put_cursor(&self, cursor: &CursorState) -> FleetResult<()> {
        let key = keys::cursor_key(&cursor.id);
        let ops = vec![BatchOp::put(key.clone(), encode(&key, cursor)?)];
        self.commit("put_cursor", ops).await
    }

    pub async fn get_cursor(&self, cursor_id: &Uuid) -> FleetResult<Option<CursorState>> {
        let key = keys::cursor_key(cursor_id);
        match self.store.get(&key).await? {
            Some(bytes) => Ok(Some(decode(&key, &bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn delete_cursor(&self, cursor_id: &Uuid) -> FleetResult<bool> {
        let existed = self.get_cursor(cursor_id).await?.is_some();
        if existed {
            self.commit(
                "delete_cursor",
                vec![BatchOp::delete(keys::cursor_key(cursor_id))],
            )
            .await?;
        }
        Ok(existed)
    }

    pub async fn list_cursors(&self) -> FleetResult<Vec<CursorState>> {
        let mut cursors = Vec::new();
        for (key, bytes) in self.store.scan_prefix(keys::CURSOR_PREFIX).await? {
            cursors.push(decode(&key, &bytes)?);
        }
        Ok(cursors)
    }

    /// Physically reap TTL-expired records (feed entries, process records)
    pub async fn reap_expired(&self) -> FleetResult<usize> {
        self.store.delete_expired(self.clock.now_ns()).await
    }
}
