//! # Cursor & Change-Feed Engine
//!
//! Consumers follow the fleet through resumable cursors over the durable
//! change feed. Each cursor is independent: readers advance at their own
//! pace and a restart resumes from the persisted cursor row.
//!
//! The first poll of a cursor delivers a synthesized snapshot of the live
//! fleet (one `AgentUpdated` per agent, in UUID order) plus the current
//! cluster schema, so a new subscriber does not need to replay history.
//! Later polls return the feed entries committed since the last delivery
//! and the schema only when it changed in between.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::agents::{ComputedSchema, FeedEvent};
use crate::infrastructure::datastore::{CursorState, Datastore};
use crate::utils::clock::Clock;
use crate::utils::error::{FleetError, FleetResult};

/// One poll's worth of updates for a cursor
#[derive(Debug, Clone, PartialEq)]
pub struct AgentUpdatesBatch {
    /// Change events in commit order (or the synthesized snapshot)
    pub updates: Vec<FeedEvent>,
    /// Cluster schema, present on the first poll and after any schema change
    pub schema: Option<ComputedSchema>,
}

/// Cursor registry over the change feed
pub struct CursorEngine {
    datastore: Arc<Datastore>,
    clock: Arc<dyn Clock>,
    /// Per-cursor mutexes serializing read-modify-write of cursor rows
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl CursorEngine {
    #[must_use]
    pub fn new(datastore: Arc<Datastore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            datastore,
            clock,
            locks: DashMap::new(),
        }
    }

    fn cursor_lock(&self, cursor_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .entry(cursor_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Register a fresh cursor positioned at the current feed head
    pub async fn create_cursor(&self) -> FleetResult<Uuid> {
        let now_ns = self.clock.now_ns();
        let cursor = CursorState {
            id: Uuid::new_v4(),
            last_sequence: self.datastore.feed_head(),
            schema_marker: self.datastore.schema_marker(),
            snapshot_delivered: false,
            created_ns: now_ns,
            last_polled_ns: now_ns,
        };
        self.datastore.put_cursor(&cursor).await?;
        tracing::debug!(cursor = %cursor.id, "cursor created");
        Ok(cursor.id)
    }

    /// Deliver everything committed since the cursor's last poll
    pub async fn get_agent_updates(&self, cursor_id: &Uuid) -> FleetResult<AgentUpdatesBatch> {
        let lock = self.cursor_lock(*cursor_id);
        let _guard = lock.lock().await;

        let mut cursor = self
            .datastore
            .get_cursor(cursor_id)
            .await?
            .ok_or_else(|| FleetError::CursorNotFound {
                id: cursor_id.to_string(),
            })?;

        let batch = if cursor.snapshot_delivered {
            self.incremental_batch(&mut cursor).await?
        } else {
            self.snapshot_batch(&mut cursor).await?
        };

        cursor.last_polled_ns = self.clock.now_ns();
        self.datastore.put_cursor(&cursor).await?;
        Ok(batch)
    }

    /// Initial snapshot: every live agent in UUID order, plus the schema
    async fn snapshot_batch(&self, cursor: &mut CursorState) -> FleetResult<AgentUpdatesBatch> {
        let mut agents = self.datastore.get_agents().await?;
        agents.sort_by_key(|agent| agent.id);

        let updates = agents
            .into_iter()
            .map(|agent| FeedEvent::AgentUpdated { agent })
            .collect();
        let schema = self.datastore.get_computed_schema().await?;

        cursor.last_sequence = self.datastore.feed_head();
        cursor.schema_marker = self.datastore.schema_marker();
        cursor.snapshot_delivered = true;

        Ok(AgentUpdatesBatch {
            updates,
            schema: Some(schema),
        })
    }

    async fn incremental_batch(&self, cursor: &mut CursorState) -> FleetResult<AgentUpdatesBatch> {
        let entries = self
            .datastore
            .feed_entries_after(cursor.last_sequence)
            .await?;

        if let Some(first) = entries.first() {
            if first.sequence > cursor.last_sequence + 1 {
                // Entries between the cursor and the retained tail were
                // trimmed; the consumer should replace this cursor.
                tracing::warn!(
                    cursor = %cursor.id,
                    last_delivered = cursor.last_sequence,
                    oldest_retained = first.sequence,
                    "cursor fell behind feed retention"
                );
            }
            cursor.last_sequence = entries[entries.len() - 1].sequence;
        }

        let marker = self.datastore.schema_marker();
        let schema = if marker > cursor.schema_marker {
            cursor.schema_marker = marker;
            Some(self.datastore.get_computed_schema().await?)
        } else {
            None
        };

        Ok(AgentUpdatesBatch {
            updates: entries.into_iter().map(|entry| entry.event).collect(),
            schema,
        })
    }

    /// Remove a cursor; subsequent polls fail with `CursorNotFound`
    pub async fn delete_cursor(&self, cursor_id: &Uuid) -> FleetResult<()> {
        let lock = self.cursor_lock(*cursor_id);
        {
            let _guard = lock.lock().await;
            self.datastore.delete_cursor(cursor_id).await?;
        }
        self.locks.remove(cursor_id);
        Ok(())
    }

    /// Drop cursors idle beyond the retention window; returns the count
    pub async fn sweep_idle_cursors(&self, idle_retention_ns: u64) -> FleetResult<usize> {
        let now_ns = self.clock.now_ns();
        let mut swept = 0;
        for cursor in self.datastore.list_cursors().await? {
            if now_ns.saturating_sub(cursor.last_polled_ns) > idle_retention_ns {
                tracing::info!(cursor = %cursor.id, "removing idle cursor");
                self.delete_cursor(&cursor.id).await?;
                swept += 1;
            }
        }
        Ok(swept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{Agent, HostInfo};
    use crate::infrastructure::store::MemoryStore;
    use crate::utils::clock::FixedClock;
    use crate::utils::config::FleetConfig;

    const NOW: u64 = 5_000_000;

    async fn fixture() -> (Arc<Datastore>, CursorEngine, Arc<FixedClock>) {
        let clock = FixedClock::new(NOW);
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let datastore = Arc::new(
            Datastore::open(store, clock.clone(), FleetConfig::default())
                .await
                .unwrap(),
        );
        let engine = CursorEngine::new(datastore.clone(), clock.clone());
        (datastore, engine, clock)
    }

    fn agent(asid: u32) -> Agent {
        Agent {
            id: Uuid::new_v4(),
            asid,
            host: HostInfo::new(format!("host-{asid}"), format!("10.0.0.{asid}")),
            namespace: "pl".to_string(),
            pod_name: format!("pem-{asid}"),
            collects_data: true,
            create_time_ns: NOW,
            last_heartbeat_ns: NOW,
        }
    }

    #[tokio::test]
    async fn test_first_poll_is_snapshot_in_uuid_order() {
        let (datastore, engine, _) = fixture().await;
        let mut ids = Vec::new();
        for asid in 1..=3 {
            let agent = agent(asid);
            ids.push(agent.id);
            datastore.create_agent(&agent).await.unwrap();
        }
        ids.sort();

        let cursor = engine.create_cursor().await.unwrap();
        let batch = engine.get_agent_updates(&cursor).await.unwrap();

        assert!(batch.schema.is_some());
        let seen: Vec<Uuid> = batch
            .updates
            .iter()
            .map(|event| event.agent_id())
            .collect();
        assert_eq!(seen, ids);
        assert!(batch
            .updates
            .iter()
            .all(|event| matches!(event, FeedEvent::AgentUpdated { .. })));
    }

    #[tokio::test]
    async fn test_incremental_polls_deliver_exactly_once() {
        let (datastore, engine, _) = fixture().await;
        let cursor = engine.create_cursor().await.unwrap();
        engine.get_agent_updates(&cursor).await.unwrap();

        let a = agent(1);
        let b = agent(2);
        datastore.create_agent(&a).await.unwrap();
        datastore.create_agent(&b).await.unwrap();

        let first = engine.get_agent_updates(&cursor).await.unwrap();
        assert_eq!(first.updates.len(), 2);
        assert!(first.schema.is_none());

        datastore.delete_agent(&a.id).await.unwrap();
        let second = engine.get_agent_updates(&cursor).await.unwrap();
        assert_eq!(second.updates.len(), 1);
        assert!(matches!(
            second.updates[0],
            FeedEvent::AgentDeleted { agent_id } if agent_id == a.id
        ));

        // Nothing new: empty batch
        let third = engine.get_agent_updates(&cursor).await.unwrap();
        assert!(third.updates.is_empty());
    }

    #[tokio::test]
    async fn test_schema_returned_only_when_marker_advances() {
        let (datastore, engine, _) = fixture().await;
        let a = agent(1);
        datastore.create_agent(&a).await.unwrap();

        let cursor = engine.create_cursor().await.unwrap();
        engine.get_agent_updates(&cursor).await.unwrap();

        // Heartbeat-style churn without schema movement
        datastore.update_agent(&a, true).await.unwrap();
        let batch = engine.get_agent_updates(&cursor).await.unwrap();
        assert!(batch.schema.is_none());

        // Deleting the sole owner of nothing changes nothing; announcing a
        // table does
        use crate::agents::schema::{ColumnSchema, DataType, TableSchema};
        let table = TableSchema {
            name: "http_events".to_string(),
            columns: vec![ColumnSchema {
                name: "time_".to_string(),
                data_type: DataType::Time,
            }],
            tabletization_key: None,
        };
        datastore.update_schemas(&a.id, &[table]).await.unwrap();
        let batch = engine.get_agent_updates(&cursor).await.unwrap();
        assert!(batch.schema.is_some());
    }

    #[tokio::test]
    async fn test_independent_cursors() {
        let (datastore, engine, _) = fixture().await;
        let fast = engine.create_cursor().await.unwrap();
        let slow = engine.create_cursor().await.unwrap();
        engine.get_agent_updates(&fast).await.unwrap();
        engine.get_agent_updates(&slow).await.unwrap();

        datastore.create_agent(&agent(1)).await.unwrap();
        assert_eq!(engine.get_agent_updates(&fast).await.unwrap().updates.len(), 1);

        datastore.create_agent(&agent(2)).await.unwrap();
        // The slow reader still sees both, in order
        let batch = engine.get_agent_updates(&slow).await.unwrap();
        assert_eq!(batch.updates.len(), 2);
        // And the fast one only the second
        assert_eq!(engine.get_agent_updates(&fast).await.unwrap().updates.len(), 1);
    }

    #[tokio::test]
    async fn test_deleted_cursor_fails() {
        let (_, engine, _) = fixture().await;
        let cursor = engine.create_cursor().await.unwrap();
        engine.delete_cursor(&cursor).await.unwrap();

        let err = engine.get_agent_updates(&cursor).await.unwrap_err();
        assert!(matches!(err, FleetError::CursorNotFound { .. }));

        let ghost = Uuid::new_v4();
        let err = engine.get_agent_updates(&ghost).await.unwrap_err();
        assert!(matches!(err, FleetError::CursorNotFound { .. }));
    }

    #[tokio::test]
    async fn test_idle_cursor_sweep() {
        let (_, engine, clock) = fixture().await;
        let idle = engine.create_cursor().await.unwrap();
        clock.advance(10_000);
        let fresh = engine.create_cursor().await.unwrap();

        let swept = engine.sweep_idle_cursors(5_000).await.unwrap();
        assert_eq!(swept, 1);
        assert!(engine.get_agent_updates(&idle).await.is_err());
        assert!(engine.get_agent_updates(&fresh).await.is_ok());
    }
}
