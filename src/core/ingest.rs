//! # Update Ingestion
//!
//! Applies one streamed agent report: schema replacement, process
//! creations and terminations, and the metadata data-info blob. The whole
//! report commits as one atomic batch through the datastore.
//!
//! Updates racing with agent deletion are expected: a report for an absent
//! agent is dropped whole, so process inserts can never create records
//! orphaned from a live ASID.

use std::sync::Arc;

use uuid::Uuid;

use crate::agents::{Agent, AgentUpdate, ProcessInfo, Upid};
use crate::infrastructure::datastore::Datastore;
use crate::utils::error::FleetResult;

/// Ingestor for streamed agent reports
pub struct UpdateIngestor {
    datastore: Arc<Datastore>,
}

impl UpdateIngestor {
    #[must_use]
    pub fn new(datastore: Arc<Datastore>) -> Self {
        Self { datastore }
    }

    /// Apply one report for `agent_id`
    ///
    /// Returns whether the cluster schema changed. A report targeting an
    /// unregistered agent is dropped silently (logged at debug).
    pub async fn apply(&self, agent_id: &Uuid, update: AgentUpdate) -> FleetResult<bool> {
        let Some(agent) = self.datastore.get_agent(agent_id).await? else {
            tracing::debug!(agent = %agent_id, "dropping update for unregistered agent");
            return Ok(false);
        };

        let mut processes = Vec::with_capacity(
            update.process_created.len() + update.process_terminated.len(),
        );
        for created in &update.process_created {
            let upid = Upid::from_parts(agent.asid, created.pid, created.start_time_ns);
            processes.push(ProcessInfo::running(
                upid,
                created.cmdline.clone(),
                created.start_time_ns,
            ));
        }
        processes.extend(self.terminations(&agent, &update).await?);

        let schema = update
            .does_update_schema
            .then_some(update.schema.as_slice());

        self.datastore
            .apply_agent_update(agent_id, schema, &processes, update.data_info.as_ref())
            .await
    }

    /// Resolve termination events into stop-stamped records
    ///
    /// Unknown UPIDs are ignored; a record that already carries a stop
    /// timestamp is left untouched so repeated terminations are idempotent.
    async fn terminations(
        &self,
        agent: &Agent,
        update: &AgentUpdate,
    ) -> FleetResult<Vec<ProcessInfo>> {
        let upids: Vec<Upid> = update.process_terminated.iter().map(|t| t.upid).collect();
        let records = self.datastore.get_processes(&upids).await?;

        let mut stopped = Vec::new();
        for (terminated, record) in update.process_terminated.iter().zip(records) {
            match record {
                Some(mut info) if info.is_running() => {
                    info.stop_time_ns = terminated.stop_time_ns;
                    stopped.push(info);
                }
                Some(_) => {}
                None => {
                    tracing::debug!(
                        agent = %agent.id,
                        upid = %terminated.upid,
                        "termination for unknown process ignored"
                    );
                }
            }
        }
        Ok(stopped)
    }
}
