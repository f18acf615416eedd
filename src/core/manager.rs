//! # Agent Manager Facade
//!
//! Composes the datastore, the identity resolver, the update ingestor, the
//! cursor engine, and the command publisher into the one object callers
//! hold. All mutating operations are serialized through a single write lock
//! so invariant-preserving batches never interleave; reads go straight to
//! the store and observe committed state.

use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::agents::{
    Agent, AgentDataInfo, AgentRegistration, AgentUpdate, ComputedSchema, HostInfo, HostKey,
};
use crate::communication::bus::MessageBus;
use crate::communication::commands::CommandPublisher;
use crate::core::feed::{AgentUpdatesBatch, CursorEngine};
use crate::core::ingest::UpdateIngestor;
use crate::core::registration::{first_free_asid, resolve_identity, Registration};
use crate::infrastructure::datastore::Datastore;
use crate::infrastructure::store::KeyValueStore;
use crate::utils::clock::Clock;
use crate::utils::config::FleetConfig;
use crate::utils::error::{FleetError, FleetResult};

/// The authoritative registry for the agent fleet
pub struct AgentManager {
    datastore: Arc<Datastore>,
    publisher: CommandPublisher,
    ingestor: UpdateIngestor,
    cursors: CursorEngine,
    clock: Arc<dyn Clock>,
    config: FleetConfig,
    /// Serializes every mutating operation
    write_lock: Mutex<()>,
}

impl AgentManager {
    /// Open the manager over a key-value store and a bus connection
    pub async fn new(
        store: Arc<dyn KeyValueStore>,
        bus: Arc<dyn MessageBus>,
        clock: Arc<dyn Clock>,
        config: FleetConfig,
    ) -> FleetResult<Self> {
        config.validate()?;
        let datastore = Arc::new(Datastore::open(store, clock.clone(), config.clone()).await?);
        Ok(Self {
            publisher: CommandPublisher::new(bus, clock.clone()),
            ingestor: UpdateIngestor::new(datastore.clone()),
            cursors: CursorEngine::new(datastore.clone(), clock.clone()),
            datastore,
            clock,
            config,
            write_lock: Mutex::new(()),
        })
    }

    // ---- registration -----------------------------------------------------

    /// Register an agent, resolving restarts and host-identity collisions
    ///
    /// Returns the agent's ASID: the stored one on re-registration, a
    /// freshly allocated one otherwise. A collision evicts the prior
    /// occupant before the new registration proceeds.
    pub async fn register_agent(&self, registration: AgentRegistration) -> FleetResult<u32> {
        let _guard = self.write_lock.lock().await;
        let now_ns = self.clock.now_ns();

        match resolve_identity(&self.datastore, &registration).await? {
            Registration::ReRegistration { existing } => {
                // Identity survives the restart: keep ASID and creation
                // time, refresh everything declared plus the heartbeat.
                let agent = Self::build_agent(
                    &registration,
                    existing.asid,
                    existing.create_time_ns,
                    now_ns,
                );
                self.datastore.update_agent(&agent, true).await?;
                tracing::info!(agent = %agent.id, asid = agent.asid, "agent re-registered");
                return Ok(existing.asid);
            }
            Registration::Eviction { occupant } => {
                let host_key = registration.host_key();
                tracing::warn!(
                    evicted = %occupant,
                    registering = %registration.id,
                    hostname = %host_key.hostname,
                    host_ip = %host_key.host_ip,
                    "host identity collision, evicting prior occupant"
                );
                self.datastore.delete_agent(&occupant).await?;
            }
            Registration::New => {}
        }

        let asid = first_free_asid(&self.datastore.allocated_asids().await?);
        let agent = Self::build_agent(&registration, asid, now_ns, now_ns);
        self.datastore.create_agent(&agent).await?;
        tracing::info!(agent = %agent.id, asid, "agent registered");
        Ok(asid)
    }

    fn build_agent(
        registration: &AgentRegistration,
        asid: u32,
        create_time_ns: u64,
        last_heartbeat_ns: u64,
    ) -> Agent {
        Agent {
            id: registration.id,
            asid,
            host: registration.host.clone(),
            namespace: registration.namespace.clone(),
            pod_name: registration.pod_name.clone(),
            collects_data: registration.collects_data,
            create_time_ns,
            last_heartbeat_ns,
        }
    }

    /// Remove an agent and everything keyed to it; idempotent
    pub async fn delete_agent(&self, agent_id: Uuid) -> FleetResult<()> {
        let _guard = self.write_lock.lock().await;
        if self.datastore.delete_agent(&agent_id).await? {
            tracing::info!(agent = %agent_id, "agent deleted");
        }
        Ok(())
    }

    /// Refresh an agent's heartbeat timestamp
    ///
    /// Fails for unknown agents: a heartbeat is never an implicit
    /// registration. Emits no change-feed entry.
    pub async fn update_heartbeat(&self, agent_id: Uuid) -> FleetResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut agent = self
            .datastore
            .get_agent(&agent_id)
            .await?
            .ok_or_else(|| FleetError::agent_not_found(agent_id))?;
        agent.last_heartbeat_ns = self.clock.now_ns();
        self.datastore.update_agent(&agent, false).await
    }

    /// Apply one streamed agent report
    ///
    /// Reports for unregistered agents are dropped whole; races with delete
    /// are expected on this path.
    pub async fn apply_agent_update(
        &self,
        agent_id: Uuid,
        update: AgentUpdate,
    ) -> FleetResult<()> {
        let _guard = self.write_lock.lock().await;
        self.ingestor.apply(&agent_id, update).await?;
        Ok(())
    }

    // ---- reads ------------------------------------------------------------

    pub async fn get_agent(&self, agent_id: Uuid) -> FleetResult<Option<Agent>> {
        self.datastore.get_agent(&agent_id).await
    }

    /// Every registered agent, healthy or not
    pub async fn get_agents(&self) -> FleetResult<Vec<Agent>> {
        self.datastore.get_agents().await
    }

    /// Healthy agents ordered by ASID ascending
    ///
    /// An agent whose heartbeat age reached the expiry threshold is retained
    /// in the store but excluded here.
    pub async fn get_active_agents(&self) -> FleetResult<Vec<Agent>> {
        let now_ns = self.clock.now_ns();
        let threshold = self.config.agent.expiry_threshold_ns;
        let mut agents: Vec<Agent> = self
            .datastore
            .get_agents()
            .await?
            .into_iter()
            .filter(|agent| agent.is_healthy(now_ns, threshold))
            .collect();
        agents.sort_by_key(|agent| agent.asid);
        Ok(agents)
    }

    /// Resolve a host-identity key to an agent UUID
    pub async fn get_agent_id_for_host(&self, host_key: &HostKey) -> FleetResult<Option<Uuid>> {
        self.datastore.get_agent_id_for_host(host_key).await
    }

    /// Agents registered for a hostname pair (collector slot first)
    pub async fn get_agents_for_host(&self, host: &HostInfo) -> FleetResult<Vec<Uuid>> {
        self.datastore.get_agents_for_host(host).await
    }

    pub async fn get_asid_for_agent(&self, agent_id: Uuid) -> FleetResult<Option<u32>> {
        self.datastore.get_asid_for_agent(&agent_id).await
    }

    pub async fn get_computed_schema(&self) -> FleetResult<ComputedSchema> {
        self.datastore.get_computed_schema().await
    }

    pub async fn get_agents_data_info(
        &self,
    ) -> FleetResult<std::collections::BTreeMap<Uuid, AgentDataInfo>> {
        self.datastore.get_agents_data_info().await
    }

    // ---- cursors ----------------------------------------------------------

    /// Allocate a change-feed cursor positioned at the current head
    pub async fn create_cursor(&self) -> FleetResult<Uuid> {
        self.cursors.create_cursor().await
    }

    /// Deliver everything committed since this cursor's last poll
    pub async fn get_agent_updates(&self, cursor_id: &Uuid) -> FleetResult<AgentUpdatesBatch> {
        self.cursors.get_agent_updates(cursor_id).await
    }

    /// Remove a cursor; later polls fail with `CursorNotFound`
    pub async fn delete_cursor(&self, cursor_id: &Uuid) -> FleetResult<()> {
        self.cursors.delete_cursor(cursor_id).await
    }

    // ---- commands ---------------------------------------------------------

    /// Push a config change to the agent running the named pod
    ///
    /// Fire-and-forget: the apply shows up in later agent updates.
    pub async fn update_config(
        &self,
        namespace: &str,
        pod_name: &str,
        key: &str,
        value: &str,
    ) -> FleetResult<()> {
        let agents = self.datastore.get_agents().await?;
        let target = agents
            .iter()
            .find(|agent| agent.namespace == namespace && agent.pod_name == pod_name)
            .ok_or_else(|| FleetError::agent_not_found(format!("{namespace}/{pod_name}")))?;

        self.publisher
            .publish_config_update(&target.id, key, value)
            .await
    }

    // ---- sweeps -----------------------------------------------------------

    /// Delete agents whose heartbeat age passed the death threshold
    ///
    /// Unhealthy-but-not-dead agents are retained; they simply drop out of
    /// `get_active_agents`. Returns the number of deletions.
    pub async fn sweep_dead_agents(&self) -> FleetResult<usize> {
        let _guard = self.write_lock.lock().await;
        let now_ns = self.clock.now_ns();
        let threshold = self.config.agent.death_threshold_ns;

        let mut deleted = 0;
        for agent in self.datastore.get_agents().await? {
            if agent.heartbeat_age_ns(now_ns) > threshold {
                tracing::info!(
                    agent = %agent.id,
                    asid = agent.asid,
                    age_ns = agent.heartbeat_age_ns(now_ns),
                    "deleting dead agent"
                );
                self.datastore.delete_agent(&agent.id).await?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Reap expired feed entries and process records, and drop idle cursors
    pub async fn trim_feed(&self) -> FleetResult<usize> {
        let reaped = self.datastore.reap_expired().await?;
        let swept = self
            .cursors
            .sweep_idle_cursors(self.config.cursor.idle_retention_ns)
            .await?;
        Ok(reaped + swept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::bus::InProcessBus;
    use crate::infrastructure::store::MemoryStore;
    use crate::utils::clock::FixedClock;

    const NOW: u64 = 70_000_000_000;

    async fn manager() -> (Arc<AgentManager>, Arc<FixedClock>) {
        let clock = FixedClock::new(NOW);
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let bus = Arc::new(InProcessBus::new());
        let manager = AgentManager::new(store, bus, clock.clone(), FleetConfig::default())
            .await
            .unwrap();
        (Arc::new(manager), clock)
    }

    fn registration(hostname: &str, ip: &str, collects_data: bool) -> AgentRegistration {
        AgentRegistration {
            id: Uuid::new_v4(),
            host: HostInfo::new(hostname, ip),
            namespace: "pl".to_string(),
            pod_name: format!("pem-{ip}"),
            collects_data,
            create_time_ns: 0,
            last_heartbeat_ns: 0,
        }
    }

    #[tokio::test]
    async fn test_register_assigns_dense_asids() {
        let (manager, _) = manager().await;
        let a = registration("h1", "10.0.0.1", true);
        let b = registration("h2", "10.0.0.2", true);

        assert_eq!(manager.register_agent(a.clone()).await.unwrap(), 1);
        assert_eq!(manager.register_agent(b).await.unwrap(), 2);

        // Free the first slot; the next registration recovers it
        manager.delete_agent(a.id).await.unwrap();
        let c = registration("h3", "10.0.0.3", true);
        assert_eq!(manager.register_agent(c).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_requires_registration() {
        let (manager, clock) = manager().await;
        let err = manager.update_heartbeat(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, FleetError::AgentNotFound { .. }));

        let reg = registration("h1", "10.0.0.1", true);
        manager.register_agent(reg.clone()).await.unwrap();

        clock.advance(1_000);
        manager.update_heartbeat(reg.id).await.unwrap();
        let agent = manager.get_agent(reg.id).await.unwrap().unwrap();
        assert_eq!(agent.last_heartbeat_ns, NOW + 1_000);
        // Creation time is untouched by heartbeats
        assert_eq!(agent.create_time_ns, NOW);
    }

    #[tokio::test]
    async fn test_active_agents_ordered_and_filtered() {
        let (manager, clock) = manager().await;
        let a = registration("h1", "10.0.0.1", true);
        let b = registration("h2", "10.0.0.2", true);
        manager.register_agent(a.clone()).await.unwrap();
        manager.register_agent(b.clone()).await.unwrap();

        let active = manager.get_active_agents().await.unwrap();
        let asids: Vec<u32> = active.iter().map(|agent| agent.asid).collect();
        assert_eq!(asids, vec![1, 2]);

        // Let `a` go stale, keep `b` fresh
        clock.advance(FleetConfig::default().agent.expiry_threshold_ns);
        manager.update_heartbeat(b.id).await.unwrap();

        let active = manager.get_active_agents().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, b.id);
        // Stale agent is retained, just not active
        assert_eq!(manager.get_agents().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_dead_agent_sweep_deletes_through_normal_path() {
        let (manager, clock) = manager().await;
        let a = registration("h1", "10.0.0.1", true);
        let b = registration("h2", "10.0.0.2", true);
        manager.register_agent(a.clone()).await.unwrap();
        manager.register_agent(b.clone()).await.unwrap();

        let cursor = manager.create_cursor().await.unwrap();
        manager.get_agent_updates(&cursor).await.unwrap();

        clock.advance(FleetConfig::default().agent.death_threshold_ns + 1);
        manager.update_heartbeat(b.id).await.unwrap();

        assert_eq!(manager.sweep_dead_agents().await.unwrap(), 1);
        assert!(manager.get_agent(a.id).await.unwrap().is_none());

        // The deletion flowed through the change feed
        let batch = manager.get_agent_updates(&cursor).await.unwrap();
        assert!(batch
            .updates
            .iter()
            .any(|event| matches!(event, crate::agents::FeedEvent::AgentDeleted { agent_id } if *agent_id == a.id)));
    }

    #[tokio::test]
    async fn test_update_config_unknown_pod() {
        let (manager, _) = manager().await;
        let err = manager
            .update_config("pl", "missing-pod", "gprof", "true")
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::AgentNotFound { .. }));
    }

    #[tokio::test]
    async fn test_eviction_reuses_host_identity() {
        let (manager, _) = manager().await;
        let first = registration("h1", "10.0.0.1", true);
        manager.register_agent(first.clone()).await.unwrap();

        // New UUID, same collector identity: prior occupant is evicted
        let mut second = registration("other-name", "10.0.0.1", true);
        second.pod_name = "pem-replacement".to_string();
        let asid = manager.register_agent(second.clone()).await.unwrap();

        assert!(manager.get_agent(first.id).await.unwrap().is_none());
        let survivor = manager.get_agent(second.id).await.unwrap().unwrap();
        assert_eq!(survivor.asid, asid);
        assert_eq!(
            manager
                .get_agent_id_for_host(&second.host_key())
                .await
                .unwrap(),
            Some(second.id)
        );
    }
}
