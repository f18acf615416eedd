//! # Background Sweepers
//!
//! Two periodic duties keep the registry bounded:
//!
//! - **Expiry sweep**: agents whose heartbeat age passed the death
//!   threshold are deleted through the normal delete path, so consumers
//!   observe an ordinary `AgentDeleted` event.
//! - **Trim sweep**: TTL-expired feed entries and process records are
//!   physically reaped, and cursors idle beyond retention are dropped.
//!
//! Each sweep runs in its own tokio task on a shared cadence; an iteration
//! that fails is logged and the loop keeps going.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::core::manager::AgentManager;
use crate::utils::config::FleetConfig;

/// Handle owning the background sweep tasks
pub struct FleetSweeper {
    interval: Duration,
    handles: Arc<RwLock<Vec<JoinHandle<()>>>>,
}

impl FleetSweeper {
    #[must_use]
    pub fn new(config: &FleetConfig) -> Self {
        Self {
            interval: Duration::from_millis(config.sweep.interval_ms),
            handles: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Spawn both sweep loops against the given manager
    pub async fn start(&self, manager: Arc<AgentManager>) {
        let mut handles = self.handles.write().await;
        handles.push(Self::spawn_expiry_sweep(manager.clone(), self.interval));
        handles.push(Self::spawn_trim_sweep(manager, self.interval));
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "sweepers started");
    }

    /// Abort every sweep task
    pub async fn stop(&self) {
        let mut handles = self.handles.write().await;
        for handle in handles.drain(..) {
            handle.abort();
        }
        tracing::info!("sweepers stopped");
    }

    fn spawn_expiry_sweep(manager: Arc<AgentManager>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                match manager.sweep_dead_agents().await {
                    Ok(0) => {}
                    Ok(deleted) => {
                        tracing::info!(deleted, "expiry sweep removed dead agents");
                    }
                    Err(err) => {
                        tracing::error!(%err, "expiry sweep failed");
                    }
                }
            }
        })
    }

    fn spawn_trim_sweep(manager: Arc<AgentManager>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                match manager.trim_feed().await {
                    Ok(0) => {}
                    Ok(trimmed) => {
                        tracing::debug!(trimmed, "trim sweep reaped expired records");
                    }
                    Err(err) => {
                        tracing::error!(%err, "trim sweep failed");
                    }
                }
            }
        })
    }

    /// Status blob for diagnostics endpoints
    pub async fn status(&self) -> serde_json::Value {
        let handles = self.handles.read().await;
        let active = handles.iter().filter(|handle| !handle.is_finished()).count();
        serde_json::json!({
            "total_sweepers": handles.len(),
            "active_sweepers": active,
            "interval_ms": self.interval.as_millis() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentRegistration, HostInfo};
    use crate::communication::bus::InProcessBus;
    use crate::infrastructure::store::MemoryStore;
    use crate::utils::clock::FixedClock;
    use uuid::Uuid;

    async fn manager_with_clock() -> (Arc<AgentManager>, Arc<FixedClock>, FleetConfig) {
        let clock = FixedClock::new(1_000_000_000_000);
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let bus = Arc::new(InProcessBus::new());
        let mut config = FleetConfig::default();
        config.sweep.interval_ms = 10;
        let manager = AgentManager::new(store, bus, clock.clone(), config.clone())
            .await
            .unwrap();
        (Arc::new(manager), clock, config)
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let (manager, _, config) = manager_with_clock().await;
        let sweeper = FleetSweeper::new(&config);

        sweeper.start(manager).await;
        let status = sweeper.status().await;
        assert_eq!(status["total_sweepers"], 2);
        assert_eq!(status["active_sweepers"], 2);

        sweeper.stop().await;
        let status = sweeper.status().await;
        assert_eq!(status["total_sweepers"], 0);
    }

    #[tokio::test]
    async fn test_expiry_sweep_deletes_dead_agent() {
        let (manager, clock, config) = manager_with_clock().await;
        let reg = AgentRegistration {
            id: Uuid::new_v4(),
            host: HostInfo::new("h1", "10.0.0.1"),
            namespace: "pl".to_string(),
            pod_name: "pem-1".to_string(),
            collects_data: true,
            create_time_ns: 0,
            last_heartbeat_ns: 0,
        };
        manager.register_agent(reg.clone()).await.unwrap();

        clock.advance(config.agent.death_threshold_ns + 1);

        let sweeper = FleetSweeper::new(&config);
        sweeper.start(manager.clone()).await;

        // Give the sweep loop a few ticks
        for _ in 0..50 {
            if manager.get_agent(reg.id).await.unwrap().is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(manager.get_agent(reg.id).await.unwrap().is_none());

        sweeper.stop().await;
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let (_, _, config) = manager_with_clock().await;
        let sweeper = FleetSweeper::new(&config);
        sweeper.stop().await;
        assert_eq!(sweeper.status().await["total_sweepers"], 0);
    }
}
