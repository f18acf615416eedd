//! Configuration-change commands pushed to live agents.
//!
//! Commands travel as a [`BusEnvelope`] framing wrapper around a typed
//! payload, published on the agent's own subject. Apply acknowledgement is
//! never waited for; it shows up in subsequent agent updates.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::communication::bus::MessageBus;
use crate::utils::clock::Clock;
use crate::utils::error::{FleetError, FleetResult};

/// Subject a single agent listens on
#[must_use]
pub fn agent_subject(agent_id: &Uuid) -> String {
    format!("Agent/{agent_id}")
}

/// Kind tag for bus payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusMessageType {
    ConfigUpdate,
}

/// Framing wrapper for everything the manager publishes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusEnvelope {
    pub message_id: Uuid,
    pub message_type: BusMessageType,
    pub timestamp_ns: u64,
    /// Serialized inner payload, typed by `message_type`
    pub payload: Vec<u8>,
}

impl BusEnvelope {
    pub fn encode(&self) -> FleetResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| FleetError::Bus {
            subject: String::new(),
            reason: format!("envelope encode failed: {e}"),
        })
    }

    pub fn decode(bytes: &[u8]) -> FleetResult<Self> {
        bincode::deserialize(bytes).map_err(|e| FleetError::Bus {
            subject: String::new(),
            reason: format!("envelope decode failed: {e}"),
        })
    }
}

/// One configuration key/value change request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigUpdateRequest {
    pub key: String,
    pub value: String,
}

impl ConfigUpdateRequest {
    pub fn decode(bytes: &[u8]) -> FleetResult<Self> {
        bincode::deserialize(bytes).map_err(|e| FleetError::Bus {
            subject: String::new(),
            reason: format!("config update decode failed: {e}"),
        })
    }
}

/// Publisher for agent-addressed commands
pub struct CommandPublisher {
    bus: Arc<dyn MessageBus>,
    clock: Arc<dyn Clock>,
}

impl CommandPublisher {
    #[must_use]
    pub fn new(bus: Arc<dyn MessageBus>, clock: Arc<dyn Clock>) -> Self {
        Self { bus, clock }
    }

    /// Publish a config-update request to one agent's subject
    pub async fn publish_config_update(
        &self,
        agent_id: &Uuid,
        key: &str,
        value: &str,
    ) -> FleetResult<()> {
        let subject = agent_subject(agent_id);
        let request = ConfigUpdateRequest {
            key: key.to_string(),
            value: value.to_string(),
        };
        let payload = bincode::serialize(&request).map_err(|e| FleetError::Bus {
            subject: subject.clone(),
            reason: format!("config update encode failed: {e}"),
        })?;
        let envelope = BusEnvelope {
            message_id: Uuid::new_v4(),
            message_type: BusMessageType::ConfigUpdate,
            timestamp_ns: self.clock.now_ns(),
            payload,
        };

        tracing::info!(agent = %agent_id, key, "publishing config update");
        self.bus.publish(&subject, envelope.encode()?).await
    }
}
