//! # Message Bus Seam
//!
//! The manager only publishes; it owns no subscriptions. [`MessageBus`] is
//! the seam the real transport plugs into. [`InProcessBus`] is a
//! subject-addressed broadcast implementation used in tests and single-node
//! deployments, letting sibling subsystems tap `Agent/<uuid>` subjects.

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::utils::error::FleetResult;

/// Buffered messages per subject before slow subscribers start lagging
const SUBJECT_CAPACITY: usize = 256;

/// Subject-addressed publish transport
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish one payload on a subject; fire-and-forget
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> FleetResult<()>;
}

/// In-process broadcast bus
///
/// Publishing to a subject with no subscribers drops the payload, matching
/// the at-most-once contract of the external transport.
#[derive(Default)]
pub struct InProcessBus {
    subjects: DashMap<String, broadcast::Sender<Vec<u8>>>,
}

impl InProcessBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, subject: &str) -> broadcast::Sender<Vec<u8>> {
        self.subjects
            .entry(subject.to_string())
            .or_insert_with(|| broadcast::channel(SUBJECT_CAPACITY).0)
            .clone()
    }

    /// Subscribe to one subject; only payloads published afterwards arrive
    #[must_use]
    pub fn subscribe(&self, subject: &str) -> broadcast::Receiver<Vec<u8>> {
        self.sender(subject).subscribe()
    }
}

#[async_trait]
impl MessageBus for InProcessBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> FleetResult<()> {
        // send only fails with zero subscribers, which is fine here
        let _ = self.sender(subject).send(payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = InProcessBus::new();
        let mut rx = bus.subscribe("Agent/abc");

        bus.publish("Agent/abc", b"hello".to_vec()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), b"hello".to_vec());
    }

    #[tokio::test]
    async fn test_subjects_are_isolated() {
        let bus = InProcessBus::new();
        let mut rx = bus.subscribe("Agent/abc");

        bus.publish("Agent/other", b"nope".to_vec()).await.unwrap();
        bus.publish("Agent/abc", b"yes".to_vec()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), b"yes".to_vec());
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = InProcessBus::new();
        bus.publish("Agent/nobody", b"dropped".to_vec())
            .await
            .unwrap();
    }
}
