//! Keyspace layout for the persistent store.
//!
//! Every record kind lives under its own prefix so a byte-ordered range scan
//! enumerates exactly one kind:
//!
//! ```text
//! /agent/<uuid>                serialized agent record
//! /hostip/<hostname>/<ip>      host-identity index -> uuid
//! /asid/<asid BE u32>          asid index -> uuid
//! /schema/<uuid>/<table>       per-agent table descriptor
//! /computed/schema             materialized cluster schema
//! /proc/<upid BE 16B>          process record (TTL-bound)
//! /datainfo/<uuid>             metadata bloom-filter blob
//! /cursor/<uuid>               cursor state
//! /feed/<sequence BE u64>      change-feed entry (TTL-bound)
//! /meta/...                    version + schema-change marker
//! ```
//!
//! Numeric key components are big-endian so lexicographic scan order equals
//! numeric order.

use uuid::Uuid;

use crate::agents::upid::Upid;
use crate::utils::error::{FleetError, FleetResult};

pub const AGENT_PREFIX: &[u8] = b"/agent/";
pub const HOST_PREFIX: &[u8] = b"/hostip/";
pub const ASID_PREFIX: &[u8] = b"/asid/";
pub const SCHEMA_PREFIX: &[u8] = b"/schema/";
pub const PROCESS_PREFIX: &[u8] = b"/proc/";
pub const DATA_INFO_PREFIX: &[u8] = b"/datainfo/";
pub const CURSOR_PREFIX: &[u8] = b"/cursor/";
pub const FEED_PREFIX: &[u8] = b"/feed/";

pub const COMPUTED_SCHEMA_KEY: &[u8] = b"/computed/schema";
pub const META_VERSION_KEY: &[u8] = b"/meta/version";
pub const META_SCHEMA_MARKER_KEY: &[u8] = b"/meta/schema_marker";

fn join(prefix: &[u8], suffix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + suffix.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(suffix);
    key
}

#[must_use]
pub fn agent_key(id: &Uuid) -> Vec<u8> {
    join(AGENT_PREFIX, id.to_string().as_bytes())
}

/// Host-identity index key; collectors use an empty hostname component
#[must_use]
pub fn host_key(hostname: &str, host_ip: &str) -> Vec<u8> {
    let mut key = HOST_PREFIX.to_vec();
    key.extend_from_slice(hostname.as_bytes());
    key.push(b'/');
    key.extend_from_slice(host_ip.as_bytes());
    key
}

#[must_use]
pub fn asid_key(asid: u32) -> Vec<u8> {
    join(ASID_PREFIX, &asid.to_be_bytes())
}

pub fn asid_from_key(key: &[u8]) -> FleetResult<u32> {
    let suffix = key
        .strip_prefix(ASID_PREFIX)
        .ok_or_else(|| FleetError::corrupt(key, "not an asid key"))?;
    let bytes: [u8; 4] = suffix
        .try_into()
        .map_err(|_| FleetError::corrupt(key, "asid suffix must be 4 bytes"))?;
    Ok(u32::from_be_bytes(bytes))
}

#[must_use]
pub fn schema_prefix(agent_id: &Uuid) -> Vec<u8> {
    let mut key = join(SCHEMA_PREFIX, agent_id.to_string().as_bytes());
    key.push(b'/');
    key
}

#[must_use]
pub fn schema_key(agent_id: &Uuid, table: &str) -> Vec<u8> {
    join(&schema_prefix(agent_id), table.as_bytes())
}

#[must_use]
pub fn process_key(upid: &Upid) -> Vec<u8> {
    join(PROCESS_PREFIX, &upid.to_bytes())
}

#[must_use]
pub fn data_info_key(agent_id: &Uuid) -> Vec<u8> {
    join(DATA_INFO_PREFIX, agent_id.to_string().as_bytes())
}

#[must_use]
pub fn cursor_key(cursor_id: &Uuid) -> Vec<u8> {
    join(CURSOR_PREFIX, cursor_id.to_string().as_bytes())
}

#[must_use]
pub fn feed_key(sequence: u64) -> Vec<u8> {
    join(FEED_PREFIX, &sequence.to_be_bytes())
}

pub fn sequence_from_key(key: &[u8]) -> FleetResult<u64> {
    let suffix = key
        .strip_prefix(FEED_PREFIX)
        .ok_or_else(|| FleetError::corrupt(key, "not a feed key"))?;
    let bytes: [u8; 8] = suffix
        .try_into()
        .map_err(|_| FleetError::corrupt(key, "feed suffix must be 8 bytes"))?;
    Ok(u64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_key_layout() {
        assert_eq!(host_key("test", "127.0.0.3"), b"/hostip/test/127.0.0.3");
        // Collector keying leaves the hostname component empty
        assert_eq!(host_key("", "127.0.0.4"), b"/hostip//127.0.0.4");
    }

    #[test]
    fn test_asid_key_round_trip_and_order() {
        assert_eq!(asid_from_key(&asid_key(42)).unwrap(), 42);
        // Big-endian keys sort numerically
        assert!(asid_key(2) < asid_key(10));
        assert!(asid_key(255) < asid_key(256));
    }

    #[test]
    fn test_feed_key_round_trip_and_order() {
        assert_eq!(sequence_from_key(&feed_key(7)).unwrap(), 7);
        assert!(feed_key(9) < feed_key(10));
        assert!(feed_key(255) < feed_key(1 << 32));
    }

    #[test]
    fn test_schema_key_nests_under_agent_prefix() {
        let id = Uuid::new_v4();
        let key = schema_key(&id, "http_events");
        assert!(key.starts_with(&schema_prefix(&id)));
        assert!(key.ends_with(b"http_events"));
    }

    #[test]
    fn test_bad_keys_are_corrupt() {
        assert!(asid_from_key(b"/agent/xyz").is_err());
        assert!(sequence_from_key(b"/feed/short").is_err());
    }
}
