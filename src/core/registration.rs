//! # Identity Resolution and ASID Allocation
//!
//! A registering agent declares a UUID and a host identity. The registry
//! decides between three outcomes by resolving the capability-dependent
//! host key:
//!
//! - the key resolves to the declared UUID: a **re-registration** that must
//!   preserve the stored creation time and ASID,
//! - the key resolves to a different UUID: a **collision**; the prior
//!   occupant is evicted and the registration proceeds as new,
//! - the key resolves to nothing: a **new** agent.
//!
//! ASIDs are dense: the allocator always hands out the smallest unused
//! positive id, recovered from the ASID-index scan.

use uuid::Uuid;

use crate::agents::{Agent, AgentRegistration};
use crate::infrastructure::datastore::Datastore;
use crate::utils::error::FleetResult;

/// Outcome of resolving a registration against the host-identity index
#[derive(Debug, Clone)]
pub enum Registration {
    /// Host identity is unclaimed
    New,
    /// Same agent returning after a restart
    ReRegistration { existing: Agent },
    /// Host identity claimed by a different agent that must be evicted
    Eviction { occupant: Uuid },
}

/// Classify a registration against the current host-identity index
pub async fn resolve_identity(
    datastore: &Datastore,
    registration: &AgentRegistration,
) -> FleetResult<Registration> {
    let host_key = registration.host_key();
    let Some(occupant) = datastore.get_agent_id_for_host(&host_key).await? else {
        return Ok(Registration::New);
    };

    if occupant == registration.id {
        match datastore.get_agent(&occupant).await? {
            Some(existing) => return Ok(Registration::ReRegistration { existing }),
            None => {
                // Index points at a record that no longer exists; treat as
                // new so the registration heals the index.
                tracing::warn!(
                    agent = %occupant,
                    "host index resolved to a missing agent record"
                );
                return Ok(Registration::New);
            }
        }
    }

    Ok(Registration::Eviction { occupant })
}

/// Smallest unused positive ASID given the allocated set in ascending order
#[must_use]
pub fn first_free_asid(allocated: &[u32]) -> u32 {
    let mut expected = 1u32;
    for &asid in allocated {
        if asid > expected {
            break;
        }
        if asid == expected {
            expected += 1;
        }
        // asid < expected only on duplicate scans; keep looking
    }
    expected
}
