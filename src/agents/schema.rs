//! # Table Schemas
//!
//! Per-agent table announcements and the derived cluster-wide schema view.
//!
//! Each agent announces the set of tables it serves. The cluster schema is
//! the exact union of live agents' announcements: a table exists iff at
//! least one live agent owns it, and the first announcer's descriptor is
//! installed as canonical. [`ComputedSchema`] implements the incremental
//! recompute so the registry never rebuilds the view from scratch on the
//! hot path.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Column value types understood by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Boolean,
    Int64,
    Uint128,
    Float64,
    String,
    Time,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: DataType,
}

/// Descriptor for one announced table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
    /// Column the table is tabletized on, when sharded
    pub tabletization_key: Option<String>,
}

/// Canonical descriptor plus the set of live agents serving the table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableOwners {
    pub schema: TableSchema,
    pub agents: BTreeSet<Uuid>,
}

/// Materialized cluster-wide schema view
///
/// BTree-backed so iteration order is deterministic for consumers and tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ComputedSchema {
    pub tables: BTreeMap<String, TableOwners>,
}

impl ComputedSchema {
    /// Replace one agent's announced table set
    ///
    /// Removes the agent from tables it no longer announces (dropping tables
    /// whose owner set empties), adds it to newly announced ones, and
    /// installs descriptors for tables seen for the first time. Returns
    /// whether the view changed.
    pub fn set_agent_tables(&mut self, agent_id: Uuid, tables: &[TableSchema]) -> bool {
        let mut changed = false;

        let announced: BTreeSet<&str> = tables.iter().map(|t| t.name.as_str()).collect();
        let owned: Vec<String> = self
            .tables
            .iter()
            .filter(|(_, owners)| owners.agents.contains(&agent_id))
            .map(|(name, _)| name.clone())
            .collect();

        for name in owned {
            if !announced.contains(name.as_str()) {
                changed |= self.drop_owner(&name, agent_id);
            }
        }

        for table in tables {
            match self.tables.get_mut(&table.name) {
                Some(owners) => {
                    if owners.schema != *table {
                        // Canonical descriptor wins; a disagreeing agent is
                        // almost always running a stale build.
                        tracing::warn!(
                            table = %table.name,
                            agent = %agent_id,
                            "announced descriptor disagrees with canonical schema"
                        );
                    }
                    changed |= owners.agents.insert(agent_id);
                }
                None => {
                    let mut agents = BTreeSet::new();
                    agents.insert(agent_id);
                    self.tables.insert(
                        table.name.clone(),
                        TableOwners {
                            schema: table.clone(),
                            agents,
                        },
                    );
                    changed = true;
                }
            }
        }

        changed
    }

    /// Remove an agent from every table it owns; returns whether the view changed
    pub fn remove_agent(&mut self, agent_id: Uuid) -> bool {
        let owned: Vec<String> = self
            .tables
            .iter()
            .filter(|(_, owners)| owners.agents.contains(&agent_id))
            .map(|(name, _)| name.clone())
            .collect();

        let mut changed = false;
        for name in owned {
            changed |= self.drop_owner(&name, agent_id);
        }
        changed
    }

    fn drop_owner(&mut self, table: &str, agent_id: Uuid) -> bool {
        let Some(owners) = self.tables.get_mut(table) else {
            return false;
        };
        let removed = owners.agents.remove(&agent_id);
        if owners.agents.is_empty() {
            self.tables.remove(table);
        }
        removed
    }

    #[must_use]
    pub fn table(&self, name: &str) -> Option<&TableOwners> {
        self.tables.get(name)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}
