// Persisted synchronization state: per-source deployment caches and checkpoints,
// per-entity records. Threaded explicitly through every stage and written only by ProgressStore.

use ethers::types::Address;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::types::entity::{EntityKind, EntityRecord};

pub const PROGRESS_FORMAT_VERSION: u32 = 1;

/// Inclusive block range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockRange {
    pub from: u64,
    pub to: u64,
}

impl BlockRange {
    pub fn new(from: u64, to: u64) -> Self {
        Self { from, to }
    }

    /// Number of blocks covered; zero for an inverted range.
    pub fn len(&self) -> u64 {
        if self.from > self.to {
            0
        } else {
            self.to - self.from + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentEntry {
    pub address: Address,
    pub deployment_block: u64,
}

/// Insertion-ordered, address-deduplicated deployment list. Never shrinks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<DeploymentEntry>", into = "Vec<DeploymentEntry>")]
pub struct DeploymentCache {
    entries: IndexMap<Address, u64>,
}

impl DeploymentCache {
    /// Adds a deployment; returns false when the address is already cached.
    /// A duplicate with an earlier block lowers the stored deployment block.
    pub fn insert(&mut self, address: Address, deployment_block: u64) -> bool {
        match self.entries.get_mut(&address) {
            Some(existing) => {
                if deployment_block < *existing {
                    *existing = deployment_block;
                }
                false
            }
            None => {
                self.entries.insert(address, deployment_block);
                true
            }
        }
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.entries.contains_key(address)
    }

    pub fn deployment_block(&self, address: &Address) -> Option<u64> {
        self.entries.get(address).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Highest deployment block in the cache.
    pub fn latest_block(&self) -> Option<u64> {
        self.entries.values().copied().max()
    }

    pub fn iter(&self) -> impl Iterator<Item = DeploymentEntry> + '_ {
        self.entries.iter().map(|(address, block)| DeploymentEntry {
            address: *address,
            deployment_block: *block,
        })
    }
}

impl From<Vec<DeploymentEntry>> for DeploymentCache {
    fn from(list: Vec<DeploymentEntry>) -> Self {
        let mut cache = DeploymentCache::default();
        for entry in list {
            cache.insert(entry.address, entry.deployment_block);
        }
        cache
    }
}

impl From<DeploymentCache> for Vec<DeploymentEntry> {
    fn from(cache: DeploymentCache) -> Self {
        cache.iter().collect()
    }
}

/// State of one factory source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceProgress {
    pub factory: Address,
    pub kind: EntityKind,
    pub last_synced_block: Option<u64>,
    #[serde(default)]
    pub deployments: DeploymentCache,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unresolved_ranges: Vec<BlockRange>,
}

impl SourceProgress {
    pub fn new(factory: Address, kind: EntityKind) -> Self {
        Self {
            factory,
            kind,
            last_synced_block: None,
            deployments: DeploymentCache::default(),
            unresolved_ranges: Vec::new(),
        }
    }
}

/// Everything the engine persists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub version: u32,
    #[serde(default)]
    pub sources: IndexMap<String, SourceProgress>,
    #[serde(default)]
    pub entities: IndexMap<Address, EntityRecord>,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            version: PROGRESS_FORMAT_VERSION,
            sources: IndexMap::new(),
            entities: IndexMap::new(),
        }
    }
}

impl Progress {
    /// Returns the source entry, creating it on first use.
    pub fn source_mut(&mut self, name: &str, factory: Address, kind: EntityKind) -> &mut SourceProgress {
        self.sources
            .entry(name.to_string())
            .or_insert_with(|| SourceProgress::new(factory, kind))
    }

    /// Every deployed vault known to the cache.
    pub fn known_vaults(&self) -> BTreeSet<Address> {
        self.sources
            .values()
            .filter(|source| source.kind == EntityKind::Vault)
            .flat_map(|source| source.deployments.iter().map(|entry| entry.address))
            .collect()
    }

    /// Forgets an entity so its next pass starts from its deployment block.
    pub fn reset_entity(&mut self, address: &Address) -> Option<EntityRecord> {
        self.entities.shift_remove(address)
    }

    pub fn unresolved_range_count(&self) -> usize {
        self.sources
            .values()
            .map(|s| s.unresolved_ranges.len())
            .chain(self.entities.values().map(|e| e.unresolved_ranges.len()))
            .sum()
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            factories: self
                .sources
                .iter()
                .filter_map(|(name, source)| source.last_synced_block.map(|b| (name.clone(), b)))
                .collect(),
            entities: self
                .entities
                .iter()
                .filter_map(|(address, record)| record.last_processed_block.map(|b| (*address, b)))
                .collect(),
        }
    }
}

/// Projection of [`Progress`] onto its block heights.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Checkpoint {
    pub factories: BTreeMap<String, u64>,
    pub entities: BTreeMap<Address, u64>,
}

/// A checkpoint that moved backwards (or disappeared).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Regression {
    pub key: String,
    pub committed: u64,
    pub attempted: u64,
}

impl Checkpoint {
    /// First value that decreased compared to `previous`, if any.
    pub fn regression_from(&self, previous: &Checkpoint) -> Option<Regression> {
        for (name, committed) in &previous.factories {
            let attempted = self.factories.get(name).copied().unwrap_or(0);
            if attempted < *committed {
                return Some(Regression {
                    key: format!("source {}", name),
                    committed: *committed,
                    attempted,
                });
            }
        }
        for (address, committed) in &previous.entities {
            let attempted = self.entities.get(address).copied().unwrap_or(0);
            if attempted < *committed {
                return Some(Regression {
                    key: format!("entity {:?}", address),
                    committed: *committed,
                    attempted,
                });
            }
        }
        None
    }

    pub fn is_monotonic_from(&self, previous: &Checkpoint) -> bool {
        self.regression_from(previous).is_none()
    }
}
