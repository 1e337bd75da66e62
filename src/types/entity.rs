//! # Entity Records
//!
//! Cached facts about routers and vaults.
//!
//! Every collection is ordered so the serialized form of a record is deterministic: two runs that
//! see the same chain produce byte-identical records. Facts only ever grow; [`EntityFacts::merge`]
//! is a set union and [`EventCounters::add`] sums.

use chrono::{DateTime, Utc};
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::types::events::{EventKind, EventPayload};
use crate::types::progress::BlockRange;
use crate::vendor_attributor::VendorClassification;

/// What a factory deploys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Router,
    Vault,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Router => "router",
            EntityKind::Vault => "vault",
        }
    }
}

/// Base/quote pair configured on a router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AssetPair {
    pub base: Address,
    pub quote: Address,
}

impl AssetPair {
    pub fn contains(&self, asset: Address) -> bool {
        self.base == asset || self.quote == asset
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResolvedVault {
    pub vault: Address,
    pub asset: Address,
}

/// Facts discovered for one entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityFacts {
    /// Every oracle adapter ever configured on the router.
    #[serde(default)]
    pub adapters: BTreeSet<Address>,
    /// Pair → adapters seen for it. A reconfigured pair keeps its previous adapters.
    #[serde(default, with = "pair_map")]
    pub pair_adapters: BTreeMap<AssetPair, BTreeSet<Address>>,
    #[serde(default)]
    pub resolved_vaults: BTreeSet<ResolvedVault>,
    #[serde(default)]
    pub fallback_oracles: BTreeSet<Address>,
    // Vault facts
    #[serde(default)]
    pub oracle_routers: BTreeSet<Address>,
    #[serde(default)]
    pub units_of_account: BTreeSet<Address>,
    #[serde(default)]
    pub underlying_assets: BTreeSet<Address>,
    #[serde(default)]
    pub collaterals: BTreeSet<Address>,
    /// Vendor classification per price source (adapters, fallbacks, a vault's zero oracle).
    #[serde(default)]
    pub vendors: BTreeMap<Address, VendorClassification>,
    /// Vault only: vendors behind the vault's asset as priced by its oracle routers.
    #[serde(default)]
    pub asset_vendors: BTreeSet<String>,
}

impl EntityFacts {
    /// Folds a decoded event into the fact set.
    pub fn apply_event(&mut self, payload: &EventPayload) {
        match payload {
            // A zero oracle removes the pair's config; earlier adapters stay on record
            EventPayload::ConfigSet { oracle, .. } if oracle.is_zero() => {}
            EventPayload::ConfigSet { base, quote, oracle } => {
                self.adapters.insert(*oracle);
                self.pair_adapters
                    .entry(AssetPair {
                        base: *base,
                        quote: *quote,
                    })
                    .or_default()
                    .insert(*oracle);
            }
            EventPayload::ResolvedVaultSet { vault, asset } => {
                self.resolved_vaults.insert(ResolvedVault {
                    vault: *vault,
                    asset: *asset,
                });
            }
            EventPayload::FallbackOracleSet { oracle } => {
                if !oracle.is_zero() {
                    self.fallback_oracles.insert(*oracle);
                }
            }
            EventPayload::GovSetLtv { collateral, .. } => {
                self.collaterals.insert(*collateral);
            }
            // Factory events never reach an entity record
            EventPayload::ProxyCreated { .. } => {}
        }
    }

    /// Set union with `other`. Nothing already present is removed or overwritten, except that an
    /// unresolved vendor classification is upgraded by a resolved one.
    pub fn merge(&mut self, other: EntityFacts) {
        self.adapters.extend(other.adapters);
        for (pair, adapters) in other.pair_adapters {
            self.pair_adapters.entry(pair).or_default().extend(adapters);
        }
        self.resolved_vaults.extend(other.resolved_vaults);
        self.fallback_oracles.extend(other.fallback_oracles);
        self.oracle_routers.extend(other.oracle_routers);
        self.units_of_account.extend(other.units_of_account);
        self.underlying_assets.extend(other.underlying_assets);
        self.collaterals.extend(other.collaterals);
        self.asset_vendors.extend(other.asset_vendors);
        for (address, classification) in other.vendors {
            self.merge_vendor(address, classification);
        }
    }

    /// Returns true when the stored classification changed.
    pub fn merge_vendor(&mut self, address: Address, classification: VendorClassification) -> bool {
        match self.vendors.get(&address) {
            Some(existing) if existing.is_resolved() || !classification.is_resolved() => false,
            _ => {
                self.vendors.insert(address, classification);
                true
            }
        }
    }

    /// Addresses classified directly for this entity. A vault's non-zero oracle is a router and
    /// is attributed through the router's adapters instead.
    pub fn price_sources(&self) -> BTreeSet<Address> {
        self.adapters
            .iter()
            .chain(self.fallback_oracles.iter())
            .chain(self.oracle_routers.iter().filter(|router| router.is_zero()))
            .copied()
            .collect()
    }

    /// True when every fact in `self` is also in `other`.
    pub fn is_subset_of(&self, other: &EntityFacts) -> bool {
        self.adapters.is_subset(&other.adapters)
            && self.pair_adapters.iter().all(|(pair, adapters)| {
                other
                    .pair_adapters
                    .get(pair)
                    .map_or(false, |theirs| adapters.is_subset(theirs))
            })
            && self.resolved_vaults.is_subset(&other.resolved_vaults)
            && self.fallback_oracles.is_subset(&other.fallback_oracles)
            && self.oracle_routers.is_subset(&other.oracle_routers)
            && self.units_of_account.is_subset(&other.units_of_account)
            && self.underlying_assets.is_subset(&other.underlying_assets)
            && self.collaterals.is_subset(&other.collaterals)
            && self.vendors.keys().all(|k| other.vendors.contains_key(k))
            && self.asset_vendors.is_subset(&other.asset_vendors)
    }
}

/// Per-event counters, summed across rechecks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCounters {
    pub config_set: u64,
    pub resolved_vault_set: u64,
    pub fallback_oracle_set: u64,
    pub gov_set_ltv: u64,
}

impl EventCounters {
    pub fn record(&mut self, payload: &EventPayload) {
        match payload {
            EventPayload::ConfigSet { .. } => self.config_set += 1,
            EventPayload::ResolvedVaultSet { .. } => self.resolved_vault_set += 1,
            EventPayload::FallbackOracleSet { .. } => self.fallback_oracle_set += 1,
            EventPayload::GovSetLtv { .. } => self.gov_set_ltv += 1,
            EventPayload::ProxyCreated { .. } => {}
        }
    }

    pub fn add(&mut self, other: &EventCounters) {
        self.config_set += other.config_set;
        self.resolved_vault_set += other.resolved_vault_set;
        self.fallback_oracle_set += other.fallback_oracle_set;
        self.gov_set_ltv += other.gov_set_ltv;
    }

    pub fn total(&self) -> u64 {
        self.config_set + self.resolved_vault_set + self.fallback_oracle_set + self.gov_set_ltv
    }
}

/// Last processing failure of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityError {
    pub message: String,
    pub at_head: u64,
    pub recorded_at: DateTime<Utc>,
}

/// Where an entity sits in the recheck cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    Unseen,
    Fresh,
    Stale,
}

/// A block range whose events of one kind could not be fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventGap {
    pub kind: EventKind,
    pub range: BlockRange,
}

/// A router or vault tracked by the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub address: Address,
    pub kind: EntityKind,
    pub source: String,
    pub deployment_block: u64,
    /// `None` until the first successful query.
    pub last_processed_block: Option<u64>,
    #[serde(default)]
    pub facts: EntityFacts,
    #[serde(default)]
    pub counters: EventCounters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<EntityError>,
    /// Ranges dropped below the retry floor, retried on the next recheck.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unresolved_ranges: Vec<EventGap>,
}

impl EntityRecord {
    pub fn new(address: Address, kind: EntityKind, source: impl Into<String>, deployment_block: u64) -> Self {
        Self {
            address,
            kind,
            source: source.into(),
            deployment_block,
            last_processed_block: None,
            facts: EntityFacts::default(),
            counters: EventCounters::default(),
            last_error: None,
            unresolved_ranges: Vec::new(),
        }
    }

    pub fn state(&self, current_head: u64, recheck_interval_blocks: u64) -> EntityState {
        match self.last_processed_block {
            None => EntityState::Unseen,
            Some(last) if current_head.saturating_sub(last) < recheck_interval_blocks => EntityState::Fresh,
            Some(_) => EntityState::Stale,
        }
    }

    /// Repeating the stored error at the same head keeps the original record.
    pub fn record_error(&mut self, message: impl Into<String>, at_head: u64) {
        let message = message.into();
        if let Some(existing) = &self.last_error {
            if existing.message == message && existing.at_head == at_head {
                return;
            }
        }
        self.last_error = Some(EntityError {
            message,
            at_head,
            recorded_at: Utc::now(),
        });
    }
}

// JSON object keys must be strings, so the pair map is stored as a list.
mod pair_map {
    use super::AssetPair;
    use ethers::types::Address;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::{BTreeMap, BTreeSet};

    #[derive(Serialize, Deserialize)]
    struct PairAdapters {
        base: Address,
        quote: Address,
        adapters: BTreeSet<Address>,
    }

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<AssetPair, BTreeSet<Address>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let list: Vec<PairAdapters> = map
            .iter()
            .map(|(pair, adapters)| PairAdapters {
                base: pair.base,
                quote: pair.quote,
                adapters: adapters.clone(),
            })
            .collect();
        list.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<AssetPair, BTreeSet<Address>>, D::Error> {
        let list = Vec::<PairAdapters>::deserialize(deserializer)?;
        let mut map: BTreeMap<AssetPair, BTreeSet<Address>> = BTreeMap::new();
        for entry in list {
            map.entry(AssetPair {
                base: entry.base,
                quote: entry.quote,
            })
            .or_default()
            .extend(entry.adapters);
        }
        Ok(map)
    }
}
