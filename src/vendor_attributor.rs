//! # Vendor Attribution
//!
//! Maps a price-source address to the oracle vendor behind it.
//!
//! ## Resolution order
//!
//! 1. Address is a known vault → [`VendorClassification::Vault`], whatever the registry says.
//! 2. Address is the zero address → [`VendorClassification::EscrowNoOracle`].
//! 3. Address absent from the oracle registry → `Unresolved(NotInRegistry)`.
//! 4. Provider label normalized through the [`VendorTable`] (first match wins). No match →
//!    `Unresolved(UnknownProvider)`.
//! 5. A label that normalizes to the composite marker is looked up in the composite table and
//!    both legs are normalized on their own. A missing row or a leg that does not normalize to a
//!    plain vendor leaves the address `Unresolved`; no vendor name is ever guessed.
//!
//! Classification is pure: the same inputs always produce the same result.

use ethers::types::Address;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::SyncError;
use crate::registry::{CompositeTable, OracleRegistry};
use crate::settings::{Registry, VendorAlias};
use crate::types::entity::EntityFacts;
use crate::types::progress::Progress;

/// Canonical name that marks a composite ("cross") adapter.
pub const COMPOSITE_MARKER: &str = "Cross";

/// Decimal places kept per share by [`split_value_evenly`].
const SPLIT_SCALE: u32 = 18;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedReason {
    NotInRegistry,
    UnknownProvider(String),
    CompositeDetailMissing,
    CompositeLegUnknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VendorClassification {
    Vault,
    ExternalVendor { name: String },
    EscrowNoOracle,
    CompositeVendor { leg_a: String, leg_b: String },
    Unresolved { reason: UnresolvedReason },
}

impl VendorClassification {
    pub fn external(name: impl Into<String>) -> Self {
        VendorClassification::ExternalVendor { name: name.into() }
    }

    pub fn unresolved_not_in_registry() -> Self {
        VendorClassification::Unresolved {
            reason: UnresolvedReason::NotInRegistry,
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self, VendorClassification::Unresolved { .. })
    }

    /// Vendor names this classification contributes to an asset. Composites contribute both legs.
    pub fn underlying(&self) -> Vec<&str> {
        match self {
            VendorClassification::ExternalVendor { name } => vec![name.as_str()],
            VendorClassification::CompositeVendor { leg_a, leg_b } => {
                vec![leg_a.as_str(), leg_b.as_str()]
            }
            _ => Vec::new(),
        }
    }
}

/// How a provider label is matched. Labels and patterns are compared case-folded with
/// separators removed, so `"RedStone Pull"` matches `"redstone"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelPredicate {
    Contains(String),
    Exact(String),
}

impl LabelPredicate {
    pub fn contains(pattern: &str) -> Self {
        LabelPredicate::Contains(fold(pattern))
    }

    pub fn exact(pattern: &str) -> Self {
        LabelPredicate::Exact(fold(pattern))
    }

    fn matches(&self, folded_label: &str) -> bool {
        match self {
            LabelPredicate::Contains(p) => !p.is_empty() && folded_label.contains(p.as_str()),
            LabelPredicate::Exact(p) => folded_label == p,
        }
    }
}

fn fold(label: &str) -> String {
    label
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Ordered label → canonical vendor table.
#[derive(Debug, Clone)]
pub struct VendorTable {
    rules: Vec<(LabelPredicate, String)>,
}

impl Default for VendorTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl VendorTable {
    pub fn builtin() -> Self {
        // Order matters: "cross" must win over the leg names it usually embeds
        let rules = [
            ("cross", COMPOSITE_MARKER),
            ("chainlink", "Chainlink"),
            ("chronicle", "Chronicle"),
            ("redstone", "RedStone"),
            ("pyth", "Pyth"),
            ("api3", "API3"),
            ("uniswap", "Uniswap"),
            ("twap", "Uniswap"),
            ("lido", "Lido"),
            ("wsteth", "Lido"),
            ("pendle", "Pendle"),
            ("midas", "Midas"),
            ("idle", "Idle"),
            ("rateprovider", "Rate Provider"),
            ("fixed", "Fixed Rate"),
        ];
        let mut table = Self {
            rules: rules
                .iter()
                .map(|(pattern, canonical)| (LabelPredicate::contains(pattern), canonical.to_string()))
                .collect(),
        };
        // Abbreviations too short to match as substrings
        table
            .rules
            .push((LabelPredicate::exact("CL"), "Chainlink".to_string()));
        table
    }

    /// Configured aliases are evaluated before the built-in rules.
    pub fn with_aliases(aliases: &[VendorAlias]) -> Self {
        let mut rules: Vec<(LabelPredicate, String)> = aliases
            .iter()
            .map(|alias| (LabelPredicate::contains(&alias.pattern), alias.canonical.clone()))
            .collect();
        rules.extend(Self::builtin().rules);
        Self { rules }
    }

    pub fn normalize(&self, label: &str) -> Option<&str> {
        let folded = fold(label);
        self.rules
            .iter()
            .find(|(predicate, _)| predicate.matches(&folded))
            .map(|(_, canonical)| canonical.as_str())
    }
}

pub struct VendorAttributor {
    registry: OracleRegistry,
    composites: CompositeTable,
    table: VendorTable,
    configured_vaults: BTreeSet<Address>,
}

impl VendorAttributor {
    pub fn new(registry: OracleRegistry, composites: CompositeTable, table: VendorTable) -> Self {
        Self {
            registry,
            composites,
            table,
            configured_vaults: BTreeSet::new(),
        }
    }

    /// Vaults outside any configured factory that must still classify as `Vault`.
    pub fn with_known_vaults(mut self, vaults: impl IntoIterator<Item = Address>) -> Self {
        self.configured_vaults.extend(vaults);
        self
    }

    pub fn from_settings(settings: &Registry) -> Result<Self, SyncError> {
        let registry = OracleRegistry::from_json_file(&settings.oracle_registry_path)?;
        let composites = CompositeTable::from_json_file(&settings.composite_table_path)?;
        Ok(Self::new(
            registry,
            composites,
            VendorTable::with_aliases(&settings.vendor_aliases),
        )
        .with_known_vaults(settings.known_vaults.iter().copied()))
    }

    pub fn classify(&self, address: Address, known_vaults: &BTreeSet<Address>) -> VendorClassification {
        if known_vaults.contains(&address) || self.configured_vaults.contains(&address) {
            return VendorClassification::Vault;
        }
        if address.is_zero() {
            return VendorClassification::EscrowNoOracle;
        }
        let Some(label) = self.registry.provider(&address) else {
            return VendorClassification::unresolved_not_in_registry();
        };
        let Some(canonical) = self.table.normalize(label) else {
            return VendorClassification::Unresolved {
                reason: UnresolvedReason::UnknownProvider(label.to_string()),
            };
        };
        if canonical != COMPOSITE_MARKER {
            return VendorClassification::external(canonical);
        }

        let Some(detail) = self.composites.get(&address) else {
            return VendorClassification::Unresolved {
                reason: UnresolvedReason::CompositeDetailMissing,
            };
        };
        match (self.plain_vendor(&detail.leg_a), self.plain_vendor(&detail.leg_b)) {
            (Some(leg_a), Some(leg_b)) => VendorClassification::CompositeVendor {
                leg_a: leg_a.to_string(),
                leg_b: leg_b.to_string(),
            },
            _ => VendorClassification::Unresolved {
                reason: UnresolvedReason::CompositeLegUnknown,
            },
        }
    }

    fn plain_vendor(&self, label: &str) -> Option<&str> {
        self.table
            .normalize(label)
            .filter(|canonical| *canonical != COMPOSITE_MARKER)
    }
}

/// Union of vendor names behind every adapter configured for a pair that contains `asset`.
pub fn vendors_for_asset(facts: &EntityFacts, asset: Address) -> BTreeSet<String> {
    facts
        .pair_adapters
        .iter()
        .filter(|(pair, _)| pair.contains(asset))
        .flat_map(|(_, adapters)| adapters.iter())
        .filter_map(|adapter| facts.vendors.get(adapter))
        .flat_map(|classification| classification.underlying())
        .map(str::to_string)
        .collect()
}

/// Vendors behind a vault's asset, followed through the vault's oracle routers.
///
/// Each router contributes the adapters it configured for a pair whose base is the vault's asset
/// (or the vault itself) and whose quote is one of the vault's units of account; when no unit of
/// account is known every quote matches. A `ResolvedVaultSet` on the router that maps a priced
/// vault to its asset continues the walk from that asset.
pub fn vendors_for_vault(progress: &Progress, vault: Address) -> BTreeSet<String> {
    let mut vendors = BTreeSet::new();
    let Some(record) = progress.entities.get(&vault) else {
        return vendors;
    };
    let facts = &record.facts;

    for router in facts.oracle_routers.iter().filter(|router| !router.is_zero()) {
        let Some(router_record) = progress.entities.get(router) else {
            continue;
        };
        let priced = &router_record.facts;
        let mut pending: Vec<Address> = facts.underlying_assets.iter().copied().collect();
        pending.push(vault);
        let mut seen = BTreeSet::new();

        while let Some(base) = pending.pop() {
            if !seen.insert(base) {
                continue;
            }
            vendors.extend(
                priced
                    .pair_adapters
                    .iter()
                    .filter(|(pair, _)| {
                        pair.base == base
                            && (facts.units_of_account.is_empty() || facts.units_of_account.contains(&pair.quote))
                    })
                    .flat_map(|(_, adapters)| adapters.iter())
                    .filter_map(|adapter| priced.vendors.get(adapter))
                    .flat_map(|classification| classification.underlying())
                    .map(str::to_string),
            );
            pending.extend(
                priced
                    .resolved_vaults
                    .iter()
                    .filter(|resolved| resolved.vault == base)
                    .map(|resolved| resolved.asset),
            );
        }
    }
    vendors
}

/// Splits `value` into `parts` shares that sum exactly to `value`.
/// Shares are truncated; the last one absorbs the remainder.
pub fn split_value_evenly(value: Decimal, parts: usize) -> Vec<Decimal> {
    if parts == 0 {
        return Vec::new();
    }
    let share = (value / Decimal::from(parts as u64))
        .round_dp_with_strategy(SPLIT_SCALE, RoundingStrategy::ToZero);
    let mut shares = vec![share; parts - 1];
    shares.push(value - share * Decimal::from((parts - 1) as u64));
    shares
}
