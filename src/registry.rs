// src/registry.rs
//
// Static lookup tables consumed by vendor attribution: the oracle registry (address -> provider
// label) and the composite-oracle detail table (address -> two leg labels). Both are produced by
// separate tooling and shipped as JSON lists.

use ethers::types::Address;
use log::{info, warn};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use crate::error::SyncError;
use crate::types::conversions::string_to_address;

#[derive(Debug, Deserialize)]
struct RegistryRow {
    address: String,
    #[serde(alias = "name")]
    provider: String,
}

#[derive(Debug, Deserialize)]
struct CompositeRow {
    address: String,
    leg_a: String,
    leg_b: String,
}

/// Address → provider label.
#[derive(Debug, Clone, Default)]
pub struct OracleRegistry {
    entries: HashMap<Address, String>,
}

impl OracleRegistry {
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (Address, S)>,
        S: Into<String>,
    {
        Self {
            entries: entries.into_iter().map(|(a, s)| (a, s.into())).collect(),
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, SyncError> {
        let rows: Vec<RegistryRow> = serde_json::from_str(json)
            .map_err(|e| SyncError::Registry(format!("oracle registry: {}", e)))?;
        let mut entries = HashMap::with_capacity(rows.len());
        for row in rows {
            match string_to_address(&row.address) {
                Ok(address) => {
                    entries.insert(address, row.provider);
                }
                Err(e) => warn!("Skipping oracle registry row {:?}: {}", row.address, e),
            }
        }
        Ok(Self { entries })
    }

    /// A missing file yields an empty registry; every lookup then degrades to `Unresolved`.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref();
        match read_optional(path)? {
            Some(json) => {
                let registry = Self::from_json_str(&json)?;
                info!("Loaded {} oracle registry entries from {}", registry.len(), path.display());
                Ok(registry)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn provider(&self, address: &Address) -> Option<&str> {
        self.entries.get(address).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Leg labels of a composite oracle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositeDetail {
    pub leg_a: String,
    pub leg_b: String,
}

/// Composite oracle address → leg labels.
#[derive(Debug, Clone, Default)]
pub struct CompositeTable {
    entries: HashMap<Address, CompositeDetail>,
}

impl CompositeTable {
    pub fn from_entries(entries: impl IntoIterator<Item = (Address, CompositeDetail)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, SyncError> {
        let rows: Vec<CompositeRow> = serde_json::from_str(json)
            .map_err(|e| SyncError::Registry(format!("composite table: {}", e)))?;
        let mut entries = HashMap::with_capacity(rows.len());
        for row in rows {
            match string_to_address(&row.address) {
                Ok(address) => {
                    entries.insert(
                        address,
                        CompositeDetail {
                            leg_a: row.leg_a,
                            leg_b: row.leg_b,
                        },
                    );
                }
                Err(e) => warn!("Skipping composite table row {:?}: {}", row.address, e),
            }
        }
        Ok(Self { entries })
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref();
        match read_optional(path)? {
            Some(json) => {
                let table = Self::from_json_str(&json)?;
                info!("Loaded {} composite oracle details from {}", table.len(), path.display());
                Ok(table)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn get(&self, address: &Address) -> Option<&CompositeDetail> {
        self.entries.get(address)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn read_optional(path: &Path) -> Result<Option<String>, SyncError> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            warn!("⚠️ {} not found, continuing with an empty table", path.display());
            Ok(None)
        }
        Err(e) => Err(SyncError::Registry(format!("{}: {}", path.display(), e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_registry_lookup_is_case_insensitive() {
        let registry = OracleRegistry::from_json_str(
            r#"[
                {"address": "0xAbCdEf0000000000000000000000000000000001", "provider": "Chainlink"},
                {"address": "not-an-address", "provider": "Pyth"},
                {"address": "0x0000000000000000000000000000000000000000", "name": "Escrow"}
            ]"#,
        )
        .unwrap();

        assert_eq!(registry.len(), 2);
        let lower = string_to_address("0xabcdef0000000000000000000000000000000001").unwrap();
        assert_eq!(registry.provider(&lower), Some("Chainlink"));
        assert_eq!(registry.provider(&Address::zero()), Some("Escrow"));
    }

    #[test]
    fn test_missing_file_is_empty_and_malformed_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = OracleRegistry::from_json_file(dir.path().join("absent.json")).unwrap();
        assert!(missing.is_empty());

        let path = dir.path().join("broken.json");
        fs::File::create(&path).unwrap().write_all(b"{ not json").unwrap();
        assert!(matches!(
            CompositeTable::from_json_file(&path),
            Err(SyncError::Registry(_))
        ));
    }

    #[test]
    fn test_composite_table_rows() {
        let table = CompositeTable::from_json_str(
            r#"[{"address": "0x00000000000000000000000000000000000000c1", "leg_a": "Chainlink", "leg_b": "Pyth"}]"#,
        )
        .unwrap();
        let detail = table
            .get(&string_to_address("0x00000000000000000000000000000000000000c1").unwrap())
            .unwrap();
        assert_eq!(detail.leg_a, "Chainlink");
        assert_eq!(detail.leg_b, "Pyth");
    }
}
