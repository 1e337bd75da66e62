// Typed event records.
//
// Logs are decoded here, at the chain-client boundary, into a closed set of payloads.
// Nothing past this module inspects topics or raw log data.

use ethers::types::{Address, Log, H256, U256};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};

use crate::error::RpcError;
use crate::types::conversions::{data_word, topic_to_address, word_to_u64, ConversionError};

/// Events the engine knows how to query and decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Factory: `ProxyCreated(address indexed proxy, bool upgradeable, address implementation, bytes trailingData)`
    ProxyCreated,
    /// Router: `ConfigSet(address indexed base, address indexed quote, address indexed oracle)`
    ConfigSet,
    /// Router: `ResolvedVaultSet(address indexed vault, address indexed asset)`
    ResolvedVaultSet,
    /// Router: `FallbackOracleSet(address indexed fallbackOracle)`
    FallbackOracleSet,
    /// Vault: `GovSetLTV(address indexed collateral, uint16, uint16, uint16, uint48, uint32)`
    GovSetLtv,
}

const ROUTER_EVENTS: [EventKind; 3] = [
    EventKind::ConfigSet,
    EventKind::ResolvedVaultSet,
    EventKind::FallbackOracleSet,
];
const VAULT_EVENTS: [EventKind; 1] = [EventKind::GovSetLtv];

impl EventKind {
    pub fn signature(&self) -> &'static str {
        match self {
            EventKind::ProxyCreated => "ProxyCreated(address,bool,address,bytes)",
            EventKind::ConfigSet => "ConfigSet(address,address,address)",
            EventKind::ResolvedVaultSet => "ResolvedVaultSet(address,address)",
            EventKind::FallbackOracleSet => "FallbackOracleSet(address)",
            EventKind::GovSetLtv => "GovSetLTV(address,uint16,uint16,uint16,uint48,uint32)",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EventKind::ProxyCreated => "ProxyCreated",
            EventKind::ConfigSet => "ConfigSet",
            EventKind::ResolvedVaultSet => "ResolvedVaultSet",
            EventKind::FallbackOracleSet => "FallbackOracleSet",
            EventKind::GovSetLtv => "GovSetLTV",
        }
    }

    pub fn topic0(&self) -> H256 {
        H256::from(keccak256(self.signature().as_bytes()))
    }

    pub fn router_events() -> &'static [EventKind] {
        &ROUTER_EVENTS
    }

    pub fn vault_events() -> &'static [EventKind] {
        &VAULT_EVENTS
    }

    /// Number of indexed arguments, i.e. topics after topic0.
    fn indexed_args(&self) -> usize {
        match self {
            EventKind::ProxyCreated => 1,
            EventKind::ConfigSet => 3,
            EventKind::ResolvedVaultSet => 2,
            EventKind::FallbackOracleSet => 1,
            EventKind::GovSetLtv => 1,
        }
    }

    /// Decodes a raw log of this kind into a [`ChainEvent`].
    pub fn decode(&self, log: &Log) -> Result<ChainEvent, RpcError> {
        let decode_err = |message: String| RpcError::Decode {
            what: self.name().to_string(),
            message,
        };

        if log.topics.first() != Some(&self.topic0()) {
            return Err(decode_err("topic0 does not match event signature".to_string()));
        }
        if log.topics.len() < 1 + self.indexed_args() {
            return Err(decode_err(format!(
                "expected {} topics, got {}",
                1 + self.indexed_args(),
                log.topics.len()
            )));
        }
        let block_number = log
            .block_number
            .ok_or_else(|| decode_err("log has no block number (pending?)".to_string()))?
            .as_u64();
        let log_index = log.log_index.unwrap_or_default();
        let log_index = word_to_u64(log_index).map_err(|e| decode_err(e.to_string()))?;

        let data = log.data.as_ref();
        let payload = self
            .decode_payload(&log.topics, data)
            .map_err(|e| decode_err(e.to_string()))?;

        Ok(ChainEvent {
            address: log.address,
            block_number,
            log_index,
            payload,
        })
    }

    fn decode_payload(&self, topics: &[H256], data: &[u8]) -> Result<EventPayload, ConversionError> {
        let payload = match self {
            EventKind::ProxyCreated => {
                let upgradeable = !data_word(data, 0)?.is_zero();
                let implementation = word_to_address(data_word(data, 1)?);
                EventPayload::ProxyCreated {
                    proxy: topic_to_address(&topics[1]),
                    upgradeable,
                    implementation,
                }
            }
            EventKind::ConfigSet => EventPayload::ConfigSet {
                base: topic_to_address(&topics[1]),
                quote: topic_to_address(&topics[2]),
                oracle: topic_to_address(&topics[3]),
            },
            EventKind::ResolvedVaultSet => EventPayload::ResolvedVaultSet {
                vault: topic_to_address(&topics[1]),
                asset: topic_to_address(&topics[2]),
            },
            EventKind::FallbackOracleSet => EventPayload::FallbackOracleSet {
                oracle: topic_to_address(&topics[1]),
            },
            EventKind::GovSetLtv => EventPayload::GovSetLtv {
                collateral: topic_to_address(&topics[1]),
                borrow_ltv: word_to_u16(data_word(data, 0)?)?,
                liquidation_ltv: word_to_u16(data_word(data, 1)?)?,
            },
        };
        Ok(payload)
    }
}

fn word_to_address(word: U256) -> Address {
    let mut buf = [0u8; 32];
    word.to_big_endian(&mut buf);
    Address::from_slice(&buf[12..])
}

fn word_to_u16(word: U256) -> Result<u16, ConversionError> {
    let value = word_to_u64(word)?;
    u16::try_from(value).map_err(|_| ConversionError::Overflow)
}

/// Decoded arguments of a known event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventPayload {
    ProxyCreated {
        proxy: Address,
        upgradeable: bool,
        implementation: Address,
    },
    ConfigSet {
        base: Address,
        quote: Address,
        oracle: Address,
    },
    ResolvedVaultSet {
        vault: Address,
        asset: Address,
    },
    FallbackOracleSet {
        oracle: Address,
    },
    GovSetLtv {
        collateral: Address,
        borrow_ltv: u16,
        liquidation_ltv: u16,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::ProxyCreated { .. } => EventKind::ProxyCreated,
            EventPayload::ConfigSet { .. } => EventKind::ConfigSet,
            EventPayload::ResolvedVaultSet { .. } => EventKind::ResolvedVaultSet,
            EventPayload::FallbackOracleSet { .. } => EventKind::FallbackOracleSet,
            EventPayload::GovSetLtv { .. } => EventKind::GovSetLtv,
        }
    }
}

/// A decoded log: emitting contract, position in the chain and typed payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEvent {
    pub address: Address,
    pub block_number: u64,
    pub log_index: u64,
    pub payload: EventPayload,
}
