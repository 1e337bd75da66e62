//! Shared fixtures for integration tests: a scripted in-memory chain and a small deployment
//! scenario with one router factory and one vault factory.

#![allow(dead_code)]

use async_trait::async_trait;
use ethers::types::Address;
use oracle_sync_sdk::chain_client::{ChainClient, ViewCall};
use oracle_sync_sdk::error::RpcError;
use oracle_sync_sdk::progress_store::{MemoryBackend, ProgressStore};
use oracle_sync_sdk::registry::{CompositeDetail, CompositeTable, OracleRegistry};
use oracle_sync_sdk::settings::{FactorySource, LogSettings, Registry, RescanMode, Rpc, Settings, SyncSettings};
use oracle_sync_sdk::types::{ChainEvent, EntityKind, EventKind, EventPayload};
use oracle_sync_sdk::vendor_attributor::{VendorAttributor, VendorTable};
use oracle_sync_sdk::SyncOrchestrator;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub const PROGRESS_KEY: &str = "progress.json";

pub fn addr(byte: u8) -> Address {
    Address::from([byte; 20])
}

pub const ROUTER_FACTORY: u8 = 0xf1;
pub const VAULT_FACTORY: u8 = 0xf2;
pub const ROUTER: u8 = 0x11;
pub const VAULT: u8 = 0x21;
pub const ASSET: u8 = 0xa1;
pub const USD: u8 = 0xd1;
pub const CHAINLINK_ADAPTER: u8 = 0x31;
pub const CROSS_ADAPTER: u8 = 0x32;
pub const REDSTONE_ADAPTER: u8 = 0x33;

type FailureRule = Box<dyn Fn(Address, EventKind, u64, u64) -> Option<RpcError> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub address: Address,
    pub kind: EventKind,
    pub from: u64,
    pub to: u64,
}

/// In-memory chain that serves pre-loaded events and view-call results.
#[derive(Default)]
pub struct ScriptedChain {
    head: Mutex<u64>,
    events: Mutex<Vec<ChainEvent>>,
    calls: Mutex<HashMap<(Address, ViewCall), Address>>,
    failure: Mutex<Option<FailureRule>>,
    queries: Mutex<Vec<Query>>,
    height_requests: Mutex<usize>,
}

impl ScriptedChain {
    pub fn new(head: u64) -> Self {
        let chain = Self::default();
        chain.set_head(head);
        chain
    }

    pub fn set_head(&self, head: u64) {
        *self.head.lock().unwrap() = head;
    }

    pub fn push(&self, address: Address, block_number: u64, log_index: u64, payload: EventPayload) {
        self.events.lock().unwrap().push(ChainEvent {
            address,
            block_number,
            log_index,
            payload,
        });
    }

    pub fn set_call(&self, address: Address, call: ViewCall, result: Address) {
        self.calls.lock().unwrap().insert((address, call), result);
    }

    pub fn fail_when(
        &self,
        rule: impl Fn(Address, EventKind, u64, u64) -> Option<RpcError> + Send + Sync + 'static,
    ) {
        *self.failure.lock().unwrap() = Some(Box::new(rule));
    }

    pub fn heal(&self) {
        *self.failure.lock().unwrap() = None;
    }

    pub fn queries(&self) -> Vec<Query> {
        self.queries.lock().unwrap().clone()
    }

    pub fn height_requests(&self) -> usize {
        *self.height_requests.lock().unwrap()
    }
}

#[async_trait]
impl ChainClient for ScriptedChain {
    async fn current_height(&self) -> Result<u64, RpcError> {
        *self.height_requests.lock().unwrap() += 1;
        Ok(*self.head.lock().unwrap())
    }

    async fn query_events(
        &self,
        address: Address,
        kind: EventKind,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<ChainEvent>, RpcError> {
        self.queries.lock().unwrap().push(Query {
            address,
            kind,
            from: from_block,
            to: to_block,
        });
        if let Some(rule) = self.failure.lock().unwrap().as_ref() {
            if let Some(err) = rule(address, kind, from_block, to_block) {
                return Err(err);
            }
        }
        let mut events: Vec<ChainEvent> = self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| {
                e.address == address
                    && e.payload.kind() == kind
                    && (from_block..=to_block).contains(&e.block_number)
            })
            .cloned()
            .collect();
        events.sort_by_key(|e| (e.block_number, e.log_index));
        Ok(events)
    }

    async fn call_address(&self, address: Address, call: ViewCall) -> Result<Address, RpcError> {
        self.calls
            .lock()
            .unwrap()
            .get(&(address, call))
            .copied()
            .ok_or_else(|| RpcError::Reverted(format!("{} not scripted", call.signature())))
    }
}

pub fn factory(name: &str, address: Address, kind: EntityKind, start_block: Option<u64>) -> FactorySource {
    FactorySource {
        name: name.to_string(),
        address,
        kind,
        start_block,
        rescan: RescanMode::RecentWindow,
    }
}

pub fn settings(factories: Vec<FactorySource>) -> Settings {
    Settings {
        rpc: Rpc {
            http_url: "http://127.0.0.1:8545".to_string(),
            qps_limit: 10,
            max_retries: 0,
            retry_base_delay_ms: 1,
        },
        sync: SyncSettings {
            recheck_interval_blocks: 50_000,
            batch_delay_ms: 0,
            entity_delay_ms: 0,
            ..SyncSettings::default()
        },
        registry: Registry::default(),
        factories,
        log: LogSettings::default(),
    }
}

pub fn default_factories() -> Vec<FactorySource> {
    vec![
        factory("routers", addr(ROUTER_FACTORY), EntityKind::Router, Some(1_000)),
        factory("vaults", addr(VAULT_FACTORY), EntityKind::Vault, Some(1_000)),
    ]
}

pub fn attributor() -> VendorAttributor {
    VendorAttributor::new(
        OracleRegistry::from_entries([
            (addr(CHAINLINK_ADAPTER), "Chainlink Oracle"),
            (addr(CROSS_ADAPTER), "Cross Adapter"),
            (addr(REDSTONE_ADAPTER), "RedStone Core"),
        ]),
        CompositeTable::from_entries([(
            addr(CROSS_ADAPTER),
            CompositeDetail {
                leg_a: "Pyth".to_string(),
                leg_b: "Chronicle".to_string(),
            },
        )]),
        VendorTable::builtin(),
    )
}

/// One router and one vault deployed by their factories, with the router pricing the asset
/// through a Chainlink adapter, a composite adapter and the vault itself.
pub fn scenario(head: u64) -> ScriptedChain {
    let chain = ScriptedChain::new(head);
    let router = addr(ROUTER);
    let vault = addr(VAULT);

    chain.push(
        addr(ROUTER_FACTORY),
        1_200,
        0,
        EventPayload::ProxyCreated {
            proxy: router,
            upgradeable: false,
            implementation: addr(0xe1),
        },
    );
    chain.push(
        addr(VAULT_FACTORY),
        1_300,
        0,
        EventPayload::ProxyCreated {
            proxy: vault,
            upgradeable: true,
            implementation: addr(0xe2),
        },
    );

    chain.push(
        router,
        2_000,
        0,
        EventPayload::ConfigSet {
            base: addr(ASSET),
            quote: addr(USD),
            oracle: addr(CHAINLINK_ADAPTER),
        },
    );
    chain.push(
        router,
        3_000,
        1,
        EventPayload::ConfigSet {
            base: addr(ASSET),
            quote: addr(USD),
            oracle: addr(CROSS_ADAPTER),
        },
    );
    chain.push(
        router,
        3_000,
        2,
        EventPayload::ConfigSet {
            base: vault,
            quote: addr(USD),
            oracle: vault,
        },
    );
    chain.push(
        router,
        3_100,
        0,
        EventPayload::ResolvedVaultSet {
            vault,
            asset: addr(ASSET),
        },
    );
    chain.push(vault, 4_000, 0, EventPayload::GovSetLtv {
        collateral: addr(0x22),
        borrow_ltv: 8_000,
        liquidation_ltv: 8_500,
    });

    chain.set_call(router, ViewCall::FallbackOracle, Address::zero());
    chain.set_call(vault, ViewCall::Oracle, router);
    chain.set_call(vault, ViewCall::UnitOfAccount, addr(USD));
    chain.set_call(vault, ViewCall::Asset, addr(ASSET));
    chain
}

pub struct Harness {
    pub chain: Arc<ScriptedChain>,
    pub backend: Arc<MemoryBackend>,
    pub orchestrator: SyncOrchestrator<ScriptedChain>,
}

impl Harness {
    pub fn new(chain: ScriptedChain, factories: Vec<FactorySource>) -> Self {
        let chain = Arc::new(chain);
        let backend = Arc::new(MemoryBackend::new());
        let store = ProgressStore::new(backend.clone(), PROGRESS_KEY);
        let orchestrator = SyncOrchestrator::new(chain.clone(), settings(factories), attributor(), store);
        Self {
            chain,
            backend,
            orchestrator,
        }
    }

    pub fn stored_bytes(&self) -> Vec<u8> {
        self.backend.get(PROGRESS_KEY).unwrap_or_default()
    }

    pub fn stored_progress(&self) -> oracle_sync_sdk::types::Progress {
        serde_json::from_slice(&self.stored_bytes()).expect("stored progress is valid JSON")
    }
}
