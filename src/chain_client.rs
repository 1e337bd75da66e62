//! # Chain Client
//!
//! The only place the engine talks to a node. Every method returns typed values; raw logs are
//! decoded by [`EventKind::decode`] before they leave this module.
//!
//! The engine awaits one call at a time, so the client never sees concurrent requests from a
//! single run. `EthersChainClient` still rate-limits through `governor` because public endpoints
//! are shared with other processes.

use async_trait::async_trait;
use ethers::prelude::{Address, Http, Middleware, Provider};
use ethers::types::Filter;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use log::debug;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::RetryIf;

use crate::contracts::{IOracleRouter, IVault};
use crate::error::{RpcError, SyncError};
use crate::settings::Settings;
use crate::types::events::{ChainEvent, EventKind};

type DefaultDirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Address-returning view calls the engine performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewCall {
    /// `oracle()` on a vault
    Oracle,
    /// `unitOfAccount()` on a vault
    UnitOfAccount,
    /// `asset()` on a vault
    Asset,
    /// `fallbackOracle()` on a router
    FallbackOracle,
}

impl ViewCall {
    pub fn signature(&self) -> &'static str {
        match self {
            ViewCall::Oracle => "oracle()",
            ViewCall::UnitOfAccount => "unitOfAccount()",
            ViewCall::Asset => "asset()",
            ViewCall::FallbackOracle => "fallbackOracle()",
        }
    }
}

/// Read-only access to the chain.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Current head block number.
    async fn current_height(&self) -> Result<u64, RpcError>;

    /// Decoded events of `kind` emitted by `address` in `[from_block, to_block]`, ascending.
    async fn query_events(
        &self,
        address: Address,
        kind: EventKind,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<ChainEvent>, RpcError>;

    /// Performs an address-returning view call at the latest block.
    async fn call_address(&self, address: Address, call: ViewCall) -> Result<Address, RpcError>;
}

/// [`ChainClient`] over an HTTP JSON-RPC endpoint.
pub struct EthersChainClient {
    provider: Arc<Provider<Http>>,
    limiter: Arc<DefaultDirectRateLimiter>,
    endpoint: String,
    max_retries: usize,
    retry_base_delay_ms: u64,
}

impl EthersChainClient {
    pub fn new(url: &str, qps_limit: u32, max_retries: usize, retry_base_delay_ms: u64) -> Result<Self, SyncError> {
        let provider = Provider::<Http>::try_from(url).map_err(|e| {
            SyncError::missing_setting("rpc.http_url", format!("invalid RPC URL {}: {}", url, e))
        })?;
        let qps = NonZeroU32::new(qps_limit)
            .ok_or_else(|| SyncError::missing_setting("rpc.qps_limit", "QPS must be non-zero"))?;

        Ok(Self {
            provider: Arc::new(provider),
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(qps))),
            endpoint: url.to_string(),
            max_retries,
            retry_base_delay_ms,
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, SyncError> {
        Self::new(
            &settings.rpc.http_url,
            settings.rpc.qps_limit,
            settings.rpc.max_retries,
            settings.rpc.retry_base_delay_ms,
        )
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn retry_strategy(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(2)
            .factor(self.retry_base_delay_ms.max(1))
            .max_delay(Duration::from_secs(10))
            .take(self.max_retries)
    }
}

#[async_trait]
impl ChainClient for EthersChainClient {
    async fn current_height(&self) -> Result<u64, RpcError> {
        RetryIf::start(
            self.retry_strategy(),
            || async {
                self.limiter.until_ready().await;
                self.provider
                    .get_block_number()
                    .await
                    .map(|block| block.as_u64())
                    .map_err(|e| RpcError::from_provider_message(e.to_string()))
            },
            |e: &RpcError| e.is_transient(),
        )
        .await
    }

    async fn query_events(
        &self,
        address: Address,
        kind: EventKind,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<ChainEvent>, RpcError> {
        let filter = Filter::new()
            .address(address)
            .from_block(from_block)
            .to_block(to_block)
            .topic0(kind.topic0());

        self.limiter.until_ready().await;
        debug!(
            "eth_getLogs {} on {:?} [{}..{}] via {}",
            kind.name(),
            address,
            from_block,
            to_block,
            self.endpoint
        );
        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(|e| RpcError::from_provider_message(e.to_string()))?;

        let mut events = logs
            .iter()
            .filter(|log| log.removed != Some(true))
            .map(|log| kind.decode(log))
            .collect::<Result<Vec<_>, _>>()?;
        events.sort_by_key(|e| (e.block_number, e.log_index));
        Ok(events)
    }

    async fn call_address(&self, address: Address, call: ViewCall) -> Result<Address, RpcError> {
        self.limiter.until_ready().await;
        debug!("eth_call {} on {:?}", call.signature(), address);
        let result = match call {
            ViewCall::Oracle => IVault::new(address, Arc::clone(&self.provider)).oracle().call().await,
            ViewCall::UnitOfAccount => {
                IVault::new(address, Arc::clone(&self.provider))
                    .unit_of_account()
                    .call()
                    .await
            }
            ViewCall::Asset => IVault::new(address, Arc::clone(&self.provider)).asset().call().await,
            ViewCall::FallbackOracle => {
                IOracleRouter::new(address, Arc::clone(&self.provider))
                    .fallback_oracle()
                    .call()
                    .await
            }
        };
        result.map_err(|e| RpcError::from_provider_message(e.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scriptable in-memory chain used by unit tests.

    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    type FailureRule = Box<dyn Fn(Address, EventKind, u64, u64) -> Option<RpcError> + Send + Sync>;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct QueryLog {
        pub address: Address,
        pub kind: EventKind,
        pub from: u64,
        pub to: u64,
    }

    #[derive(Default)]
    pub struct MockChainClient {
        pub head: Mutex<u64>,
        pub events: Mutex<Vec<ChainEvent>>,
        pub calls: Mutex<HashMap<(Address, ViewCall), Result<Address, RpcError>>>,
        pub failure: Mutex<Option<FailureRule>>,
        pub queries: Mutex<Vec<QueryLog>>,
        pub height_requests: Mutex<usize>,
    }

    impl MockChainClient {
        pub fn new(head: u64) -> Self {
            let client = Self::default();
            *client.head.lock().unwrap() = head;
            client
        }

        pub fn push_event(&self, event: ChainEvent) {
            self.events.lock().unwrap().push(event);
        }

        pub fn set_call(&self, address: Address, call: ViewCall, result: Result<Address, RpcError>) {
            self.calls.lock().unwrap().insert((address, call), result);
        }

        pub fn fail_when(
            &self,
            rule: impl Fn(Address, EventKind, u64, u64) -> Option<RpcError> + Send + Sync + 'static,
        ) {
            *self.failure.lock().unwrap() = Some(Box::new(rule));
        }

        pub fn queries(&self) -> Vec<QueryLog> {
            self.queries.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChainClient for MockChainClient {
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
            self.queries.lock().unwrap().push(QueryLog {
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
                        && e.block_number >= from_block
                        && e.block_number <= to_block
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
                .cloned()
                .unwrap_or_else(|| Err(RpcError::Reverted(format!("no result for {}", call.signature()))))
        }
    }
}
