//! # Oracle Sync SDK
//!
//! Incremental, checkpointed synchronization of oracle-router and vault configuration from
//! on-chain events, with attribution of every price source to the oracle vendor behind it.
//!
//! ## Overview
//!
//! A sync run:
//!
//! - Scans factory contracts for `ProxyCreated` events and keeps a deduplicated cache of
//!   deployed routers and vaults
//! - Rechecks each router and vault once every `recheck_interval_blocks` blocks, folding
//!   `ConfigSet`, `ResolvedVaultSet`, `FallbackOracleSet` and `GovSetLTV` events into a
//!   monotonically growing fact set
//! - Classifies every adapter and oracle as a vault, an external vendor, an escrow (no oracle), a
//!   composite of two vendors, or unresolved
//! - Persists the complete state after every unit of work so an interrupted run resumes from the
//!   last committed entity
//!
//! ## Architecture
//!
//! ### Range & Fetch Layer
//! [`range_resolver`] decides which blocks a source still needs; [`batch_fetcher`] queries them
//! in bounded batches and shrinks the batch on transient endpoint failures.
//!
//! ### Entity Layer
//! [`entity_processor`] schedules rechecks and merges per-entity deltas;
//! [`vendor_attributor`] classifies price sources using the [`registry`] tables.
//!
//! ### State Layer
//! [`progress_store`] owns durable state and refuses writes that would move a checkpoint
//! backwards.

// Core Types
/// Entity records, events and progress state
pub mod types;
/// Error taxonomy
pub mod error;

// Chain Access
/// Read-only chain client boundary
pub mod chain_client;
/// Contract ABIs for view calls
pub mod contracts;

// Sync Pipeline
/// Block range resolution per factory source
pub mod range_resolver;
/// Batched, self-shrinking event fetching
pub mod batch_fetcher;
/// Per-entity recheck and merge
pub mod entity_processor;
/// End-to-end sync runs
pub mod orchestrator;

// Attribution
/// Oracle registry and composite detail tables
pub mod registry;
/// Price source → vendor classification
pub mod vendor_attributor;

// Persistence
/// Durable progress state
pub mod progress_store;

// Settings & Utilities
/// Configuration management
pub mod settings;
/// General utilities
pub mod utils;

// Re-exports for convenience
pub use chain_client::{ChainClient, EthersChainClient};
pub use error::{RpcError, SyncError};
pub use orchestrator::{SyncOrchestrator, SyncReport};
pub use progress_store::ProgressStore;
pub use settings::Settings;
pub use vendor_attributor::{VendorAttributor, VendorClassification};
