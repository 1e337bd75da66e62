//! # Sync Orchestrator
//!
//! The `SyncOrchestrator` runs one synchronization pass end to end.
//!
//! ## Overview
//!
//! A run:
//! - Loads the progress state and fails fast if any cold-start source lacks a start block
//! - Reads the chain head once; every checkpoint written during the run is at most that head
//! - For each factory source: resolves the block range, fetches `ProxyCreated` events (retrying
//!   gaps left by earlier runs first), merges new deployments into the cache and advances the
//!   source checkpoint, then saves
//! - Runs the entity pass over every tracked router and vault
//!
//! A source whose query fails permanently keeps its checkpoint and is reported in
//! [`SyncReport::source_errors`]; the other sources and the entity pass still run. Only
//! configuration and persistence failures abort a run.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use oracle_sync_sdk::orchestrator::SyncOrchestrator;
//! use oracle_sync_sdk::settings::Settings;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let settings = Settings::new()?;
//! let mut orchestrator = SyncOrchestrator::from_settings(settings)?;
//! let report = orchestrator.run_once().await?;
//! println!("complete: {}", report.is_complete());
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info_span, Instrument};
use uuid::Uuid;

use crate::batch_fetcher::{BatchEventFetcher, FetchOutcome};
use crate::chain_client::{ChainClient, EthersChainClient};
use crate::entity_processor::{EntityPassReport, EntityProcessor};
use crate::error::SyncError;
use crate::progress_store::ProgressStore;
use crate::range_resolver::{RangeRequest, RangeResolver};
use crate::settings::{FactorySource, Settings};
use crate::types::events::{EventKind, EventPayload};
use crate::types::progress::Progress;
use crate::vendor_attributor::VendorAttributor;

/// Outcome of one factory source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceReport {
    pub name: String,
    pub from_block: u64,
    pub to_block: u64,
    pub queried: bool,
    pub new_deployments: usize,
    pub total_deployments: usize,
    pub unresolved_ranges: usize,
    pub queries: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFailure {
    pub name: String,
    pub message: String,
}

/// Summary of one run.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub head: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceReport>,
    pub source_errors: Vec<SourceFailure>,
    pub entities: EntityPassReport,
    /// Gaps still recorded across sources and entities after the run.
    pub unresolved_ranges: usize,
}

impl SyncReport {
    fn new(head: u64) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            head,
            started_at: now,
            finished_at: now,
            sources: Vec::new(),
            source_errors: Vec::new(),
            entities: EntityPassReport::default(),
            unresolved_ranges: 0,
        }
    }

    pub fn new_deployments(&self) -> usize {
        self.sources.iter().map(|s| s.new_deployments).sum()
    }

    /// A run can succeed without being complete: this is true only when nothing failed and no
    /// gap is left for a later run.
    pub fn is_complete(&self) -> bool {
        self.source_errors.is_empty() && self.entities.failed.is_empty() && self.unresolved_ranges == 0
    }
}

pub struct SyncOrchestrator<C: ChainClient + ?Sized> {
    client: Arc<C>,
    settings: Settings,
    attributor: VendorAttributor,
    store: ProgressStore,
}

impl SyncOrchestrator<EthersChainClient> {
    /// Wires the HTTP client, registry tables and file-backed store from configuration.
    pub fn from_settings(settings: Settings) -> Result<Self, SyncError> {
        let client = EthersChainClient::from_settings(&settings)?;
        let attributor = VendorAttributor::from_settings(&settings.registry)?;
        let store = ProgressStore::open_file(settings.progress_path());
        Ok(Self::new(Arc::new(client), settings, attributor, store))
    }
}

impl<C: ChainClient + ?Sized> SyncOrchestrator<C> {
    pub fn new(client: Arc<C>, settings: Settings, attributor: VendorAttributor, store: ProgressStore) -> Self {
        Self {
            client,
            settings,
            attributor,
            store,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &ProgressStore {
        &self.store
    }

    pub async fn run_once(&mut self) -> Result<SyncReport, SyncError> {
        let mut progress = self.store.load();
        RangeResolver::preflight(&self.settings.factories, &progress)?;

        let head = self.client.current_height().await?;
        let mut report = SyncReport::new(head);
        info!("🚀 Sync run {} at head {}", report.run_id, head);

        for source in &self.settings.factories {
            let span = info_span!("source", name = %source.name, factory = ?source.address);
            match self.sync_source(source, &mut progress, head).instrument(span).await {
                Ok(source_report) => {
                    self.store.save(&progress)?;
                    info!(
                        "✅ {}: [{}..{}] {} new deployments ({} cached)",
                        source_report.name,
                        source_report.from_block,
                        source_report.to_block,
                        source_report.new_deployments,
                        source_report.total_deployments
                    );
                    report.sources.push(source_report);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("⚠️ Source {} failed, checkpoint kept: {}", source.name, e);
                    report.source_errors.push(SourceFailure {
                        name: source.name.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        let processor = EntityProcessor::new(self.client.as_ref(), &self.attributor, &self.settings.sync);
        report.entities = processor.process_all(&mut progress, &mut self.store, head).await?;

        report.unresolved_ranges = progress.unresolved_range_count();
        report.finished_at = Utc::now();
        if report.is_complete() {
            info!("🏁 Run {} complete", report.run_id);
        } else {
            warn!(
                "Run {} finished incomplete: {} source errors, {} entity errors, {} unresolved ranges",
                report.run_id,
                report.source_errors.len(),
                report.entities.failed.len(),
                report.unresolved_ranges
            );
        }
        Ok(report)
    }

    /// Fetches and merges one source. `progress` is only mutated once every query succeeded.
    async fn sync_source(
        &self,
        source: &FactorySource,
        progress: &mut Progress,
        head: u64,
    ) -> Result<SourceReport, SyncError> {
        let state = progress.sources.get(&source.name);
        if let Some(state) = state {
            if state.factory != source.address {
                warn!(
                    "Source {} now points at {:?} (was {:?})",
                    source.name, source.address, state.factory
                );
            }
        }
        let request = RangeRequest {
            source: &source.name,
            start_block_setting: source.start_block_setting(),
            last_checkpoint: state.and_then(|s| s.last_synced_block),
            cached_deployments: state.map_or(0, |s| s.deployments.len()),
            latest_cached_block: state.and_then(|s| s.deployments.latest_block()),
            configured_start_block: source.start_block,
            current_head: head,
            rescan: source.rescan_policy(self.settings.sync.recent_window_blocks),
        };
        let resolved = RangeResolver::resolve(&request)?;
        let gaps = state.map(|s| s.unresolved_ranges.clone()).unwrap_or_default();

        let fetcher = BatchEventFetcher::new(
            self.client.as_ref(),
            Duration::from_millis(self.settings.sync.batch_delay_ms),
        );
        let mut outcome = FetchOutcome::default();
        if !gaps.is_empty() {
            info!("Retrying {} unresolved ranges for {}", gaps.len(), source.name);
            outcome.absorb(
                fetcher
                    .retry_gaps(source.address, EventKind::ProxyCreated, &gaps)
                    .await?,
            );
        }
        if let Some(range) = resolved.as_block_range() {
            outcome.absorb(
                fetcher
                    .fetch(source.address, EventKind::ProxyCreated, range)
                    .await?,
            );
        }

        let entry = progress.source_mut(&source.name, source.address, source.kind);
        let mut new_deployments = 0;
        for event in &outcome.events {
            if let EventPayload::ProxyCreated { proxy, .. } = &event.payload {
                if entry.deployments.insert(*proxy, event.block_number) {
                    new_deployments += 1;
                }
            }
        }
        entry.unresolved_ranges = outcome.unresolved.clone();
        entry.last_synced_block = Some(entry.last_synced_block.map_or(head, |last| last.max(head)));

        Ok(SourceReport {
            name: source.name.clone(),
            from_block: resolved.from_block,
            to_block: resolved.to_block,
            queried: resolved.should_query,
            new_deployments,
            total_deployments: entry.deployments.len(),
            unresolved_ranges: outcome.unresolved.len(),
            queries: outcome.queries,
        })
    }
}
