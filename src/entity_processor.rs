//! # Entity Processor
//!
//! Rechecks routers and vaults whose cached facts are due for a refresh.
//!
//! ## Overview
//!
//! For every tracked entity, in cache order:
//!
//! 1. [`schedule`] decides whether the entity is due. An entity processed fewer than
//!    `recheck_interval_blocks` blocks ago is skipped without any network call.
//! 2. A due entity first retries the gaps left by earlier runs, then fetches its configuration
//!    events since its last processed block and, for vaults, reads the current oracle, unit of
//!    account and asset.
//! 3. Only if every query succeeded is the delta merged into the record and its checkpoint moved
//!    to the head. Any failure is recorded on the record, which otherwise stays untouched, and the
//!    pass moves on to the next entity.
//! 4. Price sources are classified through the [`VendorAttributor`].
//! 5. The full state is saved after every mutated entity.
//! 6. Once every entity is done, each vault receives the vendors behind its asset as priced by
//!    its oracle routers ([`attribute_vaults`]).

use ethers::types::Address;
use log::{debug, error, info, warn};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info_span, Instrument};

use crate::batch_fetcher::BatchEventFetcher;
use crate::chain_client::{ChainClient, ViewCall};
use crate::error::{RpcError, SyncError};
use crate::progress_store::ProgressStore;
use crate::settings::SyncSettings;
use crate::types::entity::{EntityFacts, EntityKind, EntityRecord, EntityState, EventCounters, EventGap};
use crate::types::events::EventKind;
use crate::types::progress::{BlockRange, Progress};
use crate::vendor_attributor::{vendors_for_vault, VendorAttributor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityDecision {
    /// Processed recently; `elapsed` blocks since the last pass.
    Skip { elapsed: u64 },
    Query { from: u64, to: u64 },
}

/// Decides whether `record` must be requeried at `head`.
pub fn schedule(record: &EntityRecord, head: u64, recheck_interval_blocks: u64) -> EntityDecision {
    match (record.state(head, recheck_interval_blocks), record.last_processed_block) {
        (EntityState::Fresh, Some(last)) => EntityDecision::Skip {
            elapsed: head.saturating_sub(last),
        },
        (EntityState::Stale, Some(last)) => EntityDecision::Query {
            from: last.saturating_add(1),
            to: head,
        },
        _ => EntityDecision::Query {
            from: record.deployment_block,
            to: head,
        },
    }
}

/// Creates a record for every cached deployment that does not have one yet.
pub fn register_deployments(progress: &mut Progress) -> usize {
    let mut fresh = Vec::new();
    for (name, source) in &progress.sources {
        for entry in source.deployments.iter() {
            if !progress.entities.contains_key(&entry.address) {
                fresh.push(EntityRecord::new(
                    entry.address,
                    source.kind,
                    name.clone(),
                    entry.deployment_block,
                ));
            }
        }
    }
    let before = progress.entities.len();
    for record in fresh {
        progress.entities.entry(record.address).or_insert(record);
    }
    progress.entities.len() - before
}

/// Stores on every vault the vendors behind its asset. Returns how many vaults gained vendors.
pub fn attribute_vaults(progress: &mut Progress) -> usize {
    let current: &Progress = progress;
    let updates: Vec<(Address, BTreeSet<String>)> = current
        .entities
        .values()
        .filter(|record| record.kind == EntityKind::Vault)
        .filter_map(|record| {
            let vendors = vendors_for_vault(current, record.address);
            (!vendors.is_subset(&record.facts.asset_vendors)).then_some((record.address, vendors))
        })
        .collect();

    let updated = updates.len();
    for (address, vendors) in updates {
        if let Some(record) = progress.entities.get_mut(&address) {
            debug!("{:?} priced by {:?}", address, vendors);
            record.facts.asset_vendors.extend(vendors);
        }
    }
    updated
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityFailure {
    pub address: Address,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityPassReport {
    pub processed: usize,
    pub skipped: usize,
    pub failed: Vec<EntityFailure>,
    /// Events merged during this pass.
    pub events: EventCounters,
    /// Price sources whose stored classification changed.
    pub reclassified: usize,
    /// Vaults that gained vendors behind their asset.
    pub vaults_attributed: usize,
}

/// Everything learned about one entity in one pass, not yet merged.
#[derive(Debug, Default)]
struct EntityDelta {
    facts: EntityFacts,
    counters: EventCounters,
    gaps: Vec<EventGap>,
}

pub struct EntityProcessor<'a, C: ChainClient + ?Sized> {
    client: &'a C,
    attributor: &'a VendorAttributor,
    recheck_interval_blocks: u64,
    batch_delay: Duration,
    entity_delay: Duration,
}

impl<'a, C: ChainClient + ?Sized> EntityProcessor<'a, C> {
    pub fn new(client: &'a C, attributor: &'a VendorAttributor, settings: &SyncSettings) -> Self {
        Self {
            client,
            attributor,
            recheck_interval_blocks: settings.recheck_interval_blocks,
            batch_delay: Duration::from_millis(settings.batch_delay_ms),
            entity_delay: Duration::from_millis(settings.entity_delay_ms),
        }
    }

    /// Runs one pass over every tracked entity. Only persistence failures abort the pass.
    pub async fn process_all(
        &self,
        progress: &mut Progress,
        store: &mut ProgressStore,
        head: u64,
    ) -> Result<EntityPassReport, SyncError> {
        let added = register_deployments(progress);
        if added > 0 {
            info!("🆕 Tracking {} new entities", added);
        }

        let known_vaults = progress.known_vaults();
        let addresses: Vec<Address> = progress.entities.keys().copied().collect();
        let mut report = EntityPassReport::default();
        let mut queried = 0usize;

        for address in addresses {
            let Some(record) = progress.entities.get(&address) else {
                continue;
            };
            let (from, to) = match schedule(record, head, self.recheck_interval_blocks) {
                EntityDecision::Skip { elapsed } => {
                    debug!("Skipping {:?}: processed {} blocks ago", address, elapsed);
                    report.skipped += 1;
                    continue;
                }
                EntityDecision::Query { from, to } => (from, to),
            };

            if queried > 0 && !self.entity_delay.is_zero() {
                sleep(self.entity_delay).await;
            }
            queried += 1;

            let span = info_span!("entity", address = ?address, kind = record.kind.as_str());
            let outcome = self
                .query_entity(record, BlockRange::new(from, to))
                .instrument(span)
                .await;

            let Some(record) = progress.entities.get_mut(&address) else {
                continue;
            };
            match outcome {
                Ok(delta) => {
                    report.events.add(&delta.counters);
                    report.reclassified += self.apply_delta(record, delta, head, &known_vaults);
                    report.processed += 1;
                }
                Err(e) => {
                    let failure = SyncError::EntityProcessing {
                        entity: address,
                        message: e.to_string(),
                    };
                    error!("❌ {}", failure);
                    record.record_error(e.to_string(), head);
                    report.failed.push(EntityFailure {
                        address,
                        message: e.to_string(),
                    });
                }
            }

            store.save(progress)?;
        }

        report.vaults_attributed = attribute_vaults(progress);
        if report.vaults_attributed > 0 {
            store.save(progress)?;
        }

        info!(
            "✅ Entity pass at head {}: {} processed, {} skipped, {} failed, {} events, {} vaults attributed",
            head,
            report.processed,
            report.skipped,
            report.failed.len(),
            report.events.total(),
            report.vaults_attributed
        );
        Ok(report)
    }

    /// Fetches everything for one entity. Nothing is merged here.
    async fn query_entity(&self, record: &EntityRecord, range: BlockRange) -> Result<EntityDelta, RpcError> {
        let fetcher = BatchEventFetcher::new(self.client, self.batch_delay);
        let mut delta = EntityDelta::default();
        let mut events = Vec::new();

        for gap in &record.unresolved_ranges {
            debug!(
                "Retrying {} gap [{}..{}] on {:?}",
                gap.kind.name(),
                gap.range.from,
                gap.range.to,
                record.address
            );
            let outcome = fetcher
                .retry_gaps(record.address, gap.kind, std::slice::from_ref(&gap.range))
                .await?;
            events.extend(outcome.events);
            delta
                .gaps
                .extend(outcome.unresolved.into_iter().map(|range| EventGap { kind: gap.kind, range }));
        }

        let kinds = match record.kind {
            EntityKind::Router => EventKind::router_events(),
            EntityKind::Vault => EventKind::vault_events(),
        };
        for kind in kinds {
            let outcome = fetcher.fetch(record.address, *kind, range).await?;
            events.extend(outcome.events);
            delta
                .gaps
                .extend(outcome.unresolved.into_iter().map(|range| EventGap { kind: *kind, range }));
        }

        events.sort_by_key(|event| (event.block_number, event.log_index));
        for event in &events {
            delta.facts.apply_event(&event.payload);
            delta.counters.record(&event.payload);
        }

        match record.kind {
            EntityKind::Vault => {
                // Kept even when zero: a zero oracle marks an escrow vault
                let oracle = self.client.call_address(record.address, ViewCall::Oracle).await?;
                delta.facts.oracle_routers.insert(oracle);
                let unit = self.client.call_address(record.address, ViewCall::UnitOfAccount).await?;
                if !unit.is_zero() {
                    delta.facts.units_of_account.insert(unit);
                }
                let asset = self.client.call_address(record.address, ViewCall::Asset).await?;
                if !asset.is_zero() {
                    delta.facts.underlying_assets.insert(asset);
                }
            }
            EntityKind::Router => {
                let fallback = self
                    .client
                    .call_address(record.address, ViewCall::FallbackOracle)
                    .await?;
                if !fallback.is_zero() {
                    delta.facts.fallback_oracles.insert(fallback);
                }
            }
        }

        Ok(delta)
    }

    /// Merges a successful delta and classifies the record's price sources.
    /// Returns how many classifications changed.
    fn apply_delta(
        &self,
        record: &mut EntityRecord,
        delta: EntityDelta,
        head: u64,
        known_vaults: &BTreeSet<Address>,
    ) -> usize {
        if !delta.gaps.is_empty() {
            warn!(
                "⚠️ {:?} left {} unresolved ranges, will retry on next recheck",
                record.address,
                delta.gaps.len()
            );
        }
        record.facts.merge(delta.facts);
        record.counters.add(&delta.counters);
        record.unresolved_ranges = delta.gaps;
        record.last_error = None;
        record.last_processed_block = Some(head);

        let mut changed = 0;
        for source in record.facts.price_sources() {
            let classification = self.attributor.classify(source, known_vaults);
            if record.facts.merge_vendor(source, classification) {
                changed += 1;
            }
        }
        debug!(
            "{:?} processed up to {}: {} price sources, {} reclassified",
            record.address,
            head,
            record.facts.vendors.len(),
            changed
        );
        changed
    }
}
