//! # Batch Event Fetcher
//!
//! Runs an event-log query over a block range in bounded batches.
//!
//! - Batches run strictly one after another, so events come back ascending by block.
//! - Every query after the first waits for the fixed inter-batch delay, whatever happened to
//!   the previous one.
//! - A transient failure re-splits the failed range at half the batch size (never below
//!   [`MIN_BATCH_SIZE`]). Pending work is an explicit queue, not recursion.
//! - A range that still fails at the floor is dropped from this run and reported in
//!   [`FetchOutcome::unresolved`] so the caller can persist it and retry later.
//! - Gaps persisted by earlier runs are refetched at the floor size through
//!   [`BatchEventFetcher::retry_gaps`].
//! - Permanent failures (decode errors, reverts) are returned to the caller untouched.

use log::{debug, warn};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::sleep;

use ethers::types::Address;

use crate::chain_client::ChainClient;
use crate::error::RpcError;
use crate::types::events::{ChainEvent, EventKind};
use crate::types::progress::BlockRange;
use crate::utils::create_block_chunks;

/// Blocks per `eth_getLogs` request. Not exposed as runtime configuration.
pub const DEFAULT_BATCH_SIZE: u64 = 10_000;
/// Batch size below which a failing range is given up for this run.
pub const MIN_BATCH_SIZE: u64 = 1_000;

/// Result of a batched fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchOutcome {
    pub events: Vec<ChainEvent>,
    /// Ranges that failed at the retry floor.
    pub unresolved: Vec<BlockRange>,
    pub queries: usize,
    pub retries: usize,
}

impl FetchOutcome {
    pub fn absorb(&mut self, other: FetchOutcome) {
        self.events.extend(other.events);
        self.unresolved.extend(other.unresolved);
        self.queries += other.queries;
        self.retries += other.retries;
    }

    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }
}

pub struct BatchEventFetcher<'a, C: ChainClient + ?Sized> {
    client: &'a C,
    batch_size: u64,
    min_batch_size: u64,
    batch_delay: Duration,
}

impl<'a, C: ChainClient + ?Sized> BatchEventFetcher<'a, C> {
    pub fn new(client: &'a C, batch_delay: Duration) -> Self {
        Self {
            client,
            batch_size: DEFAULT_BATCH_SIZE,
            min_batch_size: MIN_BATCH_SIZE,
            batch_delay,
        }
    }

    #[cfg(test)]
    fn with_batch_sizes(mut self, batch_size: u64, min_batch_size: u64) -> Self {
        self.batch_size = batch_size;
        self.min_batch_size = min_batch_size;
        self
    }

    /// Fetches `kind` events emitted by `address` over `range`.
    pub async fn fetch(
        &self,
        address: Address,
        kind: EventKind,
        range: BlockRange,
    ) -> Result<FetchOutcome, RpcError> {
        self.fetch_from_size(address, kind, range, self.batch_size).await
    }

    async fn fetch_from_size(
        &self,
        address: Address,
        kind: EventKind,
        range: BlockRange,
        batch_size: u64,
    ) -> Result<FetchOutcome, RpcError> {
        let mut outcome = FetchOutcome::default();
        if range.is_empty() {
            return Ok(outcome);
        }

        let mut work: VecDeque<(BlockRange, u64)> = create_block_chunks(range, batch_size)
            .into_iter()
            .map(|chunk| (chunk, batch_size))
            .collect();

        while let Some((chunk, size)) = work.pop_front() {
            if outcome.queries > 0 && !self.batch_delay.is_zero() {
                sleep(self.batch_delay).await;
            }
            outcome.queries += 1;

            match self
                .client
                .query_events(address, kind, chunk.from, chunk.to)
                .await
            {
                Ok(events) => {
                    debug!(
                        "{} on {:?} [{}..{}]: {} events",
                        kind.name(),
                        address,
                        chunk.from,
                        chunk.to,
                        events.len()
                    );
                    outcome.events.extend(events);
                }
                Err(e) if e.is_transient() => {
                    if size <= self.min_batch_size {
                        warn!(
                            "⚠️ Dropping {} range [{}..{}] on {:?} after retries at floor size {}: {}",
                            kind.name(),
                            chunk.from,
                            chunk.to,
                            address,
                            size,
                            e
                        );
                        outcome.unresolved.push(chunk);
                        continue;
                    }
                    let next_size = (size / 2).max(self.min_batch_size);
                    warn!(
                        "{} range [{}..{}] on {:?} failed at batch size {}, retrying at {}: {}",
                        kind.name(),
                        chunk.from,
                        chunk.to,
                        address,
                        size,
                        next_size,
                        e
                    );
                    outcome.retries += 1;
                    // Front of the queue, in ascending order, keeps the output ordered
                    for sub in create_block_chunks(chunk, next_size).into_iter().rev() {
                        work.push_front((sub, next_size));
                    }
                }
                Err(e) => return Err(e),
            }
        }

        outcome
            .events
            .sort_by_key(|event| (event.block_number, event.log_index));
        Ok(outcome)
    }

    /// Refetches gaps left by earlier runs. Gaps were dropped at the floor size, so they are
    /// queried at the floor size straight away.
    pub async fn retry_gaps(
        &self,
        address: Address,
        kind: EventKind,
        ranges: &[BlockRange],
    ) -> Result<FetchOutcome, RpcError> {
        let mut outcome = FetchOutcome::default();
        for range in ranges {
            if outcome.queries > 0 && !self.batch_delay.is_zero() {
                sleep(self.batch_delay).await;
            }
            outcome.absorb(
                self.fetch_from_size(address, kind, *range, self.min_batch_size)
                    .await?,
            );
        }
        outcome
            .events
            .sort_by_key(|event| (event.block_number, event.log_index));
        Ok(outcome)
    }
}
