//! # Range Resolver
//!
//! Decides which block range a factory source still needs to scan.
//!
//! ## Policy
//!
//! Checked in order:
//!
//! 1. **Checkpoint present**: resume at `checkpoint + 1`. The range is queried even when no
//!    new deployment is expected so the checkpoint keeps advancing.
//! 2. **No checkpoint, cache non-empty**: bounded rescan, either a recent window below the head
//!    or from the latest cached deployment block.
//! 3. **No checkpoint, empty cache**: start at the configured start block. A missing start
//!    block is a [`SyncError::Configuration`]; scanning from genesis is never implied.
//!
//! [`RangeResolver::preflight`] applies rule 3 to every source up front, before the head is
//! known, so a misconfigured cold start fails without touching the network.

use log::debug;

use crate::error::SyncError;
use crate::settings::FactorySource;
use crate::types::progress::{BlockRange, Progress};

/// How a source with cached deployments but no checkpoint is rescanned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RescanPolicy {
    /// Rescan the last `n` blocks below the head.
    RecentWindow(u64),
    /// Rescan from the most recent cached deployment.
    FromLatestCached,
}

/// Inputs for one source.
#[derive(Debug, Clone)]
pub struct RangeRequest<'a> {
    pub source: &'a str,
    pub start_block_setting: String,
    pub last_checkpoint: Option<u64>,
    pub cached_deployments: usize,
    pub latest_cached_block: Option<u64>,
    pub configured_start_block: Option<u64>,
    pub current_head: u64,
    pub rescan: RescanPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRange {
    pub from_block: u64,
    pub to_block: u64,
    pub should_query: bool,
}

impl ResolvedRange {
    pub fn as_block_range(&self) -> Option<BlockRange> {
        self.should_query
            .then(|| BlockRange::new(self.from_block, self.to_block))
    }
}

pub struct RangeResolver;

impl RangeResolver {
    pub fn resolve(request: &RangeRequest<'_>) -> Result<ResolvedRange, SyncError> {
        let head = request.current_head;

        let from_block = if let Some(checkpoint) = request.last_checkpoint {
            checkpoint.saturating_add(1)
        } else if request.cached_deployments > 0 {
            match request.rescan {
                RescanPolicy::RecentWindow(window) => head.saturating_sub(window),
                RescanPolicy::FromLatestCached => request.latest_cached_block.unwrap_or(head),
            }
        } else {
            request.configured_start_block.ok_or_else(|| {
                SyncError::missing_setting(
                    request.start_block_setting.clone(),
                    format!(
                        "source `{}` has no checkpoint and no cached deployments; a start block is required",
                        request.source
                    ),
                )
            })?
        };

        let resolved = ResolvedRange {
            from_block,
            to_block: head,
            should_query: from_block <= head,
        };
        debug!(
            "Resolved range for {}: {}..{} (query: {})",
            request.source, resolved.from_block, resolved.to_block, resolved.should_query
        );
        Ok(resolved)
    }

    /// Fails on the first source that would hit rule 3 without a start block.
    pub fn preflight(sources: &[FactorySource], progress: &Progress) -> Result<(), SyncError> {
        for source in sources {
            let state = progress.sources.get(&source.name);
            let has_checkpoint = state.map_or(false, |s| s.last_synced_block.is_some());
            let has_cache = state.map_or(false, |s| !s.deployments.is_empty());
            if !has_checkpoint && !has_cache && source.start_block.is_none() {
                return Err(SyncError::missing_setting(
                    source.start_block_setting(),
                    format!(
                        "source `{}` is starting cold (no checkpoint, empty cache) and has no start block",
                        source.name
                    ),
                ));
            }
        }
        Ok(())
    }
}
