// src/utils.rs
// Utility functions for the Oracle Sync SDK

use crate::types::progress::BlockRange;

/// Splits an inclusive block range into contiguous chunks of at most `chunk_size` blocks.
/// An inverted range yields no chunks; a zero chunk size is treated as one block.
pub fn create_block_chunks(range: BlockRange, chunk_size: u64) -> Vec<BlockRange> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::new();
    let mut current_from = range.from;
    while current_from <= range.to {
        let current_to = current_from.saturating_add(chunk_size - 1).min(range.to);
        chunks.push(BlockRange::new(current_from, current_to));
        if current_to == u64::MAX {
            break;
        }
        current_from = current_to + 1;
    }
    chunks
}
