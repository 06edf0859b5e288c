//! Splitting and coalescing of pooled blocks.
//!
//! Both run under the heap guard. Merges always keep the lower block, so a
//! contiguous free run is represented by exactly one header: the one at its
//! lowest address.

use crate::block::{BLOCK_MAGIC, Block, BlockId, BlockState, HEADER_SIZE};
use crate::heap::HeapState;
use crate::size_class::MIN_SIZE;
use crate::stats::HeapStats;

/// Smallest spare tail worth turning into its own free block.
pub const SPLIT_THRESHOLD: usize = HEADER_SIZE + MIN_SIZE;

impl<S> HeapState<S> {
    /// Shrinks `id` to `want` payload bytes, freeing the tail as a new block.
    ///
    /// The tail's upper neighbor is never free here: `id` came from a free
    /// list or a fresh extent, and free blocks are never adjacent.
    pub(crate) fn split(&mut self, id: BlockId, want: usize, stats: &HeapStats) {
        let block = *self.blocks.get(id);
        let spare = block.size.saturating_sub(want);
        if spare < SPLIT_THRESHOLD {
            return;
        }

        let tail = Block {
            addr: block.addr + HEADER_SIZE + want,
            size: spare - HEADER_SIZE,
            magic: BLOCK_MAGIC,
            state: BlockState::Free {
                prev: None,
                next: None,
            },
            phys_prev: Some(id),
            phys_next: block.phys_next,
            extent: block.extent,
        };
        let tail_id = self.blocks.insert(tail);
        if let Some(next) = block.phys_next {
            self.blocks.get_mut(next).phys_prev = Some(tail_id);
        }
        let head = self.blocks.get_mut(id);
        head.size = want;
        head.phys_next = Some(tail_id);

        self.by_addr.insert(tail.addr, tail_id);
        self.free_lists.push(&mut self.blocks, tail_id);
        HeapStats::inc(&stats.splits);
    }

    /// Merges a just-freed, unlisted block with its free physical neighbors.
    ///
    /// Returns the surviving block, still unlisted.
    pub(crate) fn coalesce(&mut self, id: BlockId, stats: &HeapStats) -> BlockId {
        if let Some(next) = self.blocks.get(id).phys_next {
            if self.blocks.get(next).is_free() {
                self.free_lists.remove(&mut self.blocks, next);
                self.absorb(id, next);
                HeapStats::inc(&stats.coalesces);
            }
        }
        if let Some(prev) = self.blocks.get(id).phys_prev {
            if self.blocks.get(prev).is_free() {
                self.free_lists.remove(&mut self.blocks, prev);
                self.absorb(prev, id);
                HeapStats::inc(&stats.coalesces);
                return prev;
            }
        }
        id
    }

    /// Folds `gone` (the physical successor of `keep`) into `keep`.
    fn absorb(&mut self, keep: BlockId, gone: BlockId) {
        let absorbed = *self.blocks.get(gone);
        let survivor = self.blocks.get_mut(keep);
        survivor.size += HEADER_SIZE + absorbed.size;
        survivor.phys_next = absorbed.phys_next;
        if let Some(next) = absorbed.phys_next {
            self.blocks.get_mut(next).phys_prev = Some(keep);
        }
        self.by_addr.remove(&absorbed.addr);
        self.blocks.retire(gone);
    }
}
