//! Large allocation handling (above the small-allocation ceiling).
//!
//! Each large allocation owns a dedicated extent. Large blocks are never
//! pooled or split; freeing one hands the extent straight back to the source.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::block::{BLOCK_MAGIC, HEADER_SIZE};
use crate::extent::Extent;
use crate::size_class::round_down;
use crate::tracer::RequesterId;

/// How many released payload addresses are remembered for double-free reports.
const RELEASED_HISTORY: usize = 1024;

/// Metadata for a large allocation.
#[derive(Debug, Clone, Copy)]
pub struct LargeBlock {
    /// Backing extent, returned verbatim on free.
    pub extent: Extent,
    /// Usable payload bytes (extent minus header, alignment-rounded).
    pub size: usize,
    pub magic: u32,
    pub requester: RequesterId,
}

impl LargeBlock {
    /// Header-plus-payload bytes accounted against the heap total.
    #[must_use]
    pub const fn managed_size(&self) -> usize {
        self.size + HEADER_SIZE
    }

    #[must_use]
    pub const fn has_valid_magic(&self) -> bool {
        self.magic == BLOCK_MAGIC
    }
}

/// Tracks active large allocations.
#[derive(Debug, Default)]
pub struct LargeBlocks {
    /// Map from payload address to allocation metadata.
    allocations: HashMap<usize, LargeBlock>,
    /// Recently released payload addresses, oldest first.
    released: VecDeque<usize>,
    released_set: HashSet<usize>,
    /// Total bytes currently mapped for large blocks.
    total_mapped: usize,
}

impl LargeBlocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a freshly acquired extent and returns the payload address.
    pub fn insert(&mut self, extent: Extent, requester: RequesterId) -> (usize, LargeBlock) {
        let block = LargeBlock {
            extent,
            size: round_down(extent.size) - HEADER_SIZE,
            magic: BLOCK_MAGIC,
            requester,
        };
        let ptr = extent.base + HEADER_SIZE;
        if self.released_set.remove(&ptr) {
            self.released.retain(|&p| p != ptr);
        }
        self.total_mapped += extent.size;
        self.allocations.insert(ptr, block);
        (ptr, block)
    }

    /// Unregisters a large allocation by payload address.
    pub fn remove(&mut self, ptr: usize) -> Option<LargeBlock> {
        let block = self.allocations.remove(&ptr)?;
        self.total_mapped -= block.extent.size;
        if self.released.len() == RELEASED_HISTORY {
            if let Some(oldest) = self.released.pop_front() {
                self.released_set.remove(&oldest);
            }
        }
        self.released.push_back(ptr);
        self.released_set.insert(ptr);
        Some(block)
    }

    /// Looks up a large allocation by payload address.
    #[must_use]
    pub fn lookup(&self, ptr: usize) -> Option<&LargeBlock> {
        self.allocations.get(&ptr)
    }

    #[cfg(test)]
    pub(crate) fn lookup_mut(&mut self, ptr: usize) -> Option<&mut LargeBlock> {
        self.allocations.get_mut(&ptr)
    }

    /// Returns true if `ptr` was released recently and not handed out since.
    #[must_use]
    pub fn was_released(&self, ptr: usize) -> bool {
        self.released_set.contains(&ptr)
    }

    /// Removes every allocation, yielding their extents for teardown.
    pub fn drain(&mut self) -> impl Iterator<Item = LargeBlock> + '_ {
        self.total_mapped = 0;
        self.allocations.drain().map(|(_, block)| block)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&usize, &LargeBlock)> {
        self.allocations.iter()
    }

    /// Returns the total number of active large allocations.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.allocations.len()
    }

    /// Returns the total bytes currently mapped.
    #[must_use]
    pub fn total_mapped(&self) -> usize {
        self.total_mapped
    }
}
