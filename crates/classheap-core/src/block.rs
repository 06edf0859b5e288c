//! Block headers and the index-addressed header arena.
//!
//! Headers are kept out-of-band: each pooled block occupies `HEADER_SIZE`
//! bytes of accounting space in front of its payload, but the metadata itself
//! lives in a `Vec` slot addressed by [`BlockId`]. Physical neighbors and
//! free-list links are stored as ids, never as raw pointers.

use crate::extent::ExtentId;
use crate::tracer::RequesterId;

/// Bytes of header overhead accounted in front of every payload.
pub const HEADER_SIZE: usize = 16;

/// Sentinel carried by every live header.
pub const BLOCK_MAGIC: u32 = 0xC1A5_5EA9;

/// Sentinel written into header slots retired by coalescing.
pub const POISON_MAGIC: u32 = 0xDEAD_B10C;

/// Stable index of a header slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(usize);

impl BlockId {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Allocation state of a block. Free-list links exist only while free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Free {
        prev: Option<BlockId>,
        next: Option<BlockId>,
    },
    Allocated {
        requester: RequesterId,
    },
}

/// Header of one pooled block.
#[derive(Debug, Clone, Copy)]
pub struct Block {
    /// Address of the header (payload starts `HEADER_SIZE` bytes later).
    pub addr: usize,
    /// Usable payload bytes, a multiple of `ALIGNMENT`.
    pub size: usize,
    pub magic: u32,
    pub state: BlockState,
    /// Lower physical neighbor in the same extent.
    pub phys_prev: Option<BlockId>,
    /// Upper physical neighbor in the same extent.
    pub phys_next: Option<BlockId>,
    pub extent: ExtentId,
}

impl Block {
    #[must_use]
    pub const fn payload(&self) -> usize {
        self.addr + HEADER_SIZE
    }

    /// One past the last payload byte; where the physical next header starts.
    #[must_use]
    pub const fn end(&self) -> usize {
        self.addr + HEADER_SIZE + self.size
    }

    #[must_use]
    pub const fn is_free(&self) -> bool {
        matches!(self.state, BlockState::Free { .. })
    }

    #[must_use]
    pub const fn has_valid_magic(&self) -> bool {
        self.magic == BLOCK_MAGIC
    }
}

/// Slab of header slots with recycling of retired ids.
#[derive(Debug, Default)]
pub struct BlockArena {
    slots: Vec<Block>,
    vacant: Vec<BlockId>,
}

impl BlockArena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a new header and returns its id.
    pub fn insert(&mut self, block: Block) -> BlockId {
        if let Some(id) = self.vacant.pop() {
            self.slots[id.index()] = block;
            id
        } else {
            let id = BlockId(self.slots.len());
            self.slots.push(block);
            id
        }
    }

    /// Poisons a header slot and makes it available for reuse.
    pub fn retire(&mut self, id: BlockId) {
        let slot = &mut self.slots[id.index()];
        slot.magic = POISON_MAGIC;
        slot.phys_prev = None;
        slot.phys_next = None;
        slot.state = BlockState::Free {
            prev: None,
            next: None,
        };
        self.vacant.push(id);
    }

    #[must_use]
    pub fn get(&self, id: BlockId) -> &Block {
        &self.slots[id.index()]
    }

    pub fn get_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.slots[id.index()]
    }

    /// Number of live (non-retired) headers.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.slots.len() - self.vacant.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(addr: usize, size: usize) -> Block {
        Block {
            addr,
            size,
            magic: BLOCK_MAGIC,
            state: BlockState::Allocated { requester: 1 },
            phys_prev: None,
            phys_next: None,
            extent: ExtentId(0),
        }
    }

    #[test]
    fn payload_and_end_follow_header() {
        let b = block(0x1000, 112);
        assert_eq!(b.payload(), 0x1010);
        assert_eq!(b.end(), 0x1000 + 16 + 112);
        assert!(!b.is_free());
        assert!(b.has_valid_magic());
    }

    #[test]
    fn retired_slots_are_poisoned_and_reused() {
        let mut arena = BlockArena::new();
        let a = arena.insert(block(0x1000, 32));
        let b = arena.insert(block(0x2000, 32));
        assert_eq!(arena.live_count(), 2);

        arena.retire(a);
        assert_eq!(arena.get(a).magic, POISON_MAGIC);
        assert!(!arena.get(a).has_valid_magic());
        assert_eq!(arena.live_count(), 1);

        let c = arena.insert(block(0x3000, 48));
        assert_eq!(c, a);
        assert_eq!(arena.get(c).addr, 0x3000);
        assert!(arena.get(c).has_valid_magic());
        assert_ne!(b, c);
    }
}
