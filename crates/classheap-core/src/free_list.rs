//! Segregated free lists, one doubly linked list per size class.
//!
//! Links are threaded through [`BlockState::Free`] in the header arena, so
//! insertion and removal are O(1). Every free block sits in exactly the bucket
//! `bin_index(block.size)`.

use crate::block::{BlockArena, BlockId, BlockState};
use crate::size_class::{NUM_SIZE_CLASSES, bin_index};

/// Free-block search strategy.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchPolicy {
    /// First block with sufficient size, starting in the request's class.
    #[default]
    FirstFit,
    /// Smallest sufficient block in the first class that has one.
    BestFit,
}

impl SearchPolicy {
    /// Parse from string (case-insensitive).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first" | "first-fit" | "first_fit" | "firstfit" => Some(Self::FirstFit),
            "best" | "best-fit" | "best_fit" | "bestfit" => Some(Self::BestFit),
            _ => None,
        }
    }
}

/// Array of per-class free-list heads.
#[derive(Debug)]
pub struct FreeLists {
    heads: [Option<BlockId>; NUM_SIZE_CLASSES],
    lens: [usize; NUM_SIZE_CLASSES],
}

impl Default for FreeLists {
    fn default() -> Self {
        Self::new()
    }
}

impl FreeLists {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            heads: [None; NUM_SIZE_CLASSES],
            lens: [0; NUM_SIZE_CLASSES],
        }
    }

    /// Pushes a block onto the front of its class list and marks it free.
    pub fn push(&mut self, blocks: &mut BlockArena, id: BlockId) {
        let bucket = bin_index(blocks.get(id).size);
        let old_head = self.heads[bucket];
        blocks.get_mut(id).state = BlockState::Free {
            prev: None,
            next: old_head,
        };
        if let Some(head) = old_head {
            set_prev(blocks, head, Some(id));
        }
        self.heads[bucket] = Some(id);
        self.lens[bucket] += 1;
    }

    /// Unlinks a free block from its class list.
    ///
    /// The block keeps its free state with cleared links; callers either
    /// re-mark it allocated or merge it away.
    pub fn remove(&mut self, blocks: &mut BlockArena, id: BlockId) {
        let block = blocks.get(id);
        let BlockState::Free { prev, next } = block.state else {
            return;
        };
        let bucket = bin_index(block.size);
        match prev {
            Some(p) => set_next(blocks, p, next),
            None => self.heads[bucket] = next,
        }
        if let Some(n) = next {
            set_prev(blocks, n, prev);
        }
        blocks.get_mut(id).state = BlockState::Free {
            prev: None,
            next: None,
        };
        self.lens[bucket] -= 1;
    }

    /// Finds a free block with at least `size` payload bytes.
    ///
    /// Only the request's own class needs a size check; every block in a
    /// higher class is larger than any request mapped below it.
    #[must_use]
    pub fn find(&self, blocks: &BlockArena, size: usize, policy: SearchPolicy) -> Option<BlockId> {
        let start = bin_index(size);
        (start..NUM_SIZE_CLASSES).find_map(|bucket| match policy {
            SearchPolicy::FirstFit => self
                .iter_bucket(blocks, bucket)
                .find(|&id| blocks.get(id).size >= size),
            SearchPolicy::BestFit => self
                .iter_bucket(blocks, bucket)
                .filter(|&id| blocks.get(id).size >= size)
                .min_by_key(|&id| blocks.get(id).size),
        })
    }

    /// Iterates the ids held in one bucket, head first.
    pub fn iter_bucket<'a>(
        &self,
        blocks: &'a BlockArena,
        bucket: usize,
    ) -> impl Iterator<Item = BlockId> + use<'a> {
        let mut cursor = self.heads.get(bucket).copied().flatten();
        std::iter::from_fn(move || {
            let id = cursor?;
            cursor = match blocks.get(id).state {
                BlockState::Free { next, .. } => next,
                BlockState::Allocated { .. } => None,
            };
            Some(id)
        })
    }

    /// Number of blocks in one bucket.
    #[must_use]
    pub fn len(&self, bucket: usize) -> usize {
        self.lens.get(bucket).copied().unwrap_or(0)
    }

    /// Number of blocks across all buckets.
    #[must_use]
    pub fn total(&self) -> usize {
        self.lens.iter().sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

fn set_prev(blocks: &mut BlockArena, id: BlockId, value: Option<BlockId>) {
    if let BlockState::Free { prev, .. } = &mut blocks.get_mut(id).state {
        *prev = value;
    }
}

fn set_next(blocks: &mut BlockArena, id: BlockId, value: Option<BlockId>) {
    if let BlockState::Free { next, .. } = &mut blocks.get_mut(id).state {
        *next = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BLOCK_MAGIC, Block};
    use crate::extent::ExtentId;

    fn free_block(blocks: &mut BlockArena, addr: usize, size: usize) -> BlockId {
        blocks.insert(Block {
            addr,
            size,
            magic: BLOCK_MAGIC,
            state: BlockState::Allocated { requester: 0 },
            phys_prev: None,
            phys_next: None,
            extent: ExtentId(0),
        })
    }

    #[test]
    fn push_and_remove_keep_lengths() {
        let mut blocks = BlockArena::new();
        let mut lists = FreeLists::new();
        let a = free_block(&mut blocks, 0x1000, 112);
        let b = free_block(&mut blocks, 0x2000, 112);
        let c = free_block(&mut blocks, 0x3000, 4000);

        lists.push(&mut blocks, a);
        lists.push(&mut blocks, b);
        lists.push(&mut blocks, c);
        assert_eq!(lists.len(bin_index(112)), 2);
        assert_eq!(lists.total(), 3);
        assert!(blocks.get(a).is_free());

        // b is the head, a the tail.
        lists.remove(&mut blocks, b);
        let remaining: Vec<_> = lists.iter_bucket(&blocks, bin_index(112)).collect();
        assert_eq!(remaining, vec![a]);
        lists.remove(&mut blocks, a);
        assert_eq!(lists.len(bin_index(112)), 0);
        assert_eq!(lists.total(), 1);
    }

    #[test]
    fn remove_middle_relinks_neighbors() {
        let mut blocks = BlockArena::new();
        let mut lists = FreeLists::new();
        let ids: Vec<_> = (0..3)
            .map(|i| free_block(&mut blocks, 0x1000 * (i + 1), 64))
            .collect();
        for &id in &ids {
            lists.push(&mut blocks, id);
        }
        // List order is ids[2], ids[1], ids[0].
        lists.remove(&mut blocks, ids[1]);
        let order: Vec<_> = lists.iter_bucket(&blocks, bin_index(64)).collect();
        assert_eq!(order, vec![ids[2], ids[0]]);
    }

    #[test]
    fn find_checks_size_in_own_class_then_climbs() {
        let mut blocks = BlockArena::new();
        let mut lists = FreeLists::new();
        // 112 sits in the (96, 128] class; a request for 128 must skip it.
        let small = free_block(&mut blocks, 0x1000, 112);
        let big = free_block(&mut blocks, 0x2000, 1024);
        lists.push(&mut blocks, small);
        lists.push(&mut blocks, big);

        assert_eq!(lists.find(&blocks, 96, SearchPolicy::FirstFit), Some(small));
        assert_eq!(lists.find(&blocks, 128, SearchPolicy::FirstFit), Some(big));
        assert_eq!(lists.find(&blocks, 2048, SearchPolicy::FirstFit), None);
    }

    #[test]
    fn best_fit_prefers_smallest_sufficient_block() {
        let mut blocks = BlockArena::new();
        let mut lists = FreeLists::new();
        let loose = free_block(&mut blocks, 0x1000, 384);
        let tight = free_block(&mut blocks, 0x2000, 272);
        lists.push(&mut blocks, loose);
        lists.push(&mut blocks, tight);

        // Both live in the (256, 384] class; first fit takes the head.
        assert_eq!(lists.find(&blocks, 260, SearchPolicy::FirstFit), Some(tight));
        lists.remove(&mut blocks, loose);
        lists.push(&mut blocks, loose);
        assert_eq!(lists.find(&blocks, 260, SearchPolicy::FirstFit), Some(loose));
        assert_eq!(lists.find(&blocks, 260, SearchPolicy::BestFit), Some(tight));
    }

    #[test]
    fn search_policy_parses_loosely() {
        assert_eq!(SearchPolicy::from_str_loose("FIRST"), Some(SearchPolicy::FirstFit));
        assert_eq!(SearchPolicy::from_str_loose("best-fit"), Some(SearchPolicy::BestFit));
        assert_eq!(SearchPolicy::from_str_loose("worst"), None);
        assert_eq!(SearchPolicy::default(), SearchPolicy::FirstFit);
    }
}
