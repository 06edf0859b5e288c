//! Atomic counters for heap observability.
//!
//! All counters use relaxed ordering: they are advisory/diagnostic, not
//! synchronization primitives. Writers update them while holding the heap
//! guard; readers snapshot them without taking it, so a snapshot taken during
//! concurrent traffic may be transiently inconsistent across counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::size_class::{NUM_SIZE_CLASSES, bin_size};

/// Counters for one size class (or for the large path).
#[derive(Debug, Default)]
pub struct ClassCounters {
    /// Live blocks currently attributed to this class.
    live_count: AtomicU64,
    /// Payload bytes of those live blocks.
    live_bytes: AtomicU64,
    /// Allocations served since creation.
    allocations: AtomicU64,
    /// Frees accepted since creation.
    frees: AtomicU64,
}

impl ClassCounters {
    fn on_alloc(&self, bytes: usize) {
        self.live_count.fetch_add(1, Ordering::Relaxed);
        self.live_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.allocations.fetch_add(1, Ordering::Relaxed);
    }

    fn on_free(&self, bytes: usize) {
        self.live_count.fetch_sub(1, Ordering::Relaxed);
        self.live_bytes.fetch_sub(bytes as u64, Ordering::Relaxed);
        self.frees.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self, class: Option<usize>) -> ClassStats {
        ClassStats {
            class,
            upper_bound: class.map(bin_size),
            count: self.live_count.load(Ordering::Relaxed),
            total_bytes: self.live_bytes.load(Ordering::Relaxed),
            allocations: self.allocations.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
        }
    }
}

/// Heap-wide operation counters.
#[derive(Debug)]
pub struct HeapStats {
    per_class: [ClassCounters; NUM_SIZE_CLASSES],
    large: ClassCounters,
    /// Allocation requests rejected for any reason.
    pub failed_allocations: AtomicU64,
    /// Requests rejected as `InvalidSize` or `AllocationTooLarge`.
    pub rejected_requests: AtomicU64,
    /// `OutOfMemory` failures.
    pub out_of_memory: AtomicU64,
    /// Frees rejected as `DoubleFree`.
    pub double_frees: AtomicU64,
    /// Frees rejected as `CorruptedHeader`.
    pub corrupted_frees: AtomicU64,
    /// Blocks split to satisfy a smaller request.
    pub splits: AtomicU64,
    /// Neighbor merges performed by the coalescer.
    pub coalesces: AtomicU64,
    /// Requests satisfied from a free list.
    pub free_list_hits: AtomicU64,
    /// Extents obtained from the source, pooled and large.
    pub extents_acquired: AtomicU64,
    /// Extents the source took back: large frees, trim and teardown.
    pub extents_released: AtomicU64,
    /// `release_extent` calls the source refused.
    pub release_failures: AtomicU64,
}

impl HeapStats {
    #[must_use]
    pub fn new() -> Self {
        Self {
            per_class: std::array::from_fn(|_| ClassCounters::default()),
            large: ClassCounters::default(),
            failed_allocations: AtomicU64::new(0),
            rejected_requests: AtomicU64::new(0),
            out_of_memory: AtomicU64::new(0),
            double_frees: AtomicU64::new(0),
            corrupted_frees: AtomicU64::new(0),
            splits: AtomicU64::new(0),
            coalesces: AtomicU64::new(0),
            free_list_hits: AtomicU64::new(0),
            extents_acquired: AtomicU64::new(0),
            extents_released: AtomicU64::new(0),
            release_failures: AtomicU64::new(0),
        }
    }

    /// Increment a counter by 1.
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Read a counter value.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Records a pooled allocation; `class` is `None` on the large path.
    pub fn record_alloc(&self, class: Option<usize>, bytes: usize) {
        self.counters(class).on_alloc(bytes);
    }

    /// Records an accepted free; `class` is `None` on the large path.
    pub fn record_free(&self, class: Option<usize>, bytes: usize) {
        self.counters(class).on_free(bytes);
    }

    fn counters(&self, class: Option<usize>) -> &ClassCounters {
        match class {
            Some(index) => &self.per_class[index.min(NUM_SIZE_CLASSES - 1)],
            None => &self.large,
        }
    }

    /// Snapshot all counters without taking the heap guard.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let per_class: Vec<ClassStats> = self
            .per_class
            .iter()
            .enumerate()
            .map(|(index, counters)| counters.snapshot(Some(index)))
            .collect();
        let large = self.large.snapshot(None);
        let total_allocations =
            per_class.iter().map(|c| c.allocations).sum::<u64>() + large.allocations;
        let total_frees = per_class.iter().map(|c| c.frees).sum::<u64>() + large.frees;
        StatsSnapshot {
            per_class,
            large,
            total_allocations,
            total_frees,
            failed_allocations: Self::get(&self.failed_allocations),
            rejected_requests: Self::get(&self.rejected_requests),
            out_of_memory: Self::get(&self.out_of_memory),
            double_frees: Self::get(&self.double_frees),
            corrupted_frees: Self::get(&self.corrupted_frees),
            splits: Self::get(&self.splits),
            coalesces: Self::get(&self.coalesces),
            free_list_hits: Self::get(&self.free_list_hits),
            extents_acquired: Self::get(&self.extents_acquired),
            extents_released: Self::get(&self.extents_released),
            release_failures: Self::get(&self.release_failures),
        }
    }
}

impl Default for HeapStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of one class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassStats {
    /// Class index, `None` for the large path.
    pub class: Option<usize>,
    /// Upper size bound of the class.
    pub upper_bound: Option<usize>,
    /// Live allocations.
    pub count: u64,
    /// Payload bytes of live allocations.
    pub total_bytes: u64,
    pub allocations: u64,
    pub frees: u64,
}

/// Point-in-time snapshot of all heap counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub per_class: Vec<ClassStats>,
    pub large: ClassStats,
    pub total_allocations: u64,
    pub total_frees: u64,
    pub failed_allocations: u64,
    pub rejected_requests: u64,
    pub out_of_memory: u64,
    pub double_frees: u64,
    pub corrupted_frees: u64,
    pub splits: u64,
    pub coalesces: u64,
    pub free_list_hits: u64,
    pub extents_acquired: u64,
    pub extents_released: u64,
    pub release_failures: u64,
}

impl StatsSnapshot {
    /// Live allocations across all classes and the large path.
    #[must_use]
    pub fn live_count(&self) -> u64 {
        self.per_class.iter().map(|c| c.count).sum::<u64>() + self.large.count
    }

    /// Live payload bytes across all classes and the large path.
    #[must_use]
    pub fn live_bytes(&self) -> u64 {
        self.per_class.iter().map(|c| c.total_bytes).sum::<u64>() + self.large.total_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let stats = HeapStats::new();
        let snap = stats.snapshot();
        assert_eq!(snap.per_class.len(), NUM_SIZE_CLASSES);
        assert_eq!(snap.total_allocations, 0);
        assert_eq!(snap.live_bytes(), 0);
        assert_eq!(snap.large.class, None);
        assert_eq!(snap.per_class[3].upper_bound, Some(64));
    }

    #[test]
    fn alloc_and_free_move_live_counters() {
        let stats = HeapStats::new();
        stats.record_alloc(Some(2), 48);
        stats.record_alloc(Some(2), 48);
        stats.record_alloc(None, 65536);
        stats.record_free(Some(2), 48);
        HeapStats::inc(&stats.splits);

        let snap = stats.snapshot();
        assert_eq!(snap.per_class[2].count, 1);
        assert_eq!(snap.per_class[2].total_bytes, 48);
        assert_eq!(snap.per_class[2].allocations, 2);
        assert_eq!(snap.per_class[2].frees, 1);
        assert_eq!(snap.large.count, 1);
        assert_eq!(snap.total_allocations, 3);
        assert_eq!(snap.total_frees, 1);
        assert_eq!(snap.live_count(), 2);
        assert_eq!(snap.live_bytes(), 48 + 65536);
        assert_eq!(snap.splits, 1);
    }

    #[test]
    fn snapshot_is_serializable() {
        let stats = HeapStats::new();
        stats.record_alloc(Some(0), 16);
        let json = serde_json::to_string(&stats.snapshot()).unwrap();
        let back: StatsSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.per_class[0].count, 1);
    }
}
