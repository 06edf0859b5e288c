//! Core heap state.
//!
//! A [`Heap`] owns every block header, the segregated free lists, the
//! large-block table, the trace ring and the extent source, all behind one
//! `parking_lot::Mutex`. Statistics live outside the guard as atomics so
//! snapshots never contend with allocation traffic.
//!
//! Addresses handed to callers are plain `usize` payload addresses inside
//! extents supplied by the [`ExtentSource`]. Headers are tracked out-of-band,
//! so the heap never reads or writes caller memory.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::block::{BLOCK_MAGIC, Block, BlockArena, BlockId, BlockState, HEADER_SIZE};
use crate::config::HeapConfig;
use crate::error::{ConfigError, ExtentError, HeapError};
use crate::extent::{Extent, ExtentId, ExtentSource, SimulatedExtentSource};
use crate::free_list::FreeLists;
use crate::large::LargeBlocks;
use crate::report::HeapReport;
use crate::size_class::{ALIGNMENT, bin_index, class_index, round_down, round_up};
use crate::stats::{HeapStats, StatsSnapshot};
use crate::tracer::{AllocationTracer, RequesterId, TraceEntry, TraceEvent, current_requester};

/// A pooled extent and the first block carved from it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ExtentRecord {
    pub(crate) extent: Extent,
    /// Bytes of the extent covered by blocks (headers included).
    pub(crate) managed: usize,
    /// Lowest block of the extent. Merges keep the lower block, so this id
    /// stays valid for the extent's whole lifetime.
    pub(crate) first: BlockId,
}

/// An extent the source refused to take back.
///
/// `held` bytes of it are still counted in `total_bytes`; the next trim or
/// teardown retries the release.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StrandedExtent {
    pub(crate) extent: Extent,
    pub(crate) held: usize,
}

/// Everything mutated by allocate/free. Only reachable through the guard.
#[derive(Debug)]
pub(crate) struct HeapState<S> {
    pub(crate) blocks: BlockArena,
    pub(crate) free_lists: FreeLists,
    /// Header address -> live pooled block.
    pub(crate) by_addr: BTreeMap<usize, BlockId>,
    pub(crate) extents: BTreeMap<ExtentId, ExtentRecord>,
    next_extent: usize,
    pub(crate) large: LargeBlocks,
    pub(crate) stranded: Vec<StrandedExtent>,
    pub(crate) tracer: AllocationTracer,
    source: S,
    /// Bytes obtained from the source and still held (pooled and large).
    pub(crate) total_bytes: usize,
    /// Payload bytes of live allocations.
    pub(crate) used_bytes: usize,
}

/// Thread-safe size-classed heap.
///
/// ```
/// use classheap_core::{Heap, HeapConfig};
///
/// let heap = Heap::simulated(HeapConfig::default()).unwrap();
/// let ptr = heap.allocate(100).unwrap();
/// assert_eq!(heap.usable_size(ptr), Some(112));
/// heap.free(ptr).unwrap();
/// assert_eq!(heap.used_bytes(), 0);
/// ```
pub struct Heap<S: ExtentSource = SimulatedExtentSource> {
    config: HeapConfig,
    state: Mutex<HeapState<S>>,
    stats: HeapStats,
}

impl Heap<SimulatedExtentSource> {
    /// Creates a heap over an unbounded logical address space.
    pub fn simulated(config: HeapConfig) -> Result<Self, ConfigError> {
        Self::new(config, SimulatedExtentSource::new())
    }
}

impl<S: ExtentSource> Heap<S> {
    /// Creates an empty heap drawing extents from `source`.
    pub fn new(config: HeapConfig, source: S) -> Result<Self, ConfigError> {
        config.validate()?;
        let state = HeapState {
            blocks: BlockArena::new(),
            free_lists: FreeLists::new(),
            by_addr: BTreeMap::new(),
            extents: BTreeMap::new(),
            next_extent: 0,
            large: LargeBlocks::new(),
            stranded: Vec::new(),
            tracer: AllocationTracer::new(config.trace_capacity),
            source,
            total_bytes: 0,
            used_bytes: 0,
        };
        Ok(Self {
            config,
            state: Mutex::new(state),
            stats: HeapStats::new(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Allocates at least `size` bytes on behalf of the calling thread.
    pub fn allocate(&self, size: usize) -> Result<usize, HeapError> {
        self.allocate_for(size, current_requester())
    }

    /// Allocates at least `size` bytes on behalf of `requester`.
    ///
    /// Returns the payload address, aligned to [`ALIGNMENT`].
    pub fn allocate_for(&self, size: usize, requester: RequesterId) -> Result<usize, HeapError> {
        let rounded = self.admit(size)?;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if rounded > self.config.small_ceiling {
            state.allocate_large(size, rounded, requester, &self.stats)
        } else {
            state.allocate_pooled(size, rounded, requester, &self.config, &self.stats)
        }
    }

    /// Validates a request before the guard is taken; returns the rounded size.
    fn admit(&self, size: usize) -> Result<usize, HeapError> {
        let verdict = self.check_request(size);
        if verdict.is_err() {
            HeapStats::inc(&self.stats.rejected_requests);
            HeapStats::inc(&self.stats.failed_allocations);
        }
        verdict
    }

    fn check_request(&self, size: usize) -> Result<usize, HeapError> {
        class_index(size)?;
        if size > self.config.max_allocation {
            return Err(HeapError::AllocationTooLarge {
                size,
                limit: self.config.max_allocation,
            });
        }
        let rounded = round_up(size).ok_or(HeapError::InvalidSize { size })?;
        if rounded > self.config.small_ceiling {
            if !self.config.large_blocks {
                return Err(HeapError::AllocationTooLarge {
                    size,
                    limit: self.config.small_ceiling,
                });
            }
            if rounded.checked_add(HEADER_SIZE).is_none() {
                return Err(HeapError::InvalidSize { size });
            }
        }
        Ok(rounded)
    }

    /// Returns an allocation to the heap.
    ///
    /// A pointer that does not name a live allocation is rejected without
    /// touching heap structure. Under [`CorruptionPolicy::Abort`] the process
    /// aborts after the event is recorded.
    ///
    /// Freeing a large block returns its extent to the source. If the source
    /// refuses, the allocation is still released and
    /// [`HeapError::ReleaseFailed`] is returned; the extent stays counted
    /// until a later [`trim`](Self::trim) succeeds.
    ///
    /// [`CorruptionPolicy::Abort`]: crate::CorruptionPolicy::Abort
    pub fn free(&self, ptr: usize) -> Result<(), HeapError> {
        let requester = current_requester();
        let outcome = {
            let mut guard = self.state.lock();
            guard.release(ptr, requester, &self.stats)
        };
        if let Err(err) = &outcome {
            if err.is_corruption() && self.config.corruption_policy.aborts() {
                std::process::abort();
            }
        }
        outcome
    }

    /// Payload size of a live allocation, `None` for anything else.
    #[must_use]
    pub fn usable_size(&self, ptr: usize) -> Option<usize> {
        let state = self.state.lock();
        if let Some(block) = state.large.lookup(ptr) {
            return Some(block.size);
        }
        let id = state.by_addr.get(&ptr.checked_sub(HEADER_SIZE)?)?;
        let block = state.blocks.get(*id);
        (!block.is_free()).then_some(block.size)
    }

    #[must_use]
    pub fn used_bytes(&self) -> usize {
        self.state.lock().used_bytes
    }

    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.state.lock().total_bytes
    }

    /// Number of blocks currently held in the free lists.
    #[must_use]
    pub fn free_block_count(&self) -> usize {
        self.state.lock().free_lists.total()
    }

    #[must_use]
    pub fn large_block_count(&self) -> usize {
        self.state.lock().large.active_count()
    }

    /// Lock-free snapshot of the counters.
    #[must_use]
    pub fn snapshot_stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Retained trace entries, oldest first.
    #[must_use]
    pub fn dump_trace(&self) -> Vec<TraceEntry> {
        self.state.lock().tracer.dump()
    }

    /// Hands pooled extents that are entirely free back to the source, and
    /// retries extents an earlier release left behind.
    ///
    /// Returns the number of bytes released. If the source refuses any
    /// extent, the first refusal is returned once every candidate has been
    /// tried; refused extents stay counted in [`total_bytes`](Self::total_bytes).
    pub fn trim(&self) -> Result<usize, HeapError> {
        let requester = current_requester();
        let mut guard = self.state.lock();
        guard.trim(requester, &self.stats)
    }

    /// Releases every extent and reports the first release the source refused.
    ///
    /// Dropping a heap does the same but can only count failures.
    pub fn close(mut self) -> Result<usize, HeapError> {
        let requester = current_requester();
        self.state.get_mut().release_all(requester, &self.stats)
    }

    /// Diagnostic bundle of configuration, accounting, counters and trace.
    #[must_use]
    pub fn report(&self) -> HeapReport {
        let state = self.state.lock();
        HeapReport {
            config: self.config.clone(),
            used_bytes: state.used_bytes,
            total_bytes: state.total_bytes,
            free_blocks: state.free_lists.total(),
            large_blocks: state.large.active_count(),
            pooled_extents: state.extents.len(),
            stranded_extents: state.stranded.len(),
            stats: self.stats.snapshot(),
            trace: state.tracer.dump(),
        }
    }

    pub(crate) fn lock_state(&self) -> parking_lot::MutexGuard<'_, HeapState<S>> {
        self.state.lock()
    }

    pub(crate) fn stats(&self) -> &HeapStats {
        &self.stats
    }
}

impl<S: ExtentSource> Drop for Heap<S> {
    /// Refused releases are counted in `release_failures`; [`Heap::close`]
    /// reports them instead.
    fn drop(&mut self) {
        // Requester 0: thread-local ids may already be gone during thread exit.
        let _ = self.state.get_mut().release_all(0, &self.stats);
    }
}

impl<S: ExtentSource> std::fmt::Debug for Heap<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("config", &self.config)
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}

impl<S: ExtentSource> HeapState<S> {
    fn allocate_pooled(
        &mut self,
        size: usize,
        rounded: usize,
        requester: RequesterId,
        config: &HeapConfig,
        stats: &HeapStats,
    ) -> Result<usize, HeapError> {
        let id = match self.free_lists.find(&self.blocks, rounded, config.search) {
            Some(id) => {
                self.free_lists.remove(&mut self.blocks, id);
                HeapStats::inc(&stats.free_list_hits);
                id
            }
            None => match self.carve_extent(rounded, config.extent_size, requester, stats) {
                Ok(id) => id,
                Err(source) => {
                    return Err(self.out_of_memory(
                        size,
                        Some(bin_index(rounded)),
                        source,
                        requester,
                        stats,
                    ));
                }
            },
        };
        self.blocks.get_mut(id).state = BlockState::Allocated { requester };
        self.split(id, rounded, stats);

        let block = *self.blocks.get(id);
        let class = bin_index(block.size);
        self.used_bytes += block.size;
        stats.record_alloc(Some(class), block.size);
        self.tracer
            .record(TraceEvent::Alloc, block.payload(), size, Some(class), requester);
        Ok(block.payload())
    }

    /// Acquires a fresh extent and covers it with one block.
    ///
    /// The block comes back unlisted; the caller marks it and splits it.
    fn carve_extent(
        &mut self,
        rounded: usize,
        extent_size: usize,
        requester: RequesterId,
        stats: &HeapStats,
    ) -> Result<BlockId, ExtentError> {
        let needed = rounded + HEADER_SIZE;
        let min_size = extent_size.max(needed);
        let extent = self.source.acquire_extent(min_size)?;
        let managed = round_down(extent.size);
        if managed < needed || extent.base % ALIGNMENT != 0 {
            self.discard_misfit(extent, requester, stats);
            return Err(ExtentError::Exhausted {
                requested: min_size,
                available: extent.size,
            });
        }

        let extent_id = ExtentId(self.next_extent);
        self.next_extent += 1;
        let id = self.blocks.insert(Block {
            addr: extent.base,
            size: managed - HEADER_SIZE,
            magic: BLOCK_MAGIC,
            state: BlockState::Free {
                prev: None,
                next: None,
            },
            phys_prev: None,
            phys_next: None,
            extent: extent_id,
        });
        self.by_addr.insert(extent.base, id);
        self.extents.insert(
            extent_id,
            ExtentRecord {
                extent,
                managed,
                first: id,
            },
        );
        self.total_bytes += managed;
        HeapStats::inc(&stats.extents_acquired);
        Ok(id)
    }

    fn allocate_large(
        &mut self,
        size: usize,
        rounded: usize,
        requester: RequesterId,
        stats: &HeapStats,
    ) -> Result<usize, HeapError> {
        // `admit` already proved this addition does not overflow.
        let needed = rounded + HEADER_SIZE;
        let extent = match self.source.acquire_extent(needed) {
            Ok(extent) if round_down(extent.size) >= needed && extent.base % ALIGNMENT == 0 => {
                extent
            }
            Ok(extent) => {
                self.discard_misfit(extent, requester, stats);
                let source = ExtentError::Exhausted {
                    requested: needed,
                    available: extent.size,
                };
                return Err(self.out_of_memory(size, None, source, requester, stats));
            }
            Err(source) => return Err(self.out_of_memory(size, None, source, requester, stats)),
        };

        let (ptr, block) = self.large.insert(extent, requester);
        self.total_bytes += block.managed_size();
        HeapStats::inc(&stats.extents_acquired);
        self.used_bytes += block.size;
        stats.record_alloc(None, block.size);
        self.tracer
            .record(TraceEvent::LargeAlloc, ptr, size, None, requester);
        Ok(ptr)
    }

    fn out_of_memory(
        &mut self,
        size: usize,
        class: Option<usize>,
        source: ExtentError,
        requester: RequesterId,
        stats: &HeapStats,
    ) -> HeapError {
        HeapStats::inc(&stats.out_of_memory);
        HeapStats::inc(&stats.failed_allocations);
        self.tracer
            .record(TraceEvent::OutOfMemory, 0, size, class, requester);
        HeapError::OutOfMemory {
            requested: size,
            source,
        }
    }

    fn release(
        &mut self,
        ptr: usize,
        requester: RequesterId,
        stats: &HeapStats,
    ) -> Result<(), HeapError> {
        if let Some(block) = self.large.lookup(ptr).copied() {
            if !block.has_valid_magic() {
                return Err(self.reject(HeapError::CorruptedHeader { ptr }, requester, stats));
            }
            self.large.remove(ptr);
            self.used_bytes -= block.size;
            stats.record_free(None, block.size);
            self.tracer
                .record(TraceEvent::LargeFree, ptr, block.size, None, requester);
            // The allocation is gone even if the source keeps the extent.
            let parked = StrandedExtent {
                extent: block.extent,
                held: block.managed_size(),
            };
            return self.give_back(parked, requester, stats);
        }

        let id = ptr
            .checked_sub(HEADER_SIZE)
            .and_then(|addr| self.by_addr.get(&addr).copied());
        let Some(id) = id else {
            return Err(self.reject_unknown(ptr, requester, stats));
        };
        let block = *self.blocks.get(id);
        if !block.has_valid_magic() {
            return Err(self.reject(HeapError::CorruptedHeader { ptr }, requester, stats));
        }
        if block.is_free() {
            return Err(self.reject(HeapError::DoubleFree { ptr }, requester, stats));
        }

        let class = bin_index(block.size);
        self.blocks.get_mut(id).state = BlockState::Free {
            prev: None,
            next: None,
        };
        self.used_bytes -= block.size;
        stats.record_free(Some(class), block.size);

        let survivor = self.coalesce(id, stats);
        self.free_lists.push(&mut self.blocks, survivor);
        self.tracer
            .record(TraceEvent::Free, ptr, block.size, Some(class), requester);
        Ok(())
    }

    /// Classifies a pointer that names no live header.
    ///
    /// A pointer whose header was merged away into a free block, or a large
    /// payload released recently, is a repeated free; anything else is
    /// treated as a corrupted or foreign pointer.
    fn reject_unknown(&mut self, ptr: usize, requester: RequesterId, stats: &HeapStats) -> HeapError {
        let inside_free = ptr % ALIGNMENT == 0
            && self
                .by_addr
                .range(..ptr)
                .next_back()
                .map(|(_, &id)| self.blocks.get(id))
                .is_some_and(|block| block.is_free() && ptr > block.payload() && ptr < block.end());
        let err = if inside_free || self.large.was_released(ptr) {
            HeapError::DoubleFree { ptr }
        } else {
            HeapError::CorruptedHeader { ptr }
        };
        self.reject(err, requester, stats)
    }

    fn reject(&mut self, err: HeapError, requester: RequesterId, stats: &HeapStats) -> HeapError {
        let (event, counter, ptr) = match err {
            HeapError::DoubleFree { ptr } => (TraceEvent::DoubleFree, &stats.double_frees, ptr),
            HeapError::CorruptedHeader { ptr } => {
                (TraceEvent::CorruptedHeader, &stats.corrupted_frees, ptr)
            }
            _ => return err,
        };
        HeapStats::inc(counter);
        self.tracer.record(event, ptr, 0, None, requester);
        err
    }

    fn trim(&mut self, requester: RequesterId, stats: &HeapStats) -> Result<usize, HeapError> {
        let idle: Vec<ExtentId> = self
            .extents
            .iter()
            .filter(|(_, record)| {
                let block = self.blocks.get(record.first);
                block.is_free() && block.phys_next.is_none()
            })
            .map(|(&id, _)| id)
            .collect();

        let mut pending = std::mem::take(&mut self.stranded);
        for extent_id in idle {
            let Some(record) = self.extents.remove(&extent_id) else {
                continue;
            };
            let block = *self.blocks.get(record.first);
            self.free_lists.remove(&mut self.blocks, record.first);
            self.by_addr.remove(&block.addr);
            self.blocks.retire(record.first);
            pending.push(StrandedExtent {
                extent: record.extent,
                held: record.managed,
            });
        }

        let mut released = 0;
        let mut refused = None;
        for parked in pending {
            match self.give_back(parked, requester, stats) {
                Ok(()) => {
                    self.tracer.record(
                        TraceEvent::Trim,
                        parked.extent.base,
                        parked.extent.size,
                        None,
                        requester,
                    );
                    released += parked.extent.size;
                }
                Err(err) => {
                    refused.get_or_insert(err);
                }
            }
        }
        refused.map_or(Ok(released), Err)
    }

    /// Hands every extent back to the source. Used at teardown.
    fn release_all(
        &mut self,
        requester: RequesterId,
        stats: &HeapStats,
    ) -> Result<usize, HeapError> {
        let mut pending: Vec<StrandedExtent> = std::mem::take(&mut self.extents)
            .into_values()
            .map(|record| StrandedExtent {
                extent: record.extent,
                held: record.managed,
            })
            .collect();
        pending.extend(self.large.drain().map(|block| StrandedExtent {
            extent: block.extent,
            held: block.managed_size(),
        }));
        pending.append(&mut self.stranded);
        self.by_addr.clear();
        self.used_bytes = 0;

        let mut released = 0;
        let mut refused = None;
        for parked in pending {
            match self.give_back(parked, requester, stats) {
                Ok(()) => released += parked.extent.size,
                Err(err) => {
                    refused.get_or_insert(err);
                }
            }
        }
        refused.map_or(Ok(released), Err)
    }

    /// Returns an extent whose `held` bytes are counted in `total_bytes`.
    ///
    /// A refusal is counted, traced at error level and parked in `stranded`
    /// with its bytes still counted.
    fn give_back(
        &mut self,
        parked: StrandedExtent,
        requester: RequesterId,
        stats: &HeapStats,
    ) -> Result<(), HeapError> {
        match self.source.release_extent(parked.extent) {
            Ok(()) => {
                self.total_bytes -= parked.held;
                HeapStats::inc(&stats.extents_released);
                Ok(())
            }
            Err(source) => {
                HeapStats::inc(&stats.release_failures);
                self.tracer.record(
                    TraceEvent::ReleaseFailed,
                    parked.extent.base,
                    parked.extent.size,
                    None,
                    requester,
                );
                self.stranded.push(parked);
                Err(HeapError::ReleaseFailed {
                    base: parked.extent.base,
                    source,
                })
            }
        }
    }

    /// Returns an extent too small or misaligned to use.
    ///
    /// The caller reports `OutOfMemory`; a refused release is still counted
    /// and traced, and the extent is parked for the next trim.
    fn discard_misfit(&mut self, extent: Extent, requester: RequesterId, stats: &HeapStats) {
        HeapStats::inc(&stats.extents_acquired);
        self.total_bytes += extent.size;
        let parked = StrandedExtent {
            extent,
            held: extent.size,
        };
        let _ = self.give_back(parked, requester, stats);
    }
}
