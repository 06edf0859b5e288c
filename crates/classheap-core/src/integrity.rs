//! Full consistency walk over heap metadata.
//!
//! Walks every pooled extent in physical order, then every free-list bucket,
//! then the large-block table and any stranded extents, and cross-checks the
//! results against the recorded byte counters.

use serde::{Deserialize, Serialize};

use crate::block::HEADER_SIZE;
use crate::error::IntegrityError;
use crate::extent::ExtentSource;
use crate::heap::{Heap, HeapState};
use crate::size_class::{NUM_SIZE_CLASSES, bin_index};

/// Totals gathered by a successful integrity walk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub extents: usize,
    /// Pooled blocks walked, free and allocated.
    pub blocks: usize,
    pub free_blocks: usize,
    pub large_blocks: usize,
    /// Payload bytes of allocated blocks (pooled and large).
    pub used_bytes: usize,
    pub free_bytes: usize,
    /// Header overhead of every block walked.
    pub header_bytes: usize,
    /// Bytes of extents parked after a refused release.
    pub stranded_bytes: usize,
    pub total_bytes: usize,
}

impl<S: ExtentSource> Heap<S> {
    /// Verifies every structural invariant of the heap.
    ///
    /// Holds the guard for the whole walk, so the result describes one
    /// consistent state.
    pub fn check_integrity(&self) -> Result<IntegrityReport, IntegrityError> {
        let state = self.lock_state();
        let report = state.check()?;
        let live = self.stats().snapshot().live_bytes();
        let live = usize::try_from(live).unwrap_or(usize::MAX);
        if live != report.used_bytes {
            return Err(IntegrityError::Accounting {
                what: "live statistics bytes",
                recorded: live,
                walked: report.used_bytes,
            });
        }
        Ok(report)
    }
}

impl<S> HeapState<S> {
    pub(crate) fn check(&self) -> Result<IntegrityReport, IntegrityError> {
        let mut report = IntegrityReport {
            extents: self.extents.len(),
            ..IntegrityReport::default()
        };
        let mut walked_total = 0;

        for (&extent_id, record) in &self.extents {
            let base = record.extent.base;
            let mut expected = base;
            let mut prev = None;
            let mut prev_free_addr = None;
            let mut cursor = Some(record.first);
            while let Some(id) = cursor {
                let block = self.blocks.get(id);
                if !block.has_valid_magic() {
                    return Err(IntegrityError::BadMagic {
                        addr: block.addr,
                        magic: block.magic,
                    });
                }
                if block.addr != expected || block.phys_prev != prev {
                    return Err(IntegrityError::Discontiguous {
                        addr: prev.map_or(base, |p| self.blocks.get(p).addr),
                        expected,
                        found: block.addr,
                    });
                }
                if block.extent != extent_id || self.by_addr.get(&block.addr) != Some(&id) {
                    return Err(IntegrityError::IndexMismatch { addr: block.addr });
                }
                if block.is_free() {
                    if let Some(addr) = prev_free_addr {
                        return Err(IntegrityError::AdjacentFree {
                            addr,
                            next: block.addr,
                        });
                    }
                    prev_free_addr = Some(block.addr);
                    report.free_blocks += 1;
                    report.free_bytes += block.size;
                } else {
                    prev_free_addr = None;
                    report.used_bytes += block.size;
                }
                report.blocks += 1;
                report.header_bytes += HEADER_SIZE;
                expected = block.end();
                prev = Some(id);
                cursor = block.phys_next;
            }
            let covered = expected - base;
            if covered != record.managed {
                return Err(IntegrityError::ExtentCoverage {
                    base,
                    covered,
                    managed: record.managed,
                });
            }
            walked_total += record.managed;
        }

        if self.by_addr.len() != report.blocks {
            return Err(IntegrityError::Accounting {
                what: "indexed blocks",
                recorded: self.by_addr.len(),
                walked: report.blocks,
            });
        }

        let mut listed = 0;
        for bucket in 0..NUM_SIZE_CLASSES {
            let mut in_bucket = 0;
            for id in self.free_lists.iter_bucket(&self.blocks, bucket) {
                let block = self.blocks.get(id);
                let expected = bin_index(block.size);
                if !block.is_free() || !block.has_valid_magic() || expected != bucket {
                    return Err(IntegrityError::BucketMismatch {
                        addr: block.addr,
                        size: block.size,
                        bucket,
                        expected,
                    });
                }
                in_bucket += 1;
            }
            if in_bucket != self.free_lists.len(bucket) {
                return Err(IntegrityError::FreeListCount {
                    listed: self.free_lists.len(bucket),
                    walked: in_bucket,
                });
            }
            listed += in_bucket;
        }
        if listed != report.free_blocks {
            return Err(IntegrityError::FreeListCount {
                listed,
                walked: report.free_blocks,
            });
        }

        for (&ptr, block) in self.large.iter() {
            if !block.has_valid_magic() {
                return Err(IntegrityError::BadMagic {
                    addr: ptr - HEADER_SIZE,
                    magic: block.magic,
                });
            }
            report.large_blocks += 1;
            report.used_bytes += block.size;
            report.header_bytes += HEADER_SIZE;
            walked_total += block.managed_size();
        }

        for parked in &self.stranded {
            report.stranded_bytes += parked.held;
            walked_total += parked.held;
        }

        if self.used_bytes != report.used_bytes {
            return Err(IntegrityError::Accounting {
                what: "used bytes",
                recorded: self.used_bytes,
                walked: report.used_bytes,
            });
        }
        if self.total_bytes != walked_total {
            return Err(IntegrityError::Accounting {
                what: "total bytes",
                recorded: self.total_bytes,
                walked: walked_total,
            });
        }
        let covered =
            report.used_bytes + report.free_bytes + report.header_bytes + report.stranded_bytes;
        if covered != self.total_bytes {
            return Err(IntegrityError::Accounting {
                what: "block coverage",
                recorded: self.total_bytes,
                walked: covered,
            });
        }
        report.total_bytes = self.total_bytes;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use crate::block::{BLOCK_MAGIC, HEADER_SIZE};
    use crate::error::IntegrityError;
    use crate::{Heap, HeapConfig};

    fn heap() -> Heap {
        Heap::simulated(HeapConfig {
            extent_size: 4096,
            ..HeapConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn empty_heap_is_consistent() {
        let report = heap().check_integrity().unwrap();
        assert_eq!(report.blocks, 0);
        assert_eq!(report.total_bytes, 0);
    }

    #[test]
    fn report_totals_cover_the_extent() {
        let heap = heap();
        let a = heap.allocate(100).unwrap();
        heap.allocate(200).unwrap();
        heap.allocate(50_000).unwrap();
        heap.free(a).unwrap();

        let report = heap.check_integrity().unwrap();
        assert_eq!(report.extents, 1);
        assert_eq!(report.blocks, 3);
        assert_eq!(report.free_blocks, 2);
        assert_eq!(report.large_blocks, 1);
        assert_eq!(
            report.used_bytes + report.free_bytes + report.header_bytes,
            report.total_bytes
        );
        assert_eq!(report.used_bytes, heap.used_bytes());
    }

    #[test]
    fn detects_bad_magic() {
        let heap = heap();
        let ptr = heap.allocate(64).unwrap();
        {
            let mut state = heap.lock_state();
            let id = state.by_addr[&(ptr - HEADER_SIZE)];
            state.blocks.get_mut(id).magic = 0;
        }
        assert_eq!(
            heap.check_integrity(),
            Err(IntegrityError::BadMagic {
                addr: ptr - HEADER_SIZE,
                magic: 0
            })
        );
        // A header without the sentinel is refused on free.
        assert!(heap.free(ptr).unwrap_err().is_corruption());
        let mut state = heap.lock_state();
        let id = state.by_addr[&(ptr - HEADER_SIZE)];
        state.blocks.get_mut(id).magic = BLOCK_MAGIC;
    }

    #[test]
    fn detects_accounting_drift() {
        let heap = heap();
        heap.allocate(64).unwrap();
        heap.lock_state().used_bytes += 16;
        assert!(matches!(
            heap.check_integrity(),
            Err(IntegrityError::Accounting {
                what: "used bytes",
                ..
            })
        ));
    }

    #[test]
    fn detects_size_drift() {
        let heap = heap();
        let ptr = heap.allocate(64).unwrap();
        {
            let mut state = heap.lock_state();
            let id = state.by_addr[&(ptr - HEADER_SIZE)];
            state.blocks.get_mut(id).size += 16;
        }
        assert!(matches!(
            heap.check_integrity(),
            Err(IntegrityError::Discontiguous { .. })
        ));
    }
}
