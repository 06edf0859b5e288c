//! Extent acquisition boundary.
//!
//! An [`ExtentSource`] supplies zeroed, page-aligned address ranges to the
//! heap and takes them back on large-block free, trim, and teardown. The core
//! never dereferences extent memory, so a purely logical source is enough for
//! tests; the mmap-backed source lives in `classheap-sys`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::error::ExtentError;

/// Page size used for extent rounding.
pub const PAGE_SIZE: usize = 4096;

/// Rounds a size up to the nearest page boundary.
#[must_use]
pub const fn page_align(size: usize) -> Option<usize> {
    match size.checked_add(PAGE_SIZE - 1) {
        Some(padded) => Some(padded & !(PAGE_SIZE - 1)),
        None => None,
    }
}

/// A contiguous address range handed out by an [`ExtentSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub base: usize,
    pub size: usize,
}

impl Extent {
    #[must_use]
    pub const fn end(&self) -> usize {
        self.base + self.size
    }
}

/// Heap-local identifier of a pooled extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExtentId(pub(crate) usize);

/// Supplier of raw memory extents.
pub trait ExtentSource: Send {
    /// Obtains a zeroed, page-aligned extent of at least `min_size` bytes.
    fn acquire_extent(&mut self, min_size: usize) -> Result<Extent, ExtentError>;

    /// Returns an extent previously obtained from `acquire_extent`.
    ///
    /// On failure the extent is still held by the caller and may be retried.
    fn release_extent(&mut self, extent: Extent) -> Result<(), ExtentError>;
}

impl<S: ExtentSource + ?Sized> ExtentSource for Box<S> {
    fn acquire_extent(&mut self, min_size: usize) -> Result<Extent, ExtentError> {
        (**self).acquire_extent(min_size)
    }

    fn release_extent(&mut self, extent: Extent) -> Result<(), ExtentError> {
        (**self).release_extent(extent)
    }
}

/// Shared counters describing what a source currently has handed out.
#[derive(Debug, Default)]
pub struct SourceLedger {
    mapped: AtomicUsize,
    live_extents: AtomicUsize,
    acquisitions: AtomicUsize,
}

impl SourceLedger {
    /// Bytes currently handed out.
    #[must_use]
    pub fn mapped(&self) -> usize {
        self.mapped.load(Ordering::Relaxed)
    }

    /// Extents currently handed out.
    #[must_use]
    pub fn live_extents(&self) -> usize {
        self.live_extents.load(Ordering::Relaxed)
    }

    /// Successful acquisitions since creation.
    #[must_use]
    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::Relaxed)
    }

    pub fn on_acquire(&self, size: usize) {
        self.mapped.fetch_add(size, Ordering::Relaxed);
        self.live_extents.fetch_add(1, Ordering::Relaxed);
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_release(&self, size: usize) {
        self.mapped.fetch_sub(size, Ordering::Relaxed);
        self.live_extents.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Errno reported by [`SimulatedExtentSource`] while releases are refused (`EBUSY`).
pub const REFUSED_RELEASE_ERRNO: i32 = 16;

/// Logical address-space source for tests and benchmarks.
///
/// Hands out page-aligned ranges from a bump pointer starting at a high
/// offset. Addresses are never backed by memory and never reused. An optional
/// byte capacity makes exhaustion reproducible, and a shared switch makes
/// releases fail on demand.
#[derive(Debug)]
pub struct SimulatedExtentSource {
    next_base: usize,
    capacity: Option<usize>,
    ledger: Arc<SourceLedger>,
    refuse_releases: Arc<AtomicBool>,
}

impl SimulatedExtentSource {
    /// Creates an unbounded source.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_base: 0x1_0000_0000, // Start at a high offset to avoid confusion
            capacity: None,
            ledger: Arc::new(SourceLedger::default()),
            refuse_releases: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Creates a source that refuses to have more than `bytes` outstanding.
    #[must_use]
    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            capacity: Some(bytes),
            ..Self::new()
        }
    }

    /// Handle to the shared usage counters; stays valid after the source moves.
    #[must_use]
    pub fn ledger(&self) -> Arc<SourceLedger> {
        Arc::clone(&self.ledger)
    }

    /// Switch that, while set, makes every `release_extent` fail.
    #[must_use]
    pub fn release_switch(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.refuse_releases)
    }
}

impl Default for SimulatedExtentSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtentSource for SimulatedExtentSource {
    fn acquire_extent(&mut self, min_size: usize) -> Result<Extent, ExtentError> {
        let size = page_align(min_size.max(1))
            .ok_or(ExtentError::SizeOverflow { requested: min_size })?;
        if let Some(capacity) = self.capacity {
            let available = capacity.saturating_sub(self.ledger.mapped());
            if size > available {
                return Err(ExtentError::Exhausted {
                    requested: size,
                    available,
                });
            }
        }
        let base = self.next_base;
        self.next_base = base
            .checked_add(size)
            .ok_or(ExtentError::SizeOverflow { requested: min_size })?;
        self.ledger.on_acquire(size);
        Ok(Extent { base, size })
    }

    fn release_extent(&mut self, extent: Extent) -> Result<(), ExtentError> {
        if self.refuse_releases.load(Ordering::Relaxed) {
            return Err(ExtentError::System {
                errno: REFUSED_RELEASE_ERRNO,
            });
        }
        self.ledger.on_release(extent.size);
        Ok(())
    }
}
