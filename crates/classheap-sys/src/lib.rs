//! # classheap-sys
//!
//! System boundary for classheap: an [`ExtentSource`] backed by anonymous
//! private `mmap` mappings. Extents arrive zero-filled and page-aligned, and
//! `release_extent` unmaps them.
//!
//! This is the only crate in the workspace that contains `unsafe` code.

use std::sync::Arc;

use classheap_core::{
    ConfigError, Extent, ExtentError, ExtentSource, Heap, HeapConfig, SourceLedger,
};

/// Heap backed by real process memory.
pub type SystemHeap = Heap<MmapExtentSource>;

/// Creates a [`SystemHeap`] with the given configuration.
pub fn system_heap(config: HeapConfig) -> Result<SystemHeap, ConfigError> {
    Heap::new(config, MmapExtentSource::new())
}

/// Returns the system page size, falling back to 4 KiB if it cannot be read.
#[must_use]
pub fn page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(raw)
        .ok()
        .filter(|size| size.is_power_of_two())
        .unwrap_or(classheap_core::PAGE_SIZE)
}

/// Extent source mapping anonymous memory from the kernel.
#[derive(Debug)]
pub struct MmapExtentSource {
    page_size: usize,
    limit: Option<usize>,
    ledger: Arc<SourceLedger>,
}

impl MmapExtentSource {
    #[must_use]
    pub fn new() -> Self {
        Self {
            page_size: page_size(),
            limit: None,
            ledger: Arc::new(SourceLedger::default()),
        }
    }

    /// Creates a source that refuses to keep more than `bytes` mapped.
    #[must_use]
    pub fn with_limit(bytes: usize) -> Self {
        Self {
            limit: Some(bytes),
            ..Self::new()
        }
    }

    /// Handle to the shared mapping counters.
    #[must_use]
    pub fn ledger(&self) -> Arc<SourceLedger> {
        Arc::clone(&self.ledger)
    }

    fn round_to_page(&self, size: usize) -> Option<usize> {
        let mask = self.page_size - 1;
        size.max(1).checked_add(mask).map(|padded| padded & !mask)
    }
}

impl Default for MmapExtentSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtentSource for MmapExtentSource {
    fn acquire_extent(&mut self, min_size: usize) -> Result<Extent, ExtentError> {
        let size = self
            .round_to_page(min_size)
            .filter(|&size| size <= isize::MAX as usize)
            .ok_or(ExtentError::SizeOverflow {
                requested: min_size,
            })?;
        if let Some(limit) = self.limit {
            let available = limit.saturating_sub(self.ledger.mapped());
            if size > available {
                return Err(ExtentError::Exhausted {
                    requested: size,
                    available,
                });
            }
        }

        // SAFETY: an anonymous private mapping with a null hint aliases no
        // existing Rust object; the result is checked before use.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            let errno = std::io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(libc::ENOMEM);
            return Err(ExtentError::System { errno });
        }

        self.ledger.on_acquire(size);
        Ok(Extent {
            base: base as usize,
            size,
        })
    }

    fn release_extent(&mut self, extent: Extent) -> Result<(), ExtentError> {
        // SAFETY: the heap only returns extents this source mapped, exactly
        // once, after every payload inside them has been given up.
        let rc = unsafe { libc::munmap(extent.base as *mut libc::c_void, extent.size) };
        if rc != 0 {
            let errno = std::io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(libc::EINVAL);
            return Err(ExtentError::System { errno });
        }
        self.ledger.on_release(extent.size);
        Ok(())
    }
}
