//! Error taxonomy for heap operations.
//!
//! Caller errors (`InvalidSize`, `AllocationTooLarge`) are returned before the
//! heap guard is taken. `OutOfMemory` leaves the heap fully consistent and may
//! be retried. `CorruptedHeader` and `DoubleFree` are never repaired.

use thiserror::Error;

/// Failure reported by an [`ExtentSource`](crate::extent::ExtentSource).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtentError {
    #[error("extent source exhausted: requested {requested} bytes, {available} available")]
    Exhausted { requested: usize, available: usize },
    #[error("extent size {requested} overflows the address space")]
    SizeOverflow { requested: usize },
    #[error("system mapping failed (errno {errno})")]
    System { errno: i32 },
}

/// Errors returned by [`Heap`](crate::Heap) operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeapError {
    /// Zero-byte or absurdly large request.
    #[error("invalid allocation size {size}")]
    InvalidSize { size: usize },
    /// Request exceeds the configured ceiling and no fallback applies.
    #[error("allocation of {size} bytes exceeds limit of {limit} bytes")]
    AllocationTooLarge { size: usize, limit: usize },
    /// The extent source could not supply memory.
    #[error("out of memory while requesting {requested} bytes")]
    OutOfMemory {
        requested: usize,
        #[source]
        source: ExtentError,
    },
    /// Pointer does not resolve to a header carrying the block sentinel.
    #[error("corrupted or foreign block header for pointer {ptr:#x}")]
    CorruptedHeader { ptr: usize },
    /// Pointer refers to a block that is already free.
    #[error("double free of pointer {ptr:#x}")]
    DoubleFree { ptr: usize },
    /// The extent source refused to take an extent back. The heap keeps the
    /// extent counted and retries on the next trim.
    #[error("extent at {base:#x} could not be released")]
    ReleaseFailed {
        base: usize,
        #[source]
        source: ExtentError,
    },
}

impl HeapError {
    /// Returns true for errors caused purely by the request arguments.
    #[must_use]
    pub const fn is_caller_error(&self) -> bool {
        matches!(self, Self::InvalidSize { .. } | Self::AllocationTooLarge { .. })
    }

    /// Returns true for errors that indicate heap corruption or pointer misuse.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(self, Self::CorruptedHeader { .. } | Self::DoubleFree { .. })
    }
}

/// Rejected [`HeapConfig`](crate::HeapConfig) values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("trace capacity must be non-zero")]
    ZeroTraceCapacity,
    #[error("small ceiling {value} must be a non-zero multiple of {alignment} no larger than {max}")]
    BadSmallCeiling {
        value: usize,
        alignment: usize,
        max: usize,
    },
    #[error("extent size {value} is below the minimum of {min} bytes")]
    ExtentTooSmall { value: usize, min: usize },
    #[error("max allocation must be non-zero")]
    ZeroMaxAllocation,
}

/// Invariant violations found by [`Heap::check_integrity`](crate::Heap::check_integrity).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityError {
    #[error("block at {addr:#x} carries magic {magic:#x}")]
    BadMagic { addr: usize, magic: u32 },
    #[error("block at {addr:#x} is not followed by its physical neighbor (expected {expected:#x}, found {found:#x})")]
    Discontiguous {
        addr: usize,
        expected: usize,
        found: usize,
    },
    #[error("extent at {base:#x} covers {covered} of {managed} managed bytes")]
    ExtentCoverage {
        base: usize,
        covered: usize,
        managed: usize,
    },
    #[error("free blocks at {addr:#x} and {next:#x} are adjacent but not coalesced")]
    AdjacentFree { addr: usize, next: usize },
    #[error("free block at {addr:#x} of size {size} sits in bucket {bucket}, expected {expected}")]
    BucketMismatch {
        addr: usize,
        size: usize,
        bucket: usize,
        expected: usize,
    },
    #[error("free lists hold {listed} blocks but {walked} free blocks were walked")]
    FreeListCount { listed: usize, walked: usize },
    #[error("byte accounting mismatch for {what}: recorded {recorded}, walked {walked}")]
    Accounting {
        what: &'static str,
        recorded: usize,
        walked: usize,
    },
    #[error("address index maps {addr:#x} to a block that lives elsewhere")]
    IndexMismatch { addr: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_helpers() {
        assert!(HeapError::InvalidSize { size: 0 }.is_caller_error());
        assert!(
            HeapError::AllocationTooLarge {
                size: 2,
                limit: 1
            }
            .is_caller_error()
        );
        assert!(HeapError::DoubleFree { ptr: 0x10 }.is_corruption());
        assert!(HeapError::CorruptedHeader { ptr: 0x10 }.is_corruption());
        let oom = HeapError::OutOfMemory {
            requested: 64,
            source: ExtentError::Exhausted {
                requested: 64,
                available: 0,
            },
        };
        assert!(!oom.is_caller_error());
        assert!(!oom.is_corruption());
        let stuck = HeapError::ReleaseFailed {
            base: 0x1000,
            source: ExtentError::System { errno: 22 },
        };
        assert!(!stuck.is_caller_error());
        assert!(!stuck.is_corruption());
    }

    #[test]
    fn display_includes_pointer_in_hex() {
        let msg = HeapError::DoubleFree { ptr: 0x1000 }.to_string();
        assert_eq!(msg, "double free of pointer 0x1000");
    }

    #[test]
    fn out_of_memory_exposes_source() {
        use std::error::Error as _;
        let oom = HeapError::OutOfMemory {
            requested: 128,
            source: ExtentError::System { errno: 12 },
        };
        let source = oom.source().expect("source");
        assert_eq!(source.to_string(), "system mapping failed (errno 12)");
    }
}
