//! Size class buckets for the free-list store.
//!
//! Defines 32 classes from 16 bytes to 1 MiB. Bounds grow as powers of two
//! with one intermediate step, so a block placed in a class is never more
//! than about 50% larger than the smallest request that class serves. The
//! last class is open-ended: free remainders larger than 1 MiB land there.

use crate::error::HeapError;

/// Payload alignment granularity (bytes).
pub const ALIGNMENT: usize = 16;

/// Minimum payload size (bytes).
pub const MIN_SIZE: usize = 16;

/// Number of size class bins.
pub const NUM_SIZE_CLASSES: usize = 32;

/// Upper bound (inclusive) of every size class.
///
/// Bins 0-3: 16-byte steps (16, 32, 48, 64)
/// Bins 4-31: powers of two with one intermediate step, up to 1 MiB
const SIZE_TABLE: [usize; NUM_SIZE_CLASSES] = [
    16, 32, 48, 64, // 16-byte steps
    96, 128, 192, 256, 384, 512, 768, 1024, // sub-page
    1536, 2048, 3072, 4096, 6144, 8192, 12288, 16384, // page range
    24576, 32768, 49152, 65536, 98304, 131072, 196608, 262144, // large remainders
    393216, 524288, 786432, 1048576, // last bin is open-ended
];

/// Describes a single size class bin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClass {
    /// Bin index.
    pub index: usize,
    /// Smallest size mapped to this bin.
    pub min_size: usize,
    /// Largest size mapped to this bin (`usize::MAX` for the last bin).
    pub max_size: usize,
}

/// Rounds `size` up to the alignment granularity.
///
/// Returns `None` when rounding would overflow.
#[must_use]
pub const fn round_up(size: usize) -> Option<usize> {
    match size.checked_add(ALIGNMENT - 1) {
        Some(padded) => Some(padded & !(ALIGNMENT - 1)),
        None => None,
    }
}

/// Rounds `size` down to the alignment granularity.
#[must_use]
pub const fn round_down(size: usize) -> usize {
    size & !(ALIGNMENT - 1)
}

/// Computes the bin index for a block or request of `size` bytes.
///
/// Returns the smallest class whose bound is `>= size`. Sizes above the last
/// bound clamp into the last bin. Monotonic in `size`.
#[must_use]
pub fn bin_index(size: usize) -> usize {
    let size = size.max(MIN_SIZE);
    SIZE_TABLE
        .partition_point(|&bound| bound < size)
        .min(NUM_SIZE_CLASSES - 1)
}

/// Checked form of [`bin_index`] for caller-supplied sizes.
pub fn class_index(size: usize) -> Result<usize, HeapError> {
    if size == 0 {
        return Err(HeapError::InvalidSize { size });
    }
    Ok(bin_index(size))
}

/// Returns the upper bound for a given bin index.
///
/// Returns 0 for out-of-range indices.
#[must_use]
pub fn bin_size(index: usize) -> usize {
    if index < NUM_SIZE_CLASSES {
        SIZE_TABLE[index]
    } else {
        0
    }
}

/// Largest bound in the table; the small-allocation ceiling may not exceed it.
#[must_use]
pub const fn max_class_bound() -> usize {
    SIZE_TABLE[NUM_SIZE_CLASSES - 1]
}

/// Returns the full table of size classes.
#[must_use]
pub fn size_classes() -> Vec<SizeClass> {
    (0..NUM_SIZE_CLASSES)
        .map(|index| SizeClass {
            index,
            min_size: if index == 0 {
                1
            } else {
                SIZE_TABLE[index - 1] + 1
            },
            max_size: if index == NUM_SIZE_CLASSES - 1 {
                usize::MAX
            } else {
                SIZE_TABLE[index]
            },
        })
        .collect()
}
