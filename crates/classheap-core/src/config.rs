//! Heap configuration.
//!
//! Defaults suit general use; `HeapConfig::from_env` overlays the
//! `CLASSHEAP_*` environment variables:
//! - `CLASSHEAP_EXTENT_SIZE`: minimum bytes requested per pooled extent.
//! - `CLASSHEAP_SMALL_CEILING`: largest request served from size classes.
//! - `CLASSHEAP_MAX_ALLOCATION`: largest request accepted at all.
//! - `CLASSHEAP_LARGE_BLOCKS`: `on`/`off`, whether requests above the ceiling
//!   get a dedicated extent or are rejected.
//! - `CLASSHEAP_TRACE_CAPACITY`: entries retained by the trace ring.
//! - `CLASSHEAP_SEARCH`: `first-fit` (default) or `best-fit`.
//! - `CLASSHEAP_CORRUPTION`: `report` (default) or `abort`.

use serde::{Deserialize, Serialize};

use crate::block::HEADER_SIZE;
use crate::error::ConfigError;
use crate::free_list::SearchPolicy;
use crate::size_class::{ALIGNMENT, MIN_SIZE, max_class_bound};
use crate::tracer::DEFAULT_TRACE_CAPACITY;

/// Default minimum extent size for the pooled path.
pub const DEFAULT_EXTENT_SIZE: usize = 64 * 1024;

/// Default small-allocation ceiling.
pub const DEFAULT_SMALL_CEILING: usize = 32 * 1024;

/// Default upper bound on a single request.
pub const DEFAULT_MAX_ALLOCATION: usize = 1024 * 1024 * 1024;

/// What the heap does after detecting a corrupted header or double free.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorruptionPolicy {
    /// Record the event and return the error to the caller.
    #[default]
    Report,
    /// Record the event and abort the process.
    Abort,
}

impl CorruptionPolicy {
    /// Parse from string (case-insensitive); unknown values map to `Report`.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" | "fatal" | "panic" | "crash" => Self::Abort,
            _ => Self::Report,
        }
    }

    #[must_use]
    pub const fn aborts(self) -> bool {
        matches!(self, Self::Abort)
    }
}

/// Tunables for a [`Heap`](crate::Heap).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapConfig {
    /// Minimum bytes requested from the source for each pooled extent.
    pub extent_size: usize,
    /// Requests above this take the large-block path.
    pub small_ceiling: usize,
    /// Requests above this fail with `AllocationTooLarge`.
    pub max_allocation: usize,
    /// Serve requests above `small_ceiling` with dedicated extents.
    pub large_blocks: bool,
    /// Entries retained by the trace ring.
    pub trace_capacity: usize,
    pub search: SearchPolicy,
    pub corruption_policy: CorruptionPolicy,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            extent_size: DEFAULT_EXTENT_SIZE,
            small_ceiling: DEFAULT_SMALL_CEILING,
            max_allocation: DEFAULT_MAX_ALLOCATION,
            large_blocks: true,
            trace_capacity: DEFAULT_TRACE_CAPACITY,
            search: SearchPolicy::default(),
            corruption_policy: CorruptionPolicy::default(),
        }
    }
}

fn parse_size(raw: &str) -> Option<usize> {
    let raw = raw.trim().to_ascii_lowercase();
    let (digits, scale) = if let Some(d) = raw.strip_suffix('k') {
        (d, 1024)
    } else if let Some(d) = raw.strip_suffix('m') {
        (d, 1024 * 1024)
    } else if let Some(d) = raw.strip_suffix('g') {
        (d, 1024 * 1024 * 1024)
    } else {
        (raw.as_str(), 1)
    };
    digits.trim().parse::<usize>().ok()?.checked_mul(scale)
}

fn parse_switch(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "on" | "true" | "yes" | "enabled" => Some(true),
        "0" | "off" | "false" | "no" | "disabled" => Some(false),
        _ => None,
    }
}

impl HeapConfig {
    /// Defaults overlaid with `CLASSHEAP_*` environment variables.
    ///
    /// Values that do not parse keep their default.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values produced by `lookup`.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let size = |key: &str| lookup(key).as_deref().and_then(parse_size);
        if let Some(v) = size("CLASSHEAP_EXTENT_SIZE") {
            config.extent_size = v;
        }
        if let Some(v) = size("CLASSHEAP_SMALL_CEILING") {
            config.small_ceiling = v;
        }
        if let Some(v) = size("CLASSHEAP_MAX_ALLOCATION") {
            config.max_allocation = v;
        }
        if let Some(v) = size("CLASSHEAP_TRACE_CAPACITY") {
            config.trace_capacity = v;
        }
        if let Some(v) = lookup("CLASSHEAP_LARGE_BLOCKS")
            .as_deref()
            .and_then(parse_switch)
        {
            config.large_blocks = v;
        }
        if let Some(v) = lookup("CLASSHEAP_SEARCH")
            .as_deref()
            .and_then(SearchPolicy::from_str_loose)
        {
            config.search = v;
        }
        if let Some(raw) = lookup("CLASSHEAP_CORRUPTION") {
            config.corruption_policy = CorruptionPolicy::from_str_loose(&raw);
        }
        config
    }

    /// Checks that the configuration describes a usable heap.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.trace_capacity == 0 {
            return Err(ConfigError::ZeroTraceCapacity);
        }
        if self.small_ceiling < MIN_SIZE
            || self.small_ceiling % ALIGNMENT != 0
            || self.small_ceiling > max_class_bound()
        {
            return Err(ConfigError::BadSmallCeiling {
                value: self.small_ceiling,
                alignment: ALIGNMENT,
                max: max_class_bound(),
            });
        }
        let min_extent = HEADER_SIZE + MIN_SIZE;
        if self.extent_size < min_extent {
            return Err(ConfigError::ExtentTooSmall {
                value: self.extent_size,
                min: min_extent,
            });
        }
        if self.max_allocation == 0 {
            return Err(ConfigError::ZeroMaxAllocation);
        }
        Ok(())
    }
}
