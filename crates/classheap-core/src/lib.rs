//! # classheap-core
//!
//! Thread-safe, size-classed heap allocator in safe Rust.
//!
//! Requests are rounded to a 16-byte granularity and served from 32
//! segregated free lists. Oversized free blocks are split, freed blocks are
//! merged with free physical neighbors, and requests above the small ceiling
//! get a dedicated extent. Every operation is recorded in a bounded trace and
//! in lock-free statistics.
//!
//! Raw memory comes from an [`ExtentSource`]. This crate ships a logical
//! [`SimulatedExtentSource`]; `classheap-sys` provides one backed by `mmap`.
//! No `unsafe` code is permitted at the crate level.

#![deny(unsafe_code)]

pub mod block;
pub mod coalesce;
pub mod config;
pub mod error;
pub mod extent;
pub mod free_list;
pub mod heap;
pub mod integrity;
pub mod large;
pub mod report;
pub mod size_class;
pub mod stats;
pub mod tracer;

pub use block::HEADER_SIZE;
pub use config::{CorruptionPolicy, HeapConfig};
pub use error::{ConfigError, ExtentError, HeapError, IntegrityError};
pub use extent::{
    Extent, ExtentSource, PAGE_SIZE, REFUSED_RELEASE_ERRNO, SimulatedExtentSource, SourceLedger,
};
pub use free_list::SearchPolicy;
pub use heap::Heap;
pub use integrity::IntegrityReport;
pub use report::{HeapReport, write_trace_jsonl};
pub use size_class::{ALIGNMENT, MIN_SIZE, NUM_SIZE_CLASSES, bin_index, class_index};
pub use stats::{ClassStats, StatsSnapshot};
pub use tracer::{RequesterId, TraceEntry, TraceEvent, TraceLevel, current_requester};
