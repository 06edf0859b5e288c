//! Fixed-capacity allocation trace.
//!
//! Every allocate/free (and every rejected free or failed acquisition) is
//! recorded as a structured [`TraceEntry`]. Recording is O(1), never performs
//! I/O, and never fails: when the ring is full the oldest entry is dropped.

use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Identifier of the thread or subsystem that issued a request.
pub type RequesterId = u64;

/// Default number of entries retained by the trace ring.
pub const DEFAULT_TRACE_CAPACITY: usize = 1024;

static NEXT_REQUESTER: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static REQUESTER: Cell<RequesterId> = const { Cell::new(0) };
}

/// Returns the calling thread's requester id, assigning one on first use.
#[must_use]
pub fn current_requester() -> RequesterId {
    REQUESTER.with(|cell| {
        let id = cell.get();
        if id != 0 {
            return id;
        }
        let id = NEXT_REQUESTER.fetch_add(1, Ordering::Relaxed);
        cell.set(id);
        id
    })
}

/// Severity level of a trace entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Kind of heap event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceEvent {
    Alloc,
    Free,
    LargeAlloc,
    LargeFree,
    OutOfMemory,
    DoubleFree,
    CorruptedHeader,
    Trim,
    ReleaseFailed,
}

impl TraceEvent {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Alloc => "alloc",
            Self::Free => "free",
            Self::LargeAlloc => "large_alloc",
            Self::LargeFree => "large_free",
            Self::OutOfMemory => "out_of_memory",
            Self::DoubleFree => "double_free",
            Self::CorruptedHeader => "corrupted_header",
            Self::Trim => "trim",
            Self::ReleaseFailed => "release_failed",
        }
    }

    /// Level an event is recorded at.
    #[must_use]
    pub const fn level(self) -> TraceLevel {
        match self {
            Self::Alloc | Self::Free | Self::LargeAlloc | Self::LargeFree => TraceLevel::Trace,
            Self::Trim => TraceLevel::Info,
            Self::OutOfMemory | Self::DoubleFree => TraceLevel::Warn,
            Self::CorruptedHeader | Self::ReleaseFailed => TraceLevel::Error,
        }
    }

    /// Returns true for events that describe a completed allocate or free.
    #[must_use]
    pub const fn is_allocation_event(self) -> bool {
        matches!(
            self,
            Self::Alloc | Self::Free | Self::LargeAlloc | Self::LargeFree
        )
    }
}

/// One recorded heap event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEntry {
    /// Monotonic sequence number, starting at 1 for each heap.
    pub seq: u64,
    /// Nanoseconds since the heap was constructed.
    pub timestamp_ns: u64,
    pub requester_id: RequesterId,
    pub event: TraceEvent,
    pub level: TraceLevel,
    /// Payload address (extent base for trim events).
    pub ptr: usize,
    /// Bytes involved: requested size on allocate, block size on free.
    pub size: usize,
    /// Size class of the block, `None` on the large path.
    pub size_class: Option<usize>,
}

/// Ring buffer of the most recent trace entries.
#[derive(Debug)]
pub struct AllocationTracer {
    entries: VecDeque<TraceEntry>,
    capacity: usize,
    next_seq: u64,
    epoch: Instant,
}

impl AllocationTracer {
    /// Creates an empty tracer; a zero capacity is treated as one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            next_seq: 1,
            epoch: Instant::now(),
        }
    }

    /// Appends an event, evicting the oldest entry when full.
    pub fn record(
        &mut self,
        event: TraceEvent,
        ptr: usize,
        size: usize,
        size_class: Option<usize>,
        requester_id: RequesterId,
    ) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        let timestamp_ns = u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.entries.push_back(TraceEntry {
            seq,
            timestamp_ns,
            requester_id,
            event,
            level: event.level(),
            ptr,
            size,
            size_class,
        });
    }

    /// Copies the retained entries, oldest first.
    #[must_use]
    pub fn dump(&self) -> Vec<TraceEntry> {
        self.entries.iter().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total number of events ever recorded (including evicted ones).
    #[must_use]
    pub fn recorded(&self) -> u64 {
        self.next_seq - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_evicts_oldest_and_preserves_order() {
        let mut tracer = AllocationTracer::new(4);
        for i in 0..6 {
            tracer.record(TraceEvent::Alloc, 0x1000 + i * 16, 16, Some(0), 1);
        }
        let entries = tracer.dump();
        assert_eq!(entries.len(), 4);
        let seqs: Vec<u64> = entries.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5, 6]);
        assert_eq!(entries[0].ptr, 0x1000 + 2 * 16);
        assert_eq!(tracer.recorded(), 6);
        assert!(
            entries
                .windows(2)
                .all(|w| w[0].timestamp_ns <= w[1].timestamp_ns)
        );
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let mut tracer = AllocationTracer::new(0);
        tracer.record(TraceEvent::Free, 0x10, 16, Some(0), 1);
        tracer.record(TraceEvent::Free, 0x20, 16, Some(0), 1);
        assert_eq!(tracer.capacity(), 1);
        assert_eq!(tracer.dump()[0].ptr, 0x20);
    }

    #[test]
    fn levels_follow_event_kind() {
        let mut tracer = AllocationTracer::new(8);
        tracer.record(TraceEvent::Alloc, 0x10, 16, Some(0), 1);
        tracer.record(TraceEvent::DoubleFree, 0x10, 0, None, 1);
        tracer.record(TraceEvent::CorruptedHeader, 0x20, 0, None, 1);
        tracer.record(TraceEvent::Trim, 0x0, 4096, None, 1);
        let levels: Vec<_> = tracer.dump().iter().map(|e| e.level).collect();
        assert_eq!(
            levels,
            vec![
                TraceLevel::Trace,
                TraceLevel::Warn,
                TraceLevel::Error,
                TraceLevel::Info
            ]
        );
    }

    #[test]
    fn requester_ids_are_per_thread() {
        let here = current_requester();
        assert_ne!(here, 0);
        assert_eq!(here, current_requester());
        let there = std::thread::spawn(current_requester).join().unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn entries_serialize_with_snake_case_events() {
        let mut tracer = AllocationTracer::new(2);
        tracer.record(TraceEvent::LargeAlloc, 0x40, 65536, None, 9);
        let json = serde_json::to_value(&tracer.dump()[0]).unwrap();
        assert_eq!(json["event"], "large_alloc");
        assert_eq!(json["level"], "trace");
        assert_eq!(json["requester_id"], 9);
        assert!(json["size_class"].is_null());
        assert_eq!(TraceEvent::LargeAlloc.as_str(), "large_alloc");
    }
}
