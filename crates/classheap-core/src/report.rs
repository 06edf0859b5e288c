//! JSON export of heap diagnostics.
//!
//! [`HeapReport`] bundles everything an operator needs to inspect a heap in
//! one document; [`write_trace_jsonl`] streams trace entries one JSON object
//! per line.

use std::io::Write;

use serde::{Deserialize, Serialize};

use crate::config::HeapConfig;
use crate::stats::StatsSnapshot;
use crate::tracer::TraceEntry;

/// Point-in-time diagnostic bundle produced by [`Heap::report`](crate::Heap::report).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapReport {
    pub config: HeapConfig,
    pub used_bytes: usize,
    pub total_bytes: usize,
    pub free_blocks: usize,
    pub large_blocks: usize,
    pub pooled_extents: usize,
    /// Extents the source refused to take back, awaiting a retry.
    pub stranded_extents: usize,
    pub stats: StatsSnapshot,
    pub trace: Vec<TraceEntry>,
}

impl HeapReport {
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Writes the retained trace as JSONL.
    pub fn write_trace<W: Write>(&self, writer: W) -> std::io::Result<usize> {
        write_trace_jsonl(&self.trace, writer)
    }
}

/// Emits one JSON object per entry, newline terminated.
///
/// Returns the number of lines written.
pub fn write_trace_jsonl<W: Write>(entries: &[TraceEntry], mut writer: W) -> std::io::Result<usize> {
    for entry in entries {
        let line = serde_json::to_string(entry).map_err(std::io::Error::other)?;
        writeln!(writer, "{line}")?;
    }
    writer.flush()?;
    Ok(entries.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Heap, HeapConfig};

    #[test]
    fn report_serializes_to_json() {
        let heap = Heap::simulated(HeapConfig::default()).unwrap();
        let ptr = heap.allocate(64).unwrap();
        heap.free(ptr).unwrap();
        let report = heap.report();
        assert_eq!(report.trace.len(), 2);
        assert_eq!(report.pooled_extents, 1);

        let json = report.to_json_pretty().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["used_bytes"], 0);
        assert_eq!(parsed["config"]["search"], "first_fit");
        assert_eq!(parsed["stats"]["total_allocations"], 1);
        assert_eq!(parsed["trace"][1]["event"], "free");

        let back: HeapReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back, report);
    }

    #[test]
    fn trace_jsonl_has_one_object_per_line() {
        let heap = Heap::simulated(HeapConfig::default()).unwrap();
        for size in [16, 32, 48] {
            heap.allocate(size).unwrap();
        }
        let mut out = Vec::new();
        let written = heap.report().write_trace(&mut out).unwrap();
        assert_eq!(written, 3);

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        for (line, size) in lines.iter().zip([16, 32, 48]) {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(value["event"], "alloc");
            assert_eq!(value["level"], "trace");
            assert_eq!(value["size"], size);
        }
    }
}
