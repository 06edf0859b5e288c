//! Shared workloads for the classheap benchmarks.

use classheap_core::{ExtentSource, Heap, HeapError};

/// Deterministic xorshift generator for reproducible workloads.
#[derive(Clone, Copy, Debug)]
pub struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            state: seed.max(1),
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    /// Uniform value in `low..=high`.
    pub fn gen_range(&mut self, low: usize, high: usize) -> usize {
        let span = high.saturating_sub(low).saturating_add(1);
        low + (self.next_u64() % span as u64) as usize
    }
}

/// Allocates `count` blocks of `size` bytes, then frees them in order.
pub fn burst<S: ExtentSource>(heap: &Heap<S>, count: usize, size: usize) -> Result<(), HeapError> {
    let ptrs = (0..count)
        .map(|_| heap.allocate(size))
        .collect::<Result<Vec<_>, _>>()?;
    for ptr in ptrs {
        heap.free(ptr)?;
    }
    Ok(())
}

/// Random allocate/free mix over a bounded live set, then frees the rest.
///
/// Returns the number of operations performed.
pub fn churn<S: ExtentSource>(
    heap: &Heap<S>,
    rng: &mut XorShift64,
    ops: usize,
    max_live: usize,
    max_size: usize,
) -> Result<usize, HeapError> {
    let mut live = Vec::with_capacity(max_live);
    for _ in 0..ops {
        let grow = live.is_empty() || (live.len() < max_live && rng.next_u64() % 2 == 0);
        if grow {
            live.push(heap.allocate(rng.gen_range(1, max_size))?);
        } else {
            let victim = rng.gen_range(0, live.len() - 1);
            heap.free(live.swap_remove(victim))?;
        }
    }
    let remaining = live.len();
    for ptr in live {
        heap.free(ptr)?;
    }
    Ok(ops + remaining)
}

/// Allocates a run of neighbors and frees every other one first, so the
/// second pass merges in both directions.
pub fn coalesce_run<S: ExtentSource>(
    heap: &Heap<S>,
    count: usize,
    size: usize,
) -> Result<(), HeapError> {
    let ptrs = (0..count)
        .map(|_| heap.allocate(size))
        .collect::<Result<Vec<_>, _>>()?;
    for ptr in ptrs.iter().step_by(2) {
        heap.free(*ptr)?;
    }
    for ptr in ptrs.iter().skip(1).step_by(2) {
        heap.free(*ptr)?;
    }
    Ok(())
}
