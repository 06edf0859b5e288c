//! Deterministic allocate/free sequences with full invariant checks.

use classheap_core::{
    ALIGNMENT, Heap, HeapConfig, HeapError, SearchPolicy, SimulatedExtentSource, bin_index,
};

#[derive(Clone, Copy, Debug)]
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn gen_range(&mut self, low: usize, high_inclusive: usize) -> usize {
        assert!(low <= high_inclusive);
        let span = high_inclusive - low + 1;
        low + (self.next_u64() as usize % span)
    }
}

#[derive(Clone, Copy, Debug)]
struct Live {
    ptr: usize,
    requested: usize,
    usable: usize,
}

fn assert_no_overlap(live: &[Live]) {
    let mut ranges: Vec<(usize, usize)> = live.iter().map(|l| (l.ptr, l.ptr + l.usable)).collect();
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        assert!(
            pair[0].1 <= pair[1].0,
            "live ranges overlap: {:#x}..{:#x} and {:#x}..{:#x}",
            pair[0].0,
            pair[0].1,
            pair[1].0,
            pair[1].1
        );
    }
}

fn run_sequence(heap: &Heap, seed: u64, ops: usize, max_size: usize) {
    let mut rng = XorShift64::new(seed);
    let mut live: Vec<Live> = Vec::new();

    for step in 0..ops {
        let allocate = live.is_empty() || rng.gen_range(0, 99) < 55;
        if allocate {
            let requested = rng.gen_range(1, max_size);
            let ptr = heap.allocate(requested).unwrap();
            assert_eq!(ptr % ALIGNMENT, 0);
            let usable = heap.usable_size(ptr).unwrap();
            assert!(usable >= requested);
            live.push(Live {
                ptr,
                requested,
                usable,
            });
        } else {
            let victim = live.swap_remove(rng.gen_range(0, live.len() - 1));
            heap.free(victim.ptr).unwrap();
            assert_eq!(heap.usable_size(victim.ptr), None);
        }

        let report = heap
            .check_integrity()
            .unwrap_or_else(|err| panic!("seed {seed} step {step}: {err}"));
        let expected_used: usize = live.iter().map(|l| l.usable).sum();
        assert_eq!(report.used_bytes, expected_used);
        assert_eq!(heap.used_bytes(), expected_used);
        assert!(heap.used_bytes() <= heap.total_bytes());
        assert_no_overlap(&live);
    }

    for entry in live.drain(..) {
        assert!(entry.usable >= entry.requested);
        heap.free(entry.ptr).unwrap();
    }
    let report = heap.check_integrity().unwrap();
    assert_eq!(report.used_bytes, 0);
    assert_eq!(report.large_blocks, 0);
}

#[test]
fn first_fit_sequences_hold_invariants() {
    for seed in [0x9E37_79B9_7F4A_7C15, 0xDEAD_BEEF, 42] {
        let heap = Heap::simulated(HeapConfig {
            extent_size: 8192,
            ..HeapConfig::default()
        })
        .unwrap();
        run_sequence(&heap, seed, 600, 2048);
    }
}

#[test]
fn best_fit_sequences_hold_invariants() {
    let heap = Heap::simulated(HeapConfig {
        extent_size: 8192,
        search: SearchPolicy::BestFit,
        ..HeapConfig::default()
    })
    .unwrap();
    run_sequence(&heap, 0x1234_5678_9ABC_DEF1, 600, 2048);
}

#[test]
fn mixed_large_and_pooled_sequences_hold_invariants() {
    let heap = Heap::simulated(HeapConfig {
        extent_size: 16 * 1024,
        small_ceiling: 4096,
        ..HeapConfig::default()
    })
    .unwrap();
    run_sequence(&heap, 0x0BAD_F00D, 400, 12_000);
    assert!(heap.snapshot_stats().large.allocations > 0);
}

#[test]
fn full_release_coalesces_every_extent() {
    let source = SimulatedExtentSource::new();
    let ledger = source.ledger();
    let heap = Heap::new(
        HeapConfig {
            extent_size: 4096,
            ..HeapConfig::default()
        },
        source,
    )
    .unwrap();
    let mut rng = XorShift64::new(7);
    let mut ptrs: Vec<usize> = (0..300)
        .map(|_| heap.allocate(rng.gen_range(1, 512)).unwrap())
        .collect();
    // Free in a scrambled order to exercise both merge directions.
    for i in (1..ptrs.len()).rev() {
        ptrs.swap(i, rng.gen_range(0, i));
    }
    for ptr in ptrs {
        heap.free(ptr).unwrap();
    }

    let report = heap.check_integrity().unwrap();
    assert_eq!(report.free_blocks, report.extents);
    assert_eq!(report.blocks, report.extents);
    assert!(heap.snapshot_stats().coalesces > 0);

    let released = heap.trim().unwrap();
    assert_eq!(released, report.total_bytes);
    assert_eq!(ledger.live_extents(), 0);
    assert_eq!(heap.total_bytes(), 0);
}

#[test]
fn repeated_frees_never_corrupt_state() {
    let heap = Heap::simulated(HeapConfig {
        extent_size: 4096,
        ..HeapConfig::default()
    })
    .unwrap();
    let mut rng = XorShift64::new(99);
    let mut freed = Vec::new();
    let mut live = Vec::new();
    for _ in 0..200 {
        live.push(heap.allocate(rng.gen_range(1, 300)).unwrap());
    }
    for _ in 0..100 {
        let ptr = live.swap_remove(rng.gen_range(0, live.len() - 1));
        heap.free(ptr).unwrap();
        freed.push(ptr);
    }
    for &ptr in &freed {
        let err = heap.free(ptr).unwrap_err();
        assert!(err.is_corruption(), "{err}");
        assert!(matches!(err, HeapError::DoubleFree { .. }));
    }
    heap.check_integrity().unwrap();
    assert_eq!(heap.snapshot_stats().double_frees, freed.len() as u64);

    for ptr in live {
        heap.free(ptr).unwrap();
    }
    heap.check_integrity().unwrap();
}

#[test]
fn size_class_index_is_monotonic() {
    let mut rng = XorShift64::new(3);
    for _ in 0..10_000 {
        let a = rng.gen_range(1, 2 << 20);
        let b = rng.gen_range(1, 2 << 20);
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        assert!(bin_index(lo) <= bin_index(hi), "{lo} vs {hi}");
    }
}
