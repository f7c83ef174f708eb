//! Quarantine budget enforcement seen from the heap manager: eviction order,
//! shrinking at runtime, resharding, and heap teardown.

use shadowguard::block::user_pointer_to_block_info;
use shadowguard::{BlockState, Parameters, RecordingSink, Runtime};
use std::ptr::NonNull;
use std::sync::Arc;

const WINDOW: usize = 32 << 20;

fn runtime(options: &str) -> (Runtime, Arc<RecordingSink>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let params =
        Parameters::parse(&format!("--shadow_window_size={WINDOW} {options}")).unwrap();
    let sink = Arc::new(RecordingSink::new());
    let rt = Runtime::with_sink(params, sink.clone()).unwrap();
    (rt, sink)
}

/// Footprint of a block holding `bytes` with the runtime's parameters.
fn block_size(rt: &Runtime, bytes: usize) -> usize {
    let p = rt.allocate(bytes).unwrap();
    let size = user_pointer_to_block_info(rt.shadow(), p.as_ptr() as usize)
        .unwrap()
        .block_size;
    rt.free(p.as_ptr()).unwrap();
    rt.manager().flush_quarantine();
    size
}

fn state_of(rt: &Runtime, p: NonNull<u8>) -> Option<BlockState> {
    user_pointer_to_block_info(rt.shadow(), p.as_ptr() as usize)
        .and_then(|info| unsafe { info.header() }.state())
}

// ---------------------------------------------------------------------------
// Eviction order
// ---------------------------------------------------------------------------

#[test]
fn oldest_block_leaves_first() {
    let (rt, sink) = runtime("--sharding_factor=1");
    let bs = block_size(&rt, 100);
    let mut params = rt.manager().parameters();
    params.quarantine_size = 3 * bs;
    rt.manager().set_parameters(params).unwrap();

    let ptrs: Vec<_> = (0..4).map(|_| rt.allocate(100).unwrap()).collect();
    for p in &ptrs {
        rt.free(p.as_ptr()).unwrap();
    }
    assert_eq!(rt.manager().quarantine_len(), 3);
    assert_eq!(rt.manager().quarantine_size(), 3 * bs);

    // The evicted block is addressable again; the others stay quarantined.
    assert!(rt.shadow().is_range_accessible(ptrs[0].as_ptr() as usize, 100));
    for p in &ptrs[1..] {
        assert!(!rt.shadow().is_accessible(p.as_ptr() as usize));
        assert_eq!(state_of(&rt, *p), Some(BlockState::Quarantined));
    }
    assert!(sink.is_empty());
}

#[test]
fn shrinking_by_one_block_evicts_exactly_the_oldest() {
    const N: usize = 5;
    let (rt, sink) = runtime("--sharding_factor=1");
    let bs = block_size(&rt, 64);
    let mut params = rt.manager().parameters();
    params.quarantine_size = N * bs;
    rt.manager().set_parameters(params.clone()).unwrap();

    let ptrs: Vec<_> = (0..N).map(|_| rt.allocate(64).unwrap()).collect();
    for p in &ptrs {
        rt.free(p.as_ptr()).unwrap();
    }
    assert_eq!(rt.manager().quarantine_len(), N);

    params.quarantine_size = (N - 1) * bs;
    rt.manager().set_parameters(params).unwrap();
    assert_eq!(rt.manager().quarantine_len(), N - 1);
    assert!(rt.manager().quarantine_size() <= (N - 1) * bs);
    assert!(rt.shadow().is_accessible(ptrs[0].as_ptr() as usize));
    for p in &ptrs[1..] {
        assert_eq!(state_of(&rt, *p), Some(BlockState::Quarantined));
    }
    assert!(sink.is_empty());
}

#[test]
fn zero_budget_flushes_and_bypasses() {
    let (rt, _sink) = runtime("");
    for _ in 0..16 {
        let p = rt.allocate(48).unwrap();
        rt.free(p.as_ptr()).unwrap();
    }
    assert_eq!(rt.manager().quarantine_len(), 16);

    let mut params = rt.manager().parameters();
    params.quarantine_size = 0;
    rt.manager().set_parameters(params).unwrap();
    assert_eq!(rt.manager().quarantine_len(), 0);
    assert_eq!(rt.manager().quarantine_size(), 0);

    let p = rt.allocate(48).unwrap();
    rt.free(p.as_ptr()).unwrap();
    assert_eq!(rt.manager().quarantine_len(), 0);
    assert!(rt.shadow().is_accessible(p.as_ptr() as usize));
}

#[test]
fn aggregate_size_never_exceeds_the_budget() {
    let (rt, sink) = runtime("--sharding_factor=4 --quarantine_size=65536");
    let budget = rt.manager().parameters().quarantine_size;
    for i in 0..500 {
        let p = rt.allocate(16 + (i * 37) % 900).unwrap();
        rt.free(p.as_ptr()).unwrap();
        assert!(rt.manager().quarantine_size() <= budget);
    }
    assert!(rt.manager().quarantine_len() > 0);
    assert!(sink.is_empty());
}

#[test]
fn blocks_above_the_object_limit_are_released_at_once() {
    let (rt, _sink) = runtime("--quarantine_block_size=1024");
    let big = rt.allocate(4096).unwrap();
    rt.free(big.as_ptr()).unwrap();
    assert_eq!(rt.manager().quarantine_len(), 0);

    let small = rt.allocate(256).unwrap();
    rt.free(small.as_ptr()).unwrap();
    assert_eq!(rt.manager().quarantine_len(), 1);
}

// ---------------------------------------------------------------------------
// Resharding
// ---------------------------------------------------------------------------

#[test]
fn resharding_keeps_quarantined_blocks() {
    let (rt, sink) = runtime("--sharding_factor=4");
    let ptrs: Vec<_> = (0..32).map(|_| rt.allocate(128).unwrap()).collect();
    for p in &ptrs {
        rt.free(p.as_ptr()).unwrap();
    }
    let held = rt.manager().quarantine_size();

    let mut params = rt.manager().parameters();
    params.sharding_factor = 8;
    rt.manager().set_parameters(params).unwrap();
    assert_eq!(rt.manager().quarantine_len(), 32);
    assert_eq!(rt.manager().quarantine_size(), held);
    for p in &ptrs {
        assert_eq!(state_of(&rt, *p), Some(BlockState::Quarantined));
    }

    // Still the same blocks: a second free is a double free, not a crash.
    assert!(rt.free(ptrs[0].as_ptr()).is_err());
    assert_eq!(sink.len(), 1);
}

// ---------------------------------------------------------------------------
// Heap teardown
// ---------------------------------------------------------------------------

#[test]
fn destroying_a_heap_spares_other_heaps_quarantine() {
    let (rt, sink) = runtime("");
    let manager = rt.manager();
    let a = manager.create_heap();
    let b = manager.create_heap();

    let a_freed: Vec<_> = (0..4).map(|_| manager.allocate(a, 80).unwrap()).collect();
    let b_freed: Vec<_> = (0..3).map(|_| manager.allocate(b, 80).unwrap()).collect();
    let a_live = manager.allocate(a, 80).unwrap();
    for p in &a_freed {
        manager.free(a, p.as_ptr()).unwrap();
    }
    for p in &b_freed {
        manager.free(b, p.as_ptr()).unwrap();
    }
    assert_eq!(manager.quarantine_len(), 7);

    manager.destroy_heap(a).unwrap();
    assert_eq!(manager.quarantine_len(), 3);
    assert!(!manager.heap_ids().contains(&a));
    assert!(rt.shadow().is_accessible(a_live.as_ptr() as usize));
    for p in &a_freed {
        assert!(rt.shadow().is_accessible(p.as_ptr() as usize));
    }
    for p in &b_freed {
        assert_eq!(state_of(&rt, *p), Some(BlockState::Quarantined));
    }
    assert!(manager.destroy_heap(a).is_err());
    assert!(manager.allocate(a, 8).is_err());

    manager.flush_quarantine();
    assert_eq!(manager.quarantine_len(), 0);
    manager.destroy_heap(b).unwrap();
    assert!(sink.is_empty());
}
