//! Ephemeron Marking Integration Tests
//!
//! Runs full collections over heaps whose liveness depends on ephemeron
//! tables and checks which objects survive. The fixpoint and the linear
//! ephemeron algorithms must agree on every graph.

use core_types::{Address, Tagged};
use mark_compact::{Heap, HeapConfig, MarkCompactCollector, ObjectKind, SpaceKind};
use std::sync::Arc;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn non_moving() -> HeapConfig {
    HeapConfig {
        compact: false,
        ..HeapConfig::single_threaded()
    }
}

fn plain(heap: &Heap, fields: usize) -> Address {
    heap.allocate(SpaceKind::Old, ObjectKind::Plain, fields, 0)
        .expect("allocation failed")
}

fn table(heap: &Heap, entries: &[(Address, Address)]) -> Address {
    let table = heap
        .allocate(SpaceKind::Old, ObjectKind::EphemeronTable, 2 * entries.len(), 0)
        .expect("allocation failed");
    for (index, &(key, value)) in entries.iter().enumerate() {
        heap.write_field(table, 2 * index, Tagged::strong(key)).unwrap();
        heap.write_field(table, 2 * index + 1, Tagged::strong(value)).unwrap();
    }
    table
}

fn survives(heap: &Heap, address: Address) -> bool {
    heap.try_object(address).is_some()
}

/// Test: a value is not retained by an unreachable key
#[test]
fn test_scenario_b_unreachable_key_retains_nothing() {
    init_logging();
    let heap = Heap::new(non_moving());
    let key = plain(&heap, 0);
    let value = plain(&heap, 0);
    let table = table(&heap, &[(key, value)]);
    let _root = heap.roots().new_handle(Tagged::strong(table));

    let mut collector = MarkCompactCollector::new(Arc::clone(&heap));
    collector.collect_garbage().unwrap();
    heap.ensure_sweeping_completed();

    assert!(survives(&heap, table));
    assert!(!survives(&heap, key), "key is unreachable");
    assert!(!survives(&heap, value), "value must not be retained by a dead key");
    assert_eq!(heap.read_field(table, 0).unwrap(), Tagged::HOLE);
    assert_eq!(heap.read_field(table, 1).unwrap(), Tagged::HOLE);
}

/// Test: liveness propagates along a chain of ephemerons in one cycle
#[test]
fn test_scenario_c_ephemeron_chain() {
    init_logging();
    let heap = Heap::new(non_moving());
    let a = plain(&heap, 0);
    let b = plain(&heap, 0);
    let c = plain(&heap, 0);
    let dead_key = plain(&heap, 0);
    let dead_value = plain(&heap, 0);
    // B -> C comes first so resolving it needs the A -> B entry.
    let table = table(&heap, &[(b, c), (a, b), (dead_key, dead_value)]);
    let _roots = [
        heap.roots().new_handle(Tagged::strong(table)),
        heap.roots().new_handle(Tagged::strong(a)),
    ];

    let mut collector = MarkCompactCollector::new(Arc::clone(&heap));
    let stats = collector.collect_garbage().unwrap();
    heap.ensure_sweeping_completed();

    assert!(stats.ephemeron_iterations >= 1);
    for address in [a, b, c] {
        assert!(survives(&heap, address), "{address} must survive");
    }
    assert!(!survives(&heap, dead_key));
    assert!(!survives(&heap, dead_value));
    assert_eq!(heap.read_field(table, 0).unwrap(), Tagged::strong(b));
    assert_eq!(heap.read_field(table, 1).unwrap(), Tagged::strong(c));
}

struct Graph {
    heap: Arc<Heap>,
    nodes: Vec<Address>,
}

/// Builds the same graph in a fresh heap: a reversed ephemeron chain of
/// `length` hops whose values hold a strong child, plus dead pairs and a
/// second chain whose head is unreachable.
fn build_graph(config: HeapConfig, length: usize) -> Graph {
    let heap = Heap::new(config);
    let mut nodes = Vec::new();
    let live_chain: Vec<Address> = (0..=length).map(|_| plain(&heap, 1)).collect();
    let dead_chain: Vec<Address> = (0..=length).map(|_| plain(&heap, 1)).collect();
    for chain in [&live_chain, &dead_chain] {
        for &node in chain.iter() {
            let child = plain(&heap, 0);
            heap.write_field(node, 0, Tagged::strong(child)).unwrap();
            nodes.push(child);
        }
        nodes.extend(chain.iter().copied());
    }
    let mut entries = Vec::new();
    for chain in [&live_chain, &dead_chain] {
        for i in (0..length).rev() {
            entries.push((chain[i], chain[i + 1]));
        }
    }
    let table = table(&heap, &entries);
    heap.roots().add_strong_root(Tagged::strong(table));
    heap.roots().add_strong_root(Tagged::strong(live_chain[0]));
    Graph { heap, nodes }
}

fn surviving_nodes(config: HeapConfig) -> (Vec<bool>, bool) {
    let graph = build_graph(config, 12);
    let mut collector = MarkCompactCollector::new(Arc::clone(&graph.heap));
    let stats = collector.collect_garbage().unwrap();
    graph.heap.ensure_sweeping_completed();
    let live = graph.nodes.iter().map(|&n| survives(&graph.heap, n)).collect();
    (live, stats.linear_ephemeron_fallback)
}

/// Test: fixpoint and linear ephemeron marking produce the same live set
#[test]
fn test_fixpoint_and_linear_agree() {
    init_logging();
    let (fixpoint, fixpoint_fell_back) = surviving_nodes(HeapConfig {
        ephemeron_fixpoint_iterations: 64,
        ..non_moving()
    });
    let (linear, linear_fell_back) = surviving_nodes(HeapConfig {
        ephemeron_fixpoint_iterations: 0,
        ..non_moving()
    });
    let (overflowed, _) = surviving_nodes(HeapConfig {
        ephemeron_fixpoint_iterations: 1,
        newly_discovered_capacity: 1,
        ..non_moving()
    });

    assert!(!fixpoint_fell_back);
    assert!(linear_fell_back);
    assert_eq!(fixpoint, linear);
    assert_eq!(fixpoint, overflowed);
    let live = fixpoint.iter().filter(|&&l| l).count();
    assert_eq!(live, fixpoint.len() / 2, "exactly the rooted chain survives");
}

/// Test: ephemerons keep working when marking started incrementally
#[test]
fn test_incremental_cycle_resolves_ephemerons() {
    init_logging();
    let heap = Heap::new(non_moving());
    let key = plain(&heap, 0);
    let value = plain(&heap, 0);
    let table = table(&heap, &[(key, value)]);
    let _table_root = heap.roots().new_handle(Tagged::strong(table));
    let holder = plain(&heap, 1);
    let _holder_root = heap.roots().new_handle(Tagged::strong(holder));

    let mut collector = MarkCompactCollector::new(Arc::clone(&heap));
    collector.start_incremental_marking().unwrap();
    while !collector.incremental_marking_step().unwrap() {}
    // The key becomes reachable only after the incremental steps finished.
    heap.write_field(holder, 0, Tagged::strong(key)).unwrap();
    collector.collect_garbage().unwrap();
    heap.ensure_sweeping_completed();

    assert!(survives(&heap, key));
    assert!(survives(&heap, value));
}
