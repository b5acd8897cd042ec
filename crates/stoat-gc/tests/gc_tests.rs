//! Collector behavior over randomly generated object graphs.

use proptest::prelude::*;

use stoat_gc::{GcConfig, Heap, Ref, Trace};

/// A graph node carrying a payload we can check after collections.
struct Node {
    payload: u64,
    edges: Vec<Ref>,
}

impl Trace for Node {
    fn trace(&self, tracer: &mut dyn FnMut(Ref)) {
        for &edge in &self.edges {
            tracer(edge);
        }
    }
    fn byte_size(&self) -> usize {
        48 + self.edges.len() * 4
    }
}

fn test_heap() -> Heap<Node> {
    Heap::with_config(GcConfig {
        young_threshold: 2 * 1024,
        old_threshold: 16 * 1024,
        old_growth_factor: 1.5,
        promotion_age: 1,
        max_heap_bytes: 8 * 1024 * 1024,
    })
    .unwrap()
}

/// Build a random graph: `n` nodes, each with edges to earlier nodes.
/// Returns the handles in allocation order.
fn build_graph(heap: &mut Heap<Node>, n: usize, edge_picks: &[usize]) -> Vec<Ref> {
    let mut handles: Vec<Ref> = Vec::with_capacity(n);
    let mut pick = edge_picks.iter().cycle();
    for i in 0..n {
        let mut edges = Vec::new();
        if i > 0 {
            let count = *pick.next().unwrap() % 3;
            for _ in 0..count {
                edges.push(handles[*pick.next().unwrap() % i]);
            }
        }
        let handle = heap
            .alloc(Node {
                payload: i as u64,
                edges,
            })
            .unwrap();
        handles.push(handle);
    }
    handles
}

/// Every node reachable from `root`, by graph walk over handles.
fn reachable(heap: &Heap<Node>, root: Ref) -> Vec<Ref> {
    let mut seen = vec![root];
    let mut queue = vec![root];
    while let Some(handle) = queue.pop() {
        let node = heap.get(handle).expect("reachable handle must be live");
        for &edge in &node.edges {
            if !seen.contains(&edge) {
                seen.push(edge);
                queue.push(edge);
            }
        }
    }
    seen
}

proptest! {
    /// GC safety: any number of minor/major collections leaves every
    /// live handle dereferenceable with its payload unchanged.
    #[test]
    fn collections_never_invalidate_live_refs(
        n in 1usize..40,
        edge_picks in prop::collection::vec(0usize..64, 8..32),
        passes in prop::collection::vec(prop::bool::ANY, 1..6),
    ) {
        let mut heap = test_heap();
        let handles = build_graph(&mut heap, n, &edge_picks);
        let root = handles[n - 1];

        let live_before = reachable(&heap, root);
        let payloads: Vec<u64> =
            live_before.iter().map(|&h| heap.get(h).unwrap().payload).collect();

        for &major in &passes {
            if major {
                heap.collect_major(&[root]);
            } else {
                heap.collect_minor(&[root]);
            }

            for (&handle, &payload) in live_before.iter().zip(&payloads) {
                let node = heap.get(handle);
                prop_assert!(node.is_some(), "live handle freed by collection");
                prop_assert_eq!(node.unwrap().payload, payload);
            }
        }
    }

    /// GC liveness: with no roots at all, a major collection reclaims
    /// the entire graph.
    #[test]
    fn unreachable_graphs_are_reclaimed(
        n in 1usize..40,
        edge_picks in prop::collection::vec(0usize..64, 8..32),
    ) {
        let mut heap = test_heap();
        build_graph(&mut heap, n, &edge_picks);

        heap.collect_major(&[]);
        prop_assert_eq!(heap.live_objects(), 0);
    }
}

#[test]
fn interleaved_mutation_and_collection() {
    let mut heap = test_heap();
    let root = heap
        .alloc(Node {
            payload: 0,
            edges: Vec::new(),
        })
        .unwrap();
    heap.add_root(root);

    // Grow a list off the root, collecting as the heap fills; barriered
    // stores keep every appended node alive.
    let mut cursor = root;
    for i in 1..200u64 {
        let next = heap
            .alloc(Node {
                payload: i,
                edges: Vec::new(),
            })
            .unwrap();
        heap.get_mut(cursor).unwrap().edges.push(next);
        heap.write_barrier(cursor, next);
        cursor = next;

        if heap.wants_minor() {
            heap.collect_minor(&[cursor]);
        }
    }

    // Walk the list and check payload continuity.
    let mut handle = root;
    let mut expected = 0u64;
    loop {
        let node = heap.get(handle).expect("list node freed");
        assert_eq!(node.payload, expected);
        match node.edges.first() {
            Some(&next) => {
                handle = next;
                expected += 1;
            }
            None => break,
        }
    }
    assert_eq!(expected, 199);

    // Dropping the root releases the whole list.
    heap.remove_root(root);
    heap.collect_major(&[]);
    assert_eq!(heap.live_objects(), 0);
}
