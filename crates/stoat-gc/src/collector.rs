//! Minor and major collection passes
//!
//! Minor passes trace the young subgraph from roots plus the remembered
//! set and promote survivors. Major passes trace the whole heap and
//! rebuild the remembered set as a side effect of marking. Both use
//! tricolor marking with an explicit worklist, so cyclic graphs terminate.

use std::time::Instant;

use crate::heap::{Heap, Slot};
use crate::object::{Color, Generation, Ref, Trace};

impl<T: Trace> Heap<T> {
    #[inline]
    fn slot(&self, handle: Ref) -> Option<&Slot<T>> {
        self.slots.get(handle.index() as usize)?.as_ref()
    }

    fn is_live_young(&self, handle: Ref) -> bool {
        matches!(self.slot(handle), Some(slot) if slot.header.is_young())
    }

    /// Gray a live young slot and push it on the worklist.
    fn mark_young(&mut self, handle: Ref, worklist: &mut Vec<u32>) {
        let index = handle.index() as usize;
        if let Some(Some(slot)) = self.slots.get_mut(index)
            && slot.header.is_young()
            && slot.header.color == Color::White
        {
            slot.header.color = Color::Gray;
            worklist.push(handle.index());
        }
    }

    /// Gray any live slot and push it on the worklist.
    fn mark_any(&mut self, handle: Ref, worklist: &mut Vec<u32>) {
        let index = handle.index() as usize;
        if let Some(Some(slot)) = self.slots.get_mut(index)
            && slot.header.color == Color::White
        {
            slot.header.color = Color::Gray;
            worklist.push(handle.index());
        }
    }

    /// Run a minor collection.
    ///
    /// `roots` are the caller's live handles (evaluator stacks, frames);
    /// pinned and external roots are gathered automatically. Old objects
    /// are a trace boundary: their young edges are covered by the
    /// remembered set, which the write barrier and promotion scans keep
    /// complete.
    pub fn collect_minor(&mut self, roots: &[Ref]) {
        let start = Instant::now();
        self.stats.minor_collections += 1;

        let all_roots = self.gather_roots(roots);
        let mut worklist: Vec<u32> = Vec::new();
        let mut scratch: Vec<Ref> = Vec::new();

        for root in all_roots {
            self.mark_young(root, &mut worklist);
        }

        // Each remembered old source is re-traced one level; its young
        // children join the root set.
        for source in self.remembered.sources() {
            scratch.clear();
            match self.slot(source) {
                Some(slot) => slot.value.trace(&mut |r| scratch.push(r)),
                None => continue,
            }
            for index in 0..scratch.len() {
                self.mark_young(scratch[index], &mut worklist);
            }
        }

        // Drain the gray worklist across the young subgraph.
        while let Some(index) = worklist.pop() {
            scratch.clear();
            if let Some(Some(slot)) = self.slots.get(index as usize) {
                slot.value.trace(&mut |r| scratch.push(r));
            }
            for child_index in 0..scratch.len() {
                self.mark_young(scratch[child_index], &mut worklist);
            }
            if let Some(Some(slot)) = self.slots.get_mut(index as usize) {
                slot.header.color = Color::Black;
            }
        }

        // Sweep the young generation: free white, age and promote black.
        let mut promoted: Vec<Ref> = Vec::new();
        let mut reclaimed = 0u64;
        for index in 0..self.slots.len() {
            let header = match &self.slots[index] {
                Some(slot) if slot.header.is_young() => slot.header.clone(),
                _ => continue,
            };
            if header.color == Color::Black {
                if let Some(slot) = self.slots[index].as_mut() {
                    slot.header.color = Color::White;
                    slot.header.age = slot.header.age.saturating_add(1);
                    if slot.header.age >= self.config.promotion_age {
                        slot.header.generation = Generation::Old;
                        let bytes = slot.header.bytes as usize;
                        self.young_bytes -= bytes;
                        self.old_bytes += bytes;
                        promoted.push(Ref::from_index(index as u32));
                    }
                }
            } else {
                let bytes = header.bytes as usize;
                self.young_bytes -= bytes;
                reclaimed += bytes as u64;
                self.slots[index] = None;
                self.free.push(index as u32);
            }
        }

        // Promotion can create fresh old-to-young edges; scan the
        // promoted objects so the next minor pass still sees them.
        for parent in promoted {
            scratch.clear();
            if let Some(slot) = self.slot(parent) {
                slot.value.trace(&mut |r| scratch.push(r));
            }
            if scratch.iter().any(|&child| self.is_live_young(child)) {
                self.remembered.add(parent);
            }
        }

        self.prune_remembered(&mut scratch);

        self.stats.total_reclaimed += reclaimed;
        self.stats.total_gc_pause_ns += start.elapsed().as_nanos() as u64;

        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            reclaimed,
            young_bytes = self.young_bytes,
            old_bytes = self.old_bytes,
            "minor collection"
        );
    }

    /// Run a major (full-heap) collection.
    ///
    /// Traces everything reachable from the gathered root set, frees all
    /// unreached slots in both generations, and rebuilds the remembered
    /// set from the surviving old-to-young edges.
    pub fn collect_major(&mut self, roots: &[Ref]) {
        let start = Instant::now();
        self.stats.major_collections += 1;
        self.remembered.clear();

        let all_roots = self.gather_roots(roots);
        let mut worklist: Vec<u32> = Vec::new();
        let mut scratch: Vec<Ref> = Vec::new();

        for root in all_roots {
            self.mark_any(root, &mut worklist);
        }

        while let Some(index) = worklist.pop() {
            scratch.clear();
            let source_is_old = match self.slots.get(index as usize) {
                Some(Some(slot)) => {
                    slot.value.trace(&mut |r| scratch.push(r));
                    !slot.header.is_young()
                }
                _ => continue,
            };
            for child_index in 0..scratch.len() {
                let child = scratch[child_index];
                if source_is_old && self.is_live_young(child) {
                    self.remembered.add(Ref::from_index(index));
                }
                self.mark_any(child, &mut worklist);
            }
            if let Some(Some(slot)) = self.slots.get_mut(index as usize) {
                slot.header.color = Color::Black;
            }
        }

        // Sweep both generations.
        let mut promoted: Vec<Ref> = Vec::new();
        let mut reclaimed = 0u64;
        for index in 0..self.slots.len() {
            let header = match &self.slots[index] {
                Some(slot) => slot.header.clone(),
                None => continue,
            };
            if header.color == Color::Black {
                if let Some(slot) = self.slots[index].as_mut() {
                    slot.header.color = Color::White;
                    if slot.header.is_young() {
                        slot.header.age = slot.header.age.saturating_add(1);
                        if slot.header.age >= self.config.promotion_age {
                            slot.header.generation = Generation::Old;
                            let bytes = slot.header.bytes as usize;
                            self.young_bytes -= bytes;
                            self.old_bytes += bytes;
                            promoted.push(Ref::from_index(index as u32));
                        }
                    }
                }
            } else {
                let bytes = header.bytes as usize;
                match header.generation {
                    Generation::Young => self.young_bytes -= bytes,
                    Generation::Old => self.old_bytes -= bytes,
                }
                reclaimed += bytes as u64;
                self.slots[index] = None;
                self.free.push(index as u32);
            }
        }

        for parent in promoted {
            scratch.clear();
            if let Some(slot) = self.slot(parent) {
                slot.value.trace(&mut |r| scratch.push(r));
            }
            if scratch.iter().any(|&child| self.is_live_young(child)) {
                self.remembered.add(parent);
            }
        }

        self.prune_remembered(&mut scratch);

        // Let the old generation grow before the next major pass.
        self.old_limit = self
            .config
            .old_threshold
            .max((self.old_bytes as f64 * self.config.old_growth_factor) as usize);

        self.stats.total_reclaimed += reclaimed;
        self.stats.total_gc_pause_ns += start.elapsed().as_nanos() as u64;

        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            reclaimed,
            young_bytes = self.young_bytes,
            old_bytes = self.old_bytes,
            old_limit = self.old_limit,
            "major collection"
        );
    }

    /// Force a full collection regardless of heap pressure.
    pub fn force_major(&mut self) {
        self.collect_major(&[]);
    }

    /// Drop remembered sources that were freed, or that no longer hold
    /// any young reference.
    fn prune_remembered(&mut self, scratch: &mut Vec<Ref>) {
        for source in self.remembered.sources() {
            scratch.clear();
            let keep = match self.slot(source) {
                Some(slot) if !slot.header.is_young() => {
                    slot.value.trace(&mut |r| scratch.push(r));
                    scratch.iter().any(|&child| self.is_live_young(child))
                }
                _ => false,
            };
            if !keep {
                self.remembered.remove(source);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::GcConfig;

    /// A test node holding outgoing handles.
    struct Node {
        edges: Vec<Ref>,
    }

    impl Node {
        fn leaf() -> Self {
            Self { edges: Vec::new() }
        }
    }

    impl Trace for Node {
        fn trace(&self, tracer: &mut dyn FnMut(Ref)) {
            for &edge in &self.edges {
                tracer(edge);
            }
        }
        fn byte_size(&self) -> usize {
            64
        }
    }

    fn small_heap() -> Heap<Node> {
        Heap::with_config(GcConfig {
            young_threshold: 1024,
            old_threshold: 4096,
            old_growth_factor: 1.5,
            promotion_age: 1,
            max_heap_bytes: 1024 * 1024,
        })
        .unwrap()
    }

    #[test]
    fn minor_reclaims_unreached() {
        let mut heap = small_heap();
        let live = heap.alloc(Node::leaf()).unwrap();
        let dead = heap.alloc(Node::leaf()).unwrap();

        heap.collect_minor(&[live]);

        assert!(heap.contains(live));
        assert!(!heap.contains(dead));
        assert_eq!(heap.live_objects(), 1);
    }

    #[test]
    fn survivors_are_promoted() {
        let mut heap = small_heap();
        let live = heap.alloc(Node::leaf()).unwrap();

        assert_eq!(heap.generation(live), Some(Generation::Young));
        heap.collect_minor(&[live]);
        assert_eq!(heap.generation(live), Some(Generation::Old));
    }

    #[test]
    fn transitive_reachability_keeps_chain_alive() {
        let mut heap = small_heap();
        let c = heap.alloc(Node::leaf()).unwrap();
        let b = heap.alloc(Node { edges: vec![c] }).unwrap();
        let a = heap.alloc(Node { edges: vec![b] }).unwrap();

        heap.collect_minor(&[a]);

        assert!(heap.contains(a));
        assert!(heap.contains(b));
        assert!(heap.contains(c));
    }

    #[test]
    fn write_barrier_keeps_young_target_alive() {
        let mut heap = small_heap();
        let old = heap.alloc(Node::leaf()).unwrap();
        // Promote `old` by surviving a minor pass.
        heap.collect_minor(&[old]);
        assert_eq!(heap.generation(old), Some(Generation::Old));

        // Store a young handle into the old object, with the barrier.
        let young = heap.alloc(Node::leaf()).unwrap();
        heap.get_mut(old).unwrap().edges.push(young);
        heap.write_barrier(old, young);

        // `young` is reachable only through `old`, which is not in the
        // caller root set; the remembered set must save it.
        heap.collect_minor(&[old]);
        assert!(heap.contains(young));
    }

    #[test]
    fn missed_barrier_scenario_is_covered_by_promotion_scan() {
        let mut heap = small_heap();
        // Parent and child allocated together; parent promoted while the
        // child stays reachable through it.
        let child = heap.alloc(Node::leaf()).unwrap();
        let parent = heap.alloc(Node { edges: vec![child] }).unwrap();

        heap.collect_minor(&[parent]);
        // Both survived; both promoted with default promotion_age = 1.
        assert_eq!(heap.generation(parent), Some(Generation::Old));
        assert_eq!(heap.generation(child), Some(Generation::Old));
    }

    #[test]
    fn major_collects_cycles() {
        let mut heap = small_heap();
        let a = heap.alloc(Node::leaf()).unwrap();
        let b = heap.alloc(Node { edges: vec![a] }).unwrap();
        heap.get_mut(a).unwrap().edges.push(b);

        // Cycle is live while rooted.
        heap.collect_major(&[a]);
        assert!(heap.contains(a));
        assert!(heap.contains(b));

        // Unrooted cycle is reclaimed.
        heap.collect_major(&[]);
        assert!(!heap.contains(a));
        assert!(!heap.contains(b));
        assert_eq!(heap.live_objects(), 0);
    }

    #[test]
    fn major_rebuilds_remembered_set() {
        let mut heap = small_heap();
        let old = heap.alloc(Node::leaf()).unwrap();
        heap.collect_minor(&[old]);

        let config_age = heap.config().promotion_age;
        assert_eq!(config_age, 1);

        // Old object points at a young one; major rebuilds the edge
        // record even though we never called the barrier.
        let young = heap.alloc(Node::leaf()).unwrap();
        heap.get_mut(old).unwrap().edges.push(young);
        heap.add_root(old);
        heap.collect_major(&[]);

        // After the major pass `young` was promoted (age 1), so there is
        // no old-to-young edge left to remember.
        assert!(heap.contains(young));
        assert_eq!(heap.remembered_len(), 0);
    }

    #[test]
    fn pinned_roots_survive_without_caller_roots() {
        let mut heap = small_heap();
        let pinned = heap.alloc(Node::leaf()).unwrap();
        heap.add_root(pinned);

        heap.collect_major(&[]);
        assert!(heap.contains(pinned));

        heap.remove_root(pinned);
        heap.collect_major(&[]);
        assert!(!heap.contains(pinned));
    }

    #[test]
    fn slot_reuse_after_free() {
        let mut heap = small_heap();
        let dead = heap.alloc(Node::leaf()).unwrap();
        heap.collect_minor(&[]);
        assert!(!heap.contains(dead));

        // The freed slot index is reused for the next allocation.
        let reborn = heap.alloc(Node::leaf()).unwrap();
        assert_eq!(reborn.index(), dead.index());
    }

    #[test]
    fn stats_track_reclamation() {
        let mut heap = small_heap();
        for _ in 0..8 {
            heap.alloc(Node::leaf()).unwrap();
        }
        heap.collect_major(&[]);

        let stats = heap.stats();
        assert_eq!(stats.major_collections, 1);
        assert_eq!(stats.total_reclaimed, 8 * 64);
        assert!(stats.total_allocated >= 8 * 64);
    }
}
