//! Heap arena: slot storage, allocation, configuration, statistics

use std::sync::Arc;

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::barrier::RememberedSet;
use crate::object::{ExternalRootSet, Generation, GcHeader, Ref, Trace};

/// GC tuning parameters.
///
/// All of these are pacing knobs, not correctness properties.
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Young-generation byte budget before a minor collection is requested
    pub young_threshold: usize,
    /// Initial old-generation byte budget before a major collection
    pub old_threshold: usize,
    /// Factor applied to the old budget after each major collection
    pub old_growth_factor: f64,
    /// Minor collections an object must survive before promotion
    pub promotion_age: u8,
    /// Hard cap on total heap bytes; exceeding it is fatal
    pub max_heap_bytes: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            young_threshold: 256 * 1024,        // 256 KiB
            old_threshold: 4 * 1024 * 1024,     // 4 MiB
            old_growth_factor: 1.5,
            promotion_age: 1,
            max_heap_bytes: 512 * 1024 * 1024,  // 512 MiB
        }
    }
}

impl GcConfig {
    /// Configuration sized from a total heap budget in megabytes.
    /// The young budget gets 1/16 of the total, capped at 4 MiB.
    pub fn with_max_heap_mb(max_heap_mb: usize) -> Self {
        let max_heap_bytes = max_heap_mb * 1024 * 1024;
        Self {
            young_threshold: (max_heap_bytes / 16).min(4 * 1024 * 1024),
            old_threshold: max_heap_bytes / 4,
            max_heap_bytes,
            ..Default::default()
        }
    }

    /// Validate the configuration before building a heap with it.
    pub fn validate(&self) -> Result<(), String> {
        if self.young_threshold == 0 {
            return Err("young_threshold must be non-zero".into());
        }
        if self.old_threshold == 0 {
            return Err("old_threshold must be non-zero".into());
        }
        if self.old_growth_factor < 1.0 {
            return Err(format!(
                "old_growth_factor must be >= 1.0, got {}",
                self.old_growth_factor
            ));
        }
        if self.max_heap_bytes < self.young_threshold {
            return Err(format!(
                "max_heap_bytes ({}) is smaller than young_threshold ({})",
                self.max_heap_bytes, self.young_threshold
            ));
        }
        Ok(())
    }
}

/// Collection and allocation statistics
#[derive(Debug, Default, Clone)]
pub struct HeapStats {
    /// Minor collections performed
    pub minor_collections: u64,
    /// Major collections performed
    pub major_collections: u64,
    /// Cumulative bytes handed out by the allocator
    pub total_allocated: u64,
    /// Cumulative bytes reclaimed by collections
    pub total_reclaimed: u64,
    /// Peak total heap usage observed
    pub peak_heap_bytes: u64,
    /// Cumulative collection pause time in nanoseconds
    pub total_gc_pause_ns: u64,
}

/// Allocation failure after the heap's hard cap was exhausted.
///
/// There is no recovery inside a language-level program; the host must
/// report this and terminate the run.
#[derive(Debug, Clone, Error)]
#[error(
    "heap out of memory: requested {requested_bytes} bytes with {heap_used}/{max_heap_bytes} bytes in use ({major_collections} major collections performed)"
)]
pub struct OomError {
    /// Bytes requested by the failed allocation
    pub requested_bytes: usize,
    /// Total heap bytes in use at failure time
    pub heap_used: usize,
    /// Configured hard cap
    pub max_heap_bytes: usize,
    /// Major collections performed before giving up
    pub major_collections: u64,
}

pub(crate) struct Slot<T> {
    pub(crate) header: GcHeader,
    pub(crate) value: T,
}

/// Generational heap over a slot arena.
///
/// The heap exclusively owns every object's storage; callers hold opaque
/// [`Ref`] handles and must route every handle-into-object store through
/// [`Heap::write_barrier`].
pub struct Heap<T: Trace> {
    pub(crate) slots: Vec<Option<Slot<T>>>,
    pub(crate) free: Vec<u32>,
    pub(crate) remembered: RememberedSet,
    pub(crate) config: GcConfig,
    pub(crate) young_bytes: usize,
    pub(crate) old_bytes: usize,
    /// Current old-generation budget; grows after each major pass
    pub(crate) old_limit: usize,
    pub(crate) stats: HeapStats,
    scoped_roots: FxHashMap<Ref, usize>,
    external_roots: Vec<Arc<dyn ExternalRootSet>>,
}

impl<T: Trace> Heap<T> {
    /// Create a heap with the default configuration.
    pub fn new() -> Self {
        Self::with_config(GcConfig::default()).expect("default GcConfig is valid")
    }

    /// Create a heap with a custom configuration.
    pub fn with_config(config: GcConfig) -> Result<Self, String> {
        config.validate()?;
        let old_limit = config.old_threshold;
        Ok(Self {
            slots: Vec::new(),
            free: Vec::new(),
            remembered: RememberedSet::new(),
            config,
            young_bytes: 0,
            old_bytes: 0,
            old_limit,
            stats: HeapStats::default(),
            scoped_roots: FxHashMap::default(),
            external_roots: Vec::new(),
        })
    }

    /// Allocate a new young object and return its handle.
    ///
    /// Allocation never collects; callers poll [`Heap::wants_minor`] /
    /// [`Heap::wants_major`] at safepoints and collect with a full root
    /// set. The only failure is the hard cap.
    pub fn alloc(&mut self, value: T) -> Result<Ref, OomError> {
        let bytes = value.byte_size().max(std::mem::size_of::<Slot<T>>());
        if self.used_bytes() + bytes > self.config.max_heap_bytes {
            return Err(OomError {
                requested_bytes: bytes,
                heap_used: self.used_bytes(),
                max_heap_bytes: self.config.max_heap_bytes,
                major_collections: self.stats.major_collections,
            });
        }

        let slot = Slot {
            header: GcHeader::new(bytes as u32),
            value,
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(slot);
                index
            }
            None => {
                self.slots.push(Some(slot));
                (self.slots.len() - 1) as u32
            }
        };

        self.young_bytes += bytes;
        self.stats.total_allocated += bytes as u64;
        let used = self.used_bytes() as u64;
        if used > self.stats.peak_heap_bytes {
            self.stats.peak_heap_bytes = used;
        }
        Ok(Ref::from_index(index))
    }

    /// Borrow the object behind a handle, if it is still live.
    #[inline]
    pub fn get(&self, handle: Ref) -> Option<&T> {
        self.slots
            .get(handle.index() as usize)?
            .as_ref()
            .map(|slot| &slot.value)
    }

    /// Mutably borrow the object behind a handle, if it is still live.
    #[inline]
    pub fn get_mut(&mut self, handle: Ref) -> Option<&mut T> {
        self.slots
            .get_mut(handle.index() as usize)?
            .as_mut()
            .map(|slot| &mut slot.value)
    }

    /// Whether a handle currently refers to a live slot.
    pub fn contains(&self, handle: Ref) -> bool {
        matches!(self.slots.get(handle.index() as usize), Some(Some(_)))
    }

    /// The generation of a live slot.
    pub fn generation(&self, handle: Ref) -> Option<Generation> {
        self.slots
            .get(handle.index() as usize)?
            .as_ref()
            .map(|slot| slot.header.generation)
    }

    /// Generational write barrier.
    ///
    /// Call after storing `value` into `owner`. Records the owner in the
    /// remembered set when the store created an old-to-young edge.
    #[inline]
    pub fn write_barrier(&mut self, owner: Ref, value: Ref) {
        let owner_old = matches!(self.generation(owner), Some(Generation::Old));
        let value_young = matches!(self.generation(value), Some(Generation::Young));
        if owner_old && value_young {
            self.remembered.add(owner);
        }
    }

    /// Pin a handle as a root until [`Heap::remove_root`] balances it.
    /// Nested pins of the same handle are counted.
    pub fn add_root(&mut self, handle: Ref) {
        *self.scoped_roots.entry(handle).or_insert(0) += 1;
    }

    /// Release one pin on a handle.
    pub fn remove_root(&mut self, handle: Ref) {
        if let Some(count) = self.scoped_roots.get_mut(&handle) {
            *count -= 1;
            if *count == 0 {
                self.scoped_roots.remove(&handle);
            }
        }
    }

    /// Register an external root set consulted on every collection.
    pub fn register_external_roots(&mut self, roots: Arc<dyn ExternalRootSet>) {
        self.external_roots.push(roots);
    }

    /// Whether the young generation has outgrown its budget.
    #[inline]
    pub fn wants_minor(&self) -> bool {
        self.young_bytes >= self.config.young_threshold
    }

    /// Whether the old generation has outgrown its current budget.
    #[inline]
    pub fn wants_major(&self) -> bool {
        self.old_bytes >= self.old_limit
    }

    /// Total bytes currently in use across both generations.
    pub fn used_bytes(&self) -> usize {
        self.young_bytes + self.old_bytes
    }

    /// Number of live objects.
    pub fn live_objects(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Collection and allocation statistics.
    pub fn stats(&self) -> &HeapStats {
        &self.stats
    }

    /// The active configuration.
    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Size of the remembered set (for tests and diagnostics).
    pub fn remembered_len(&self) -> usize {
        self.remembered.len()
    }

    /// Gather the full root set: caller roots, pinned roots, and every
    /// registered external root set.
    pub(crate) fn gather_roots(&self, extra: &[Ref]) -> Vec<Ref> {
        let mut roots: Vec<Ref> = Vec::with_capacity(extra.len() + self.scoped_roots.len());
        roots.extend_from_slice(extra);
        roots.extend(self.scoped_roots.keys().copied());
        for set in &self.external_roots {
            set.trace_roots(&mut |r| roots.push(r));
        }
        roots
    }
}

impl<T: Trace> Default for Heap<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Leaf;
    impl Trace for Leaf {
        fn trace(&self, _tracer: &mut dyn FnMut(Ref)) {}
        fn byte_size(&self) -> usize {
            32
        }
    }

    #[test]
    fn alloc_and_get() {
        let mut heap: Heap<Leaf> = Heap::new();
        let r = heap.alloc(Leaf).unwrap();
        assert!(heap.get(r).is_some());
        assert_eq!(heap.live_objects(), 1);
        assert!(heap.used_bytes() >= 32);
    }

    #[test]
    fn config_validation() {
        assert!(GcConfig::default().validate().is_ok());

        let config = GcConfig {
            young_threshold: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = GcConfig {
            old_growth_factor: 0.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn hard_cap_is_fatal() {
        let config = GcConfig {
            young_threshold: 48,
            old_threshold: 1024,
            max_heap_bytes: 48,
            ..Default::default()
        };
        let mut heap: Heap<Leaf> = Heap::with_config(config).unwrap();
        heap.alloc(Leaf).unwrap();
        let err = heap.alloc(Leaf).unwrap_err();
        assert_eq!(err.max_heap_bytes, 48);
        assert!(err.heap_used > 0);
    }

    #[test]
    fn scoped_roots_are_counted() {
        let mut heap: Heap<Leaf> = Heap::new();
        let r = heap.alloc(Leaf).unwrap();
        heap.add_root(r);
        heap.add_root(r);
        heap.remove_root(r);
        // still pinned once
        assert_eq!(heap.gather_roots(&[]).len(), 1);
        heap.remove_root(r);
        assert!(heap.gather_roots(&[]).is_empty());
    }
}
