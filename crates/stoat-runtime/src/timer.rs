//! Timer storage
//!
//! Timers live in a map keyed by handle for O(1) cancellation, with a
//! min-heap of deadline entries for O(log n) scheduling. Cancellation
//! only prevents future enqueuing: once a callback has been moved to the
//! macrotask queue it runs regardless.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use stoat_core::Value;
use stoat_gc::{ExternalRootSet, Ref};

struct Timer {
    deadline: Instant,
    callback: Value,
    interval: Option<Duration>,
}

/// Heap entry ordered by deadline, then registration order, so
/// same-deadline timers fire FIFO.
#[derive(Clone, Copy, PartialEq, Eq)]
struct TimerHeapEntry {
    deadline: Instant,
    seq: u64,
    id: u64,
}

impl Ord for TimerHeapEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed: BinaryHeap is a max-heap, we want the earliest first.
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerHeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

struct TimerSetInner {
    timers: FxHashMap<u64, Timer>,
    heap: BinaryHeap<TimerHeapEntry>,
    seq: u64,
}

/// A due timer's callback, ready to become a macrotask.
pub struct DueTimer {
    /// Timer handle
    pub id: u64,
    /// The callback to enqueue
    pub callback: Value,
}

/// Timer storage, shareable with the GC heap as a root set.
pub struct TimerSet {
    inner: Mutex<TimerSetInner>,
}

impl TimerSet {
    /// Empty timer set
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TimerSetInner {
                timers: FxHashMap::default(),
                heap: BinaryHeap::new(),
                seq: 0,
            }),
        }
    }

    /// Arm a timer under a caller-allocated handle.
    pub fn schedule(&self, id: u64, callback: Value, delay: Duration, repeating: bool) {
        let mut inner = self.inner.lock();
        let deadline = Instant::now() + delay;
        inner.timers.insert(
            id,
            Timer {
                deadline,
                callback,
                interval: repeating.then_some(delay),
            },
        );
        let seq = inner.seq;
        inner.seq += 1;
        inner.heap.push(TimerHeapEntry { deadline, seq, id });
    }

    /// Cancel a timer. Returns whether a pending timer existed. Never
    /// retracts a callback already moved to the macrotask queue.
    pub fn cancel(&self, id: u64) -> bool {
        self.inner.lock().timers.remove(&id).is_some()
    }

    /// Pop every timer whose deadline has elapsed, in deadline-then-
    /// registration order. Repeating timers are re-armed.
    pub fn pop_due(&self, now: Instant) -> Vec<DueTimer> {
        let mut inner = self.inner.lock();
        let mut due = Vec::new();
        while let Some(&entry) = inner.heap.peek() {
            if entry.deadline > now {
                break;
            }
            inner.heap.pop();

            // Stale heap entries (cancelled or re-armed timers) are
            // skipped: the map holds the truth.
            let fire = match inner.timers.get(&entry.id) {
                Some(timer) if timer.deadline == entry.deadline => Some(timer.callback),
                _ => None,
            };
            let Some(callback) = fire else { continue };

            due.push(DueTimer {
                id: entry.id,
                callback,
            });

            let interval = inner
                .timers
                .get(&entry.id)
                .and_then(|timer| timer.interval);
            match interval {
                Some(interval) => {
                    // Clamp so a zero-interval repeat cannot re-fire
                    // within this same pump.
                    let deadline = now + interval.max(Duration::from_millis(1));
                    if let Some(timer) = inner.timers.get_mut(&entry.id) {
                        timer.deadline = deadline;
                    }
                    let seq = inner.seq;
                    inner.seq += 1;
                    inner.heap.push(TimerHeapEntry {
                        deadline,
                        seq,
                        id: entry.id,
                    });
                }
                None => {
                    inner.timers.remove(&entry.id);
                }
            }
        }
        due
    }

    /// Time until the earliest pending timer, if any.
    pub fn next_deadline_wait(&self, now: Instant) -> Option<Duration> {
        let inner = self.inner.lock();
        inner
            .timers
            .values()
            .map(|timer| timer.deadline.saturating_duration_since(now))
            .min()
    }

    /// Number of pending timers
    pub fn len(&self) -> usize {
        self.inner.lock().timers.len()
    }

    /// Whether no timers are pending
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TimerSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ExternalRootSet for TimerSet {
    fn trace_roots(&self, tracer: &mut dyn FnMut(Ref)) {
        let inner = self.inner.lock();
        for timer in inner.timers.values() {
            timer.callback.trace(tracer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn due_timers_fire_in_deadline_order() {
        let timers = TimerSet::new();
        timers.schedule(1, Value::int32(1), Duration::from_millis(5), false);
        timers.schedule(2, Value::int32(2), Duration::ZERO, false);
        timers.schedule(3, Value::int32(3), Duration::ZERO, false);

        let due = timers.pop_due(Instant::now() + Duration::from_millis(10));
        let order: Vec<u64> = due.iter().map(|t| t.id).collect();
        // Same-deadline timers keep registration order.
        assert_eq!(order, vec![2, 3, 1]);
        assert!(timers.is_empty());
    }

    #[test]
    fn not_yet_due_timers_stay() {
        let timers = TimerSet::new();
        timers.schedule(1, Value::int32(1), Duration::from_secs(60), false);

        assert!(timers.pop_due(Instant::now()).is_empty());
        assert_eq!(timers.len(), 1);
        assert!(timers.next_deadline_wait(Instant::now()).is_some());
    }

    #[test]
    fn cancelled_timers_never_fire() {
        let timers = TimerSet::new();
        timers.schedule(1, Value::int32(1), Duration::ZERO, false);
        assert!(timers.cancel(1));
        assert!(!timers.cancel(1));

        let due = timers.pop_due(Instant::now() + Duration::from_millis(1));
        assert!(due.is_empty());
    }

    #[test]
    fn repeating_timers_rearm() {
        let timers = TimerSet::new();
        timers.schedule(1, Value::int32(1), Duration::ZERO, true);

        let now = Instant::now();
        let first = timers.pop_due(now + Duration::from_millis(1));
        assert_eq!(first.len(), 1);
        // Still armed for the next interval.
        assert_eq!(timers.len(), 1);

        let second = timers.pop_due(now + Duration::from_millis(5));
        assert_eq!(second.len(), 1);

        timers.cancel(1);
        assert!(timers.is_empty());
    }
}
