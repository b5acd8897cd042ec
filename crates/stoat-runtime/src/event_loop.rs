//! Event loop state: the two task queues, the timer set, host
//! completions, and the unhandled-error channel.
//!
//! This type holds no interpreter; [`crate::Runtime`] drives it. The
//! phase order lives there too — this module just owns the queues and
//! the transitions between them (timers firing into the macrotask queue,
//! host completions draining into it).

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, unbounded};
use stoat_core::{HeapObject, Job, ScheduledEffect, Value, VmError};
use stoat_gc::Heap;

use crate::microtask::JobQueue;
use crate::timer::TimerSet;

/// An error that escaped a task, surfaced for the host to observe.
#[derive(Debug, Clone)]
pub struct UnhandledError {
    /// Error-kind name (`TypeError`, `RangeError`, ...)
    pub name: String,
    /// Message without the kind prefix
    pub message: String,
    /// Rendered frame-by-frame trace; empty when unavailable
    pub stack: String,
}

impl UnhandledError {
    /// Build from a VM error, capturing its trace when it has one.
    pub fn from_vm_error(err: &VmError) -> Self {
        let stack = match err {
            VmError::Thrown(thrown) => thrown
                .stack
                .iter()
                .map(|frame| format!("    at {}", frame))
                .collect::<Vec<_>>()
                .join("\n"),
            _ => String::new(),
        };
        Self {
            name: err.kind_name().to_string(),
            message: err.message(),
            stack,
        }
    }
}

/// Queues and timers for one runtime instance.
pub struct EventLoop {
    microtasks: Arc<JobQueue>,
    macrotasks: Arc<JobQueue>,
    host_completions: Arc<JobQueue>,
    timers: Arc<TimerSet>,
    unhandled_tx: Sender<UnhandledError>,
    unhandled_rx: Receiver<UnhandledError>,
}

impl EventLoop {
    /// Create an empty loop.
    pub fn new() -> Self {
        let (unhandled_tx, unhandled_rx) = unbounded();
        Self {
            microtasks: Arc::new(JobQueue::new()),
            macrotasks: Arc::new(JobQueue::new()),
            host_completions: Arc::new(JobQueue::new()),
            timers: Arc::new(TimerSet::new()),
            unhandled_tx,
            unhandled_rx,
        }
    }

    /// Register every queue as a GC root set on the heap. Pending tasks
    /// must keep their callbacks and arguments alive.
    pub fn register_roots(&self, heap: &mut Heap<HeapObject>) {
        heap.register_external_roots(Arc::clone(&self.microtasks) as _);
        heap.register_external_roots(Arc::clone(&self.macrotasks) as _);
        heap.register_external_roots(Arc::clone(&self.host_completions) as _);
        heap.register_external_roots(Arc::clone(&self.timers) as _);
    }

    /// The microtask queue.
    pub fn microtasks(&self) -> &JobQueue {
        &self.microtasks
    }

    /// The macrotask queue.
    pub fn macrotasks(&self) -> &JobQueue {
        &self.macrotasks
    }

    /// Apply effects drained from the VM context: microtask enqueues and
    /// timer arm/cancel commands.
    pub fn apply_effects(&self, effects: Vec<ScheduledEffect>) {
        for effect in effects {
            match effect {
                ScheduledEffect::Microtask(job) => self.microtasks.enqueue(job),
                ScheduledEffect::SetTimer {
                    id,
                    callback,
                    delay_ms,
                    repeating,
                } => {
                    self.timers
                        .schedule(id, callback, Duration::from_millis(delay_ms), repeating);
                }
                ScheduledEffect::CancelTimer { id } => {
                    self.timers.cancel(id);
                }
            }
        }
    }

    /// Move every elapsed timer's callback to the macrotask queue.
    /// Returns how many fired.
    pub fn pump_timers(&self, now: Instant) -> usize {
        let due = self.timers.pop_due(now);
        let fired = due.len();
        for timer in due {
            tracing::trace!(id = timer.id, "timer fired");
            self.macrotasks.enqueue(Job::Call {
                callback: timer.callback,
                this: Value::undefined(),
                args: Vec::new(),
            });
        }
        fired
    }

    /// Move pending host completions to the macrotask queue. Returns how
    /// many were moved.
    pub fn poll_host(&self) -> usize {
        let mut moved = 0;
        while let Some(job) = self.host_completions.dequeue() {
            self.macrotasks.enqueue(job);
            moved += 1;
        }
        moved
    }

    /// Hand an I/O completion callback to the loop (any thread).
    pub fn push_host_completion(&self, callback: Value, args: Vec<Value>) {
        self.host_completions.enqueue(Job::Call {
            callback,
            this: Value::undefined(),
            args,
        });
    }

    /// Arm a timer directly (host API, same semantics as the natives).
    pub fn schedule_timer(&self, id: u64, callback: Value, delay: Duration, repeating: bool) {
        self.timers.schedule(id, callback, delay, repeating);
    }

    /// Cancel a timer directly.
    pub fn cancel_timer(&self, id: u64) -> bool {
        self.timers.cancel(id)
    }

    /// Report a failed task. Never blocks; the loop keeps running.
    pub fn report_unhandled(&self, err: &VmError) {
        let report = UnhandledError::from_vm_error(err);
        tracing::warn!(name = %report.name, message = %report.message, "unhandled task error");
        // A full channel is impossible (unbounded); a disconnected one
        // means the receiver half was dropped with the loop, so drop the
        // report rather than panic.
        let _ = self.unhandled_tx.send(report);
    }

    /// Drain every unhandled error reported so far.
    pub fn take_unhandled(&self) -> Vec<UnhandledError> {
        self.unhandled_rx.try_iter().collect()
    }

    /// Whether any queue, timer, or completion still holds work.
    pub fn has_pending_work(&self) -> bool {
        !self.microtasks.is_empty()
            || !self.macrotasks.is_empty()
            || !self.host_completions.is_empty()
            || !self.timers.is_empty()
    }

    /// Whether only timers remain (the drive loop may sleep).
    pub fn idle_except_timers(&self) -> bool {
        self.microtasks.is_empty()
            && self.macrotasks.is_empty()
            && self.host_completions.is_empty()
            && !self.timers.is_empty()
    }

    /// Time until the earliest pending timer.
    pub fn next_timer_wait(&self) -> Option<Duration> {
        self.timers.next_deadline_wait(Instant::now())
    }

    /// Queue depths: (microtasks, macrotasks, pending timers).
    pub fn depths(&self) -> (usize, usize, usize) {
        (
            self.microtasks.len(),
            self.macrotasks.len(),
            self.timers.len(),
        )
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}
