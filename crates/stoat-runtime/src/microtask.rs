//! FIFO job queues
//!
//! One queue type serves both priority classes; the scheduler owns a
//! microtask instance and a macrotask instance (plus one for host
//! completions). Every queued job is a GC root until it runs.
//!
//! ## Ordering Guarantees
//!
//! - FIFO: first queued, first executed
//! - The drive loop drains microtasks to exhaustion before any
//!   macrotask, including microtasks enqueued mid-drain

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use stoat_core::Job;
use stoat_gc::{ExternalRootSet, Ref};

/// A FIFO queue of jobs, shareable with the heap as a root set.
pub struct JobQueue {
    queue: Mutex<VecDeque<Job>>,
    len: AtomicUsize,
}

impl JobQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            len: AtomicUsize::new(0),
        }
    }

    /// Append a job
    pub fn enqueue(&self, job: Job) {
        self.queue.lock().push_back(job);
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    /// Take the next job
    pub fn dequeue(&self) -> Option<Job> {
        let job = self.queue.lock().pop_front();
        if job.is_some() {
            self.len.fetch_sub(1, Ordering::Relaxed);
        }
        job
    }

    /// Number of queued jobs
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all queued jobs
    pub fn clear(&self) {
        let mut queue = self.queue.lock();
        let dropped = queue.len();
        queue.clear();
        self.len.fetch_sub(dropped, Ordering::Relaxed);
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ExternalRootSet for JobQueue {
    fn trace_roots(&self, tracer: &mut dyn FnMut(Ref)) {
        let queue = self.queue.lock();
        for job in queue.iter() {
            job.trace(tracer);
        }
    }
}
