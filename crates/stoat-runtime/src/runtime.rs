//! The runtime instance: heap + evaluator + scheduler, wired together.
//!
//! Drive-loop phase order, per iteration: (1) drain the microtask queue
//! to exhaustion, (2) run exactly one macrotask, (3) move elapsed timers
//! to the macrotask queue, (4) move polled host completions there too,
//! (5) report whether work remains. A failed task goes to the
//! unhandled-error channel and the loop keeps running; heap exhaustion
//! aborts the run.

use std::sync::Arc;
use std::time::{Duration, Instant};

use stoat_bytecode::Module;
use stoat_core::{
    Interpreter, Job, PromiseState, Reaction, ResumeInput, ScheduledEffect, SettleKind, Value,
    VmContext, VmError, VmResult, coerce,
};
use stoat_gc::{GcConfig, HeapStats, Ref};

use crate::event_loop::{EventLoop, UnhandledError};

/// Longest sleep while waiting on a distant timer, so host shutdown
/// flags are observed promptly.
const MAX_IDLE_SLEEP: Duration = Duration::from_millis(10);

/// Introspection counters for host-side backpressure decisions.
#[derive(Debug, Clone)]
pub struct RuntimeStats {
    /// Bytes currently in use across both heap generations
    pub heap_used_bytes: usize,
    /// Live heap objects
    pub live_objects: usize,
    /// Pending microtasks
    pub microtask_depth: usize,
    /// Pending macrotasks
    pub macrotask_depth: usize,
    /// Armed timers
    pub pending_timers: usize,
}

/// A complete runtime instance. Hosts may construct several; each owns
/// its heap, evaluator, and scheduler, with no shared state between
/// instances.
pub struct Runtime {
    ctx: VmContext,
    interp: Interpreter,
    event_loop: EventLoop,
}

impl Runtime {
    /// Runtime with default GC configuration.
    pub fn new() -> VmResult<Self> {
        Self::with_config(GcConfig::default())
    }

    /// Runtime with a custom GC configuration.
    pub fn with_config(config: GcConfig) -> VmResult<Self> {
        let mut ctx = VmContext::with_config(config)?;
        let event_loop = EventLoop::new();
        event_loop.register_roots(&mut ctx.heap);

        let mut runtime = Self {
            ctx,
            interp: Interpreter::new(),
            event_loop,
        };
        runtime.install_natives()?;
        Ok(runtime)
    }

    /// Built-in natives: `set_timeout`, `set_interval`, `clear_timer`,
    /// `queue_microtask`. Hosts add their own through
    /// [`VmContext::define_native`].
    fn install_natives(&mut self) -> VmResult<()> {
        self.ctx.define_native("set_timeout", |ctx, _this, args| {
            schedule_native(ctx, args, false)
        })?;
        self.ctx.define_native("set_interval", |ctx, _this, args| {
            schedule_native(ctx, args, true)
        })?;
        self.ctx.define_native("clear_timer", |ctx, _this, args| {
            let id = args
                .first()
                .map(|v| coerce::to_number(&ctx.heap, *v))
                .unwrap_or(f64::NAN);
            if id.is_finite() && id >= 0.0 {
                ctx.push_effect(ScheduledEffect::CancelTimer { id: id as u64 });
            }
            Ok(Value::undefined())
        })?;
        self.ctx
            .define_native("queue_microtask", |ctx, _this, args| {
                let callback = require_callable(ctx, args.first().copied(), "queue_microtask")?;
                ctx.enqueue_microtask(Job::Call {
                    callback,
                    this: Value::undefined(),
                    args: Vec::new(),
                });
                Ok(Value::undefined())
            })?;
        Ok(())
    }

    /// The underlying context, for installing host natives and globals.
    pub fn context(&mut self) -> &mut VmContext {
        &mut self.ctx
    }

    /// Read-only context access.
    pub fn context_ref(&self) -> &VmContext {
        &self.ctx
    }

    // ==================== Entry points ====================

    /// Execute a program unit, then drive the scheduler to exhaustion.
    /// Returns the top-level completion value, or the uncaught error.
    pub fn run(&mut self, module: Arc<Module>) -> VmResult<Value> {
        tracing::debug!(source = %module.source_name, "executing module");
        let result = self.interp.run_module(&mut self.ctx, module);
        self.flush_effects();
        if let Err(err) = &result
            && !err.is_catchable()
        {
            return result;
        }
        self.drive_to_quiescence()?;
        result
    }

    /// One scheduler iteration. Returns whether work remains, for
    /// embedding in an external event loop.
    pub fn drive_once(&mut self) -> VmResult<bool> {
        // (1) Microtasks drain fully, including ones enqueued mid-drain.
        while let Some(job) = self.event_loop.microtasks().dequeue() {
            self.run_job(job)?;
        }
        // (2) Exactly one macrotask.
        if let Some(job) = self.event_loop.macrotasks().dequeue() {
            self.run_job(job)?;
        }
        // (3) Elapsed timers become macrotasks.
        self.event_loop.pump_timers(Instant::now());
        // (4) Host completions become macrotasks.
        self.event_loop.poll_host();
        // (5) Between-task collection opportunity.
        self.maybe_collect();
        Ok(self.event_loop.has_pending_work())
    }

    /// Drive until no work remains, sleeping only when every queue is
    /// empty and a timer is pending.
    pub fn drive_to_quiescence(&mut self) -> VmResult<()> {
        loop {
            let more = self.drive_once()?;
            if !more {
                return Ok(());
            }
            if self.event_loop.idle_except_timers()
                && let Some(wait) = self.event_loop.next_timer_wait()
                && !wait.is_zero()
            {
                std::thread::sleep(wait.min(MAX_IDLE_SLEEP));
            }
        }
    }

    /// Invoke a callable value as a task (host API).
    pub fn call_function(&mut self, callback: Value, this: Value, args: &[Value]) -> VmResult<Value> {
        let result = self.interp.call_value(&mut self.ctx, callback, this, args);
        self.flush_effects();
        result
    }

    // ==================== Host scheduling API ====================

    /// Arm a one-shot timer from host code. Returns the handle.
    pub fn set_timeout(&mut self, callback: Value, delay: Duration) -> u64 {
        let id = self.ctx.alloc_timer_id();
        self.event_loop.schedule_timer(id, callback, delay, false);
        id
    }

    /// Arm a repeating timer from host code. Returns the handle.
    pub fn set_interval(&mut self, callback: Value, interval: Duration) -> u64 {
        let id = self.ctx.alloc_timer_id();
        self.event_loop.schedule_timer(id, callback, interval, true);
        id
    }

    /// Cancel a timer. Returns whether a pending timer existed; a
    /// callback already moved to the macrotask queue still runs.
    pub fn clear_timer(&mut self, id: u64) -> bool {
        self.event_loop.cancel_timer(id)
    }

    /// Queue a callback as a microtask from host code.
    pub fn queue_microtask(&mut self, callback: Value) {
        self.event_loop.microtasks().enqueue(Job::Call {
            callback,
            this: Value::undefined(),
            args: Vec::new(),
        });
    }

    /// Hand an I/O completion callback to the loop (any thread may call
    /// through a clone of the loop's queues; this is the single-thread
    /// convenience form).
    pub fn push_host_completion(&mut self, callback: Value, args: Vec<Value>) {
        self.event_loop.push_host_completion(callback, args);
    }

    /// Drain the unhandled-error channel.
    pub fn take_unhandled_errors(&mut self) -> Vec<UnhandledError> {
        self.event_loop.take_unhandled()
    }

    // ==================== Promise host API ====================

    /// Allocate a pending promise.
    pub fn create_promise(&mut self) -> VmResult<Ref> {
        self.ctx.new_promise()
    }

    /// Resolve a promise from host code; reactions run as microtasks on
    /// the next drive.
    pub fn resolve_promise(&mut self, promise: Ref, value: Value) -> VmResult<()> {
        self.ctx
            .settle_promise(promise, SettleKind::Fulfill, value)?;
        self.flush_effects();
        Ok(())
    }

    /// Reject a promise from host code.
    pub fn reject_promise(&mut self, promise: Ref, error: Value) -> VmResult<()> {
        self.ctx.settle_promise(promise, SettleKind::Reject, error)?;
        self.flush_effects();
        Ok(())
    }

    /// Current state of a promise.
    pub fn promise_state(&self, promise: Ref) -> VmResult<PromiseState> {
        self.ctx.promise_state(promise)
    }

    // ==================== Introspection ====================

    /// Heap and queue counters.
    pub fn stats(&self) -> RuntimeStats {
        let (microtask_depth, macrotask_depth, pending_timers) = self.event_loop.depths();
        RuntimeStats {
            heap_used_bytes: self.ctx.heap.used_bytes(),
            live_objects: self.ctx.heap.live_objects(),
            microtask_depth,
            macrotask_depth,
            pending_timers,
        }
    }

    /// Collector statistics.
    pub fn heap_stats(&self) -> &HeapStats {
        self.ctx.heap.stats()
    }

    // ==================== Internals ====================

    fn flush_effects(&mut self) {
        if self.ctx.has_effects() {
            self.event_loop.apply_effects(self.ctx.take_effects());
        }
    }

    /// Run one task. Catchable failures go to the unhandled-error
    /// channel; fatal ones (heap exhaustion) stop the loop.
    fn run_job(&mut self, job: Job) -> VmResult<()> {
        let outcome = match job {
            Job::Call {
                callback,
                this,
                args,
            } => self
                .interp
                .call_value(&mut self.ctx, callback, this, &args)
                .map(|_| ()),
            Job::Resume { activation, input } => {
                self.interp.resume_activation(&mut self.ctx, activation, input)
            }
            Job::Reaction {
                reaction,
                kind,
                value,
            } => self.run_reaction(reaction, kind, value),
        };
        self.flush_effects();
        match outcome {
            Ok(()) => Ok(()),
            Err(err) if err.is_catchable() => {
                self.event_loop.report_unhandled(&err);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn run_reaction(
        &mut self,
        reaction: Reaction,
        kind: SettleKind,
        value: Value,
    ) -> VmResult<()> {
        // Await continuation: the settlement resumes the parked
        // activation directly.
        if let Some(activation) = reaction.continuation {
            let input = match kind {
                SettleKind::Fulfill => ResumeInput::Fulfilled(value),
                SettleKind::Reject => ResumeInput::Rejected(value),
            };
            return self.interp.resume_activation(&mut self.ctx, activation, input);
        }

        let handler = match kind {
            SettleKind::Fulfill => reaction.on_fulfilled,
            SettleKind::Reject => reaction.on_rejected,
        };
        match handler {
            Some(callback) => {
                // Pin what the reaction still needs across the call; the
                // handler may allocate enough to trigger collections.
                let pins: Vec<Ref> = reaction
                    .result
                    .into_iter()
                    .chain(value.as_reference())
                    .collect();
                for &pin in &pins {
                    self.ctx.heap.add_root(pin);
                }
                let outcome =
                    self.interp
                        .call_value(&mut self.ctx, callback, Value::undefined(), &[value]);
                for &pin in &pins {
                    self.ctx.heap.remove_root(pin);
                }
                match outcome {
                    Ok(result_value) => {
                        if let Some(result) = reaction.result {
                            self.ctx
                                .settle_promise(result, SettleKind::Fulfill, result_value)?;
                        }
                        Ok(())
                    }
                    Err(err) if err.is_catchable() => {
                        let error_value = self.ctx.error_to_value(&err, &[])?;
                        match reaction.result {
                            Some(result) => {
                                self.ctx
                                    .settle_promise(result, SettleKind::Reject, error_value)
                            }
                            None => {
                                self.event_loop.report_unhandled(&err);
                                Ok(())
                            }
                        }
                    }
                    Err(err) => Err(err),
                }
            }
            None => match reaction.result {
                // Passthrough: the chained promise adopts the settlement.
                Some(result) => self.ctx.settle_promise(result, kind, value),
                None if kind == SettleKind::Reject => {
                    let message = coerce::to_display_string(&self.ctx.heap, value);
                    self.event_loop
                        .report_unhandled(&VmError::host(format!(
                            "unhandled promise rejection: {}",
                            message
                        )));
                    Ok(())
                }
                None => Ok(()),
            },
        }
    }

    /// Between tasks the evaluator holds no activation, so the context's
    /// own roots (plus the registered queue root sets) are the complete
    /// root set.
    fn maybe_collect(&mut self) {
        if !self.ctx.heap.wants_minor() && !self.ctx.heap.wants_major() {
            return;
        }
        let mut roots: Vec<Ref> = Vec::new();
        self.ctx.trace_roots(&mut |r| roots.push(r));
        if self.ctx.heap.wants_major() {
            self.ctx.heap.collect_major(&roots);
        } else {
            self.ctx.heap.collect_minor(&roots);
        }
    }
}

/// `set_timeout(callback, delay_ms)` / `set_interval(callback, delay_ms)`
fn schedule_native(ctx: &mut VmContext, args: &[Value], repeating: bool) -> VmResult<Value> {
    let name = if repeating { "set_interval" } else { "set_timeout" };
    let callback = require_callable(ctx, args.first().copied(), name)?;
    let delay = args
        .get(1)
        .map(|v| coerce::to_number(&ctx.heap, *v))
        .unwrap_or(0.0);
    let delay_ms = if delay.is_finite() && delay > 0.0 {
        delay as u64
    } else {
        0
    };
    let id = ctx.alloc_timer_id();
    ctx.push_effect(ScheduledEffect::SetTimer {
        id,
        callback,
        delay_ms,
        repeating,
    });
    Ok(Value::number(id as f64))
}

fn require_callable(ctx: &VmContext, value: Option<Value>, who: &str) -> VmResult<Value> {
    let value = value.unwrap_or(Value::undefined());
    let callable = value
        .as_reference()
        .and_then(|h| ctx.heap.get(h))
        .is_some_and(|obj| obj.is_callable());
    if !callable {
        return Err(VmError::type_error(format!(
            "{} requires a callable argument",
            who
        )));
    }
    Ok(value)
}
