//! Scheduler ordering, cancellation, and end-to-end async behavior.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use stoat_bytecode::{
    ConstantPool, Function, FunctionIndex, FunctionKind, Instruction as I, Module, Register,
};
use stoat_core::object::{HeapObject, NativeFunction};
use stoat_core::{Job, ScheduledEffect, Value, VmError};
use stoat_runtime::Runtime;

type LogSink = Rc<RefCell<Vec<String>>>;

fn r(n: u8) -> Register {
    Register::new(n)
}

/// Install a logging native under `name` and return its callable value.
fn logger(rt: &mut Runtime, name: &'static str, log: &LogSink) -> Value {
    let sink = Rc::clone(log);
    rt.context()
        .define_native(name, move |_, _, _| {
            sink.borrow_mut().push(name.to_string());
            Ok(Value::undefined())
        })
        .unwrap();
    rt.context_ref().get_global(name).unwrap()
}

#[test]
fn microtasks_run_before_macrotasks() {
    // queueMicrotask(f1); setTimeout(f2, 0); queueMicrotask(f3)
    // must run f1, f3, f2.
    let log: LogSink = Rc::new(RefCell::new(Vec::new()));
    let mut rt = Runtime::new().unwrap();
    let f1 = logger(&mut rt, "f1", &log);
    let f2 = logger(&mut rt, "f2", &log);
    let f3 = logger(&mut rt, "f3", &log);

    rt.queue_microtask(f1);
    rt.set_timeout(f2, Duration::ZERO);
    rt.queue_microtask(f3);
    rt.drive_to_quiescence().unwrap();

    assert_eq!(*log.borrow(), vec!["f1", "f3", "f2"]);
}

#[test]
fn microtasks_enqueued_while_draining_still_precede_macrotasks() {
    let log: LogSink = Rc::new(RefCell::new(Vec::new()));
    let mut rt = Runtime::new().unwrap();
    let chained = logger(&mut rt, "chained", &log);
    let timer_cb = logger(&mut rt, "timer", &log);

    // The first microtask enqueues another; both run before the timer.
    let sink = Rc::clone(&log);
    rt.context()
        .define_native("first", move |ctx, _, _| {
            sink.borrow_mut().push("first".to_string());
            let next = ctx.get_global("chained").unwrap();
            ctx.enqueue_microtask(Job::Call {
                callback: next,
                this: Value::undefined(),
                args: Vec::new(),
            });
            Ok(Value::undefined())
        })
        .unwrap();
    let first = rt.context_ref().get_global("first").unwrap();
    // Silence the unused binding; `chained` reaches the queue by name.
    let _ = chained;

    rt.set_timeout(timer_cb, Duration::ZERO);
    rt.queue_microtask(first);
    rt.drive_to_quiescence().unwrap();

    assert_eq!(*log.borrow(), vec!["first", "chained", "timer"]);
}

#[test]
fn macrotasks_are_fifo_with_microtask_drain_between() {
    let log: LogSink = Rc::new(RefCell::new(Vec::new()));
    let mut rt = Runtime::new().unwrap();
    let micro = logger(&mut rt, "micro", &log);
    let second_timer = logger(&mut rt, "t2", &log);
    let _ = micro;

    // First timer callback enqueues a microtask, which must run before
    // the second timer callback.
    let sink = Rc::clone(&log);
    rt.context()
        .define_native("t1", move |ctx, _, _| {
            sink.borrow_mut().push("t1".to_string());
            let callback = ctx.get_global("micro").unwrap();
            ctx.enqueue_microtask(Job::Call {
                callback,
                this: Value::undefined(),
                args: Vec::new(),
            });
            Ok(Value::undefined())
        })
        .unwrap();
    let first_timer = rt.context_ref().get_global("t1").unwrap();

    rt.set_timeout(first_timer, Duration::ZERO);
    rt.set_timeout(second_timer, Duration::ZERO);
    rt.drive_to_quiescence().unwrap();

    assert_eq!(*log.borrow(), vec!["t1", "micro", "t2"]);
}

#[test]
fn cancelled_timer_never_fires() {
    let log: LogSink = Rc::new(RefCell::new(Vec::new()));
    let mut rt = Runtime::new().unwrap();
    let doomed = logger(&mut rt, "doomed", &log);
    let survivor = logger(&mut rt, "survivor", &log);

    let id = rt.set_timeout(doomed, Duration::from_millis(5));
    rt.set_timeout(survivor, Duration::from_millis(1));
    assert!(rt.clear_timer(id));
    rt.drive_to_quiescence().unwrap();

    assert_eq!(*log.borrow(), vec!["survivor"]);
}

#[test]
fn interval_repeats_until_cleared() {
    let count = Rc::new(Cell::new(0u32));
    let timer_id = Rc::new(Cell::new(0u64));
    let mut rt = Runtime::new().unwrap();

    let count_in = Rc::clone(&count);
    let id_in = Rc::clone(&timer_id);
    rt.context()
        .define_native("tick", move |ctx, _, _| {
            let n = count_in.get() + 1;
            count_in.set(n);
            if n >= 3 {
                ctx.push_effect(ScheduledEffect::CancelTimer { id: id_in.get() });
            }
            Ok(Value::undefined())
        })
        .unwrap();
    let tick = rt.context_ref().get_global("tick").unwrap();

    let id = rt.set_interval(tick, Duration::from_millis(1));
    timer_id.set(id);
    rt.drive_to_quiescence().unwrap();

    assert_eq!(count.get(), 3);
    assert_eq!(rt.stats().pending_timers, 0);
}

#[test]
fn failed_task_is_reported_and_loop_continues() {
    let log: LogSink = Rc::new(RefCell::new(Vec::new()));
    let mut rt = Runtime::new().unwrap();
    let after = logger(&mut rt, "after", &log);

    rt.context()
        .define_native("explode", |_, _, _| {
            Err(VmError::type_error("task went sideways"))
        })
        .unwrap();
    let explode = rt.context_ref().get_global("explode").unwrap();

    rt.set_timeout(explode, Duration::ZERO);
    rt.set_timeout(after, Duration::from_millis(1));
    rt.drive_to_quiescence().unwrap();

    // The failing task did not halt the loop.
    assert_eq!(*log.borrow(), vec!["after"]);
    let errors = rt.take_unhandled_errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].name, "TypeError");
    assert_eq!(errors[0].message, "task went sideways");
}

#[test]
fn host_completions_run_after_queued_work() {
    let log: LogSink = Rc::new(RefCell::new(Vec::new()));
    let mut rt = Runtime::new().unwrap();
    let micro = logger(&mut rt, "micro", &log);
    let completion = logger(&mut rt, "completion", &log);

    rt.push_host_completion(completion, vec![]);
    rt.queue_microtask(micro);
    rt.drive_to_quiescence().unwrap();

    assert_eq!(*log.borrow(), vec!["micro", "completion"]);
}

#[test]
fn queued_callbacks_survive_collection() {
    let count = Rc::new(Cell::new(0u32));
    let mut rt = Runtime::new().unwrap();

    let count_in = Rc::clone(&count);
    rt.context()
        .define_native("once", move |_, _, _| {
            count_in.set(count_in.get() + 1);
            Ok(Value::undefined())
        })
        .unwrap();
    let once = rt.context_ref().get_global("once").unwrap();

    // Drop the global binding so the queue is the only root.
    rt.context().set_global("once", Value::undefined()).unwrap();
    rt.queue_microtask(once);

    rt.context().heap.force_major();
    rt.drive_to_quiescence().unwrap();
    assert_eq!(count.get(), 1);
}

#[test]
fn introspection_reports_queue_depths() {
    let log: LogSink = Rc::new(RefCell::new(Vec::new()));
    let mut rt = Runtime::new().unwrap();
    let cb = logger(&mut rt, "cb", &log);

    rt.queue_microtask(cb);
    rt.queue_microtask(cb);
    rt.set_timeout(cb, Duration::from_secs(60));

    let stats = rt.stats();
    assert_eq!(stats.microtask_depth, 2);
    assert_eq!(stats.pending_timers, 1);
    assert!(stats.live_objects > 0);
    assert!(stats.heap_used_bytes > 0);

    // Clean up the distant timer so the test ends promptly.
    let drained = rt.drive_once().unwrap();
    assert!(drained); // the timer is still pending
    assert_eq!(rt.stats().microtask_depth, 0);
}

/// Full pipeline: an async function awaits a host-provided delay promise;
/// execution order crosses the scheduler exactly as specified.
#[test]
fn async_function_awaits_timer_backed_promise() {
    let log: LogSink = Rc::new(RefCell::new(Vec::new()));
    let mut rt = Runtime::new().unwrap();
    let _ = logger(&mut rt, "async_start", &log);
    let _ = logger(&mut rt, "after_await", &log);
    let _ = logger(&mut rt, "sync_end", &log);

    // delay(ms): promise resolved by a timer.
    rt.context()
        .define_native("delay", |ctx, _, args| {
            let ms = args
                .first()
                .map(|v| stoat_core::coerce::to_number(&ctx.heap, *v))
                .unwrap_or(0.0) as u64;
            let promise = ctx.new_promise()?;
            let resolver = NativeFunction {
                name: "resolve_delay".into(),
                // Declared so the collector keeps the promise alive while
                // only the timer holds this resolver.
                bound: vec![Value::reference(promise)],
                func: std::sync::Arc::new(move |ctx, _, _| {
                    ctx.settle_promise(
                        promise,
                        stoat_core::SettleKind::Fulfill,
                        Value::undefined(),
                    )?;
                    Ok(Value::undefined())
                }),
            };
            let resolver = ctx.alloc(HeapObject::Native(resolver))?;
            let id = ctx.alloc_timer_id();
            ctx.push_effect(ScheduledEffect::SetTimer {
                id,
                callback: Value::reference(resolver),
                delay_ms: ms,
                repeating: false,
            });
            Ok(Value::reference(promise))
        })
        .unwrap();

    let mut constants = ConstantPool::new();
    let async_start = constants.add_string("async_start");
    let after_await = constants.add_string("after_await");
    let sync_end = constants.add_string("sync_end");
    let delay_name = constants.add_string("delay");

    let body = {
        let mut f = Function::new(
            "waiter",
            vec![
                I::GetGlobal {
                    dst: r(0),
                    name: async_start,
                },
                I::Call {
                    dst: r(1),
                    callee: r(0),
                    args_start: r(2),
                    argc: 0,
                },
                I::GetGlobal {
                    dst: r(2),
                    name: delay_name,
                },
                I::LoadInt32 { dst: r(4), value: 1 },
                I::Call {
                    dst: r(3),
                    callee: r(2),
                    args_start: r(4),
                    argc: 1,
                },
                I::Await { dst: r(5), src: r(3) },
                I::GetGlobal {
                    dst: r(0),
                    name: after_await,
                },
                I::Call {
                    dst: r(1),
                    callee: r(0),
                    args_start: r(2),
                    argc: 0,
                },
                I::ReturnUndefined,
            ],
        );
        f.kind = FunctionKind::Async;
        f.register_count = 6;
        f
    };
    let main = {
        let mut f = Function::new(
            "<main>",
            vec![
                I::Closure {
                    dst: r(0),
                    func: FunctionIndex::new(1),
                },
                I::Call {
                    dst: r(1),
                    callee: r(0),
                    args_start: r(2),
                    argc: 0,
                },
                I::GetGlobal {
                    dst: r(2),
                    name: sync_end,
                },
                I::Call {
                    dst: r(3),
                    callee: r(2),
                    args_start: r(4),
                    argc: 0,
                },
                I::ReturnUndefined,
            ],
        );
        f.register_count = 8;
        f
    };

    let module = Module::new(
        "async.js",
        vec![main, body],
        constants,
        FunctionIndex::new(0),
    );
    rt.run(Arc::new(module)).unwrap();

    // The async body runs synchronously to its first await, the rest of
    // main finishes, then the timer resolves the promise and the
    // continuation runs.
    assert_eq!(*log.borrow(), vec!["async_start", "sync_end", "after_await"]);
}

#[test]
fn run_returns_top_level_completion_value() {
    let mut rt = Runtime::new().unwrap();
    let main = {
        let mut f = Function::new(
            "<main>",
            vec![
                I::LoadInt32 { dst: r(0), value: 7 },
                I::Return { src: r(0) },
            ],
        );
        f.register_count = 1;
        f
    };
    let module = Module::new(
        "seven.js",
        vec![main],
        ConstantPool::new(),
        FunctionIndex::new(0),
    );
    let value = rt.run(Arc::new(module)).unwrap();
    assert_eq!(value.as_int32(), Some(7));
}

#[test]
fn run_surfaces_uncaught_top_level_errors() {
    let mut rt = Runtime::new().unwrap();
    let mut constants = ConstantPool::new();
    let boom = constants.add_string("boom");
    let main = {
        let mut f = Function::new(
            "<main>",
            vec![
                I::LoadConst { dst: r(0), idx: boom },
                I::Throw { src: r(0) },
            ],
        );
        f.register_count = 1;
        f
    };
    let module = Module::new("boom.js", vec![main], constants, FunctionIndex::new(0));
    let err = rt.run(Arc::new(module)).unwrap_err();
    assert!(matches!(err, VmError::Thrown(_)));
}
