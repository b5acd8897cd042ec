//! Bytecode interpreter
//!
//! Executes instruction streams over activations. An [`Activation`] is a
//! stack of call frames plus suspension bookkeeping: synchronous calls
//! push frames onto the running activation, while async and generator
//! calls get their own activation so `await`/`yield` can capture it whole
//! into an explicit resumable record — suspension is owned here, not
//! borrowed from a host coroutine.

use std::sync::Arc;

use smallvec::SmallVec;
use stoat_bytecode::{FunctionIndex, FunctionKind, Instruction, Module, Register};
use stoat_gc::Ref;

use crate::coerce;
use crate::context::{Job, ResumeInput, VmContext};
use crate::error::{StackFrame, ThrownValue, VmError, VmResult};
use crate::object::{HeapObject, JsFunction, PropertyKey};
use crate::promise::{Reaction, SettleKind};
use crate::value::Value;

/// Maximum call frames per activation
const MAX_STACK_DEPTH: usize = 1000;

/// Maximum nested activations (async calls, generator resumes)
const MAX_RUN_DEPTH: u32 = 256;

/// Instructions between collection-trigger checks
const SAFEPOINT_INTERVAL: u64 = 64;

/// A call stack frame
#[derive(Debug)]
pub struct Frame {
    /// Code pointer into the module's function table
    pub function_index: FunctionIndex,
    /// The module being executed
    pub module: Arc<Module>,
    /// Program counter (instruction index)
    pub pc: usize,
    /// Virtual registers
    pub registers: Vec<Value>,
    /// This frame's environment
    pub env: Ref,
    /// The `this` binding
    pub this_value: Value,
    /// Caller register receiving the return value
    pub return_register: Option<Register>,
    /// Catch targets pushed by `PushTry`, innermost last
    pub try_handlers: Vec<usize>,
    /// Exception delivered to the innermost catch handler
    pub pending_exception: Value,
    /// Function kind, for suspension checks and `this` rules
    pub kind: FunctionKind,
}

impl Frame {
    /// Report held handles to a GC tracer.
    fn trace(&self, tracer: &mut dyn FnMut(Ref)) {
        for value in &self.registers {
            value.trace(tracer);
        }
        tracer(self.env);
        self.this_value.trace(tracer);
        self.pending_exception.trace(tracer);
    }
}

/// A resumable unit of execution: the evaluator's in-flight state across
/// a suspension, fully re-entrant.
#[derive(Debug, Default)]
pub struct Activation {
    /// Call frames, caller first
    pub frames: Vec<Frame>,
    /// Generator object owning this activation, if any
    pub owner: Option<Ref>,
    /// Promise settled when an async activation completes
    pub result_promise: Option<Ref>,
    /// Register that receives the value delivered by the next resume
    pub resume_register: Option<Register>,
}

impl Activation {
    /// Report held handles to a GC tracer.
    pub fn trace(&self, tracer: &mut dyn FnMut(Ref)) {
        for frame in &self.frames {
            frame.trace(tracer);
        }
        if let Some(owner) = self.owner {
            tracer(owner);
        }
        if let Some(promise) = self.result_promise {
            tracer(promise);
        }
    }
}

/// Resumable state of a generator object
#[derive(Debug)]
pub enum GeneratorState {
    /// Parked between resumes
    Suspended(Box<Activation>),
    /// Currently executing (or parked on an `await` inside an async
    /// generator, where the activation lives in a promise reaction)
    Running,
    /// Ran to completion, returned, or threw
    Completed,
}

/// A generator heap object
#[derive(Debug)]
pub struct JsGenerator {
    /// Resumable state
    pub state: GeneratorState,
    /// Whether `await` is legal while resumed (async generators)
    pub is_async: bool,
    /// Promise for the in-flight `next()` of an async generator
    pub pending_next: Option<Ref>,
}

impl JsGenerator {
    fn new(is_async: bool) -> Self {
        Self {
            state: GeneratorState::Running,
            is_async,
            pending_next: None,
        }
    }

    /// Report held handles to a GC tracer.
    pub fn trace(&self, tracer: &mut dyn FnMut(Ref)) {
        if let GeneratorState::Suspended(activation) = &self.state {
            activation.trace(tracer);
        }
        if let Some(promise) = self.pending_next {
            tracer(promise);
        }
    }

    /// Approximate footprint for GC accounting.
    pub fn byte_size(&self) -> usize {
        let frames = match &self.state {
            GeneratorState::Suspended(activation) => activation.frames.len(),
            _ => 0,
        };
        std::mem::size_of::<Self>() + frames * 256
    }
}

/// How a generator resume was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeMode {
    /// `gen.next(arg)`
    Next,
    /// `gen.return(arg)`
    Return,
    /// `gen.throw(arg)`
    Throw,
}

/// Outcome of running an activation
#[derive(Debug)]
pub enum RunResult {
    /// Ran to completion with this value
    Done(Value),
    /// Suspended at an `await`; the activation was parked on a promise
    /// reaction or a microtask
    Suspended,
    /// Suspended at a `yield`
    Yielded {
        /// The yielded value
        value: Value,
        /// The captured activation, to stash in the generator object
        activation: Box<Activation>,
    },
}

/// Per-instruction control flow
enum Step {
    /// Fall through (pc already updated)
    Next,
    /// Return from the current frame
    Return(Value),
    /// Suspend at `await`
    Await {
        dst: Register,
        value: Value,
    },
    /// Suspend at `yield`
    Yield {
        dst: Register,
        value: Value,
    },
}

/// Everything needed to invoke a closure, copied out of the heap so the
/// borrow ends before allocation starts.
struct ClosureInfo {
    kind: FunctionKind,
    function_index: FunctionIndex,
    module: Arc<Module>,
    env: Option<Ref>,
    bound_this: Option<Value>,
}

/// The bytecode interpreter
pub struct Interpreter {
    /// Nested activation depth (async calls, generator resumes)
    depth: u32,
    /// Instructions executed since the last safepoint check
    steps: u64,
}

impl Interpreter {
    /// Create a new interpreter
    pub fn new() -> Self {
        Self { depth: 0, steps: 0 }
    }

    /// Execute a module's entry function to completion.
    pub fn run_module(&mut self, ctx: &mut VmContext, module: Arc<Module>) -> VmResult<Value> {
        let entry = module
            .entry_function()
            .ok_or_else(|| VmError::internal("module has no entry function"))?;
        let env = ctx.new_env(None, entry.local_count)?;
        let frame = Frame {
            function_index: module.entry,
            module: Arc::clone(&module),
            pc: 0,
            registers: vec![Value::undefined(); entry.register_count as usize],
            env,
            this_value: Value::undefined(),
            return_register: None,
            try_handlers: Vec::new(),
            pending_exception: Value::undefined(),
            kind: entry.kind,
        };
        let activation = Activation {
            frames: vec![frame],
            ..Activation::default()
        };
        match self.run(ctx, activation)? {
            RunResult::Done(value) => Ok(value),
            _ => Err(VmError::internal("top-level code suspended")),
        }
    }

    /// Invoke a callable value, driving it to completion (or, for async
    /// and generator callees, to its first suspension). This is the
    /// scheduler's entry point for callbacks and reaction handlers.
    pub fn call_value(
        &mut self,
        ctx: &mut VmContext,
        callee: Value,
        this: Value,
        args: &[Value],
    ) -> VmResult<Value> {
        if let Some(native) = self.native_of(ctx, callee) {
            return native(ctx, this, args);
        }
        let Some(info) = self.closure_of(ctx, callee) else {
            let shown = coerce::to_display_string(&ctx.heap, callee);
            return Err(VmError::type_error(format!("{} is not a function", shown)));
        };
        match info.kind {
            FunctionKind::Normal | FunctionKind::Arrow => {
                let frame = self.make_frame(ctx, &info, this, args, None)?;
                let activation = Activation {
                    frames: vec![frame],
                    ..Activation::default()
                };
                match self.run(ctx, activation)? {
                    RunResult::Done(value) => Ok(value),
                    _ => Err(VmError::internal("synchronous call suspended")),
                }
            }
            FunctionKind::Async => self.call_async(ctx, &info, this, args),
            FunctionKind::Generator | FunctionKind::AsyncGenerator => {
                self.create_generator(ctx, &info, this, args)
            }
        }
    }

    /// Resume a suspended activation with a promise settlement. Called by
    /// the scheduler when the awaited promise settles.
    pub fn resume_activation(
        &mut self,
        ctx: &mut VmContext,
        mut activation: Box<Activation>,
        input: ResumeInput,
    ) -> VmResult<()> {
        let owner = activation.owner;
        let result_promise = activation.result_promise;

        let outcome = match input {
            ResumeInput::Fulfilled(value) => {
                if let Some(register) = activation.resume_register.take()
                    && let Some(frame) = activation.frames.last_mut()
                {
                    frame.registers[register.index() as usize] = value;
                }
                self.run(ctx, *activation)
            }
            ResumeInput::Rejected(error) => {
                activation.resume_register = None;
                let err = thrown_error(ctx, error, &activation);
                match Self::unwind(ctx, &mut activation, err) {
                    Ok(()) => self.run(ctx, *activation),
                    Err(uncaught) => Err(uncaught),
                }
            }
        };
        self.finish_outcome(ctx, owner, result_promise, outcome)
    }

    /// Resume a generator with `next`/`return`/`throw` semantics,
    /// producing an iterator-result object (or, for async generators, a
    /// promise of one).
    pub fn resume_generator(
        &mut self,
        ctx: &mut VmContext,
        generator: Ref,
        mode: ResumeMode,
        arg: Value,
    ) -> VmResult<Value> {
        let (state, is_async) = match ctx.heap.get_mut(generator) {
            Some(HeapObject::Generator(g)) => (
                std::mem::replace(&mut g.state, GeneratorState::Running),
                g.is_async,
            ),
            _ => return Err(VmError::type_error("value is not a generator")),
        };

        let mut activation = match state {
            GeneratorState::Completed => {
                self.set_generator_state(ctx, generator, GeneratorState::Completed)?;
                return match mode {
                    ResumeMode::Next => self.iter_result(ctx, Value::undefined(), true),
                    ResumeMode::Return => self.iter_result(ctx, arg, true),
                    ResumeMode::Throw => Err(thrown_plain(ctx, arg)),
                };
            }
            GeneratorState::Running => {
                return Err(VmError::type_error("generator is already running"));
            }
            GeneratorState::Suspended(activation) => activation,
        };

        match mode {
            ResumeMode::Next => {
                if let Some(register) = activation.resume_register.take()
                    && let Some(frame) = activation.frames.last_mut()
                {
                    frame.registers[register.index() as usize] = arg;
                }
            }
            ResumeMode::Return => {
                self.set_generator_state(ctx, generator, GeneratorState::Completed)?;
                return self.iter_result(ctx, arg, true);
            }
            ResumeMode::Throw => {
                activation.resume_register = None;
                let err = thrown_error(ctx, arg, &activation);
                if let Err(uncaught) = Self::unwind(ctx, &mut activation, err) {
                    self.set_generator_state(ctx, generator, GeneratorState::Completed)?;
                    return Err(uncaught);
                }
            }
        }

        match self.run(ctx, *activation) {
            Ok(RunResult::Yielded { value, activation }) => {
                self.set_generator_state(ctx, generator, GeneratorState::Suspended(activation))?;
                self.iter_result(ctx, value, false)
            }
            Ok(RunResult::Done(value)) => {
                self.set_generator_state(ctx, generator, GeneratorState::Completed)?;
                self.iter_result(ctx, value, true)
            }
            Ok(RunResult::Suspended) => {
                // Parked on an await inside an async generator; hand the
                // caller a promise for the eventual iterator result.
                if !is_async {
                    return Err(VmError::internal("synchronous generator awaited"));
                }
                let next_promise = ctx.new_promise()?;
                match ctx.heap.get_mut(generator) {
                    Some(HeapObject::Generator(g)) => g.pending_next = Some(next_promise),
                    _ => return Err(VmError::internal("generator vanished during resume")),
                }
                ctx.heap.write_barrier(generator, next_promise);
                Ok(Value::reference(next_promise))
            }
            Err(err) => {
                self.set_generator_state(ctx, generator, GeneratorState::Completed)?;
                Err(err)
            }
        }
    }

    // ==================== Activation driving ====================

    fn run(&mut self, ctx: &mut VmContext, activation: Activation) -> VmResult<RunResult> {
        if self.depth >= MAX_RUN_DEPTH {
            return Err(VmError::StackOverflow);
        }
        self.depth += 1;
        let result = self.run_loop(ctx, activation);
        self.depth -= 1;
        result
    }

    fn run_loop(&mut self, ctx: &mut VmContext, mut act: Activation) -> VmResult<RunResult> {
        loop {
            self.steps += 1;
            if self.steps % SAFEPOINT_INTERVAL == 0 {
                self.maybe_collect(ctx, &act);
            }

            let instruction = {
                let frame = act
                    .frames
                    .last()
                    .ok_or_else(|| VmError::internal("activation has no frames"))?;
                let function = frame
                    .module
                    .function(frame.function_index)
                    .ok_or_else(|| VmError::internal("function index out of bounds"))?;
                if frame.pc >= function.instructions.len() {
                    // Implicit return undefined at the end of the body.
                    if let Some(result) = Self::do_return(&mut act, Value::undefined()) {
                        return Ok(result);
                    }
                    continue;
                }
                function.instructions[frame.pc].clone()
            };

            let step = match self.step(ctx, &mut act, instruction) {
                Ok(step) => step,
                Err(err) => {
                    Self::unwind(ctx, &mut act, err)?;
                    continue;
                }
            };

            match step {
                Step::Next => {}
                Step::Return(value) => {
                    if let Some(result) = Self::do_return(&mut act, value) {
                        return Ok(result);
                    }
                }
                Step::Await { dst, value } => {
                    {
                        let frame = act
                            .frames
                            .last()
                            .ok_or_else(|| VmError::internal("activation has no frames"))?;
                        if !frame.kind.is_async() || act.frames.len() != 1 {
                            return Err(VmError::internal("await outside an async function body"));
                        }
                    }
                    act.resume_register = Some(dst);
                    let boxed = Box::new(act);
                    let is_promise = value
                        .as_reference()
                        .is_some_and(|h| matches!(ctx.heap.get(h), Some(HeapObject::Promise(_))));
                    if let Some(promise) = value.as_reference().filter(|_| is_promise) {
                        ctx.add_reaction(promise, Reaction::continuation(boxed))?;
                    } else {
                        // Awaiting a plain value still defers a tick.
                        ctx.enqueue_microtask(Job::Resume {
                            activation: boxed,
                            input: ResumeInput::Fulfilled(value),
                        });
                    }
                    return Ok(RunResult::Suspended);
                }
                Step::Yield { dst, value } => {
                    {
                        let frame = act
                            .frames
                            .last()
                            .ok_or_else(|| VmError::internal("activation has no frames"))?;
                        if !frame.kind.is_generator() || act.frames.len() != 1 {
                            return Err(VmError::internal("yield outside a generator body"));
                        }
                    }
                    act.resume_register = Some(dst);
                    return Ok(RunResult::Yielded {
                        value,
                        activation: Box::new(act),
                    });
                }
            }
        }
    }

    /// Pop the current frame, delivering `value` to the caller. Returns
    /// the final result when the base frame returned.
    fn do_return(act: &mut Activation, value: Value) -> Option<RunResult> {
        let frame = act.frames.pop()?;
        if act.frames.is_empty() {
            return Some(RunResult::Done(value));
        }
        if let Some(register) = frame.return_register
            && let Some(caller) = act.frames.last_mut()
        {
            caller.registers[register.index() as usize] = value;
        }
        None
    }

    /// Unwind `err` through the activation's try handlers. On success the
    /// activation is positioned at a catch block; otherwise the error
    /// (now carrying a trace) propagates.
    fn unwind(ctx: &mut VmContext, act: &mut Activation, err: VmError) -> VmResult<()> {
        if !err.is_catchable() {
            return Err(err);
        }
        let stack = stack_trace(act);
        let message = match &err {
            VmError::Thrown(thrown) => thrown.message.clone(),
            other => other.to_string(),
        };
        let value = match &err {
            VmError::Thrown(thrown) => thrown.value,
            other => ctx.error_to_value(other, &stack)?,
        };

        loop {
            let Some(frame) = act.frames.last_mut() else {
                return Err(VmError::Thrown(Box::new(ThrownValue {
                    value,
                    message,
                    stack,
                })));
            };
            if let Some(catch_pc) = frame.try_handlers.pop() {
                frame.pc = catch_pc;
                frame.pending_exception = value;
                return Ok(());
            }
            act.frames.pop();
        }
    }

    /// Trigger a pending collection at a safepoint, supplying the full
    /// root set: the live activation, plus everything the context holds.
    /// Only the outermost run loop collects, so nested activations are
    /// never invisible to the tracer.
    fn maybe_collect(&self, ctx: &mut VmContext, act: &Activation) {
        if self.depth != 1 {
            return;
        }
        if !ctx.heap.wants_major() && !ctx.heap.wants_minor() {
            return;
        }
        let mut roots: Vec<Ref> = Vec::with_capacity(64);
        act.trace(&mut |r| roots.push(r));
        ctx.trace_roots(&mut |r| roots.push(r));
        if ctx.heap.wants_major() {
            ctx.heap.collect_major(&roots);
        } else {
            ctx.heap.collect_minor(&roots);
        }
    }

    // ==================== Instruction dispatch ====================

    #[allow(clippy::too_many_lines)]
    fn step(
        &mut self,
        ctx: &mut VmContext,
        act: &mut Activation,
        instruction: Instruction,
    ) -> VmResult<Step> {
        use Instruction as I;

        macro_rules! frame {
            () => {
                act.frames
                    .last_mut()
                    .ok_or_else(|| VmError::internal("activation has no frames"))?
            };
        }
        macro_rules! reg {
            ($f:expr, $r:expr) => {
                $f.registers[$r.index() as usize]
            };
        }

        match instruction {
            I::LoadUndefined { dst } => {
                let frame = frame!();
                reg!(frame, dst) = Value::undefined();
                frame.pc += 1;
            }
            I::LoadNull { dst } => {
                let frame = frame!();
                reg!(frame, dst) = Value::null();
                frame.pc += 1;
            }
            I::LoadTrue { dst } => {
                let frame = frame!();
                reg!(frame, dst) = Value::boolean(true);
                frame.pc += 1;
            }
            I::LoadFalse { dst } => {
                let frame = frame!();
                reg!(frame, dst) = Value::boolean(false);
                frame.pc += 1;
            }
            I::LoadInt32 { dst, value } => {
                let frame = frame!();
                reg!(frame, dst) = Value::int32(value);
                frame.pc += 1;
            }
            I::LoadConst { dst, idx } => {
                let constant = {
                    let frame = frame!();
                    frame
                        .module
                        .constants
                        .get(idx)
                        .ok_or_else(|| VmError::internal("constant index out of bounds"))?
                        .clone()
                };
                let value = match constant {
                    stoat_bytecode::Constant::Number(n) => Value::number(n),
                    stoat_bytecode::Constant::String(s) => ctx.alloc_string(s)?,
                };
                let frame = frame!();
                reg!(frame, dst) = value;
                frame.pc += 1;
            }
            I::Move { dst, src } => {
                let frame = frame!();
                reg!(frame, dst) = reg!(frame, src);
                frame.pc += 1;
            }

            I::GetLocal { dst, slot } => {
                let env = frame!().env;
                let value = ctx.env_get(env, 0, slot.index())?;
                let frame = frame!();
                reg!(frame, dst) = value;
                frame.pc += 1;
            }
            I::SetLocal { slot, src } => {
                let (env, value) = {
                    let frame = frame!();
                    (frame.env, reg!(frame, src))
                };
                ctx.env_set(env, 0, slot.index(), value)?;
                frame!().pc += 1;
            }
            I::GetCaptured { dst, depth, slot } => {
                let env = frame!().env;
                let value = ctx.env_get(env, depth, slot.index())?;
                let frame = frame!();
                reg!(frame, dst) = value;
                frame.pc += 1;
            }
            I::SetCaptured { depth, slot, src } => {
                let (env, value) = {
                    let frame = frame!();
                    (frame.env, reg!(frame, src))
                };
                ctx.env_set(env, depth, slot.index(), value)?;
                frame!().pc += 1;
            }
            I::GetGlobal { dst, name } => {
                let name_str = self.constant_str(act, name)?;
                let value = ctx.get_global(&name_str).ok_or_else(|| {
                    VmError::reference_error(format!("{} is not defined", name_str))
                })?;
                let frame = frame!();
                reg!(frame, dst) = value;
                frame.pc += 1;
            }
            I::SetGlobal { name, src } => {
                let name_str = self.constant_str(act, name)?;
                let value = reg!(frame!(), src);
                ctx.set_global(&name_str, value)?;
                frame!().pc += 1;
            }
            I::LoadThis { dst } => {
                let frame = frame!();
                reg!(frame, dst) = frame.this_value;
                frame.pc += 1;
            }
            I::PushScope { slots } => {
                let parent = frame!().env;
                let env = ctx.new_env(Some(parent), slots)?;
                let frame = frame!();
                frame.env = env;
                frame.pc += 1;
            }
            I::PopScope => {
                let env = frame!().env;
                let parent = match ctx.heap.get(env) {
                    Some(HeapObject::Environment(e)) => e
                        .parent
                        .ok_or_else(|| VmError::internal("PopScope past function scope"))?,
                    _ => return Err(VmError::internal("expected environment frame")),
                };
                let frame = frame!();
                frame.env = parent;
                frame.pc += 1;
            }

            I::Add { dst, lhs, rhs } => {
                let (a, b) = {
                    let frame = frame!();
                    (reg!(frame, lhs), reg!(frame, rhs))
                };
                let result = coerce::add(ctx, a, b)?;
                let frame = frame!();
                reg!(frame, dst) = result;
                frame.pc += 1;
            }
            I::Sub { dst, lhs, rhs } => {
                self.numeric_binop(ctx, act, dst, lhs, rhs, |a, b| a - b)?;
            }
            I::Mul { dst, lhs, rhs } => {
                self.numeric_binop(ctx, act, dst, lhs, rhs, |a, b| a * b)?;
            }
            I::Div { dst, lhs, rhs } => {
                self.numeric_binop(ctx, act, dst, lhs, rhs, |a, b| a / b)?;
            }
            I::Mod { dst, lhs, rhs } => {
                // `%` on f64 is truncated remainder, matching the language.
                self.numeric_binop(ctx, act, dst, lhs, rhs, |a, b| a % b)?;
            }
            I::Neg { dst, src } => {
                let value = reg!(frame!(), src);
                let n = coerce::to_number(&ctx.heap, value);
                let frame = frame!();
                reg!(frame, dst) = Value::number(-n);
                frame.pc += 1;
            }

            I::Eq { dst, lhs, rhs } => {
                self.comparison(ctx, act, dst, lhs, rhs, |heap, a, b| {
                    coerce::loose_equals(heap, a, b)
                })?;
            }
            I::Ne { dst, lhs, rhs } => {
                self.comparison(ctx, act, dst, lhs, rhs, |heap, a, b| {
                    !coerce::loose_equals(heap, a, b)
                })?;
            }
            I::StrictEq { dst, lhs, rhs } => {
                self.comparison(ctx, act, dst, lhs, rhs, |heap, a, b| {
                    coerce::strict_equals(heap, a, b)
                })?;
            }
            I::StrictNe { dst, lhs, rhs } => {
                self.comparison(ctx, act, dst, lhs, rhs, |heap, a, b| {
                    !coerce::strict_equals(heap, a, b)
                })?;
            }
            I::Lt { dst, lhs, rhs } => {
                self.comparison(ctx, act, dst, lhs, rhs, |heap, a, b| {
                    matches!(coerce::compare(heap, a, b), Some(std::cmp::Ordering::Less))
                })?;
            }
            I::Le { dst, lhs, rhs } => {
                self.comparison(ctx, act, dst, lhs, rhs, |heap, a, b| {
                    matches!(
                        coerce::compare(heap, a, b),
                        Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
                    )
                })?;
            }
            I::Gt { dst, lhs, rhs } => {
                self.comparison(ctx, act, dst, lhs, rhs, |heap, a, b| {
                    matches!(coerce::compare(heap, a, b), Some(std::cmp::Ordering::Greater))
                })?;
            }
            I::Ge { dst, lhs, rhs } => {
                self.comparison(ctx, act, dst, lhs, rhs, |heap, a, b| {
                    matches!(
                        coerce::compare(heap, a, b),
                        Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
                    )
                })?;
            }

            I::Not { dst, src } => {
                let value = reg!(frame!(), src);
                let result = !coerce::to_boolean(&ctx.heap, value);
                let frame = frame!();
                reg!(frame, dst) = Value::boolean(result);
                frame.pc += 1;
            }
            I::TypeOf { dst, src } => {
                let value = reg!(frame!(), src);
                let name = coerce::type_of(&ctx.heap, value);
                let result = ctx.alloc_string(name)?;
                let frame = frame!();
                reg!(frame, dst) = result;
                frame.pc += 1;
            }

            I::NewObject { dst } => {
                let handle = ctx.alloc(HeapObject::Object(crate::object::JsObject::new()))?;
                let frame = frame!();
                reg!(frame, dst) = Value::reference(handle);
                frame.pc += 1;
            }
            I::NewArray { dst } => {
                let handle = ctx.alloc(HeapObject::Array(crate::object::JsArray::new()))?;
                let frame = frame!();
                reg!(frame, dst) = Value::reference(handle);
                frame.pc += 1;
            }
            I::GetProp { dst, obj, key } => {
                let (target, key_value) = {
                    let frame = frame!();
                    (reg!(frame, obj), reg!(frame, key))
                };
                let key = ctx.property_key(key_value)?;
                let value = ctx.get_property(target, &key)?;
                let frame = frame!();
                reg!(frame, dst) = value;
                frame.pc += 1;
            }
            I::SetProp { obj, key, src } => {
                let (target, key_value, value) = {
                    let frame = frame!();
                    (reg!(frame, obj), reg!(frame, key), reg!(frame, src))
                };
                let key = ctx.property_key(key_value)?;
                ctx.set_property(target, key, value)?;
                frame!().pc += 1;
            }
            I::GetPropConst { dst, obj, name } => {
                let name_str = self.constant_str(act, name)?;
                let target = reg!(frame!(), obj);
                let value = ctx.get_property(target, &PropertyKey::from_name(&name_str))?;
                let frame = frame!();
                reg!(frame, dst) = value;
                frame.pc += 1;
            }
            I::SetPropConst { obj, name, src } => {
                let name_str = self.constant_str(act, name)?;
                let (target, value) = {
                    let frame = frame!();
                    (reg!(frame, obj), reg!(frame, src))
                };
                ctx.set_property(target, PropertyKey::from_name(&name_str), value)?;
                frame!().pc += 1;
            }
            I::ArrayPush { arr, src } => {
                let (target, value) = {
                    let frame = frame!();
                    (reg!(frame, arr), reg!(frame, src))
                };
                let handle = target
                    .as_reference()
                    .ok_or_else(|| VmError::type_error("push target is not an array"))?;
                match ctx.heap.get_mut(handle) {
                    Some(HeapObject::Array(a)) => a.push(value),
                    _ => return Err(VmError::type_error("push target is not an array")),
                }
                if let Some(stored) = value.as_reference() {
                    ctx.heap.write_barrier(handle, stored);
                }
                frame!().pc += 1;
            }

            I::Closure { dst, func } => {
                let closure = {
                    let frame = frame!();
                    let target = frame
                        .module
                        .function(func)
                        .ok_or_else(|| VmError::internal("closure target out of bounds"))?;
                    JsFunction {
                        kind: target.kind,
                        function_index: func,
                        module: Arc::clone(&frame.module),
                        env: Some(frame.env),
                        bound_this: if target.kind == FunctionKind::Arrow {
                            Some(frame.this_value)
                        } else {
                            None
                        },
                        name: target.name.clone(),
                    }
                };
                let handle = ctx.alloc(HeapObject::Function(closure))?;
                let frame = frame!();
                reg!(frame, dst) = Value::reference(handle);
                frame.pc += 1;
            }
            I::Call {
                dst,
                callee,
                args_start,
                argc,
            } => {
                let (callee_value, args) = {
                    let frame = frame!();
                    let callee_value = reg!(frame, callee);
                    let start = args_start.index() as usize;
                    let args: SmallVec<[Value; 8]> =
                        SmallVec::from_slice(&frame.registers[start..start + argc as usize]);
                    (callee_value, args)
                };
                frame!().pc += 1;
                self.invoke(ctx, act, callee_value, Value::undefined(), &args, dst)?;
            }
            I::CallMethod {
                dst,
                obj,
                name,
                args_start,
                argc,
            } => {
                let name_str = self.constant_str(act, name)?;
                let (receiver, args) = {
                    let frame = frame!();
                    let receiver = reg!(frame, obj);
                    let start = args_start.index() as usize;
                    let args: SmallVec<[Value; 8]> =
                        SmallVec::from_slice(&frame.registers[start..start + argc as usize]);
                    (receiver, args)
                };
                let callee_value =
                    ctx.get_property(receiver, &PropertyKey::from_name(&name_str))?;
                frame!().pc += 1;
                self.invoke(ctx, act, callee_value, receiver, &args, dst)?;
            }
            I::Return { src } => {
                let value = reg!(frame!(), src);
                return Ok(Step::Return(value));
            }
            I::ReturnUndefined => {
                return Ok(Step::Return(Value::undefined()));
            }

            I::Jump { offset } => {
                let frame = frame!();
                frame.pc = offset_pc(frame.pc, offset.offset())?;
            }
            I::JumpIfTrue { cond, offset } => {
                let value = reg!(frame!(), cond);
                let taken = coerce::to_boolean(&ctx.heap, value);
                let frame = frame!();
                frame.pc = if taken {
                    offset_pc(frame.pc, offset.offset())?
                } else {
                    frame.pc + 1
                };
            }
            I::JumpIfFalse { cond, offset } => {
                let value = reg!(frame!(), cond);
                let taken = !coerce::to_boolean(&ctx.heap, value);
                let frame = frame!();
                frame.pc = if taken {
                    offset_pc(frame.pc, offset.offset())?
                } else {
                    frame.pc + 1
                };
            }
            I::JumpIfNullish { cond, offset } => {
                let frame = frame!();
                let taken = reg!(frame, cond).is_nullish();
                frame.pc = if taken {
                    offset_pc(frame.pc, offset.offset())?
                } else {
                    frame.pc + 1
                };
            }

            I::PushTry { catch_offset } => {
                let frame = frame!();
                let catch_pc = offset_pc(frame.pc, catch_offset.offset())?;
                frame.try_handlers.push(catch_pc);
                frame.pc += 1;
            }
            I::PopTry => {
                let frame = frame!();
                frame
                    .try_handlers
                    .pop()
                    .ok_or_else(|| VmError::internal("PopTry without handler"))?;
                frame.pc += 1;
            }
            I::Throw { src } => {
                let value = reg!(frame!(), src);
                return Err(thrown_error(ctx, value, act));
            }
            I::LoadException { dst } => {
                let frame = frame!();
                reg!(frame, dst) = frame.pending_exception;
                frame.pc += 1;
            }

            I::Await { dst, src } => {
                let frame = frame!();
                let value = reg!(frame, src);
                frame.pc += 1;
                return Ok(Step::Await { dst, value });
            }
            I::Yield { dst, src } => {
                let frame = frame!();
                let value = reg!(frame, src);
                frame.pc += 1;
                return Ok(Step::Yield { dst, value });
            }
            I::GeneratorNext { dst, r#gen, arg } => {
                self.generator_op(ctx, act, dst, r#gen, arg, ResumeMode::Next)?;
            }
            I::GeneratorReturn { dst, r#gen, arg } => {
                self.generator_op(ctx, act, dst, r#gen, arg, ResumeMode::Return)?;
            }
            I::GeneratorThrow { dst, r#gen, arg } => {
                self.generator_op(ctx, act, dst, r#gen, arg, ResumeMode::Throw)?;
            }

            I::Nop => {
                frame!().pc += 1;
            }
        }
        Ok(Step::Next)
    }

    // ==================== Calls ====================

    /// Invoke a callee from within the run loop. Synchronous closures
    /// push a frame; natives, async calls, and generator construction
    /// complete immediately and write straight into `dst`.
    fn invoke(
        &mut self,
        ctx: &mut VmContext,
        act: &mut Activation,
        callee: Value,
        this: Value,
        args: &[Value],
        dst: Register,
    ) -> VmResult<()> {
        let write_dst = |act: &mut Activation, value: Value| -> VmResult<()> {
            let frame = act
                .frames
                .last_mut()
                .ok_or_else(|| VmError::internal("activation has no frames"))?;
            frame.registers[dst.index() as usize] = value;
            Ok(())
        };

        if let Some(native) = self.native_of(ctx, callee) {
            let result = native(ctx, this, args)?;
            return write_dst(act, result);
        }
        let Some(info) = self.closure_of(ctx, callee) else {
            let shown = coerce::to_display_string(&ctx.heap, callee);
            return Err(VmError::type_error(format!("{} is not a function", shown)));
        };
        match info.kind {
            FunctionKind::Normal | FunctionKind::Arrow => {
                if act.frames.len() >= MAX_STACK_DEPTH {
                    return Err(VmError::StackOverflow);
                }
                let frame = self.make_frame(ctx, &info, this, args, Some(dst))?;
                act.frames.push(frame);
                Ok(())
            }
            FunctionKind::Async => {
                let promise = self.call_async(ctx, &info, this, args)?;
                write_dst(act, promise)
            }
            FunctionKind::Generator | FunctionKind::AsyncGenerator => {
                let generator = self.create_generator(ctx, &info, this, args)?;
                write_dst(act, generator)
            }
        }
    }

    /// Call an async function: runs the body synchronously to its first
    /// await and returns the result promise.
    fn call_async(
        &mut self,
        ctx: &mut VmContext,
        info: &ClosureInfo,
        this: Value,
        args: &[Value],
    ) -> VmResult<Value> {
        let promise = ctx.new_promise()?;
        let frame = self.make_frame(ctx, info, this, args, None)?;
        let activation = Activation {
            frames: vec![frame],
            result_promise: Some(promise),
            ..Activation::default()
        };
        let outcome = self.run(ctx, activation);
        self.finish_outcome(ctx, None, Some(promise), outcome)?;
        Ok(Value::reference(promise))
    }

    /// Call a generator function: builds the suspended-at-start
    /// activation without executing any of the body.
    fn create_generator(
        &mut self,
        ctx: &mut VmContext,
        info: &ClosureInfo,
        this: Value,
        args: &[Value],
    ) -> VmResult<Value> {
        let frame = self.make_frame(ctx, info, this, args, None)?;
        let generator = ctx.alloc(HeapObject::Generator(JsGenerator::new(
            info.kind == FunctionKind::AsyncGenerator,
        )))?;
        let activation = Activation {
            frames: vec![frame],
            owner: Some(generator),
            ..Activation::default()
        };
        match ctx.heap.get_mut(generator) {
            Some(HeapObject::Generator(g)) => {
                g.state = GeneratorState::Suspended(Box::new(activation));
            }
            _ => return Err(VmError::internal("generator allocation vanished")),
        }
        Ok(Value::reference(generator))
    }

    /// Deliver a finished (or suspended) activation outcome to its async
    /// promise or owning generator.
    fn finish_outcome(
        &mut self,
        ctx: &mut VmContext,
        owner: Option<Ref>,
        result_promise: Option<Ref>,
        outcome: VmResult<RunResult>,
    ) -> VmResult<()> {
        match outcome {
            Ok(RunResult::Done(value)) => {
                if let Some(promise) = result_promise {
                    ctx.settle_promise(promise, SettleKind::Fulfill, value)?;
                }
                if let Some(generator) = owner {
                    self.set_generator_state(ctx, generator, GeneratorState::Completed)?;
                    let result = self.iter_result(ctx, value, true)?;
                    self.settle_pending_next(ctx, generator, SettleKind::Fulfill, result)?;
                }
                Ok(())
            }
            Ok(RunResult::Suspended) => Ok(()),
            Ok(RunResult::Yielded { value, activation }) => {
                let Some(generator) = owner else {
                    return Err(VmError::internal("yield outside a generator"));
                };
                self.set_generator_state(ctx, generator, GeneratorState::Suspended(activation))?;
                let result = self.iter_result(ctx, value, false)?;
                self.settle_pending_next(ctx, generator, SettleKind::Fulfill, result)
            }
            Err(err) => {
                if !err.is_catchable() {
                    return Err(err);
                }
                if result_promise.is_none() && owner.is_none() {
                    return Err(err);
                }
                let stack: Vec<StackFrame> = Vec::new();
                let value = ctx.error_to_value(&err, &stack)?;
                if let Some(promise) = result_promise {
                    ctx.settle_promise(promise, SettleKind::Reject, value)?;
                }
                if let Some(generator) = owner {
                    self.set_generator_state(ctx, generator, GeneratorState::Completed)?;
                    self.settle_pending_next(ctx, generator, SettleKind::Reject, value)?;
                }
                Ok(())
            }
        }
    }

    fn settle_pending_next(
        &mut self,
        ctx: &mut VmContext,
        generator: Ref,
        kind: SettleKind,
        value: Value,
    ) -> VmResult<()> {
        let pending = match ctx.heap.get_mut(generator) {
            Some(HeapObject::Generator(g)) => g.pending_next.take(),
            _ => None,
        };
        if let Some(promise) = pending {
            ctx.settle_promise(promise, kind, value)?;
        }
        Ok(())
    }

    fn set_generator_state(
        &mut self,
        ctx: &mut VmContext,
        generator: Ref,
        state: GeneratorState,
    ) -> VmResult<()> {
        // The generator may have been promoted; every handle stashed into
        // it must pass the write barrier.
        let mut stored: SmallVec<[Ref; 16]> = SmallVec::new();
        if let GeneratorState::Suspended(activation) = &state {
            activation.trace(&mut |r| stored.push(r));
        }
        match ctx.heap.get_mut(generator) {
            Some(HeapObject::Generator(g)) => g.state = state,
            _ => return Err(VmError::internal("expected generator object")),
        }
        for handle in stored {
            ctx.heap.write_barrier(generator, handle);
        }
        Ok(())
    }

    fn make_frame(
        &mut self,
        ctx: &mut VmContext,
        info: &ClosureInfo,
        this: Value,
        args: &[Value],
        return_register: Option<Register>,
    ) -> VmResult<Frame> {
        let function = info
            .module
            .function(info.function_index)
            .ok_or_else(|| VmError::internal("function index out of bounds"))?;
        let env = ctx.new_env(info.env, function.local_count)?;
        let bound = function.param_count.min(args.len() as u16);
        for i in 0..bound {
            ctx.env_set(env, 0, i, args[i as usize])?;
        }
        // Arrows never rebind `this`; bound functions use their stored
        // value; plain calls use the call-site receiver.
        let this_value = match function.kind {
            FunctionKind::Arrow => info.bound_this.unwrap_or(Value::undefined()),
            _ => info.bound_this.unwrap_or(this),
        };
        Ok(Frame {
            function_index: info.function_index,
            module: Arc::clone(&info.module),
            pc: 0,
            registers: vec![Value::undefined(); function.register_count as usize],
            env,
            this_value,
            return_register,
            try_handlers: Vec::new(),
            pending_exception: Value::undefined(),
            kind: function.kind,
        })
    }

    // ==================== Helpers ====================

    fn generator_op(
        &mut self,
        ctx: &mut VmContext,
        act: &mut Activation,
        dst: Register,
        r#gen: Register,
        arg: Register,
        mode: ResumeMode,
    ) -> VmResult<()> {
        let (gen_value, arg_value) = {
            let frame = act
                .frames
                .last()
                .ok_or_else(|| VmError::internal("activation has no frames"))?;
            (
                frame.registers[r#gen.index() as usize],
                frame.registers[arg.index() as usize],
            )
        };
        let handle = gen_value
            .as_reference()
            .ok_or_else(|| VmError::type_error("value is not a generator"))?;
        let result = self.resume_generator(ctx, handle, mode, arg_value)?;
        let frame = act
            .frames
            .last_mut()
            .ok_or_else(|| VmError::internal("activation has no frames"))?;
        frame.registers[dst.index() as usize] = result;
        frame.pc += 1;
        Ok(())
    }

    fn numeric_binop(
        &mut self,
        ctx: &mut VmContext,
        act: &mut Activation,
        dst: Register,
        lhs: Register,
        rhs: Register,
        op: impl Fn(f64, f64) -> f64,
    ) -> VmResult<()> {
        let frame = act
            .frames
            .last_mut()
            .ok_or_else(|| VmError::internal("activation has no frames"))?;
        let a = coerce::to_number(&ctx.heap, frame.registers[lhs.index() as usize]);
        let b = coerce::to_number(&ctx.heap, frame.registers[rhs.index() as usize]);
        frame.registers[dst.index() as usize] = Value::number(op(a, b));
        frame.pc += 1;
        Ok(())
    }

    fn comparison(
        &mut self,
        ctx: &mut VmContext,
        act: &mut Activation,
        dst: Register,
        lhs: Register,
        rhs: Register,
        op: impl Fn(&stoat_gc::Heap<HeapObject>, Value, Value) -> bool,
    ) -> VmResult<()> {
        let frame = act
            .frames
            .last_mut()
            .ok_or_else(|| VmError::internal("activation has no frames"))?;
        let a = frame.registers[lhs.index() as usize];
        let b = frame.registers[rhs.index() as usize];
        frame.registers[dst.index() as usize] = Value::boolean(op(&ctx.heap, a, b));
        frame.pc += 1;
        Ok(())
    }

    fn constant_str(
        &self,
        act: &Activation,
        index: stoat_bytecode::ConstantIndex,
    ) -> VmResult<Box<str>> {
        let frame = act
            .frames
            .last()
            .ok_or_else(|| VmError::internal("activation has no frames"))?;
        frame
            .module
            .constants
            .get(index)
            .and_then(|c| c.as_str())
            .map(Box::from)
            .ok_or_else(|| VmError::internal("expected string constant"))
    }

    fn native_of(&self, ctx: &VmContext, callee: Value) -> Option<crate::object::NativeFn> {
        let handle = callee.as_reference()?;
        match ctx.heap.get(handle) {
            Some(HeapObject::Native(n)) => Some(Arc::clone(&n.func)),
            _ => None,
        }
    }

    fn closure_of(&self, ctx: &VmContext, callee: Value) -> Option<ClosureInfo> {
        let handle = callee.as_reference()?;
        match ctx.heap.get(handle) {
            Some(HeapObject::Function(f)) => Some(ClosureInfo {
                kind: f.kind,
                function_index: f.function_index,
                module: Arc::clone(&f.module),
                env: f.env,
                bound_this: f.bound_this,
            }),
            _ => None,
        }
    }

    /// Build an iterator-result object `{ value, done }`.
    fn iter_result(&mut self, ctx: &mut VmContext, value: Value, done: bool) -> VmResult<Value> {
        let mut object = crate::object::JsObject::new();
        object.set(PropertyKey::string("value"), value);
        object.set(PropertyKey::string("done"), Value::boolean(done));
        let handle = ctx.alloc(HeapObject::Object(object))?;
        if let Some(stored) = value.as_reference() {
            ctx.heap.write_barrier(handle, stored);
        }
        Ok(Value::reference(handle))
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply a relative jump to a program counter.
fn offset_pc(pc: usize, offset: i32) -> VmResult<usize> {
    let target = pc as i64 + offset as i64;
    if target < 0 {
        return Err(VmError::internal("jump target out of bounds"));
    }
    Ok(target as usize)
}

/// Wrap a thrown value with its message and the current trace.
fn thrown_error(ctx: &VmContext, value: Value, act: &Activation) -> VmError {
    VmError::Thrown(Box::new(ThrownValue {
        value,
        message: coerce::to_display_string(&ctx.heap, value),
        stack: stack_trace(act),
    }))
}

/// Wrap a thrown value when no activation is live.
fn thrown_plain(ctx: &VmContext, value: Value) -> VmError {
    VmError::Thrown(Box::new(ThrownValue {
        value,
        message: coerce::to_display_string(&ctx.heap, value),
        stack: Vec::new(),
    }))
}

/// Frame-by-frame trace, innermost first.
fn stack_trace(act: &Activation) -> Vec<StackFrame> {
    act.frames
        .iter()
        .rev()
        .map(|frame| {
            let (name, line) = match frame.module.function(frame.function_index) {
                Some(function) => {
                    let name = if function.name.is_empty() {
                        "<anonymous>".to_string()
                    } else {
                        function.name.to_string()
                    };
                    (name, function.line_for(frame.pc.saturating_sub(1)))
                }
                None => ("<unknown>".to_string(), None),
            };
            StackFrame {
                function_name: name,
                source: frame.module.source_name.to_string(),
                line,
            }
        })
        .collect()
}

