//! VM execution context
//!
//! The context is the explicitly constructed runtime instance: it owns
//! the heap, the global object, the symbol registry, and the effect queue
//! through which natives and promise settlement talk to the scheduler
//! without this crate depending on it. Several independent contexts can
//! coexist in one host process.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use stoat_gc::{GcConfig, Heap, Ref};

use crate::coerce;
use crate::error::{StackFrame, VmError, VmResult};
use crate::interpreter::Activation;
use crate::object::{
    HeapObject, JsEnvironment, JsObject, JsString, NativeFn, NativeFunction, PropertyKey,
};
use crate::promise::{JsPromise, PromiseState, Reaction, SettleKind};
use crate::value::Value;

/// Longest prototype chain walked before lookup gives up; tolerates
/// user-constructed cycles without hanging.
const MAX_PROTO_CHAIN: usize = 1024;

/// How a suspended activation is resumed.
#[derive(Debug, Clone, Copy)]
pub enum ResumeInput {
    /// The awaited promise fulfilled with this value
    Fulfilled(Value),
    /// The awaited promise rejected with this value
    Rejected(Value),
}

/// A unit of queued work. Microtasks and macrotasks carry the same job
/// shape; only the queue they sit in differs.
#[derive(Debug)]
pub enum Job {
    /// Call a callback value
    Call {
        /// The callable
        callback: Value,
        /// Receiver
        this: Value,
        /// Arguments
        args: Vec<Value>,
    },
    /// Resume a suspended activation
    Resume {
        /// The parked activation
        activation: Box<Activation>,
        /// Settlement it resumes with
        input: ResumeInput,
    },
    /// Run a promise reaction
    Reaction {
        /// The reaction record
        reaction: Reaction,
        /// Which way the promise settled
        kind: SettleKind,
        /// The settlement value
        value: Value,
    },
}

impl Job {
    /// Report every handle this job keeps alive.
    pub fn trace(&self, tracer: &mut dyn FnMut(Ref)) {
        match self {
            Job::Call {
                callback,
                this,
                args,
            } => {
                callback.trace(tracer);
                this.trace(tracer);
                for arg in args {
                    arg.trace(tracer);
                }
            }
            Job::Resume { activation, input } => {
                activation.trace(tracer);
                match input {
                    ResumeInput::Fulfilled(v) | ResumeInput::Rejected(v) => v.trace(tracer),
                }
            }
            Job::Reaction {
                reaction, value, ..
            } => {
                reaction.trace(tracer);
                value.trace(tracer);
            }
        }
    }
}

/// Scheduling commands emitted by natives and promise settlement; the
/// runtime drains these after every task.
#[derive(Debug)]
pub enum ScheduledEffect {
    /// Enqueue a microtask
    Microtask(Job),
    /// Arm a timer
    SetTimer {
        /// Handle returned to the program
        id: u64,
        /// Callback run when the timer fires
        callback: Value,
        /// Delay in milliseconds
        delay_ms: u64,
        /// Re-arm after each fire
        repeating: bool,
    },
    /// Cancel a timer; never retracts an already-queued callback
    CancelTimer {
        /// Handle from `SetTimer`
        id: u64,
    },
}

impl ScheduledEffect {
    /// Report every handle this effect keeps alive.
    pub fn trace(&self, tracer: &mut dyn FnMut(Ref)) {
        match self {
            ScheduledEffect::Microtask(job) => job.trace(tracer),
            ScheduledEffect::SetTimer { callback, .. } => callback.trace(tracer),
            ScheduledEffect::CancelTimer { .. } => {}
        }
    }
}

/// Per-instance VM state: heap, globals, symbols, pending effects.
pub struct VmContext {
    /// The heap; the only owner of object storage
    pub heap: Heap<HeapObject>,
    globals: Ref,
    effects: Vec<ScheduledEffect>,
    next_timer_id: u64,
    next_symbol_id: u32,
    symbol_descriptions: FxHashMap<u32, Box<str>>,
}

impl VmContext {
    /// Context with the default GC configuration.
    pub fn new() -> VmResult<Self> {
        Self::with_config(GcConfig::default())
    }

    /// Context with a custom GC configuration.
    pub fn with_config(config: GcConfig) -> VmResult<Self> {
        let mut heap = Heap::with_config(config).map_err(VmError::internal)?;
        let globals = heap.alloc(HeapObject::Object(JsObject::new()))?;
        Ok(Self {
            heap,
            globals,
            effects: Vec::new(),
            next_timer_id: 1,
            next_symbol_id: 1,
            symbol_descriptions: FxHashMap::default(),
        })
    }

    // ==================== Allocation ====================

    /// Allocate a heap object.
    pub fn alloc(&mut self, object: HeapObject) -> VmResult<Ref> {
        Ok(self.heap.alloc(object)?)
    }

    /// Allocate a string value.
    pub fn alloc_string(&mut self, s: impl Into<Box<str>>) -> VmResult<Value> {
        let handle = self.alloc(HeapObject::String(JsString::new(s)))?;
        Ok(Value::reference(handle))
    }

    /// Allocate a fresh environment frame.
    pub fn new_env(&mut self, parent: Option<Ref>, slots: u16) -> VmResult<Ref> {
        self.alloc(HeapObject::Environment(JsEnvironment::new(parent, slots)))
    }

    /// Allocate a pending promise.
    pub fn new_promise(&mut self) -> VmResult<Ref> {
        self.alloc(HeapObject::Promise(JsPromise::new()))
    }

    /// Mint a fresh symbol value.
    pub fn new_symbol(&mut self, description: Option<&str>) -> Value {
        let id = self.next_symbol_id;
        self.next_symbol_id += 1;
        if let Some(desc) = description {
            self.symbol_descriptions.insert(id, desc.into());
        }
        Value::symbol(id)
    }

    /// Description a symbol was minted with, if any.
    pub fn symbol_description(&self, id: u32) -> Option<&str> {
        self.symbol_descriptions.get(&id).map(|s| s.as_ref())
    }

    // ==================== Globals ====================

    /// The global object's handle.
    pub fn globals(&self) -> Ref {
        self.globals
    }

    /// Global lookup by name.
    pub fn get_global(&self, name: &str) -> Option<Value> {
        match self.heap.get(self.globals) {
            Some(HeapObject::Object(o)) => o.get(&PropertyKey::from_name(name)),
            _ => None,
        }
    }

    /// Global store by name.
    pub fn set_global(&mut self, name: &str, value: Value) -> VmResult<()> {
        let globals = self.globals;
        match self.heap.get_mut(globals) {
            Some(HeapObject::Object(o)) => {
                o.set(PropertyKey::from_name(name), value);
            }
            _ => return Err(VmError::internal("global object missing")),
        }
        if let Some(handle) = value.as_reference() {
            self.heap.write_barrier(globals, handle);
        }
        Ok(())
    }

    /// Install a host callable on the global object.
    pub fn define_native(
        &mut self,
        name: &str,
        func: impl Fn(&mut VmContext, Value, &[Value]) -> VmResult<Value> + 'static,
    ) -> VmResult<()> {
        let native = NativeFunction::new(name, std::sync::Arc::new(func) as NativeFn);
        let handle = self.alloc(HeapObject::Native(native))?;
        self.set_global(name, Value::reference(handle))
    }

    // ==================== Properties ====================

    /// Build a property key from a runtime key value.
    pub fn property_key(&self, key: Value) -> VmResult<PropertyKey> {
        if let Some(id) = key.as_symbol() {
            return Ok(PropertyKey::Symbol(id));
        }
        if let Some(n) = key.as_number() {
            if n.fract() == 0.0 && n >= 0.0 && n <= u32::MAX as f64 {
                return Ok(PropertyKey::Index(n as u32));
            }
            return Ok(PropertyKey::String(
                coerce::number_to_string(n).into_boxed_str(),
            ));
        }
        Ok(PropertyKey::from_name(&coerce::to_display_string(
            &self.heap, key,
        )))
    }

    /// Property lookup with prototype-chain walk. Nullish targets throw;
    /// primitives read as undefined except string `length`.
    pub fn get_property(&self, target: Value, key: &PropertyKey) -> VmResult<Value> {
        if target.is_nullish() {
            let what = if target.is_null() { "null" } else { "undefined" };
            return Err(VmError::type_error(format!(
                "Cannot read properties of {} (reading '{}')",
                what,
                key_display(key)
            )));
        }
        let Some(handle) = target.as_reference() else {
            return Ok(Value::undefined());
        };
        match self.heap.get(handle) {
            Some(HeapObject::String(s)) => Ok(match key {
                PropertyKey::String(name) if name.as_ref() == "length" => {
                    Value::number(s.len() as f64)
                }
                _ => Value::undefined(),
            }),
            Some(HeapObject::Array(a)) => Ok(match key {
                PropertyKey::Index(index) => a.element(*index).unwrap_or(Value::undefined()),
                PropertyKey::String(name) if name.as_ref() == "length" => {
                    Value::number(a.length as f64)
                }
                _ => Value::undefined(),
            }),
            Some(HeapObject::Object(_)) => {
                if let PropertyKey::String(name) = key
                    && name.as_ref() == "__proto__"
                {
                    let proto = match self.heap.get(handle) {
                        Some(HeapObject::Object(o)) => o.prototype,
                        _ => None,
                    };
                    return Ok(proto.map(Value::reference).unwrap_or(Value::null()));
                }
                // Walk the prototype chain; bounded, so cycles terminate.
                let mut current = Some(handle);
                for _ in 0..MAX_PROTO_CHAIN {
                    let Some(object_handle) = current else { break };
                    match self.heap.get(object_handle) {
                        Some(HeapObject::Object(o)) => {
                            if let Some(value) = o.get(key) {
                                return Ok(value);
                            }
                            current = o.prototype;
                        }
                        _ => break,
                    }
                }
                Ok(Value::undefined())
            }
            Some(_) => Ok(Value::undefined()),
            None => Err(VmError::internal("property access through freed handle")),
        }
    }

    /// Property store. Nullish targets throw; stores to other primitives
    /// and non-extensible shapes are silently ignored, sloppy-mode style.
    pub fn set_property(&mut self, target: Value, key: PropertyKey, value: Value) -> VmResult<()> {
        if target.is_nullish() {
            let what = if target.is_null() { "null" } else { "undefined" };
            return Err(VmError::type_error(format!(
                "Cannot set properties of {}",
                what
            )));
        }
        let Some(handle) = target.as_reference() else {
            return Ok(());
        };

        // Array length assignment validates before borrowing mutably.
        let length_assignment = match (self.heap.get(handle), &key) {
            (Some(HeapObject::Array(_)), PropertyKey::String(name))
                if name.as_ref() == "length" =>
            {
                let n = coerce::to_number(&self.heap, value);
                if n.fract() != 0.0 || n < 0.0 || n > u32::MAX as f64 {
                    return Err(VmError::range_error("Invalid array length"));
                }
                Some(n as u32)
            }
            _ => None,
        };

        match self.heap.get_mut(handle) {
            Some(HeapObject::Object(o)) => {
                if let PropertyKey::String(name) = &key
                    && name.as_ref() == "__proto__"
                {
                    if let Some(proto) = value.as_reference() {
                        o.prototype = Some(proto);
                    } else if value.is_null() {
                        o.prototype = None;
                    }
                } else {
                    o.set(key, value);
                }
            }
            Some(HeapObject::Array(a)) => {
                if let Some(new_length) = length_assignment {
                    a.set_length(new_length);
                } else if let PropertyKey::Index(index) = key {
                    a.set_element(index, value);
                }
                // Named properties on arrays are not modeled.
            }
            Some(_) => return Ok(()),
            None => return Err(VmError::internal("property store through freed handle")),
        }

        if let Some(stored) = value.as_reference() {
            self.heap.write_barrier(handle, stored);
        }
        Ok(())
    }

    // ==================== Environments ====================

    /// Walk `depth` parent links from `env`.
    fn env_at_depth(&self, env: Ref, depth: u16) -> VmResult<Ref> {
        let mut current = env;
        for _ in 0..depth {
            match self.heap.get(current) {
                Some(HeapObject::Environment(e)) => {
                    current = e
                        .parent
                        .ok_or_else(|| VmError::internal("environment chain too short"))?;
                }
                _ => return Err(VmError::internal("expected environment frame")),
            }
        }
        Ok(current)
    }

    /// Read a variable slot `depth` frames up the chain.
    pub fn env_get(&self, env: Ref, depth: u16, slot: u16) -> VmResult<Value> {
        let frame = self.env_at_depth(env, depth)?;
        match self.heap.get(frame) {
            Some(HeapObject::Environment(e)) => e
                .slots
                .get(slot as usize)
                .copied()
                .ok_or_else(|| VmError::internal("environment slot out of bounds")),
            _ => Err(VmError::internal("expected environment frame")),
        }
    }

    /// Write a variable slot `depth` frames up the chain.
    pub fn env_set(&mut self, env: Ref, depth: u16, slot: u16, value: Value) -> VmResult<()> {
        let frame = self.env_at_depth(env, depth)?;
        match self.heap.get_mut(frame) {
            Some(HeapObject::Environment(e)) => {
                let cell = e
                    .slots
                    .get_mut(slot as usize)
                    .ok_or_else(|| VmError::internal("environment slot out of bounds"))?;
                *cell = value;
            }
            _ => return Err(VmError::internal("expected environment frame")),
        }
        if let Some(stored) = value.as_reference() {
            self.heap.write_barrier(frame, stored);
        }
        Ok(())
    }

    // ==================== Promises ====================

    /// Current state of a promise.
    pub fn promise_state(&self, promise: Ref) -> VmResult<PromiseState> {
        match self.heap.get(promise) {
            Some(HeapObject::Promise(p)) => Ok(p.state.clone()),
            _ => Err(VmError::internal("expected promise")),
        }
    }

    /// Settle a promise. Fulfilling with another promise adopts that
    /// promise's eventual state instead of fulfilling with it directly.
    /// Reactions are moved to the microtask queue, never run inline.
    pub fn settle_promise(
        &mut self,
        promise: Ref,
        kind: SettleKind,
        value: Value,
    ) -> VmResult<()> {
        if kind == SettleKind::Fulfill
            && let Some(inner) = value.as_reference()
            && inner != promise
            && matches!(self.heap.get(inner), Some(HeapObject::Promise(_)))
        {
            return self.add_reaction(inner, Reaction::handlers(None, None, Some(promise)));
        }

        let reactions = match self.heap.get_mut(promise) {
            Some(HeapObject::Promise(p)) => {
                if p.state.is_settled() {
                    return Ok(());
                }
                p.state = match kind {
                    SettleKind::Fulfill => PromiseState::Fulfilled(value),
                    SettleKind::Reject => PromiseState::Rejected(value),
                };
                std::mem::take(&mut p.reactions)
            }
            _ => return Err(VmError::internal("expected promise")),
        };
        if let Some(stored) = value.as_reference() {
            self.heap.write_barrier(promise, stored);
        }
        for reaction in reactions {
            self.effects.push(ScheduledEffect::Microtask(Job::Reaction {
                reaction,
                kind,
                value,
            }));
        }
        Ok(())
    }

    /// Attach a reaction. Settled promises enqueue it immediately as a
    /// microtask; pending ones park it.
    pub fn add_reaction(&mut self, promise: Ref, reaction: Reaction) -> VmResult<()> {
        let mut reaction_refs: SmallVec<[Ref; 8]> = SmallVec::new();
        reaction.trace(&mut |r| reaction_refs.push(r));

        let settled = match self.heap.get(promise) {
            Some(HeapObject::Promise(p)) => match &p.state {
                PromiseState::Pending => None,
                PromiseState::Fulfilled(v) => Some((SettleKind::Fulfill, *v)),
                PromiseState::Rejected(v) => Some((SettleKind::Reject, *v)),
            },
            _ => return Err(VmError::internal("expected promise")),
        };

        match settled {
            Some((kind, value)) => {
                self.effects.push(ScheduledEffect::Microtask(Job::Reaction {
                    reaction,
                    kind,
                    value,
                }));
            }
            None => {
                match self.heap.get_mut(promise) {
                    Some(HeapObject::Promise(p)) => p.reactions.push(reaction),
                    _ => return Err(VmError::internal("expected promise")),
                }
                for stored in reaction_refs {
                    self.heap.write_barrier(promise, stored);
                }
            }
        }
        Ok(())
    }

    // ==================== Effects & timers ====================

    /// Queue an effect for the scheduler.
    pub fn push_effect(&mut self, effect: ScheduledEffect) {
        self.effects.push(effect);
    }

    /// Queue a microtask job.
    pub fn enqueue_microtask(&mut self, job: Job) {
        self.effects.push(ScheduledEffect::Microtask(job));
    }

    /// Drain all pending effects, in emission order.
    pub fn take_effects(&mut self) -> Vec<ScheduledEffect> {
        std::mem::take(&mut self.effects)
    }

    /// Whether effects are pending.
    pub fn has_effects(&self) -> bool {
        !self.effects.is_empty()
    }

    /// Allocate a timer handle.
    pub fn alloc_timer_id(&mut self) -> u64 {
        let id = self.next_timer_id;
        self.next_timer_id += 1;
        id
    }

    // ==================== Errors ====================

    /// Materialize a runtime error as a catchable error value: an object
    /// with `name`, `message`, and a rendered `stack`.
    pub fn error_to_value(&mut self, err: &VmError, stack: &[StackFrame]) -> VmResult<Value> {
        if let VmError::Thrown(thrown) = err {
            return Ok(thrown.value);
        }
        let name = self.alloc_string(err.kind_name())?;
        let message = self.alloc_string(err.message())?;
        let mut rendered = format!("{}: {}", err.kind_name(), err.message());
        for frame in stack {
            rendered.push_str("\n    at ");
            rendered.push_str(&frame.to_string());
        }
        let stack_value = self.alloc_string(rendered)?;

        let mut object = JsObject::new();
        object.set(PropertyKey::string("name"), name);
        object.set(PropertyKey::string("message"), message);
        object.set(PropertyKey::string("stack"), stack_value);
        let handle = self.alloc(HeapObject::Object(object))?;
        Ok(Value::reference(handle))
    }

    // ==================== GC roots ====================

    /// Report every handle the context itself keeps alive (globals and
    /// queued effects). The interpreter adds the live activation.
    pub fn trace_roots(&self, tracer: &mut dyn FnMut(Ref)) {
        tracer(self.globals);
        for effect in &self.effects {
            effect.trace(tracer);
        }
    }
}

fn key_display(key: &PropertyKey) -> String {
    match key {
        PropertyKey::String(s) => s.to_string(),
        PropertyKey::Index(i) => i.to_string(),
        PropertyKey::Symbol(id) => format!("Symbol({})", id),
    }
}
