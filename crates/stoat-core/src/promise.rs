//! Promise state machine
//!
//! A promise is a heap object holding a settlement state and a list of
//! reaction records. Settling never runs handlers inline: each reaction
//! becomes a microtask job, so `then` callbacks and `await` continuations
//! always run in queue order, after the current task.

use stoat_gc::Ref;

use crate::interpreter::Activation;
use crate::value::Value;

/// Promise state
#[derive(Debug, Clone)]
pub enum PromiseState {
    /// Not yet settled
    Pending,
    /// Resolved with a value
    Fulfilled(Value),
    /// Rejected with an error value
    Rejected(Value),
}

impl PromiseState {
    /// Check if settled (fulfilled or rejected)
    pub fn is_settled(&self) -> bool {
        !matches!(self, PromiseState::Pending)
    }
}

/// Which way a promise settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleKind {
    /// Fulfilled
    Fulfill,
    /// Rejected
    Reject,
}

/// A handler attached via `then`/`catch`, or a parked `await`
/// continuation.
#[derive(Debug)]
pub struct Reaction {
    /// Callback for fulfillment; `None` passes the value through
    pub on_fulfilled: Option<Value>,
    /// Callback for rejection; `None` passes the rejection through
    pub on_rejected: Option<Value>,
    /// Promise settled with the handler's outcome
    pub result: Option<Ref>,
    /// Suspended activation resumed by the settlement
    pub continuation: Option<Box<Activation>>,
}

impl Reaction {
    /// A `then`-style reaction feeding `result`
    pub fn handlers(
        on_fulfilled: Option<Value>,
        on_rejected: Option<Value>,
        result: Option<Ref>,
    ) -> Self {
        Self {
            on_fulfilled,
            on_rejected,
            result,
            continuation: None,
        }
    }

    /// An `await` continuation
    pub fn continuation(activation: Box<Activation>) -> Self {
        Self {
            on_fulfilled: None,
            on_rejected: None,
            result: None,
            continuation: Some(activation),
        }
    }

    /// Report held handles to a GC tracer
    pub fn trace(&self, tracer: &mut dyn FnMut(Ref)) {
        if let Some(v) = self.on_fulfilled {
            v.trace(tracer);
        }
        if let Some(v) = self.on_rejected {
            v.trace(tracer);
        }
        if let Some(result) = self.result {
            tracer(result);
        }
        if let Some(activation) = &self.continuation {
            activation.trace(tracer);
        }
    }
}

/// A promise heap object
#[derive(Debug)]
pub struct JsPromise {
    /// Current state
    pub state: PromiseState,
    /// Reactions waiting for settlement
    pub reactions: Vec<Reaction>,
}

impl JsPromise {
    /// A fresh pending promise
    pub fn new() -> Self {
        Self {
            state: PromiseState::Pending,
            reactions: Vec::new(),
        }
    }

    /// An already fulfilled promise
    pub fn fulfilled(value: Value) -> Self {
        Self {
            state: PromiseState::Fulfilled(value),
            reactions: Vec::new(),
        }
    }

    /// An already rejected promise
    pub fn rejected(error: Value) -> Self {
        Self {
            state: PromiseState::Rejected(error),
            reactions: Vec::new(),
        }
    }

    /// Report held handles to a GC tracer
    pub fn trace(&self, tracer: &mut dyn FnMut(Ref)) {
        match &self.state {
            PromiseState::Fulfilled(v) | PromiseState::Rejected(v) => v.trace(tracer),
            PromiseState::Pending => {}
        }
        for reaction in &self.reactions {
            reaction.trace(tracer);
        }
    }

    /// Approximate footprint for GC accounting
    pub fn byte_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.reactions.len() * 64
    }
}

impl Default for JsPromise {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions() {
        let p = JsPromise::new();
        assert!(!p.state.is_settled());

        let f = JsPromise::fulfilled(Value::int32(1));
        assert!(f.state.is_settled());
        assert!(matches!(f.state, PromiseState::Fulfilled(_)));

        let r = JsPromise::rejected(Value::int32(2));
        assert!(matches!(r.state, PromiseState::Rejected(_)));
    }

    #[test]
    fn reaction_traces_its_values() {
        let result = Ref::from_index(3);
        let reaction = Reaction::handlers(
            Some(Value::reference(Ref::from_index(1))),
            None,
            Some(result),
        );
        let mut seen = Vec::new();
        reaction.trace(&mut |r| seen.push(r));
        assert_eq!(seen, vec![Ref::from_index(1), result]);
    }
}
