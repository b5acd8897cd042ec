//! # Stoat Core
//!
//! Value representation, object model, and bytecode evaluator for the
//! Stoat scripting runtime.
//!
//! ## Design Principles
//!
//! - **NaN-boxing**: every value is one 64-bit word; heap payloads are
//!   arena handles, never raw pointers
//! - **Explicit instances**: a [`VmContext`] is a self-contained runtime
//!   instance (heap, globals, symbols); hosts may hold several
//! - **Owned suspension**: `await`/`yield` capture the evaluator's state
//!   into resumable activation records, independent of host coroutines
//! - **Effect queue**: natives and promise settlement emit scheduling
//!   effects; the scheduler crate drains them, keeping this crate free of
//!   any event-loop dependency

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod coerce;
pub mod context;
pub mod error;
pub mod interpreter;
pub mod object;
pub mod promise;
pub mod value;

pub use context::{Job, ResumeInput, ScheduledEffect, VmContext};
pub use error::{StackFrame, ThrownValue, VmError, VmResult};
pub use interpreter::{Activation, Interpreter, ResumeMode, RunResult};
pub use object::{HeapObject, JsObject, PropertyKey};
pub use promise::{JsPromise, PromiseState, Reaction, SettleKind};
pub use value::Value;
