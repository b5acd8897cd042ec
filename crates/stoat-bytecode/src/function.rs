//! Function bytecode representation

use serde::{Deserialize, Serialize};

use crate::instruction::Instruction;

/// The five function kinds, distinguished by their `this` binding and
/// suspension behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FunctionKind {
    /// Plain function: rebinds `this` per call site
    #[default]
    Normal,
    /// Arrow function: never rebinds `this`
    Arrow,
    /// Generator: suspends at `yield`, driven by next/return/throw
    Generator,
    /// Async function: returns a promise, suspends at `await`
    Async,
    /// Async generator: both of the above
    AsyncGenerator,
}

impl FunctionKind {
    /// Whether calls return a promise and `Await` is legal in the body
    #[inline]
    pub fn is_async(self) -> bool {
        matches!(self, Self::Async | Self::AsyncGenerator)
    }

    /// Whether calls produce a generator object and `Yield` is legal
    #[inline]
    pub fn is_generator(self) -> bool {
        matches!(self, Self::Generator | Self::AsyncGenerator)
    }
}

/// A single compiled function
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    /// Function name, for stack traces ("<anonymous>" when absent)
    pub name: Box<str>,
    /// Function kind
    pub kind: FunctionKind,
    /// Declared parameter count; parameters occupy environment slots
    /// `0..param_count`
    pub param_count: u16,
    /// Total environment slots (parameters + locals)
    pub local_count: u16,
    /// Virtual registers used by the body
    pub register_count: u8,
    /// Instruction stream
    pub instructions: Vec<Instruction>,
    /// Source line per instruction, for error traces; may be empty
    pub lines: Vec<u32>,
}

impl Function {
    /// Create a function with the given name and body.
    pub fn new(name: impl Into<Box<str>>, instructions: Vec<Instruction>) -> Self {
        Self {
            name: name.into(),
            kind: FunctionKind::Normal,
            param_count: 0,
            local_count: 0,
            register_count: 8,
            instructions,
            lines: Vec::new(),
        }
    }

    /// Source line for an instruction index, when line info is present.
    pub fn line_for(&self, pc: usize) -> Option<u32> {
        self.lines.get(pc).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_predicates() {
        assert!(FunctionKind::Async.is_async());
        assert!(FunctionKind::AsyncGenerator.is_async());
        assert!(FunctionKind::AsyncGenerator.is_generator());
        assert!(!FunctionKind::Arrow.is_async());
        assert!(!FunctionKind::Normal.is_generator());
    }

    #[test]
    fn line_lookup() {
        let mut f = Function::new("f", vec![Instruction::ReturnUndefined]);
        assert_eq!(f.line_for(0), None);
        f.lines = vec![7];
        assert_eq!(f.line_for(0), Some(7));
        assert_eq!(f.line_for(1), None);
    }
}
