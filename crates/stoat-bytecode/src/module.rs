//! Bytecode module format

use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

use crate::constant::ConstantPool;
use crate::error::{BytecodeError, Result};
use crate::function::Function;
use crate::operand::FunctionIndex;
use crate::{BYTECODE_MAGIC, BYTECODE_VERSION};

/// A compiled, linked program unit: function table, constant pool, and the
/// entry function index. Produced by the upstream compiler; assembled by
/// hand in tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Module {
    /// Source name, for stack traces
    pub source_name: Box<str>,
    /// All functions, entry included
    pub functions: Vec<Function>,
    /// Literal pool shared by all functions
    pub constants: ConstantPool,
    /// Index of the top-level function
    pub entry: FunctionIndex,
}

impl Module {
    /// Create a module from parts.
    pub fn new(
        source_name: impl Into<Box<str>>,
        functions: Vec<Function>,
        constants: ConstantPool,
        entry: FunctionIndex,
    ) -> Self {
        Self {
            source_name: source_name.into(),
            functions,
            constants,
            entry,
        }
    }

    /// Look up a function by index.
    #[inline]
    pub fn function(&self, index: FunctionIndex) -> Option<&Function> {
        self.functions.get(index.index() as usize)
    }

    /// The entry (top-level) function.
    pub fn entry_function(&self) -> Option<&Function> {
        self.function(self.entry)
    }

    /// Serialize to a cacheable byte stream (magic + version + payload).
    pub fn to_writer<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&BYTECODE_MAGIC)?;
        writer.write_all(&BYTECODE_VERSION.to_le_bytes())?;
        let payload =
            serde_json::to_vec(self).map_err(|e| BytecodeError::Malformed(e.to_string()))?;
        writer.write_all(&payload)?;
        Ok(())
    }

    /// Deserialize from a cached byte stream.
    pub fn from_reader<R: Read>(reader: &mut R) -> Result<Self> {
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if magic != BYTECODE_MAGIC {
            return Err(BytecodeError::InvalidMagic);
        }

        let mut version_bytes = [0u8; 4];
        reader.read_exact(&mut version_bytes)?;
        let version = u32::from_le_bytes(version_bytes);
        if version != BYTECODE_VERSION {
            return Err(BytecodeError::UnsupportedVersion(version));
        }

        let mut payload = Vec::new();
        reader.read_to_end(&mut payload)?;
        serde_json::from_slice(&payload).map_err(|e| BytecodeError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::Instruction;
    use crate::operand::Register;

    fn sample_module() -> Module {
        let mut constants = ConstantPool::new();
        constants.add_string("greeting");
        let entry = Function::new(
            "<main>",
            vec![Instruction::LoadUndefined {
                dst: Register::new(0),
            }],
        );
        Module::new("sample.js", vec![entry], constants, FunctionIndex::new(0))
    }

    #[test]
    fn entry_function_lookup() {
        let module = sample_module();
        assert_eq!(module.entry_function().unwrap().name.as_ref(), "<main>");
        assert!(module.function(FunctionIndex::new(7)).is_none());
    }

    #[test]
    fn serialization_round_trip() {
        let module = sample_module();
        let mut bytes = Vec::new();
        module.to_writer(&mut bytes).unwrap();

        let back = Module::from_reader(&mut bytes.as_slice()).unwrap();
        assert_eq!(back.source_name, module.source_name);
        assert_eq!(back.functions.len(), 1);
    }

    #[test]
    fn rejects_bad_magic() {
        let bytes = b"NOTSTOAT\x01\x00\x00\x00{}".to_vec();
        let err = Module::from_reader(&mut bytes.as_slice()).unwrap_err();
        assert!(matches!(err, BytecodeError::InvalidMagic));
    }
}
