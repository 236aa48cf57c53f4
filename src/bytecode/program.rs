use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bytecode::chunk::{Chunk, FunctionId};
use crate::bytecode::verify::{self, VerifyError};

const MAGIC: &[u8; 4] = b"RATC";
const FORMAT_VERSION: u8 = 1;

/// Immutable compiled data of a runnable (or of the top-level script).
///
/// Calls never copy this; a call frame refers to it by [`FunctionId`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub arity: usize,
    /// Declared local names in declaration order, parameters first.
    pub locals: Vec<String>,
    pub chunk: Chunk,
    pub enclosing: Option<FunctionId>,
    /// Newline markers inside the body.
    pub line_count: u16,
}

impl Function {
    pub fn new(name: impl Into<String>, enclosing: Option<FunctionId>) -> Self {
        Self {
            name: name.into(),
            arity: 0,
            locals: Vec::new(),
            chunk: Chunk::new(),
            enclosing,
            line_count: 0,
        }
    }

    pub fn is_script(&self) -> bool {
        self.enclosing.is_none()
    }
}

/// A compiled program.
/// Convention: `functions[0]` is always the top-level script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub functions: Vec<Function>,
}

#[derive(Debug, Error)]
pub enum BytecodeError {
    #[error("not a rat bytecode file")]
    BadMagic,

    #[error("unsupported bytecode format version {0} (expected {FORMAT_VERSION})")]
    UnsupportedVersion(u8),

    #[error("malformed bytecode: {0}")]
    Decode(#[from] postcard::Error),

    #[error(transparent)]
    Invalid(#[from] VerifyError),
}

impl Program {
    pub fn new(script: Function) -> Self {
        Self {
            functions: vec![script],
        }
    }

    pub fn script(&self) -> &Function {
        &self.functions[FunctionId::SCRIPT.0]
    }

    pub fn function(&self, id: FunctionId) -> Option<&Function> {
        self.functions.get(id.0)
    }

    /// Absolute source line on which `id` begins.
    pub fn start_line(&self, id: FunctionId) -> usize {
        let Some(function) = self.function(id) else {
            return 1;
        };
        match function.enclosing {
            Some(parent) if parent < id => {
                let Some(outer) = self.function(parent) else {
                    return 1;
                };
                let relative = outer.chunk.runnable_start_line(id).unwrap_or(1);
                self.start_line(parent) + relative - 1
            }
            _ => 1,
        }
    }

    /// Absolute source line of the instruction at `ip` in function `id`.
    pub fn source_line(&self, id: FunctionId, ip: usize) -> usize {
        let local = self.function(id).map_or(1, |f| f.chunk.count_lines(ip));
        self.start_line(id) + local - 1
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, BytecodeError> {
        let mut bytes = MAGIC.to_vec();
        bytes.push(FORMAT_VERSION);
        bytes.extend(postcard::to_allocvec(self)?);
        Ok(bytes)
    }

    /// Decode and verify a serialized program.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BytecodeError> {
        let body = bytes.strip_prefix(MAGIC).ok_or(BytecodeError::BadMagic)?;
        let (&version, body) = body.split_first().ok_or(BytecodeError::BadMagic)?;
        if version != FORMAT_VERSION {
            return Err(BytecodeError::UnsupportedVersion(version));
        }
        let program: Program = postcard::from_bytes(body)?;
        verify::verify(&program)?;
        Ok(program)
    }
}
