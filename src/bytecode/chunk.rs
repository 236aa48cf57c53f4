use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bytecode::op::{OpCode, OperandKind};

/// Maximum number of entries in one chunk's constant pool.
pub const MAX_CONSTANTS: usize = 256;

/// Index of a compiled function inside a [`crate::bytecode::Program`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionId(pub usize);

impl FunctionId {
    pub const SCRIPT: FunctionId = FunctionId(0);
}

/// Compile-time constant. The VM materializes these into runtime values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    Number(f32),
    String(String),
    Runnable(FunctionId),
}

impl std::fmt::Display for Constant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Constant::Number(n) => write!(f, "{}", n),
            Constant::String(s) => write!(f, "{:?}", s),
            Constant::Runnable(id) => write!(f, "<runnable #{}>", id.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChunkError {
    #[error("too many constants in one chunk (limit is {MAX_CONSTANTS})")]
    ConstantsOverflow,

    #[error("number literal '{0}' is not representable")]
    NumericOverflow(String),

    #[error("unknown opcode {byte:#04x} at offset {offset}")]
    UnknownOpcode { offset: usize, byte: u8 },

    #[error("{op} at offset {offset} is missing operand bytes")]
    TruncatedOperand { offset: usize, op: OpCode },
}

/// A byte-encoded instruction stream plus its constant pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub code: Vec<u8>,
    pub constants: Vec<Constant>,
}

impl Chunk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn append(&mut self, byte: u8) {
        self.code.push(byte);
    }

    pub fn append2(&mut self, first: u8, second: u8) {
        self.code.push(first);
        self.code.push(second);
    }

    pub fn add_constant(&mut self, constant: Constant) -> Result<u8, ChunkError> {
        if self.constants.len() >= MAX_CONSTANTS {
            return Err(ChunkError::ConstantsOverflow);
        }
        self.constants.push(constant);
        Ok((self.constants.len() - 1) as u8)
    }

    /// Strings are interned: the same text always reuses its slot.
    pub fn add_string(&mut self, name: &str) -> Result<u8, ChunkError> {
        let existing = self
            .constants
            .iter()
            .position(|c| matches!(c, Constant::String(s) if s == name));
        match existing {
            Some(index) => Ok(index as u8),
            None => self.add_constant(Constant::String(name.to_string())),
        }
    }

    pub fn add_number(&mut self, lexeme: &str) -> Result<u8, ChunkError> {
        let value: f32 = lexeme
            .parse()
            .map_err(|_| ChunkError::NumericOverflow(lexeme.to_string()))?;
        if !value.is_finite() {
            return Err(ChunkError::NumericOverflow(lexeme.to_string()));
        }
        self.add_constant(Constant::Number(value))
    }

    pub fn read_constant(&self, index: u8) -> Option<&Constant> {
        self.constants.get(index as usize)
    }

    pub fn read_u16(&self, at: usize) -> Option<u16> {
        let hi = *self.code.get(at)?;
        let lo = *self.code.get(at + 1)?;
        Some(u16::from_be_bytes([hi, lo]))
    }

    /// Overwrite the two operand bytes reserved at `at`.
    pub fn patch_jump(&mut self, at: usize, distance: u16) {
        let [hi, lo] = distance.to_be_bytes();
        self.code[at] = hi;
        self.code[at + 1] = lo;
    }

    pub fn instructions(&self) -> Instructions<'_> {
        Instructions {
            code: &self.code,
            offset: 0,
        }
    }

    /// Source line (1-based, relative to this chunk) of the instruction at
    /// `upto`, recovered by replaying newline markers.
    pub fn count_lines(&self, upto: usize) -> usize {
        let mut line = 1;
        for instr in self.instructions().map_while(Result::ok) {
            if instr.offset >= upto {
                break;
            }
            match instr.op {
                OpCode::Newline => line += 1,
                OpCode::DefineRunnable => line += instr.u16_at(1) as usize,
                _ => {}
            }
        }
        line
    }

    /// Line on which `function` was declared, relative to this chunk.
    pub fn runnable_start_line(&self, function: FunctionId) -> Option<usize> {
        let mut line = 1;
        for instr in self.instructions().map_while(Result::ok) {
            match instr.op {
                OpCode::Newline => line += 1,
                OpCode::DefineRunnable => {
                    if self.read_constant(instr.byte(0)) == Some(&Constant::Runnable(function)) {
                        return Some(line);
                    }
                    line += instr.u16_at(1) as usize;
                }
                _ => {}
            }
        }
        None
    }
}

/// One decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Instruction<'a> {
    pub offset: usize,
    pub op: OpCode,
    pub operands: &'a [u8],
}

impl Instruction<'_> {
    pub fn byte(&self, i: usize) -> u8 {
        self.operands[i]
    }

    pub fn u16_at(&self, i: usize) -> u16 {
        u16::from_be_bytes([self.operands[i], self.operands[i + 1]])
    }

    /// Offset of the following instruction.
    pub fn next_offset(&self) -> usize {
        self.offset + 1 + self.operands.len()
    }

    /// Absolute target of a jump or loop.
    pub fn jump_target(&self) -> Option<usize> {
        match self.op.operand_kind() {
            OperandKind::Jump => Some(self.next_offset() + self.u16_at(0) as usize),
            OperandKind::Loop => self.next_offset().checked_sub(self.u16_at(0) as usize),
            _ => None,
        }
    }
}

pub struct Instructions<'a> {
    code: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for Instructions<'a> {
    type Item = Result<Instruction<'a>, ChunkError>;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.offset;
        let byte = *self.code.get(offset)?;
        let op = match OpCode::try_from(byte) {
            Ok(op) => op,
            Err(byte) => {
                self.offset = self.code.len();
                return Some(Err(ChunkError::UnknownOpcode { offset, byte }));
            }
        };
        let end = offset + op.width();
        if end > self.code.len() {
            self.offset = self.code.len();
            return Some(Err(ChunkError::TruncatedOperand { offset, op }));
        }
        self.offset = end;
        Some(Ok(Instruction {
            offset,
            op,
            operands: &self.code[offset + 1..end],
        }))
    }
}
