// =============================================================================
// OPCODE - one byte per instruction, operands follow inline
// =============================================================================

/// Instruction opcodes. The discriminant is the encoded byte.
///
/// Operand layouts are described by [`OpCode::operand_kind`]; every consumer
/// of the byte stream (line replay, disassembler, verifier, VM) decodes
/// widths through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    // markers
    Newline = 0,
    Return,

    // literals
    Constant,
    True,
    False,
    None,
    Pop,

    // arithmetic
    Add,
    Sub,
    Multiply,
    Divide,
    Negate,

    // bitwise
    ShiftLeft,
    ShiftRight,
    BitAnd,
    BitOr,
    BitXor,
    BitNot,

    // logic / comparison
    Not,
    Equals,
    Greater,
    Less,

    // variables
    DefineGlobal,
    GetGlobal,
    SetGlobal,
    GetLocal,
    SetLocal,
    IncGlobal,
    DecGlobal,
    IncLocal,
    DecLocal,

    // compound assignment on globals
    AddAssignGlobal,
    SubAssignGlobal,
    MultiplyAssignGlobal,
    DivideAssignGlobal,
    BitAndAssignGlobal,
    BitOrAssignGlobal,
    BitXorAssignGlobal,
    ShiftLeftAssignGlobal,
    ShiftRightAssignGlobal,

    // compound assignment on locals
    AddAssignLocal,
    SubAssignLocal,
    MultiplyAssignLocal,
    DivideAssignLocal,
    BitAndAssignLocal,
    BitOrAssignLocal,
    BitXorAssignLocal,
    ShiftLeftAssignLocal,
    ShiftRightAssignLocal,

    // ==========================================================================
    // Control flow. Distances are unsigned; LOOP jumps backwards.
    // ==========================================================================
    Jump,
    JumpIfFalse,
    JumpIfTrue,
    Loop,
    Repeat,
    EndRepeat,

    // runnables
    DefineRunnable,
    Call,
    CallNative,
}

/// What the bytes after an opcode mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    None,
    /// One byte: constant-pool index.
    Constant,
    /// One byte: local slot in the current frame.
    Slot,
    /// Two bytes big-endian: forward distance.
    Jump,
    /// Two bytes big-endian: backward distance.
    Loop,
    /// Constant index of the runnable, then its line count (u16 BE).
    Runnable,
    /// Constant index of the native's name, then the argument count.
    Native,
}

impl OperandKind {
    pub fn len(self) -> usize {
        match self {
            OperandKind::None => 0,
            OperandKind::Constant | OperandKind::Slot => 1,
            OperandKind::Jump | OperandKind::Loop | OperandKind::Native => 2,
            OperandKind::Runnable => 3,
        }
    }
}

impl OpCode {
    pub const ALL: [OpCode; 58] = [
        OpCode::Newline,
        OpCode::Return,
        OpCode::Constant,
        OpCode::True,
        OpCode::False,
        OpCode::None,
        OpCode::Pop,
        OpCode::Add,
        OpCode::Sub,
        OpCode::Multiply,
        OpCode::Divide,
        OpCode::Negate,
        OpCode::ShiftLeft,
        OpCode::ShiftRight,
        OpCode::BitAnd,
        OpCode::BitOr,
        OpCode::BitXor,
        OpCode::BitNot,
        OpCode::Not,
        OpCode::Equals,
        OpCode::Greater,
        OpCode::Less,
        OpCode::DefineGlobal,
        OpCode::GetGlobal,
        OpCode::SetGlobal,
        OpCode::GetLocal,
        OpCode::SetLocal,
        OpCode::IncGlobal,
        OpCode::DecGlobal,
        OpCode::IncLocal,
        OpCode::DecLocal,
        OpCode::AddAssignGlobal,
        OpCode::SubAssignGlobal,
        OpCode::MultiplyAssignGlobal,
        OpCode::DivideAssignGlobal,
        OpCode::BitAndAssignGlobal,
        OpCode::BitOrAssignGlobal,
        OpCode::BitXorAssignGlobal,
        OpCode::ShiftLeftAssignGlobal,
        OpCode::ShiftRightAssignGlobal,
        OpCode::AddAssignLocal,
        OpCode::SubAssignLocal,
        OpCode::MultiplyAssignLocal,
        OpCode::DivideAssignLocal,
        OpCode::BitAndAssignLocal,
        OpCode::BitOrAssignLocal,
        OpCode::BitXorAssignLocal,
        OpCode::ShiftLeftAssignLocal,
        OpCode::ShiftRightAssignLocal,
        OpCode::Jump,
        OpCode::JumpIfFalse,
        OpCode::JumpIfTrue,
        OpCode::Loop,
        OpCode::Repeat,
        OpCode::EndRepeat,
        OpCode::DefineRunnable,
        OpCode::Call,
        OpCode::CallNative,
    ];

    pub fn operand_kind(self) -> OperandKind {
        use OpCode::*;
        match self {
            Newline | Return | True | False | None | Pop | Add | Sub | Multiply | Divide
            | Negate | ShiftLeft | ShiftRight | BitAnd | BitOr | BitXor | BitNot | Not
            | Equals | Greater | Less | Repeat | EndRepeat => OperandKind::None,

            Constant | DefineGlobal | GetGlobal | SetGlobal | IncGlobal | DecGlobal
            | AddAssignGlobal | SubAssignGlobal | MultiplyAssignGlobal | DivideAssignGlobal
            | BitAndAssignGlobal | BitOrAssignGlobal | BitXorAssignGlobal
            | ShiftLeftAssignGlobal | ShiftRightAssignGlobal | Call => OperandKind::Constant,

            GetLocal | SetLocal | IncLocal | DecLocal | AddAssignLocal | SubAssignLocal
            | MultiplyAssignLocal | DivideAssignLocal | BitAndAssignLocal | BitOrAssignLocal
            | BitXorAssignLocal | ShiftLeftAssignLocal | ShiftRightAssignLocal => {
                OperandKind::Slot
            }

            Jump | JumpIfFalse | JumpIfTrue => OperandKind::Jump,
            Loop => OperandKind::Loop,
            DefineRunnable => OperandKind::Runnable,
            CallNative => OperandKind::Native,
        }
    }

    /// Number of operand bytes following the opcode.
    pub fn operand_len(self) -> usize {
        self.operand_kind().len()
    }

    /// Full encoded width, opcode byte included.
    pub fn width(self) -> usize {
        1 + self.operand_len()
    }

    /// The plain binary operator a compound assignment applies.
    pub fn compound_base(self) -> Option<OpCode> {
        use OpCode::*;
        let base = match self {
            AddAssignGlobal | AddAssignLocal => Add,
            SubAssignGlobal | SubAssignLocal => Sub,
            MultiplyAssignGlobal | MultiplyAssignLocal => Multiply,
            DivideAssignGlobal | DivideAssignLocal => Divide,
            BitAndAssignGlobal | BitAndAssignLocal => BitAnd,
            BitOrAssignGlobal | BitOrAssignLocal => BitOr,
            BitXorAssignGlobal | BitXorAssignLocal => BitXor,
            ShiftLeftAssignGlobal | ShiftLeftAssignLocal => ShiftLeft,
            ShiftRightAssignGlobal | ShiftRightAssignLocal => ShiftRight,
            _ => return Option::None,
        };
        Some(base)
    }

    /// Mnemonic used by the disassembler.
    pub fn name(self) -> &'static str {
        use OpCode::*;
        match self {
            Newline => "NEWLINE",
            Return => "RETURN",
            Constant => "CONSTANT",
            True => "TRUE",
            False => "FALSE",
            None => "NONE",
            Pop => "POP",
            Add => "ADD",
            Sub => "SUB",
            Multiply => "MULTIPLY",
            Divide => "DIVIDE",
            Negate => "NEGATE",
            ShiftLeft => "SHIFT_LEFT",
            ShiftRight => "SHIFT_RIGHT",
            BitAnd => "BIT_AND",
            BitOr => "BIT_OR",
            BitXor => "BIT_XOR",
            BitNot => "BIT_NOT",
            Not => "NOT",
            Equals => "EQUALS",
            Greater => "GREATER",
            Less => "LESS",
            DefineGlobal => "DEFINE_GLOBAL",
            GetGlobal => "GET_GLOBAL",
            SetGlobal => "SET_GLOBAL",
            GetLocal => "GET_LOCAL",
            SetLocal => "SET_LOCAL",
            IncGlobal => "INC_GLOBAL",
            DecGlobal => "DEC_GLOBAL",
            IncLocal => "INC_LOCAL",
            DecLocal => "DEC_LOCAL",
            AddAssignGlobal => "ADD_ASSIGN_GLOBAL",
            SubAssignGlobal => "SUB_ASSIGN_GLOBAL",
            MultiplyAssignGlobal => "MULTIPLY_ASSIGN_GLOBAL",
            DivideAssignGlobal => "DIVIDE_ASSIGN_GLOBAL",
            BitAndAssignGlobal => "BIT_AND_ASSIGN_GLOBAL",
            BitOrAssignGlobal => "BIT_OR_ASSIGN_GLOBAL",
            BitXorAssignGlobal => "BIT_XOR_ASSIGN_GLOBAL",
            ShiftLeftAssignGlobal => "SHIFT_LEFT_ASSIGN_GLOBAL",
            ShiftRightAssignGlobal => "SHIFT_RIGHT_ASSIGN_GLOBAL",
            AddAssignLocal => "ADD_ASSIGN_LOCAL",
            SubAssignLocal => "SUB_ASSIGN_LOCAL",
            MultiplyAssignLocal => "MULTIPLY_ASSIGN_LOCAL",
            DivideAssignLocal => "DIVIDE_ASSIGN_LOCAL",
            BitAndAssignLocal => "BIT_AND_ASSIGN_LOCAL",
            BitOrAssignLocal => "BIT_OR_ASSIGN_LOCAL",
            BitXorAssignLocal => "BIT_XOR_ASSIGN_LOCAL",
            ShiftLeftAssignLocal => "SHIFT_LEFT_ASSIGN_LOCAL",
            ShiftRightAssignLocal => "SHIFT_RIGHT_ASSIGN_LOCAL",
            Jump => "JUMP",
            JumpIfFalse => "JUMP_IF_FALSE",
            JumpIfTrue => "JUMP_IF_TRUE",
            Loop => "LOOP",
            Repeat => "REPEAT",
            EndRepeat => "END_REPEAT",
            DefineRunnable => "DEFINE_RUNNABLE",
            Call => "CALL",
            CallNative => "CALL_NATIVE",
        }
    }
}

impl TryFrom<u8> for OpCode {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        OpCode::ALL.get(byte as usize).copied().ok_or(byte)
    }
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> u8 {
        op as u8
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
