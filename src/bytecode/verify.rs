use thiserror::Error;

use crate::bytecode::chunk::{Constant, FunctionId, Instruction};
use crate::bytecode::op::{OpCode, OperandKind};
use crate::bytecode::program::{Function, Program};

#[derive(Debug, Clone, PartialEq, Error)]
#[error("verify error in '{function}' at {offset:04}: {message}")]
pub struct VerifyError {
    pub function: String,
    pub offset: usize,
    pub message: String,
}

impl VerifyError {
    fn new(function: &Function, offset: usize, message: impl Into<String>) -> Self {
        Self {
            function: function.name.clone(),
            offset,
            message: message.into(),
        }
    }
}

/// Returns (pops, pushes) for an op, or None when it depends on the callee.
fn effect(op: OpCode) -> Option<(usize, usize)> {
    use OpCode::*;
    Some(match op {
        Newline | Jump | JumpIfFalse | JumpIfTrue | Loop | DefineRunnable => (0, 0),

        Constant | True | False | None => (0, 1),
        Pop => (1, 0),
        Return => (1, 0),

        Add | Sub | Multiply | Divide | ShiftLeft | ShiftRight | BitAnd | BitOr | BitXor
        | Equals | Greater | Less => (2, 1),
        Negate | BitNot | Not => (1, 1),

        DefineGlobal => (1, 0),
        GetGlobal | GetLocal => (0, 1),
        SetGlobal | SetLocal => (1, 1),
        IncGlobal | DecGlobal | IncLocal | DecLocal => (0, 1),

        AddAssignGlobal | SubAssignGlobal | MultiplyAssignGlobal | DivideAssignGlobal
        | BitAndAssignGlobal | BitOrAssignGlobal | BitXorAssignGlobal
        | ShiftLeftAssignGlobal | ShiftRightAssignGlobal | AddAssignLocal | SubAssignLocal
        | MultiplyAssignLocal | DivideAssignLocal | BitAndAssignLocal | BitOrAssignLocal
        | BitXorAssignLocal | ShiftLeftAssignLocal | ShiftRightAssignLocal => (1, 1),

        // The counter is checked in place
        Repeat => (1, 1),
        // Handled per successor
        EndRepeat => (0, 0),

        Call | CallNative => return Option::None,
    })
}

/// Verify every function of a program.
pub fn verify(program: &Program) -> Result<(), VerifyError> {
    let Some(script) = program.functions.first() else {
        return Err(VerifyError {
            function: "<script>".to_string(),
            offset: 0,
            message: "program has no script".to_string(),
        });
    };
    if !script.is_script() {
        return Err(VerifyError::new(script, 0, "first function must be the script"));
    }
    for id in 0..program.functions.len() {
        verify_function(program, FunctionId(id))?;
    }
    Ok(())
}

/// Structural and stack-height checks for one function.
///
/// Follows every jump so heights are compared at join points. Code that no
/// path reaches is only decoded, not height-checked.
pub fn verify_function(program: &Program, id: FunctionId) -> Result<(), VerifyError> {
    let function = &program.functions[id.0];
    let chunk = &function.chunk;

    if let Some(parent) = function.enclosing {
        if parent >= id {
            return Err(VerifyError::new(
                function,
                0,
                format!("enclosing function #{} does not precede it", parent.0),
            ));
        }
    } else if id != FunctionId::SCRIPT {
        return Err(VerifyError::new(function, 0, "only the script may lack an enclosing function"));
    }

    let mut instructions: Vec<Instruction<'_>> = Vec::new();
    for decoded in chunk.instructions() {
        let instr = decoded.map_err(|e| VerifyError::new(function, chunk.len(), e.to_string()))?;
        check_operands(program, function, &instr)?;
        instructions.push(instr);
    }

    // Instruction index by byte offset; None for bytes inside an instruction.
    let mut index_at = vec![None; chunk.len() + 1];
    for (i, instr) in instructions.iter().enumerate() {
        index_at[instr.offset] = Some(i);
    }

    let mut heights: Vec<Option<usize>> = vec![None; chunk.len() + 1];
    let mut work = vec![(0usize, function.arity)];

    while let Some((offset, height)) = work.pop() {
        if offset == chunk.len() {
            if !function.is_script() {
                return Err(VerifyError::new(function, offset, "runnable body falls off its end"));
            }
            continue;
        }
        let Some(i) = index_at.get(offset).copied().flatten() else {
            return Err(VerifyError::new(function, offset, "jump into the middle of an instruction"));
        };
        match heights[offset] {
            Some(seen) if seen == height => continue,
            Some(seen) => {
                return Err(VerifyError::new(
                    function,
                    offset,
                    format!("inconsistent stack height ({} vs {})", seen, height),
                ));
            }
            None => heights[offset] = Some(height),
        }

        let instr = &instructions[i];
        let (pops, pushes) = match effect(instr.op) {
            Some(e) => e,
            None => call_effect(program, function, instr)?,
        };
        if height < pops {
            return Err(VerifyError::new(
                function,
                offset,
                format!("stack underflow: {} needs {} values, has {}", instr.op, pops, height),
            ));
        }
        let after = height - pops + pushes;

        if instr.op.operand_kind() == OperandKind::Slot {
            let slot = instr.byte(0) as usize;
            if function.is_script() || slot >= height {
                return Err(VerifyError::new(
                    function,
                    offset,
                    format!("local slot {} is not live", slot),
                ));
            }
        }

        let next = instr.next_offset();
        match instr.op {
            OpCode::Return => {}
            OpCode::Jump | OpCode::Loop => work.push((target(function, instr)?, after)),
            OpCode::JumpIfFalse | OpCode::JumpIfTrue => {
                if height == 0 {
                    return Err(VerifyError::new(function, offset, "conditional jump on empty stack"));
                }
                work.push((target(function, instr)?, after));
                work.push((next, after));
            }
            OpCode::EndRepeat => {
                if height == 0 {
                    return Err(VerifyError::new(function, offset, "END_REPEAT without a counter"));
                }
                let after_loop = index_at
                    .get(next)
                    .copied()
                    .flatten()
                    .map(|j| &instructions[j])
                    .filter(|j| j.op == OpCode::Loop)
                    .map(|j| j.next_offset())
                    .ok_or_else(|| VerifyError::new(function, offset, "END_REPEAT must precede LOOP"))?;
                work.push((next, after));
                work.push((after_loop, after - 1));
            }
            _ => work.push((next, after)),
        }
    }

    Ok(())
}

fn target(function: &Function, instr: &Instruction<'_>) -> Result<usize, VerifyError> {
    match instr.jump_target() {
        Some(t) if t <= function.chunk.len() => Ok(t),
        _ => Err(VerifyError::new(function, instr.offset, "jump target outside the chunk")),
    }
}

fn call_effect(
    program: &Program,
    function: &Function,
    instr: &Instruction<'_>,
) -> Result<(usize, usize), VerifyError> {
    match instr.op {
        OpCode::CallNative => Ok((instr.byte(1) as usize + 1, 1)),
        _ => {
            let name = identifier(function, instr)?;
            let callee = program
                .functions
                .iter()
                .skip(1)
                .find(|f| f.name == name)
                .ok_or_else(|| {
                    VerifyError::new(function, instr.offset, format!("call to unknown runnable '{}'", name))
                })?;
            Ok((callee.arity + 1, 1))
        }
    }
}

fn identifier<'f>(function: &'f Function, instr: &Instruction<'_>) -> Result<&'f str, VerifyError> {
    match function.chunk.read_constant(instr.byte(0)) {
        Some(Constant::String(s)) => Ok(s),
        _ => Err(VerifyError::new(
            function,
            instr.offset,
            format!("{} expects an identifier constant", instr.op),
        )),
    }
}

fn check_operands(
    program: &Program,
    function: &Function,
    instr: &Instruction<'_>,
) -> Result<(), VerifyError> {
    match instr.op.operand_kind() {
        OperandKind::Constant | OperandKind::Native | OperandKind::Runnable => {
            let index = instr.byte(0);
            let Some(constant) = function.chunk.read_constant(index) else {
                return Err(VerifyError::new(
                    function,
                    instr.offset,
                    format!("constant index {} out of range", index),
                ));
            };
            match (instr.op, constant) {
                (OpCode::Constant, Constant::Runnable(_)) => Err(VerifyError::new(
                    function,
                    instr.offset,
                    "runnables are only loaded through DEFINE_RUNNABLE",
                )),
                (OpCode::Constant, _) => Ok(()),
                (OpCode::DefineRunnable, Constant::Runnable(target)) => {
                    match program.function(*target) {
                        Some(callee) if callee.enclosing.is_some() => Ok(()),
                        _ => Err(VerifyError::new(
                            function,
                            instr.offset,
                            format!("runnable #{} does not exist", target.0),
                        )),
                    }
                }
                (OpCode::DefineRunnable, _) => Err(VerifyError::new(
                    function,
                    instr.offset,
                    "DEFINE_RUNNABLE expects a runnable constant",
                )),
                _ => identifier(function, instr).map(|_| ()),
            }
        }
        _ => Ok(()),
    }
}
