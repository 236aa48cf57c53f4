use std::collections::BTreeSet;
use std::io::{self, Write};

use crate::bytecode::chunk::{Chunk, Constant, Instruction};
use crate::bytecode::op::OperandKind;
use crate::bytecode::program::{Function, Program};
use crate::lang::value::format_number;

/// Print disassembly of every function in a program to stdout.
pub fn print_program(program: &Program) -> io::Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    disassemble_program(&mut out, program)
}

pub fn disassemble_program(out: &mut dyn Write, program: &Program) -> io::Result<()> {
    writeln!(out, "=== BYTECODE PROGRAM ===")?;
    writeln!(out)?;
    for function in &program.functions {
        disassemble_function(out, program, function)?;
    }
    Ok(())
}

/// Return disassembly as a String (for tests and the REPL).
pub fn disassemble_to_string(program: &Program) -> String {
    let mut buf = Vec::new();
    // Writing into a Vec cannot fail.
    let _ = disassemble_program(&mut buf, program);
    String::from_utf8_lossy(&buf).into_owned()
}

fn disassemble_function(out: &mut dyn Write, program: &Program, function: &Function) -> io::Result<()> {
    let title = if function.is_script() {
        function.name.clone()
    } else {
        format!("runnable {}/{}", function.name, function.arity)
    };

    writeln!(out, "════════════════════════════════════════")?;
    writeln!(out, " {}", title)?;
    writeln!(
        out,
        " {} bytes, {} constants",
        function.chunk.len(),
        function.chunk.constants.len()
    )?;
    writeln!(out, "════════════════════════════════════════")?;
    disassemble_chunk(out, program, function)?;
    writeln!(out)
}

fn disassemble_chunk(out: &mut dyn Write, program: &Program, function: &Function) -> io::Result<()> {
    let chunk = &function.chunk;
    let targets = collect_jump_targets(chunk);

    for instr in chunk.instructions() {
        let instr = match instr {
            Ok(instr) => instr,
            Err(e) => {
                writeln!(out, "       <{}>", e)?;
                break;
            }
        };

        let marker = if targets.contains(&instr.offset) {
            writeln!(out, "      ┌──────────────────────────────────")?;
            "► "
        } else {
            "  "
        };
        write!(out, "{:04} {}", instr.offset, marker)?;
        write_instruction(out, program, function, &instr)?;
    }
    Ok(())
}

fn collect_jump_targets(chunk: &Chunk) -> BTreeSet<usize> {
    chunk
        .instructions()
        .map_while(Result::ok)
        .filter_map(|i| i.jump_target())
        .collect()
}

fn write_instruction(
    out: &mut dyn Write,
    program: &Program,
    function: &Function,
    instr: &Instruction<'_>,
) -> io::Result<()> {
    let name = instr.op.name();
    match instr.op.operand_kind() {
        OperandKind::None => writeln!(out, "{}", name),
        OperandKind::Constant => {
            let index = instr.byte(0);
            writeln!(
                out,
                "{:<24} {:>3}    ; {}",
                name,
                index,
                describe_constant(program, &function.chunk, index)
            )
        }
        OperandKind::Slot => {
            let slot = instr.byte(0);
            let local = function
                .locals
                .get(slot as usize)
                .map_or("?", |s| s.as_str());
            writeln!(out, "{:<24} {:>3}    ; {}", name, slot, local)
        }
        OperandKind::Jump | OperandKind::Loop => {
            let distance = instr.u16_at(0);
            let (sign, arrow) = if instr.op.operand_kind() == OperandKind::Loop {
                ('-', "↑")
            } else {
                ('+', "↓")
            };
            match instr.jump_target() {
                Some(target) => writeln!(
                    out,
                    "{:<24} {}{} {} (→ {:04})",
                    name, sign, distance, arrow, target
                ),
                None => writeln!(out, "{:<24} {}{} {} (→ ????)", name, sign, distance, arrow),
            }
        }
        OperandKind::Runnable => {
            let index = instr.byte(0);
            writeln!(
                out,
                "{:<24} {:>3}    ; {} ({} lines)",
                name,
                index,
                describe_constant(program, &function.chunk, index),
                instr.u16_at(1)
            )
        }
        OperandKind::Native => {
            let index = instr.byte(0);
            writeln!(
                out,
                "{:<24} {:>3}    ; {} ({} args)",
                name,
                index,
                describe_constant(program, &function.chunk, index),
                instr.byte(1)
            )
        }
    }
}

fn describe_constant(program: &Program, chunk: &Chunk, index: u8) -> String {
    match chunk.read_constant(index) {
        Some(Constant::Number(n)) => format_number(*n),
        Some(Constant::String(s)) => format!("{:?}", s),
        Some(Constant::Runnable(id)) => match program.function(*id) {
            Some(f) => format!("<Runnable '{}'>", f.name),
            None => format!("<missing function {}>", id.0),
        },
        None => "<out of range>".to_string(),
    }
}
