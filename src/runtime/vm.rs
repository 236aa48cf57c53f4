use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Write};

use crate::bytecode::chunk::{Constant, FunctionId};
use crate::bytecode::op::OpCode;
use crate::bytecode::program::Program;
use crate::lang::heap::{Heap, HeapStats, NativeId, Object};
use crate::lang::value::{Value, format_number};
use crate::runtime::natives::{self, NATIVES};
use crate::runtime::runtime_error::{
    ExitCode, RuntimeError, internal, redeclared_identifier, stack_overflow, stack_underflow,
    type_error, undefined_identifier,
};

/// Largest `repeat` count. The counter is an `f32`, which stops counting
/// down exactly past 2^24.
pub const MAX_REPEAT: i32 = 1 << 24;

#[derive(Debug, Clone)]
pub struct VmConfig {
    pub stack_capacity: usize,
    pub max_call_depth: usize,
    /// Print the operand stack to the diagnostics stream after every instruction.
    pub trace: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            stack_capacity: 1024,
            max_call_depth: 256,
            trace: false,
        }
    }
}

/// One active call. Local slot `s` lives at `stack[frame_start + s + 1]`;
/// `stack[frame_start]` holds the callee itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallFrame {
    pub function: FunctionId,
    pub ip: usize,
    pub frame_start: usize,
}

pub struct Vm<'io> {
    config: VmConfig,
    stack: Vec<Value>,
    globals: HashMap<String, Value>,
    frames: Vec<CallFrame>,
    heap: Heap,
    /// Materialized constant pool per function of the loaded program.
    constants: Vec<Vec<Value>>,
    natives_bound: bool,

    out: Box<dyn Write + 'io>,
    input: Box<dyn BufRead + 'io>,
    diagnostics: Box<dyn Write + 'io>,
}

impl Vm<'static> {
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    /// A VM wired to the process's stdin, stdout and stderr.
    pub fn with_config(config: VmConfig) -> Self {
        Vm::with_io(config, io::stdout(), BufReader::new(io::stdin()))
    }
}

impl Default for Vm<'static> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'io> Vm<'io> {
    pub fn with_io(config: VmConfig, out: impl Write + 'io, input: impl BufRead + 'io) -> Self {
        Self {
            config,
            stack: Vec::new(),
            globals: HashMap::new(),
            frames: Vec::new(),
            heap: Heap::new(),
            constants: Vec::new(),
            natives_bound: false,
            out: Box::new(out),
            input: Box::new(input),
            diagnostics: Box::new(io::stderr()),
        }
    }

    /// Redirect trace output (stderr by default).
    pub fn with_diagnostics(mut self, diagnostics: impl Write + 'io) -> Self {
        self.diagnostics = Box::new(diagnostics);
        self
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn stack(&self) -> &[Value] {
        &self.stack
    }

    pub fn frames(&self) -> &[CallFrame] {
        &self.frames
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        self.globals.get(name).copied()
    }

    // =========================================================================
    // Entry point
    // =========================================================================

    /// Run `program` to completion.
    ///
    /// Global variables survive between calls on the same VM; runnables and
    /// constants belong to the program that defined them and are dropped when
    /// the next one is loaded. After a fault the stack and frames are left as
    /// they were so they can be inspected.
    pub fn interpret(&mut self, program: &Program) -> Result<(), RuntimeError> {
        self.reset()?;
        self.bind_natives()?;
        self.load_constants(program)?;
        self.frames.push(CallFrame {
            function: FunctionId::SCRIPT,
            ip: 0,
            frame_start: 0,
        });

        self.run(program)?;
        self.frames.clear();
        Ok(())
    }

    /// Release everything the VM holds and return the heap's final counters.
    pub fn teardown(&mut self) -> HeapStats {
        let held: Vec<Value> = self
            .stack
            .drain(..)
            .chain(self.globals.drain().map(|(_, v)| v))
            .chain(self.constants.drain(..).flatten())
            .collect();
        for value in held {
            // Sweep below reclaims anything a failed release leaves behind.
            let _ = self.heap.release_value(value);
        }
        self.frames.clear();
        self.natives_bound = false;
        self.heap.sweep();
        self.heap.stats()
    }

    fn reset(&mut self) -> Result<(), RuntimeError> {
        for value in std::mem::take(&mut self.stack) {
            self.heap.release_value(value)?;
        }
        self.frames.clear();
        for value in std::mem::take(&mut self.constants).into_iter().flatten() {
            self.heap.release_value(value)?;
        }

        let stale: Vec<String> = self
            .globals
            .iter()
            .filter(|(_, v)| self.is_runnable(**v))
            .map(|(name, _)| name.clone())
            .collect();
        for name in stale {
            if let Some(value) = self.globals.remove(&name) {
                self.heap.release_value(value)?;
            }
        }
        Ok(())
    }

    fn bind_natives(&mut self) -> Result<(), RuntimeError> {
        if self.natives_bound {
            return Ok(());
        }
        for (i, native) in NATIVES.iter().enumerate() {
            let r = self.heap.alloc(Object::Native {
                id: NativeId(i),
                name: native.name,
            });
            self.define_global(native.name, Value::Object(r))?;
        }
        self.natives_bound = true;
        Ok(())
    }

    fn load_constants(&mut self, program: &Program) -> Result<(), RuntimeError> {
        for function in &program.functions {
            let mut pool = Vec::with_capacity(function.chunk.constants.len());
            for constant in &function.chunk.constants {
                let value = match constant {
                    Constant::Number(n) => Value::Number(*n),
                    Constant::String(s) => self.new_string(s.clone()),
                    Constant::Runnable(id) => {
                        let callee = program.function(*id).ok_or_else(|| {
                            internal(format!("constant refers to missing function {}", id.0))
                        })?;
                        Value::Object(self.heap.alloc(Object::Runnable {
                            function: *id,
                            name: callee.name.clone(),
                        }))
                    }
                };
                self.heap.retain_value(value)?;
                pool.push(value);
            }
            self.constants.push(pool);
        }
        Ok(())
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    fn run(&mut self, program: &Program) -> Result<(), RuntimeError> {
        loop {
            let frame = *self.frames.last().ok_or_else(|| internal("no active frame"))?;
            let function = program
                .function(frame.function)
                .ok_or_else(|| internal(format!("missing function {}", frame.function.0)))?;

            if frame.ip >= function.chunk.len() {
                if function.is_script() {
                    return Ok(());
                }
                return Err(
                    internal(format!("runnable '{}' ran past its end", function.name))
                        .at_line(program.source_line(frame.function, frame.ip)),
                );
            }

            self.step(program, frame.function, &function.chunk.code)
                .map_err(|e| e.at_line(program.source_line(frame.function, frame.ip)))?;

            if self.config.trace {
                self.trace(frame.ip)?;
            }
        }
    }

    fn step(&mut self, program: &Program, fid: FunctionId, code: &[u8]) -> Result<(), RuntimeError> {
        let byte = self.read_byte(code)?;
        let op = OpCode::try_from(byte).map_err(|byte| {
            RuntimeError::new(
                ExitCode::UnrecognizedOpcode,
                format!("unrecognized opcode 0x{:02x}", byte),
            )
        })?;

        match op {
            OpCode::Newline => {}
            OpCode::Pop => self.pop()?,

            OpCode::Constant => {
                let index = self.read_byte(code)?;
                let value = self.constant(fid, index)?;
                self.push(value)?;
            }
            OpCode::True => self.push(Value::Bool(true))?,
            OpCode::False => self.push(Value::Bool(false))?,
            OpCode::None => self.push(Value::None)?,

            OpCode::Add
            | OpCode::Sub
            | OpCode::Multiply
            | OpCode::Divide
            | OpCode::ShiftLeft
            | OpCode::ShiftRight
            | OpCode::BitAnd
            | OpCode::BitOr
            | OpCode::BitXor
            | OpCode::Equals
            | OpCode::Greater
            | OpCode::Less => {
                let a = self.peek(1)?;
                let b = self.peek(0)?;
                let result = self.binary(op, a, b)?;
                self.pop()?;
                self.pop()?;
                self.push(result)?;
            }

            OpCode::Negate => {
                let value = self.peek(0)?;
                let n = value.as_number().ok_or_else(|| {
                    type_error(format!("cannot negate {}", self.describe(value)))
                })?;
                self.replace_top(Value::Number(-n))?;
            }
            OpCode::BitNot => {
                let value = self.peek(0)?;
                let n = value.as_integral().ok_or_else(|| {
                    type_error(format!("operand of '~' must be integral, got {}", self.describe(value)))
                        .with_help("bitwise operators work on whole numbers")
                })?;
                self.replace_top(Value::Number(!n as f32))?;
            }
            OpCode::Not => {
                let truthy = self.is_truthy(self.peek(0)?)?;
                self.replace_top(Value::Bool(!truthy))?;
            }

            OpCode::DefineGlobal => {
                let name = identifier(program, fid, self.read_byte(code)?)?;
                let value = self.peek(0)?;
                self.define_global(name, value)?;
                self.pop()?;
            }
            OpCode::GetGlobal => {
                let name = identifier(program, fid, self.read_byte(code)?)?;
                let value = self.global(name).ok_or_else(|| undefined_identifier(name))?;
                self.push(value)?;
            }
            OpCode::SetGlobal => {
                let name = identifier(program, fid, self.read_byte(code)?)?;
                self.variable_global(name)?;
                let value = self.peek(0)?;
                self.store_global(name, value)?;
            }
            OpCode::IncGlobal | OpCode::DecGlobal => {
                let name = identifier(program, fid, self.read_byte(code)?)?;
                let old = self.variable_global(name)?;
                let new = self.step_number(op, old)?;
                self.store_global(name, new)?;
                self.push(new)?;
            }

            OpCode::GetLocal => {
                let slot = self.read_byte(code)?;
                let value = self.stack[self.local_index(slot)?];
                self.push(value)?;
            }
            OpCode::SetLocal => {
                let slot = self.read_byte(code)?;
                let value = self.peek(0)?;
                self.store_local(slot, value)?;
            }
            OpCode::IncLocal | OpCode::DecLocal => {
                let slot = self.read_byte(code)?;
                let old = self.stack[self.local_index(slot)?];
                let new = self.step_number(op, old)?;
                self.store_local(slot, new)?;
                self.push(new)?;
            }

            OpCode::Jump => {
                let distance = self.read_u16(code)?;
                self.frame_mut()?.ip += distance as usize;
            }
            OpCode::JumpIfFalse | OpCode::JumpIfTrue => {
                let distance = self.read_u16(code)?;
                let truthy = self.is_truthy(self.peek(0)?)?;
                if truthy == (op == OpCode::JumpIfTrue) {
                    self.frame_mut()?.ip += distance as usize;
                }
            }
            OpCode::Loop => {
                let distance = self.read_u16(code)?;
                let frame = self.frame_mut()?;
                frame.ip = frame
                    .ip
                    .checked_sub(distance as usize)
                    .ok_or_else(|| internal("loop jumps before the start of the chunk"))?;
            }

            OpCode::Repeat => {
                let count = self.peek(0)?;
                if !count.as_integral().is_some_and(|n| n > 0) {
                    return Err(type_error(format!(
                        "repeat count must be a positive whole number, got {}",
                        self.describe(count)
                    )));
                }
                if let Some(n) = count.as_integral().filter(|n| *n > MAX_REPEAT) {
                    return Err(type_error(format!(
                        "repeat count {} is above the limit of {}",
                        n, MAX_REPEAT
                    ))
                    .with_help("use a while loop for longer counts"));
                }
            }
            OpCode::EndRepeat => {
                let remaining = self
                    .peek(0)?
                    .as_number()
                    .ok_or_else(|| internal("repeat counter is not a number"))?
                    - 1.0;
                if remaining <= 0.0 {
                    self.pop()?;
                    self.frame_mut()?.ip += OpCode::Loop.width();
                } else {
                    self.replace_top(Value::Number(remaining))?;
                }
            }

            OpCode::DefineRunnable => {
                let index = self.read_byte(code)?;
                // Line count, only used for line recovery.
                self.read_u16(code)?;
                let value = self.constant(fid, index)?;
                let name = match value.as_object().map(|r| self.heap.get(r)).transpose()? {
                    Some(Object::Runnable { name, .. }) => name.clone(),
                    _ => return Err(internal("DEFINE_RUNNABLE operand is not a runnable")),
                };
                self.define_global(&name, value)?;
            }
            OpCode::Call => {
                let name = identifier(program, fid, self.read_byte(code)?)?;
                self.call(program, name)?;
            }
            OpCode::CallNative => {
                let name = identifier(program, fid, self.read_byte(code)?)?;
                let argc = self.read_byte(code)? as usize;
                self.call_native(name, argc)?;
            }
            OpCode::Return => {
                let result = self.peek(0)?;
                if self.frames.len() <= 1 {
                    return Err(RuntimeError::new(
                        ExitCode::ReturnFromScript,
                        "can't return from top-level code",
                    ));
                }
                let frame = *self.frame()?;
                self.collapse(frame.frame_start, result)?;
                self.frames.pop();
            }

            OpCode::AddAssignGlobal
            | OpCode::SubAssignGlobal
            | OpCode::MultiplyAssignGlobal
            | OpCode::DivideAssignGlobal
            | OpCode::BitAndAssignGlobal
            | OpCode::BitOrAssignGlobal
            | OpCode::BitXorAssignGlobal
            | OpCode::ShiftLeftAssignGlobal
            | OpCode::ShiftRightAssignGlobal => {
                let name = identifier(program, fid, self.read_byte(code)?)?;
                let base = op.compound_base().ok_or_else(|| internal("no base operator"))?;
                let old = self.variable_global(name)?;
                let rhs = self.peek(0)?;
                let result = self.binary(base, old, rhs)?;
                self.store_global(name, result)?;
                self.pop()?;
                self.push(result)?;
            }

            OpCode::AddAssignLocal
            | OpCode::SubAssignLocal
            | OpCode::MultiplyAssignLocal
            | OpCode::DivideAssignLocal
            | OpCode::BitAndAssignLocal
            | OpCode::BitOrAssignLocal
            | OpCode::BitXorAssignLocal
            | OpCode::ShiftLeftAssignLocal
            | OpCode::ShiftRightAssignLocal => {
                let slot = self.read_byte(code)?;
                let base = op.compound_base().ok_or_else(|| internal("no base operator"))?;
                let old = self.stack[self.local_index(slot)?];
                let rhs = self.peek(0)?;
                let result = self.binary(base, old, rhs)?;
                self.store_local(slot, result)?;
                self.pop()?;
                self.push(result)?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Calls
    // =========================================================================

    fn call(&mut self, program: &Program, name: &str) -> Result<(), RuntimeError> {
        let callee = self.global(name).ok_or_else(|| undefined_identifier(name))?;
        let function = match callee.as_object().map(|r| self.heap.get(r)).transpose()? {
            Some(Object::Runnable { function, .. }) => *function,
            _ => return Err(type_error(format!("'{}' is not a runnable", name))),
        };
        let arity = program
            .function(function)
            .ok_or_else(|| internal(format!("missing function {}", function.0)))?
            .arity;

        if self.frames.len() >= self.config.max_call_depth {
            return Err(RuntimeError::new(
                ExitCode::StackOverflow,
                format!("call depth limit of {} exceeded", self.config.max_call_depth),
            )
            .with_help("check that recursive runnables have a base case"));
        }
        let frame_start = self
            .stack
            .len()
            .checked_sub(arity + 1)
            .ok_or_else(stack_underflow)?;
        self.frames.push(CallFrame {
            function,
            ip: 0,
            frame_start,
        });
        Ok(())
    }

    fn call_native(&mut self, name: &str, argc: usize) -> Result<(), RuntimeError> {
        let callee = self.global(name).ok_or_else(|| undefined_identifier(name))?;
        let id = match callee.as_object().map(|r| self.heap.get(r)).transpose()? {
            Some(Object::Native { id, .. }) => *id,
            _ => return Err(type_error(format!("'{}' is not a native runnable", name))),
        };
        let native = natives::get(id).ok_or_else(|| internal(format!("unknown native {}", id.0)))?;
        if native.arity != argc {
            return Err(type_error(format!(
                "'{}' expects {} argument(s) but got {}",
                name, native.arity, argc
            )));
        }

        let base = self
            .stack
            .len()
            .checked_sub(argc + 1)
            .ok_or_else(stack_underflow)?;
        (native.run)(self)?;
        let result = self.peek(0)?;
        self.collapse(base, result)
    }

    /// Drop everything from `base` up and leave `result` in its place.
    fn collapse(&mut self, base: usize, result: Value) -> Result<(), RuntimeError> {
        self.heap.retain_value(result)?;
        while self.stack.len() > base {
            self.pop()?;
        }
        self.push(result)?;
        self.heap.release_value(result)?;
        Ok(())
    }

    // =========================================================================
    // Variables
    // =========================================================================

    fn define_global(&mut self, name: &str, value: Value) -> Result<(), RuntimeError> {
        if let Some(existing) = self.global(name) {
            if self.is_native(existing) {
                return Err(RuntimeError::new(
                    ExitCode::RedeclaredIdentifier,
                    format!("'{}' is reserved for a native function", name),
                ));
            }
            return Err(redeclared_identifier(name));
        }
        self.heap.retain_value(value)?;
        self.globals.insert(name.to_string(), value);
        Ok(())
    }

    /// Current value of a global that may be assigned to.
    fn variable_global(&self, name: &str) -> Result<Value, RuntimeError> {
        let value = self.global(name).ok_or_else(|| undefined_identifier(name))?;
        if self.is_runnable(value) || self.is_native(value) {
            return Err(type_error(format!("cannot assign to runnable '{}'", name)));
        }
        Ok(value)
    }

    fn store_global(&mut self, name: &str, value: Value) -> Result<(), RuntimeError> {
        self.heap.retain_value(value)?;
        if let Some(old) = self.globals.insert(name.to_string(), value) {
            self.heap.release_value(old)?;
        }
        Ok(())
    }

    fn local_index(&self, slot: u8) -> Result<usize, RuntimeError> {
        let index = self.frame()?.frame_start + slot as usize + 1;
        if index >= self.stack.len() {
            return Err(internal(format!("local slot {} is out of range", slot)));
        }
        Ok(index)
    }

    fn store_local(&mut self, slot: u8, value: Value) -> Result<(), RuntimeError> {
        let index = self.local_index(slot)?;
        self.heap.retain_value(value)?;
        let old = std::mem::replace(&mut self.stack[index], value);
        self.heap.release_value(old)?;
        Ok(())
    }

    fn step_number(&self, op: OpCode, value: Value) -> Result<Value, RuntimeError> {
        let n = value.as_number().ok_or_else(|| {
            type_error(format!("cannot increment or decrement {}", self.describe(value)))
        })?;
        Ok(match op {
            OpCode::IncGlobal | OpCode::IncLocal => Value::Number(n + 1.0),
            _ => Value::Number(n - 1.0),
        })
    }

    // =========================================================================
    // Operators
    // =========================================================================

    fn binary(&mut self, op: OpCode, a: Value, b: Value) -> Result<Value, RuntimeError> {
        match op {
            OpCode::Equals => return Ok(Value::Bool(self.values_equal(a, b)?)),
            OpCode::BitAnd
            | OpCode::BitOr
            | OpCode::BitXor
            | OpCode::ShiftLeft
            | OpCode::ShiftRight => return self.bitwise(op, a, b),
            _ => {}
        }

        if let (Value::Number(x), Value::Number(y)) = (a, b) {
            return Ok(match op {
                OpCode::Add => Value::Number(x + y),
                OpCode::Sub => Value::Number(x - y),
                OpCode::Multiply => Value::Number(x * y),
                OpCode::Divide => Value::Number(x / y),
                OpCode::Greater => Value::Bool(x > y),
                OpCode::Less => Value::Bool(x < y),
                _ => return Err(internal(format!("{} is not a binary operator", op))),
            });
        }

        if op == OpCode::Add {
            let joined = match (self.as_str(a)?, self.as_str(b)?) {
                (Some(x), Some(y)) => Some(format!("{}{}", x, y)),
                _ => None,
            };
            if let Some(joined) = joined {
                return Ok(self.new_string(joined));
            }
        }

        Err(type_error(format!(
            "operands of '{}' must be numbers, got {} and {}",
            symbol(op),
            self.describe(a),
            self.describe(b)
        )))
    }

    fn bitwise(&self, op: OpCode, a: Value, b: Value) -> Result<Value, RuntimeError> {
        let (Some(x), Some(y)) = (a.as_integral(), b.as_integral()) else {
            return Err(type_error(format!(
                "operands of '{}' must be integral numbers, got {} and {}",
                symbol(op),
                self.describe(a),
                self.describe(b)
            ))
            .with_help("bitwise operators work on whole numbers"));
        };

        let result = match op {
            OpCode::BitAnd => x & y,
            OpCode::BitOr => x | y,
            OpCode::BitXor => x ^ y,
            OpCode::ShiftLeft | OpCode::ShiftRight => {
                if !(0..32).contains(&y) {
                    return Err(type_error(format!("shift amount {} is outside 0..32", y)));
                }
                if op == OpCode::ShiftLeft {
                    x.wrapping_shl(y as u32)
                } else {
                    x >> y
                }
            }
            _ => return Err(internal(format!("{} is not a bitwise operator", op))),
        };
        Ok(Value::Number(result as f32))
    }

    fn values_equal(&self, a: Value, b: Value) -> Result<bool, RuntimeError> {
        Ok(match (a, b) {
            (Value::None, Value::None) => true,
            (Value::Number(x), Value::Number(y)) => x == y,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::Object(x), Value::Object(y)) => {
                match (self.heap.get(x)?, self.heap.get(y)?) {
                    (Object::String(s), Object::String(t)) => s == t,
                    _ => x == y,
                }
            }
            _ => false,
        })
    }

    // =========================================================================
    // Stack and value helpers (also used by natives)
    // =========================================================================

    pub fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.stack.len() >= self.config.stack_capacity {
            return Err(stack_overflow(self.config.stack_capacity));
        }
        self.heap.retain_value(value)?;
        self.stack.push(value);
        Ok(())
    }

    /// Discard the top value. Read it with [`Vm::peek`] first: popping may
    /// free the object it refers to.
    pub fn pop(&mut self) -> Result<(), RuntimeError> {
        let value = self.stack.pop().ok_or_else(stack_underflow)?;
        self.heap.release_value(value)?;
        Ok(())
    }

    pub fn peek(&self, distance: usize) -> Result<Value, RuntimeError> {
        self.stack
            .len()
            .checked_sub(distance + 1)
            .map(|i| self.stack[i])
            .ok_or_else(stack_underflow)
    }

    fn replace_top(&mut self, value: Value) -> Result<(), RuntimeError> {
        self.pop()?;
        self.push(value)
    }

    /// Allocate a string object. It is unheld until pushed or stored.
    pub fn new_string(&mut self, text: String) -> Value {
        Value::Object(self.heap.alloc(Object::String(text)))
    }

    /// Allocate a string and push it. Capacity is checked first so a full
    /// stack never leaves an unheld object behind.
    pub fn push_string(&mut self, text: String) -> Result<(), RuntimeError> {
        if self.stack.len() >= self.config.stack_capacity {
            return Err(stack_overflow(self.config.stack_capacity));
        }
        let value = self.new_string(text);
        self.push(value)
    }

    pub fn is_truthy(&self, value: Value) -> Result<bool, RuntimeError> {
        Ok(match value {
            Value::None => false,
            Value::Bool(b) => b,
            Value::Number(n) => n != 0.0,
            Value::Object(r) => match self.heap.get(r)? {
                Object::String(s) => !s.is_empty() && s != "false",
                Object::Runnable { .. } | Object::Native { .. } => true,
            },
        })
    }

    pub fn display(&self, value: Value) -> Result<String, RuntimeError> {
        Ok(match value {
            Value::None => "None".to_string(),
            Value::Number(n) => format_number(n),
            Value::Bool(b) => b.to_string(),
            Value::Object(r) => self.heap.get(r)?.to_string(),
        })
    }

    pub fn type_name(&self, value: Value) -> Result<&'static str, RuntimeError> {
        Ok(match value {
            Value::None => "NONE",
            Value::Number(_) => "NUMBER",
            Value::Bool(_) => "BOOL",
            Value::Object(r) => self.heap.get(r)?.kind_name(),
        })
    }

    /// `KIND value` for error messages.
    fn describe(&self, value: Value) -> String {
        match (self.type_name(value), self.display(value)) {
            (Ok(kind), Ok(text)) if kind == "STRING" => format!("{} \"{}\"", kind, text),
            (Ok(kind), Ok(text)) => format!("{} {}", kind, text),
            _ => "a freed object".to_string(),
        }
    }

    fn as_str(&self, value: Value) -> Result<Option<&str>, RuntimeError> {
        match value {
            Value::Object(r) => match self.heap.get(r)? {
                Object::String(s) => Ok(Some(s)),
                _ => Ok(None),
            },
            _ => Ok(None),
        }
    }

    fn is_runnable(&self, value: Value) -> bool {
        matches!(
            value.as_object().map(|r| self.heap.get(r)),
            Some(Ok(Object::Runnable { .. }))
        )
    }

    fn is_native(&self, value: Value) -> bool {
        matches!(
            value.as_object().map(|r| self.heap.get(r)),
            Some(Ok(Object::Native { .. }))
        )
    }

    // =========================================================================
    // I/O
    // =========================================================================

    pub fn write_line(&mut self, text: &str) -> Result<(), RuntimeError> {
        writeln!(self.out, "{}", text)
            .and_then(|_| self.out.flush())
            .map_err(|e| internal(format!("could not write output: {}", e)))
    }

    /// One line of input without its line terminator; empty at end of input.
    pub fn read_line(&mut self) -> Result<String, RuntimeError> {
        let mut line = String::new();
        self.input
            .read_line(&mut line)
            .map_err(|e| internal(format!("could not read input: {}", e)))?;
        let trimmed = line.trim_end_matches(['\n', '\r']).len();
        line.truncate(trimmed);
        Ok(line)
    }

    fn trace(&mut self, offset: usize) -> Result<(), RuntimeError> {
        let mut line = format!("{:04}\t", offset);
        for value in &self.stack {
            line.push_str(&format!("[ {} ]", self.display(*value)?));
        }
        writeln!(self.diagnostics, "{}", line)
            .map_err(|e| internal(format!("could not write trace: {}", e)))
    }

    // =========================================================================
    // Frame and operand decoding
    // =========================================================================

    fn frame(&self) -> Result<&CallFrame, RuntimeError> {
        self.frames.last().ok_or_else(|| internal("no active frame"))
    }

    fn frame_mut(&mut self) -> Result<&mut CallFrame, RuntimeError> {
        self.frames.last_mut().ok_or_else(|| internal("no active frame"))
    }

    fn read_byte(&mut self, code: &[u8]) -> Result<u8, RuntimeError> {
        let frame = self.frame_mut()?;
        let byte = *code
            .get(frame.ip)
            .ok_or_else(|| internal("instruction runs past the end of the chunk"))?;
        frame.ip += 1;
        Ok(byte)
    }

    fn read_u16(&mut self, code: &[u8]) -> Result<u16, RuntimeError> {
        let hi = self.read_byte(code)?;
        let lo = self.read_byte(code)?;
        Ok(u16::from_be_bytes([hi, lo]))
    }

    fn constant(&self, fid: FunctionId, index: u8) -> Result<Value, RuntimeError> {
        self.constants
            .get(fid.0)
            .and_then(|pool| pool.get(index as usize))
            .copied()
            .ok_or_else(|| internal(format!("constant {} is out of range", index)))
    }
}

impl Drop for Vm<'_> {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Name stored in a string constant, for the global and call opcodes.
fn identifier(program: &Program, fid: FunctionId, index: u8) -> Result<&str, RuntimeError> {
    match program
        .function(fid)
        .and_then(|f| f.chunk.read_constant(index))
    {
        Some(Constant::String(name)) => Ok(name),
        _ => Err(internal(format!("constant {} is not an identifier", index))),
    }
}

fn symbol(op: OpCode) -> &'static str {
    match op {
        OpCode::Add => "+",
        OpCode::Sub => "-",
        OpCode::Multiply => "*",
        OpCode::Divide => "/",
        OpCode::Greater => ">",
        OpCode::Less => "<",
        OpCode::BitAnd => "&",
        OpCode::BitOr => "|",
        OpCode::BitXor => "^",
        OpCode::ShiftLeft => "<<",
        OpCode::ShiftRight => ">>",
        _ => "?",
    }
}
