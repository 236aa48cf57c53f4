//! Built-in runnables.
//!
//! A native sees the operand stack exactly as the caller left it: the callee
//! object, then its arguments with the last one on top. It reads the
//! arguments with [`Vm::peek`], pops them, and pushes exactly one result. The
//! VM then replaces the callee slot with that result.

use std::fs::{self, OpenOptions};
use std::io::Write;

use crate::lang::heap::{NativeId, Object};
use crate::lang::value::Value;
use crate::runtime::runtime_error::{RuntimeError, internal, type_error};
use crate::runtime::vm::Vm;

pub type NativeFn = fn(&mut Vm<'_>) -> Result<(), RuntimeError>;

pub struct Native {
    pub name: &'static str,
    pub arity: usize,
    pub run: NativeFn,
}

pub static NATIVES: [Native; 9] = [
    Native { name: "input", arity: 0, run: native_input },
    Native { name: "print", arity: 1, run: native_print },
    Native { name: "ReadFromFile", arity: 1, run: native_read_from_file },
    Native { name: "WriteToFile", arity: 2, run: native_write_to_file },
    Native { name: "EmptyFile", arity: 1, run: native_empty_file },
    Native { name: "Number", arity: 1, run: native_number },
    Native { name: "Boolean", arity: 1, run: native_boolean },
    Native { name: "String", arity: 1, run: native_string },
    Native { name: "Type", arity: 1, run: native_type },
];

pub fn lookup(name: &str) -> Option<NativeId> {
    NATIVES.iter().position(|n| n.name == name).map(NativeId)
}

pub fn get(id: NativeId) -> Option<&'static Native> {
    NATIVES.get(id.0)
}

/// Text argument, or a type error naming the native.
fn string_arg(vm: &Vm<'_>, distance: usize, native: &str) -> Result<String, RuntimeError> {
    let value = vm.peek(distance)?;
    match value {
        Value::Object(r) => match vm.heap().get(r)? {
            Object::String(s) => Ok(s.clone()),
            other => Err(type_error(format!(
                "{} expects a string, got {}",
                native,
                other.kind_name()
            ))),
        },
        _ => Err(type_error(format!(
            "{} expects a string, got {}",
            native,
            vm.type_name(value)?
        ))),
    }
}

fn native_input(vm: &mut Vm<'_>) -> Result<(), RuntimeError> {
    let line = vm.read_line()?;
    vm.push_string(line)
}

fn native_print(vm: &mut Vm<'_>) -> Result<(), RuntimeError> {
    let text = vm.display(vm.peek(0)?)?;
    vm.write_line(&text)?;
    vm.pop()?;
    vm.push(Value::None)
}

fn native_read_from_file(vm: &mut Vm<'_>) -> Result<(), RuntimeError> {
    let path = string_arg(vm, 0, "ReadFromFile")?;
    let contents = fs::read_to_string(&path)
        .map_err(|e| internal(format!("could not read '{}': {}", path, e)))?;
    vm.pop()?;
    vm.push_string(contents)
}

fn native_write_to_file(vm: &mut Vm<'_>) -> Result<(), RuntimeError> {
    let path = string_arg(vm, 1, "WriteToFile")?;
    let text = vm.display(vm.peek(0)?)?;

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| internal(format!("could not open '{}': {}", path, e)))?;
    file.write_all(text.as_bytes())
        .map_err(|e| internal(format!("could not write '{}': {}", path, e)))?;

    vm.pop()?;
    vm.pop()?;
    vm.push(Value::None)
}

fn native_empty_file(vm: &mut Vm<'_>) -> Result<(), RuntimeError> {
    let path = string_arg(vm, 0, "EmptyFile")?;
    OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(&path)
        .map_err(|e| internal(format!("could not empty '{}': {}", path, e)))?;
    vm.pop()?;
    vm.push(Value::None)
}

fn native_number(vm: &mut Vm<'_>) -> Result<(), RuntimeError> {
    let value = vm.peek(0)?;
    let n = match value {
        Value::None => 0.0,
        Value::Number(n) => n,
        Value::Bool(b) => {
            if b {
                1.0
            } else {
                0.0
            }
        }
        Value::Object(r) => match vm.heap().get(r)? {
            Object::String(s) => s
                .trim()
                .parse::<f32>()
                .ok()
                .filter(|n| n.is_finite())
                .ok_or_else(|| type_error(format!("cannot convert \"{}\" to a number", s)))?,
            other => {
                return Err(type_error(format!(
                    "cannot convert {} to a number",
                    other.kind_name()
                )));
            }
        },
    };
    vm.pop()?;
    vm.push(Value::Number(n))
}

fn native_boolean(vm: &mut Vm<'_>) -> Result<(), RuntimeError> {
    let truthy = vm.is_truthy(vm.peek(0)?)?;
    vm.pop()?;
    vm.push(Value::Bool(truthy))
}

fn native_string(vm: &mut Vm<'_>) -> Result<(), RuntimeError> {
    let text = vm.display(vm.peek(0)?)?;
    vm.pop()?;
    vm.push_string(text)
}

fn native_type(vm: &mut Vm<'_>) -> Result<(), RuntimeError> {
    let name = vm.type_name(vm.peek(0)?)?;
    vm.pop()?;
    vm.push_string(name.to_string())
}
