use thiserror::Error;

use crate::lang::heap::HeapError;

/// Outcome of a run, also used as the process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Ok,
    UnrecognizedOpcode,
    StackUnderflow,
    StackOverflow,
    TypeError,
    UndefinedIdentifier,
    RedeclaredIdentifier,
    ReturnFromScript,
    InternalError,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        match self {
            ExitCode::Ok => 0,
            ExitCode::UnrecognizedOpcode => 201,
            ExitCode::StackUnderflow => 202,
            ExitCode::StackOverflow => 203,
            ExitCode::TypeError => 204,
            ExitCode::UndefinedIdentifier => 205,
            ExitCode::RedeclaredIdentifier => 206,
            ExitCode::ReturnFromScript => 207,
            ExitCode::InternalError => 208,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("[Runtime error in line {line}]: {message}{}", render_help(.help))]
pub struct RuntimeError {
    pub code: ExitCode,
    pub message: String,
    /// Source line, filled in by the VM when the fault leaves the dispatch loop.
    pub line: usize,
    pub help: Option<String>,
}

fn render_help(help: &Option<String>) -> String {
    match help {
        Some(h) => format!("\n  help: {}", h),
        None => String::new(),
    }
}

impl RuntimeError {
    pub fn new(code: ExitCode, message: impl Into<String>) -> Self {
        RuntimeError {
            code,
            message: message.into(),
            line: 0,
            help: None,
        }
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    pub fn at_line(mut self, line: usize) -> Self {
        if self.line == 0 {
            self.line = line;
        }
        self
    }
}

impl From<HeapError> for RuntimeError {
    fn from(err: HeapError) -> Self {
        internal(err.to_string())
    }
}

pub fn stack_underflow() -> RuntimeError {
    RuntimeError::new(ExitCode::StackUnderflow, "stack underflow")
}

pub fn stack_overflow(capacity: usize) -> RuntimeError {
    RuntimeError::new(
        ExitCode::StackOverflow,
        format!("stack overflow (capacity {})", capacity),
    )
}

pub fn type_error(message: impl Into<String>) -> RuntimeError {
    RuntimeError::new(ExitCode::TypeError, message)
}

pub fn undefined_identifier(name: &str) -> RuntimeError {
    RuntimeError::new(
        ExitCode::UndefinedIdentifier,
        format!("undefined identifier '{}'", name),
    )
}

pub fn redeclared_identifier(name: &str) -> RuntimeError {
    RuntimeError::new(
        ExitCode::RedeclaredIdentifier,
        format!("identifier '{}' is already declared", name),
    )
}

pub fn internal(message: impl Into<String>) -> RuntimeError {
    RuntimeError::new(ExitCode::InternalError, message)
}
