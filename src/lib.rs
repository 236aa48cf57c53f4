//! Rat: a small line-oriented scripting language.
//!
//! Source text is scanned into tokens ([`frontend`]), compiled in a single
//! Pratt pass straight to byte-encoded chunks ([`bytecode`]), and executed by
//! a stack machine with explicit call frames over a reference-counted object
//! heap ([`runtime`], [`lang`]).

use thiserror::Error;

pub mod bytecode;
pub mod frontend;
pub mod lang;
pub mod runtime;

pub use bytecode::{CompileErrors, Program, compile};
pub use runtime::runtime_error::{ExitCode, RuntimeError};
pub use runtime::vm::{Vm, VmConfig};

/// Either half of a failed run.
#[derive(Debug, Error)]
pub enum RatError {
    #[error(transparent)]
    Compile(#[from] CompileErrors),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl RatError {
    /// Process exit status for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            RatError::Compile(errors) => errors.code(),
            RatError::Runtime(err) => err.code.code(),
        }
    }
}

/// Compile `source` and run it on `vm`.
pub fn run(source: &str, vm: &mut Vm<'_>) -> Result<(), RatError> {
    let program = compile(source)?;
    vm.interpret(&program)?;
    Ok(())
}
