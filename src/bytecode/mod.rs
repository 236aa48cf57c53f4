pub mod chunk;
pub mod compile;
pub mod compile_error;
pub mod disasm;
pub mod op;
pub mod program;
pub mod verify;

pub use chunk::{Chunk, Constant, FunctionId};
pub use compile::{Compiler, compile};
pub use compile_error::{CompileError, CompileErrorKind, CompileErrors};
pub use op::OpCode;
pub use program::{BytecodeError, Function, Program};
