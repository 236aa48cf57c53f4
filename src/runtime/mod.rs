pub mod natives;
pub mod runtime_error;
pub mod vm;
