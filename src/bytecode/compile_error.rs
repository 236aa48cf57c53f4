use thiserror::Error;

use crate::bytecode::chunk::ChunkError;
use crate::frontend::lexer::{LexerError, Spanned};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileErrorKind {
    UnexpectedToken,
    UnrecognizedToken,
    UnclosedBlock,
    ConstantsOverflow,
    NumericOverflow,
    RedeclaredIdentifier,
    UndefinedRunnable,
    NestedRunnable,
    JumpOverflow,
    Internal,
    NestingTooDeep,
}

impl CompileErrorKind {
    /// Stable numeric code, also used as the process exit status.
    pub fn code(self) -> i32 {
        match self {
            CompileErrorKind::UnexpectedToken => 101,
            CompileErrorKind::UnrecognizedToken => 102,
            CompileErrorKind::UnclosedBlock => 103,
            CompileErrorKind::ConstantsOverflow => 104,
            CompileErrorKind::NumericOverflow => 105,
            CompileErrorKind::RedeclaredIdentifier => 106,
            CompileErrorKind::UndefinedRunnable => 107,
            CompileErrorKind::NestedRunnable => 108,
            CompileErrorKind::JumpOverflow => 109,
            CompileErrorKind::Internal => 110,
            CompileErrorKind::NestingTooDeep => 111,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("[Compilation error in line {line}, at '{lexeme}']: {message}{}", render_hint(.hint))]
pub struct CompileError {
    pub kind: CompileErrorKind,
    pub message: String,
    pub line: usize,
    pub col: usize,
    pub lexeme: String,
    pub hint: Option<String>,
}

fn render_hint(hint: &Option<String>) -> String {
    match hint {
        Some(h) => format!("\n  hint: {}", h),
        None => String::new(),
    }
}

impl CompileError {
    /// Error located at `at`.
    pub fn new(kind: CompileErrorKind, at: &Spanned, message: impl Into<String>) -> Self {
        CompileError {
            kind,
            message: message.into(),
            line: at.span.line,
            col: at.span.col,
            lexeme: at.token.to_string(),
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn unexpected(at: &Spanned, message: impl Into<String>) -> Self {
        Self::new(CompileErrorKind::UnexpectedToken, at, message)
    }

    pub fn unclosed(at: &Spanned, block: &str, closer: &str) -> Self {
        Self::new(
            CompileErrorKind::UnclosedBlock,
            at,
            format!("'{}' block is never closed", block),
        )
        .with_hint(format!("add '{}'", closer))
    }

    pub fn from_chunk(at: &Spanned, err: ChunkError) -> Self {
        let kind = match err {
            ChunkError::ConstantsOverflow => CompileErrorKind::ConstantsOverflow,
            ChunkError::NumericOverflow(_) => CompileErrorKind::NumericOverflow,
            _ => CompileErrorKind::Internal,
        };
        Self::new(kind, at, err.to_string())
    }

    /// Create an internal compiler error
    pub fn internal(at: &Spanned, msg: impl Into<String>) -> Self {
        Self::new(CompileErrorKind::Internal, at, msg)
    }

    pub fn code(&self) -> i32 {
        self.kind.code()
    }
}

impl From<LexerError> for CompileError {
    fn from(err: LexerError) -> Self {
        CompileError {
            kind: CompileErrorKind::UnrecognizedToken,
            message: err.message,
            line: err.line,
            col: err.col,
            lexeme: String::new(),
            hint: None,
        }
    }
}

/// Every error collected while compiling one source.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{}", render_all(.0))]
pub struct CompileErrors(pub Vec<CompileError>);

fn render_all(errors: &[CompileError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

impl CompileErrors {
    pub fn iter(&self) -> std::slice::Iter<'_, CompileError> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Exit status for the whole compilation: the first error's code.
    pub fn code(&self) -> i32 {
        self.0.first().map_or(0, CompileError::code)
    }
}

impl From<LexerError> for CompileErrors {
    fn from(err: LexerError) -> Self {
        CompileErrors(vec![err.into()])
    }
}
