//! Structured error types for the lex/parse/compile/runtime phase
//! boundaries, plus the top-level `Error` that `loadstring`/`dostring`/
//! `exec` return. Every variant carries the `(module, line, col)` triple
//! so `Display` renders the exact located-message format the embedding
//! API promises its host error callback.

use std::fmt;
use thiserror::Error;

use crate::value::KindSet;

/// A source location within a single module, used to tag every
/// diagnostic the lexer, parser, compiler and VM can raise.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Location {
    pub module: String,
    pub line: u32,
    pub col: u32,
}

impl Location {
    pub fn new(module: impl Into<String>, line: u32, col: u32) -> Self {
        Location { module: module.into(), line, col }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}:{}", self.module, self.line, self.col)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LexError {
    #[error("{0}: unrecognized byte {1:#04x}")]
    UnrecognizedByte(Location, u8),
    #[error("{0}: malformed number (multiple decimal points)")]
    MalformedNumber(Location),
    #[error("{0}: unterminated string literal")]
    UnterminatedString(Location),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("{0}: unexpected token {1}")]
    UnexpectedToken(Location, String),
    #[error("{0}: unclosed {1}")]
    Unclosed(Location, &'static str),
    #[error("{0}: expected {1}")]
    ExpectedDelimiter(Location, &'static str),
    #[error("{0}: `else` after `else`")]
    DuplicateElse(Location),
    #[error("{0}: too many call arguments (max 16)")]
    TooManyArguments(Location),
    #[error("{0}: table literal keys must be a single identifier or literal token")]
    InvalidTableKey(Location),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("{0}: invalid assignment target")]
    InvalidAssignTarget(Location),
    #[error("{0}: assignment to undeclared global `{1}`")]
    AssignToUndeclaredGlobal(Location, String),
    #[error("{0}: `break` outside a loop")]
    BreakOutsideLoop(Location),
    #[error("{0}: function has too many parameters (max 16)")]
    TooManyParameters(Location),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("{0}: unknown opcode {1}")]
    UnknownOpcode(Location, u8),
    #[error("{0}: stack overflow")]
    StackOverflow(Location),
    #[error("{0}: stack underflow")]
    StackUnderflow(Location),
    #[error("{0}: call stack overflow (exceeded {1} frames)")]
    CallStackOverflow(Location, u16),
    #[error("{0}: value is not callable")]
    NotCallable(Location),
    #[error("{0}: expected {1}, found {2}")]
    TypeMismatch(Location, KindSet, &'static str),
    #[error("{0}: {1}")]
    Library(Location, String),
}

/// The single fatal error channel the whole runtime shares: every
/// phase's error rolls up into this enum so the embedding API has one
/// type to hand the host error callback.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl Error {
    pub fn location(&self) -> &Location {
        match self {
            Error::Lex(LexError::UnrecognizedByte(l, _))
            | Error::Lex(LexError::MalformedNumber(l))
            | Error::Lex(LexError::UnterminatedString(l))
            | Error::Parse(ParseError::UnexpectedToken(l, _))
            | Error::Parse(ParseError::Unclosed(l, _))
            | Error::Parse(ParseError::ExpectedDelimiter(l, _))
            | Error::Parse(ParseError::DuplicateElse(l))
            | Error::Parse(ParseError::TooManyArguments(l))
            | Error::Parse(ParseError::InvalidTableKey(l))
            | Error::Compile(CompileError::InvalidAssignTarget(l))
            | Error::Compile(CompileError::AssignToUndeclaredGlobal(l, _))
            | Error::Compile(CompileError::BreakOutsideLoop(l))
            | Error::Compile(CompileError::TooManyParameters(l))
            | Error::Runtime(RuntimeError::UnknownOpcode(l, _))
            | Error::Runtime(RuntimeError::StackOverflow(l))
            | Error::Runtime(RuntimeError::StackUnderflow(l))
            | Error::Runtime(RuntimeError::CallStackOverflow(l, _))
            | Error::Runtime(RuntimeError::NotCallable(l))
            | Error::Runtime(RuntimeError::TypeMismatch(l, _, _))
            | Error::Runtime(RuntimeError::Library(l, _)) => l,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
