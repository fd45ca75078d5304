pub mod interp;
pub mod lexer;
pub mod parser;

use thiserror::Error;

/// Source-level error with position context, for the lexer and parser.
#[derive(Debug, Clone, Error)]
#[error("{message} at line {line}, column {col}")]
pub struct SourceError {
    pub message: String,
    pub line: usize,
    pub col: usize,
}
