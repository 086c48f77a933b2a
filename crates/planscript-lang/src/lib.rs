//! # PlanScript Lang
//!
//! Front-end for the PlanScript DSL: an indentation-sensitive scripting
//! language with ordinary control flow plus the runtime's built-in
//! operations. This crate turns script text into tokens and tokens into
//! an AST; it knows nothing about execution.

pub mod ast;
pub mod lexer;
pub mod parser;
pub mod token;

use thiserror::Error;

/// Tokenizer or parser rejection. Always fatal and always carries the
/// line it happened on.
#[derive(Debug, Error)]
#[error("ParseError: line {line}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

impl ParseError {
    pub fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

/// Tokenize and parse a script in one step.
pub fn parse_script(source: &str) -> Result<Vec<ast::Stmt>, ParseError> {
    let tokens = lexer::tokenize(source)?;
    parser::parse_program(&tokens)
}

pub use ast::{BinOp, Expr, Stmt, StmtKind};
pub use token::{Keyword, Token, TokenKind};
