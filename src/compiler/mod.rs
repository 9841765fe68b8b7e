//! Source text to [`CompiledProgram`].
//!
//! `parse_source` runs the lexer and parser and aggregates every syntax
//! error; `compile_program` generates code for a parsed tree, runs the
//! optimizer and fills a fresh program container.

pub mod codegen;
pub mod optimize;
pub mod scope;

use crate::ast::{Program, Span};
use crate::bytecode::{CompiledProgram, FormatError};
use crate::lexer::{self, LexError};
use crate::parser::{self, ParseError};

pub use codegen::{CodeGen, RESERVED_SLOTS};
pub use optimize::{DefaultOptimizer, Optimizer};

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("{} syntax error(s)", .lex.len() + .parse.len())]
    Syntax { lex: Vec<LexError>, parse: Vec<ParseError> },
    #[error("unresolved identifier `{name}`")]
    UnresolvedIdentifier { name: String, function: String },
    #[error("unresolved function `{name}`")]
    UnresolvedFunction { name: String, function: String },
    #[error("malformed conditional: {reason}")]
    MalformedConditional { function: String, reason: String },
    #[error("the else guard of a conditional cannot be evaluated")]
    ElseGuardEvaluated { function: String },
    #[error("unsupported: {what}")]
    Unsupported { function: String, what: String },
    #[error("function `{name}` is defined more than once")]
    DuplicateFunction { name: String, span: Span, first: Span },
    #[error("instruction emitted outside of a function")]
    NoFunctionContext,
    #[error("cannot start function `{name}` while `{open}` is still open")]
    NestedFunction { name: String, open: String },
    #[error("function `{name}` was never registered")]
    UnregisteredFunction { name: String },
    #[error(transparent)]
    Format(#[from] FormatError),
}

impl CompileError {
    pub fn code(&self) -> &'static str {
        match self {
            CompileError::Syntax { .. } => "TRN-C000",
            CompileError::UnresolvedIdentifier { .. } => "TRN-C001",
            CompileError::UnresolvedFunction { .. } => "TRN-C002",
            CompileError::MalformedConditional { .. } => "TRN-C003",
            CompileError::ElseGuardEvaluated { .. } => "TRN-C004",
            CompileError::Unsupported { .. } => "TRN-C005",
            CompileError::DuplicateFunction { .. } => "TRN-C006",
            CompileError::NoFunctionContext
            | CompileError::NestedFunction { .. }
            | CompileError::UnregisteredFunction { .. } => "TRN-C100",
            CompileError::Format(_) => "TRN-F001",
        }
    }

    /// The function being generated when the error was raised.
    pub fn function(&self) -> Option<&str> {
        match self {
            CompileError::UnresolvedIdentifier { function, .. }
            | CompileError::UnresolvedFunction { function, .. }
            | CompileError::MalformedConditional { function, .. }
            | CompileError::ElseGuardEvaluated { function }
            | CompileError::Unsupported { function, .. } => Some(function),
            _ => None,
        }
    }

    pub fn span(&self) -> Option<Span> {
        match self {
            CompileError::DuplicateFunction { span, .. } => Some(*span),
            _ => None,
        }
    }
}

/// Lex and parse `source`. Lex and parse errors from the same run are
/// reported together.
pub fn parse_source(source: &str) -> Result<Program, CompileError> {
    let (tokens, lex) = lexer::lex(source);
    let (mut program, parse) = parser::parse(tokens);
    if !lex.is_empty() || !parse.is_empty() {
        return Err(CompileError::Syntax { lex, parse });
    }
    program.source = Some(source.to_string());
    Ok(program)
}

pub fn compile_program(program: &Program) -> Result<CompiledProgram, CompileError> {
    compile_program_with(program, &DefaultOptimizer)
}

pub fn compile_program_with(
    program: &Program,
    optimizer: &dyn Optimizer,
) -> Result<CompiledProgram, CompileError> {
    let mut cg = CodeGen::new();
    cg.generate_program(program)?;
    cg.optimize(optimizer);
    let mut out = CompiledProgram::new();
    cg.scaffold(&mut out);
    Ok(out)
}

pub fn compile_source(source: &str) -> Result<CompiledProgram, CompileError> {
    compile_program(&parse_source(source)?)
}

/// Compile straight to the on-disk format.
pub fn compile_to_bytes(source: &str) -> Result<Vec<u8>, CompileError> {
    Ok(compile_source(source)?.to_bytes()?)
}
