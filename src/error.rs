//! Compile error types
//!
//! Every failure the query compiler can report. Lexer, parser and macro errors
//! abort a compile; ad-hoc filter format errors are logged and the filter is
//! skipped by the caller.

use thiserror::Error;

/// Errors that can occur while compiling a query
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    /// No token pattern matches the remaining input
    #[error("unexpected input at `{remaining}`")]
    Lex { remaining: String },

    /// A required follow-up token is missing
    #[error("expected {expected}, but got `{found}` at `{remaining}`")]
    Syntax {
        expected: String,
        found: String,
        remaining: String,
    },

    /// A macro argument list or subquery never closes its parenthesis
    #[error("missing closing parenthesis in `{span}`")]
    UnbalancedParen { span: String },

    /// A macro got fewer (or more) arguments than it accepts
    #[error(
        "{macro_name} expects {expected} arguments, got {}: {}",
        .args.len(),
        .args.join(", ")
    )]
    MacroArity {
        macro_name: String,
        expected: &'static str,
        args: Vec<String>,
    },

    /// A macro argument that must carry an alias does not
    #[error("argument `{argument}` of {macro_name} can't be used without an alias")]
    UnaliasedArgument {
        macro_name: String,
        argument: String,
    },

    /// `$conditionalTest` references a variable the host did not supply
    #[error("variable `{name}` is not defined")]
    UnresolvedVariable { name: String },

    /// A macro invocation is not followed by a FROM clause
    #[error("could not find FROM statement after {macro_name} in `{query}`")]
    FromClauseMissing { macro_name: String, query: String },

    /// GROUP BY / HAVING / ORDER BY appear out of order
    #[error("{clause} must not follow {previous}")]
    ClauseOrder { clause: String, previous: String },

    /// Ad-hoc filter key cannot be resolved to `database.table.column`
    #[error("ad-hoc filter `{key}` has wrong format: {reason}")]
    AdHocFilterFormat { key: String, reason: String },

    /// Interval or round value is not a duration
    #[error("received interval is invalid: `{interval}`")]
    InvalidInterval { interval: String },

    /// Compile request could not be loaded
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Coarse error category, for hosts that report `{kind, message}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Lex,
    Syntax,
    UnbalancedParen,
    MacroArity,
    UnaliasedArgument,
    UnresolvedVariable,
    FromClauseMissing,
    ClauseOrder,
    AdHocFilterFormat,
    InvalidInterval,
    Config,
}

impl CompileError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CompileError::Lex { .. } => ErrorKind::Lex,
            CompileError::Syntax { .. } => ErrorKind::Syntax,
            CompileError::UnbalancedParen { .. } => ErrorKind::UnbalancedParen,
            CompileError::MacroArity { .. } => ErrorKind::MacroArity,
            CompileError::UnaliasedArgument { .. } => ErrorKind::UnaliasedArgument,
            CompileError::UnresolvedVariable { .. } => ErrorKind::UnresolvedVariable,
            CompileError::FromClauseMissing { .. } => ErrorKind::FromClauseMissing,
            CompileError::ClauseOrder { .. } => ErrorKind::ClauseOrder,
            CompileError::AdHocFilterFormat { .. } => ErrorKind::AdHocFilterFormat,
            CompileError::InvalidInterval { .. } => ErrorKind::InvalidInterval,
            CompileError::Config(_) => ErrorKind::Config,
        }
    }
}

/// Result type for compile operations
pub type Result<T> = std::result::Result<T, CompileError>;
