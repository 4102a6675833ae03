//! Compiler for templated ClickHouse queries.
//!
//! Turns a dashboard query template, with its variables, time placeholders
//! and aggregation macros such as `$rate(...)` or `$columns(...)`, into plain
//! SQL:
//!
//! ```no_run
//! use chquery::{compile, CompileRequest};
//!
//! let request = CompileRequest::from_toml_str(
//!     "[options]\ntable = \"requests\"\n\
//!      [time_range]\nfrom = \"2024-01-01T00:00:00Z\"\nto = \"2024-01-01T01:00:00Z\"\n",
//! )?;
//! let sql = compile("$rate(countIf(status >= 500) AS errors) FROM $table", &request)?;
//! println!("{sql}");
//! # Ok::<(), chquery::CompileError>(())
//! ```

pub mod adhoc;
pub mod ast;
pub mod compiler;
pub mod config;
pub mod error;
pub mod fragment;
pub mod lexer;
pub mod parser;
pub mod printer;
pub mod processor;
pub mod template;
pub mod time;

pub use adhoc::{AdHocFilter, AdHocValue};
pub use ast::{Ast, Clause, Join, MacroArgs, Source};
pub use compiler::{Compiler, compile};
pub use config::{CompileRequest, QueryOptions};
pub use error::{CompileError, ErrorKind, Result};
pub use lexer::{Lexer, Token, TokenKind};
pub use parser::{Parser, parse_query};
pub use printer::print_ast;
pub use processor::{AggregationMacro, Expander};
pub use template::{Variable, VariableKind, VariableValue};
pub use time::{DateTimeType, TimeRange};
