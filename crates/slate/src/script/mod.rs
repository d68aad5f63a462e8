// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2024 Jonathan Lee
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License version 3
// as published by the Free Software Foundation.
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.
// See the GNU Affero General Public License for more details.
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see https://www.gnu.org/licenses/.

pub mod ast;
pub mod interpreter;
pub mod parser;
pub mod stdlib;
pub mod token;
pub mod value;

pub use ast::{BinaryOp, Expr, Literal, Program, Stmt, UnaryOp};
pub use interpreter::{Capability, CapabilityTable, Interpreter, SqlCapability};
pub use value::Value;

use thiserror::Error;

/// Name of the injected raw-SQL capability, and of the only function a
/// generated program may define when direct SQL mode is enabled.
pub const SQL_FUNCTION: &str = "execute_sql_query";

/// Conventional variable a generated program must leave its answer in.
pub const RESULT_VARIABLE: &str = "result";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ScriptError {
    #[error("line {line}: unexpected character '{found}'")]
    UnexpectedChar { line: usize, found: char },

    #[error("line {line}: unterminated string literal")]
    UnterminatedString { line: usize },

    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("line {line}: {message}")]
    Runtime { line: usize, message: String },

    /// An injected capability failed with an error the host must see
    /// unflattened, such as a lost connector connection.
    #[error("line {line}: {source}")]
    Capability { line: usize, source: Box<crate::errors::SlateError> },

    #[error("evaluation budget exhausted after {steps} steps")]
    BudgetExhausted { steps: u64 },
}

impl ScriptError {
    pub fn parse(line: usize, message: impl Into<String>) -> Self {
        Self::Parse { line, message: message.into() }
    }

    pub fn runtime(line: usize, message: impl Into<String>) -> Self {
        Self::Runtime { line, message: message.into() }
    }
}

pub type ScriptResult<T> = Result<T, ScriptError>;

/// Parses program text into its syntax tree.
pub fn parse(source: &str) -> ScriptResult<Program> {
    let tokens = token::tokenize(source)?;
    parser::Parser::new(tokens).parse_program()
}
