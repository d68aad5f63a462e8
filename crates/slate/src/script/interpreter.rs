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

//! Tree-walking evaluator for validated programs. Nothing ambient leaks
//! in: every callable the program can reach lives in an explicit
//! [`CapabilityTable`] built by the host, and dataset variables are bound
//! up front. Evaluation is metered so a runaway program fails with a
//! typed budget error instead of hanging the turn.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use polars::prelude::DataFrame;

use super::ast::{BinaryOp, Expr, Program, Stmt, UnaryOp};
use super::stdlib;
use super::value::{FunctionDef, Value};
use super::{ScriptError, ScriptResult};

const MAX_CALL_DEPTH: usize = 64;

/// Host-provided raw-SQL capability. Errors pass through the evaluator
/// unflattened so the host can distinguish a broken query from a broken
/// connector.
#[async_trait]
pub trait SqlCapability: Send + Sync {
    async fn execute_sql(&self, sql: &str) -> crate::errors::Result<DataFrame>;
}

pub type NativeFn = fn(&[Value], usize) -> ScriptResult<Value>;

#[derive(Clone)]
pub enum Capability {
    Native(NativeFn),
    Sql(Arc<dyn SqlCapability>),
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native(_) => f.write_str("Capability::Native"),
            Self::Sql(_) => f.write_str("Capability::Sql"),
        }
    }
}

/// The complete set of callables a program may reach. Capabilities are
/// authoritative: a program-defined function never shadows one.
#[derive(Debug, Clone, Default)]
pub struct CapabilityTable {
    entries: HashMap<String, Capability>,
}

impl CapabilityTable {
    pub fn new() -> Self {
        Self { entries: HashMap::new() }
    }

    /// Table pre-loaded with the always-available scalar helpers.
    pub fn with_base() -> Self {
        let mut table = Self::new();
        stdlib::install_base(&mut table);
        table
    }

    pub fn register(&mut self, name: &str, capability: Capability) {
        self.entries.insert(name.to_string(), capability);
    }

    /// Adds one import family. Returns false for module names this
    /// runtime does not provide.
    pub fn enable_module(&mut self, module: &str) -> bool {
        stdlib::install_module(self, module)
    }

    pub fn get(&self, name: &str) -> Option<&Capability> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }
}

#[derive(Debug)]
pub struct Interpreter {
    capabilities: CapabilityTable,
    globals: HashMap<String, Value>,
    scopes: Vec<HashMap<String, Value>>,
    steps: u64,
    max_steps: u64,
    current_line: usize,
}

impl Interpreter {
    pub fn new(capabilities: CapabilityTable, max_steps: u64) -> Self {
        Self {
            capabilities,
            globals: HashMap::new(),
            scopes: Vec::new(),
            steps: 0,
            max_steps,
            current_line: 0,
        }
    }

    /// Binds a variable before execution starts, used for the session's
    /// dataset frames.
    pub fn bind(&mut self, name: impl Into<String>, value: Value) {
        self.globals.insert(name.into(), value);
    }

    pub fn global(&self, name: &str) -> Option<&Value> {
        self.globals.get(name)
    }

    pub fn into_globals(self) -> HashMap<String, Value> {
        self.globals
    }

    pub async fn run(&mut self, program: &Program) -> ScriptResult<()> {
        for stmt in &program.statements {
            self.exec_stmt(stmt).await?;
        }
        Ok(())
    }

    fn tick(&mut self) -> ScriptResult<()> {
        self.steps += 1;
        if self.steps > self.max_steps {
            return Err(ScriptError::BudgetExhausted { steps: self.max_steps });
        }
        Ok(())
    }

    fn lookup(&self, name: &str) -> Option<&Value> {
        for scope in self.scopes.iter().rev() {
            if let Some(value) = scope.get(name) {
                return Some(value);
            }
        }
        self.globals.get(name)
    }

    fn assign(&mut self, name: &str, value: Value) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string(), value);
        } else {
            self.globals.insert(name.to_string(), value);
        }
    }

    /// Executes one statement, yielding the value of an expression
    /// statement so function bodies can return their final expression.
    async fn exec_stmt(&mut self, stmt: &Stmt) -> ScriptResult<Option<Value>> {
        self.tick()?;
        self.current_line = stmt.line();
        match stmt {
            Stmt::Import { module, line } => {
                if !self.capabilities.enable_module(module) {
                    return Err(ScriptError::runtime(
                        *line,
                        format!("no module named '{module}' is available"),
                    ));
                }
                Ok(None)
            }
            Stmt::FnDef { name, params, body, .. } => {
                let def = FunctionDef {
                    name: name.clone(),
                    params: params.clone(),
                    body: body.clone(),
                };
                self.assign(name, Value::Function(Arc::new(def)));
                Ok(None)
            }
            Stmt::Assign { target, value, .. } => {
                let value = self.eval(value).await?;
                self.assign(target, value);
                Ok(None)
            }
            Stmt::Expr { expr, .. } => {
                let value = self.eval(expr).await?;
                Ok(Some(value))
            }
        }
    }

    async fn exec_block(&mut self, body: &[Stmt]) -> ScriptResult<Value> {
        let mut last = Value::Null;
        for stmt in body {
            if let Some(value) = self.exec_stmt(stmt).await? {
                last = value;
            }
        }
        Ok(last)
    }

    fn eval<'a>(&'a mut self, expr: &'a Expr) -> BoxFuture<'a, ScriptResult<Value>> {
        Box::pin(async move {
            self.tick()?;
            match expr {
                Expr::Literal(lit) => Ok(Value::from_literal(lit)),
                Expr::Ident(name) => self.lookup(name).cloned().ok_or_else(|| {
                    ScriptError::runtime(
                        self.current_line,
                        format!("unknown variable '{name}'"),
                    )
                }),
                Expr::List(items) => {
                    let mut values = Vec::with_capacity(items.len());
                    for item in items {
                        values.push(self.eval(item).await?);
                    }
                    Ok(Value::List(values))
                }
                Expr::Map(entries) => {
                    let mut values = Vec::with_capacity(entries.len());
                    for (key, item) in entries {
                        values.push((key.clone(), self.eval(item).await?));
                    }
                    Ok(Value::Map(values))
                }
                Expr::Unary { op, operand } => {
                    let value = self.eval(operand).await?;
                    self.apply_unary(*op, value)
                }
                Expr::Binary { op: BinaryOp::And, left, right } => {
                    let left = self.eval(left).await?;
                    if left.is_truthy() {
                        self.eval(right).await
                    } else {
                        Ok(left)
                    }
                }
                Expr::Binary { op: BinaryOp::Or, left, right } => {
                    let left = self.eval(left).await?;
                    if left.is_truthy() {
                        Ok(left)
                    } else {
                        self.eval(right).await
                    }
                }
                Expr::Binary { op, left, right } => {
                    let left = self.eval(left).await?;
                    let right = self.eval(right).await?;
                    apply_binary(*op, left, right, self.current_line)
                }
                Expr::Call { callee, args, line } => {
                    let mut values = Vec::with_capacity(args.len());
                    for arg in args {
                        values.push(self.eval(arg).await?);
                    }
                    self.call(callee, values, *line).await
                }
                Expr::Index { target, index } => {
                    let target = self.eval(target).await?;
                    let index = self.eval(index).await?;
                    self.index_value(&target, &index)
                }
            }
        })
    }

    async fn call(&mut self, callee: &str, args: Vec<Value>, line: usize) -> ScriptResult<Value> {
        if let Some(capability) = self.capabilities.get(callee).cloned() {
            return match capability {
                Capability::Native(f) => f(&args, line),
                Capability::Sql(executor) => {
                    if args.len() != 1 {
                        return Err(ScriptError::runtime(
                            line,
                            format!("{callee} expects exactly one SQL string argument"),
                        ));
                    }
                    let sql = args[0].as_str().ok_or_else(|| {
                        ScriptError::runtime(
                            line,
                            format!("{callee}: the query must be a string"),
                        )
                    })?;
                    let frame = executor.execute_sql(sql).await.map_err(|source| {
                        ScriptError::Capability { line, source: Box::new(source) }
                    })?;
                    Ok(Value::Frame(frame))
                }
            };
        }
        let function = match self.lookup(callee) {
            Some(Value::Function(def)) => Arc::clone(def),
            Some(other) => {
                return Err(ScriptError::runtime(
                    line,
                    format!("'{callee}' is a {}, not a function", other.type_name()),
                ))
            }
            None => {
                return Err(ScriptError::runtime(
                    line,
                    format!("unknown function '{callee}'"),
                ))
            }
        };
        if function.params.len() != args.len() {
            return Err(ScriptError::runtime(
                line,
                format!(
                    "{callee} expects {} argument(s), got {}",
                    function.params.len(),
                    args.len()
                ),
            ));
        }
        if self.scopes.len() >= MAX_CALL_DEPTH {
            return Err(ScriptError::runtime(line, "call depth limit exceeded"));
        }
        let scope = function
            .params
            .iter()
            .cloned()
            .zip(args)
            .collect::<HashMap<_, _>>();
        self.scopes.push(scope);
        let result = self.exec_block(&function.body).await;
        self.scopes.pop();
        result
    }

    fn apply_unary(&self, op: UnaryOp, value: Value) -> ScriptResult<Value> {
        match op {
            UnaryOp::Neg => match value {
                Value::Int(n) => n.checked_neg().map(Value::Int).ok_or_else(|| {
                    ScriptError::runtime(self.current_line, "integer overflow")
                }),
                Value::Float(x) => Ok(Value::Float(-x)),
                other => Err(ScriptError::runtime(
                    self.current_line,
                    format!("cannot negate a {}", other.type_name()),
                )),
            },
            UnaryOp::Not => Ok(Value::Bool(!value.is_truthy())),
        }
    }

    fn index_value(&self, target: &Value, index: &Value) -> ScriptResult<Value> {
        let line = self.current_line;
        match (target, index) {
            (Value::List(items), Value::Int(i)) => {
                let len = items.len() as i64;
                let at = if *i < 0 { len + *i } else { *i };
                if at < 0 || at >= len {
                    return Err(ScriptError::runtime(
                        line,
                        format!("list index {i} out of range for length {len}"),
                    ));
                }
                Ok(items[at as usize].clone())
            }
            (Value::Map(_), Value::Str(key)) => {
                target.map_get(key).cloned().ok_or_else(|| {
                    ScriptError::runtime(line, format!("map has no key '{key}'"))
                })
            }
            (Value::Frame(frame), Value::Str(column)) => {
                stdlib::column_values(frame, column, line).map(Value::List)
            }
            (target, index) => Err(ScriptError::runtime(
                line,
                format!(
                    "cannot index a {} with a {}",
                    target.type_name(),
                    index.type_name()
                ),
            )),
        }
    }
}

fn apply_binary(op: BinaryOp, left: Value, right: Value, line: usize) -> ScriptResult<Value> {
    match op {
        BinaryOp::Add => match (&left, &right) {
            (Value::Str(a), Value::Str(b)) => Ok(Value::Str(format!("{a}{b}"))),
            (Value::List(a), Value::List(b)) => {
                let mut out = a.clone();
                out.extend(b.iter().cloned());
                Ok(Value::List(out))
            }
            _ => arithmetic(op, &left, &right, line),
        },
        BinaryOp::Sub | BinaryOp::Mul => arithmetic(op, &left, &right, line),
        BinaryOp::Div => {
            let (x, y) = numeric_pair(op, &left, &right, line)?;
            if y == 0.0 {
                return Err(ScriptError::runtime(line, "division by zero"));
            }
            Ok(Value::Float(x / y))
        }
        BinaryOp::Rem => match (&left, &right) {
            (Value::Int(a), Value::Int(b)) => {
                if *b == 0 {
                    return Err(ScriptError::runtime(line, "division by zero"));
                }
                Ok(Value::Int(a.rem_euclid(*b)))
            }
            _ => {
                let (x, y) = numeric_pair(op, &left, &right, line)?;
                if y == 0.0 {
                    return Err(ScriptError::runtime(line, "division by zero"));
                }
                Ok(Value::Float(x.rem_euclid(y)))
            }
        },
        BinaryOp::Eq => Ok(Value::Bool(left == right)),
        BinaryOp::Ne => Ok(Value::Bool(left != right)),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            compare(op, &left, &right, line)
        }
        // short-circuit forms are evaluated before operands are forced
        BinaryOp::And | BinaryOp::Or => Err(ScriptError::runtime(
            line,
            "logical operators must be evaluated lazily",
        )),
    }
}

fn arithmetic(op: BinaryOp, left: &Value, right: &Value, line: usize) -> ScriptResult<Value> {
    if let (Value::Int(a), Value::Int(b)) = (left, right) {
        let out = match op {
            BinaryOp::Add => a.checked_add(*b),
            BinaryOp::Sub => a.checked_sub(*b),
            BinaryOp::Mul => a.checked_mul(*b),
            _ => None,
        };
        return out
            .map(Value::Int)
            .ok_or_else(|| ScriptError::runtime(line, "integer overflow"));
    }
    let (x, y) = numeric_pair(op, left, right, line)?;
    let out = match op {
        BinaryOp::Add => x + y,
        BinaryOp::Sub => x - y,
        BinaryOp::Mul => x * y,
        _ => {
            return Err(ScriptError::runtime(
                line,
                format!("'{}' is not an arithmetic operator", op.symbol()),
            ))
        }
    };
    Ok(Value::Float(out))
}

fn numeric_pair(
    op: BinaryOp,
    left: &Value,
    right: &Value,
    line: usize,
) -> ScriptResult<(f64, f64)> {
    match (left.as_f64(), right.as_f64()) {
        (Some(x), Some(y)) => Ok((x, y)),
        _ => Err(ScriptError::runtime(
            line,
            format!(
                "cannot apply '{}' to {} and {}",
                op.symbol(),
                left.type_name(),
                right.type_name()
            ),
        )),
    }
}

fn compare(op: BinaryOp, left: &Value, right: &Value, line: usize) -> ScriptResult<Value> {
    let ordering = if let (Some(x), Some(y)) = (left.as_f64(), right.as_f64()) {
        x.partial_cmp(&y)
    } else if let (Value::Str(a), Value::Str(b)) = (left, right) {
        Some(a.cmp(b))
    } else {
        return Err(ScriptError::runtime(
            line,
            format!(
                "cannot compare {} with {}",
                left.type_name(),
                right.type_name()
            ),
        ));
    };
    let Some(ordering) = ordering else {
        return Ok(Value::Bool(false));
    };
    let holds = match op {
        BinaryOp::Lt => ordering.is_lt(),
        BinaryOp::Le => ordering.is_le(),
        BinaryOp::Gt => ordering.is_gt(),
        BinaryOp::Ge => ordering.is_ge(),
        _ => false,
    };
    Ok(Value::Bool(holds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SlateError;
    use crate::script::parse;
    use polars::df;

    struct FixedSql {
        outcome: crate::errors::Result<DataFrame>,
    }

    #[async_trait]
    impl SqlCapability for FixedSql {
        async fn execute_sql(&self, _sql: &str) -> crate::errors::Result<DataFrame> {
            self.outcome.clone()
        }
    }

    async fn run_program(source: &str) -> ScriptResult<Interpreter> {
        let program = parse(source)?;
        let mut interpreter = Interpreter::new(CapabilityTable::with_base(), 10_000);
        interpreter.run(&program).await?;
        Ok(interpreter)
    }

    #[tokio::test]
    async fn arithmetic_and_result_binding() {
        let interpreter = run_program("x = 1 + 2 * 3\nresult = x * 2\n").await.unwrap();
        assert_eq!(interpreter.global("result"), Some(&Value::Int(14)));
    }

    #[tokio::test]
    async fn division_always_yields_floats() {
        let interpreter = run_program("result = 7 / 2\n").await.unwrap();
        assert_eq!(interpreter.global("result"), Some(&Value::Float(3.5)));
        assert!(run_program("result = 1 / 0\n").await.is_err());
    }

    #[tokio::test]
    async fn user_functions_return_their_last_expression() {
        let source = "fn double(n) {\n    n * 2\n}\nresult = double(21)\n";
        let interpreter = run_program(source).await.unwrap();
        assert_eq!(interpreter.global("result"), Some(&Value::Int(42)));
    }

    #[tokio::test]
    async fn wrong_arity_is_reported_with_the_call_line() {
        let err = run_program("fn one(a) {\n    a\n}\nresult = one(1, 2)\n")
            .await
            .unwrap_err();
        assert!(matches!(err, ScriptError::Runtime { line: 4, .. }));
    }

    #[tokio::test]
    async fn imports_unlock_capability_families() {
        assert!(run_program("x = head(frame({\"a\": [1, 2]}))\n").await.is_err());
        let source = "import frames\nresult = head(frame({\"a\": [1, 2]}), 1)\n";
        let interpreter = run_program(source).await.unwrap();
        match interpreter.global("result") {
            Some(Value::Frame(frame)) => assert_eq!(frame.height(), 1),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn capabilities_are_not_shadowed_by_program_functions() {
        let source = "import frames\nfn head(df) {\n    0\n}\nresult = head(frame({\"a\": [1, 2, 3]}))\n";
        let interpreter = run_program(source).await.unwrap();
        assert!(matches!(interpreter.global("result"), Some(Value::Frame(_))));
    }

    #[tokio::test]
    async fn runaway_recursion_hits_the_budget() {
        let source = "fn spin(n) {\n    spin(n + 1)\n}\nspin(0)\n";
        let err = run_program(source).await.unwrap_err();
        assert!(matches!(
            err,
            ScriptError::BudgetExhausted { .. } | ScriptError::Runtime { .. }
        ));
    }

    #[tokio::test]
    async fn sql_capability_returns_frames() {
        let program = parse("result = execute_sql_query(\"SELECT * FROM t\")\n").unwrap();
        let mut table = CapabilityTable::with_base();
        table.register(
            crate::script::SQL_FUNCTION,
            Capability::Sql(Arc::new(FixedSql {
                outcome: Ok(df!("n" => [1i64, 2]).unwrap()),
            })),
        );
        let mut interpreter = Interpreter::new(table, 10_000);
        interpreter.run(&program).await.unwrap();
        match interpreter.global("result") {
            Some(Value::Frame(frame)) => assert_eq!(frame.height(), 2),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn sql_capability_errors_surface_unflattened() {
        let program = parse("result = execute_sql_query(\"SELECT 1\")\n").unwrap();
        let mut table = CapabilityTable::with_base();
        table.register(
            crate::script::SQL_FUNCTION,
            Capability::Sql(Arc::new(FixedSql {
                outcome: Err(SlateError::api_call("connector unreachable")),
            })),
        );
        let mut interpreter = Interpreter::new(table, 10_000);
        let err = interpreter.run(&program).await.unwrap_err();
        match err {
            ScriptError::Capability { source, .. } => {
                assert_eq!(*source, SlateError::api_call("connector unreachable"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn indexing_reaches_into_frames_lists_and_maps() {
        let source = "import frames\ndf = frame({\"a\": [10, 20, 30]})\nresult = df[\"a\"][-1]\n";
        let interpreter = run_program(source).await.unwrap();
        assert_eq!(interpreter.global("result"), Some(&Value::Int(30)));

        let source = "m = {\"k\": 5}\nresult = m[\"k\"]\n";
        let interpreter = run_program(source).await.unwrap();
        assert_eq!(interpreter.global("result"), Some(&Value::Int(5)));
    }
}
