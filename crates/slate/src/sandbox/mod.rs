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

//! Executes validated programs and maps interpreter failures into the
//! crate's error taxonomy. The [`Sandbox`] trait is the seam for an
//! out-of-process execution service; [`InProcessSandbox`] runs the
//! interpreter directly with the session's datasets bound by name.

use std::sync::Arc;

use async_trait::async_trait;
use polars::prelude::DataFrame;
use tracing::debug;

use crate::dataset::Dataset;
use crate::errors::{Result, SlateError};
use crate::query::QueryRouter;
use crate::script::{
    Capability, CapabilityTable, Interpreter, ScriptError, Value, RESULT_VARIABLE, SQL_FUNCTION,
};
use crate::validate::ValidatedProgram;

/// Result of running one program to completion.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// Final value of the result variable.
    pub value: Value,
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn execute(&self, program: &ValidatedProgram) -> Result<ExecutionOutcome>;
}

pub struct InProcessSandbox {
    router: Arc<QueryRouter>,
    frames: Vec<(String, DataFrame)>,
    max_steps: u64,
}

impl InProcessSandbox {
    pub fn new(router: Arc<QueryRouter>, datasets: &[Dataset], max_steps: u64) -> Self {
        let frames = datasets
            .iter()
            .map(|dataset| (dataset.name().to_string(), dataset.frame().clone()))
            .collect();
        Self { router, frames, max_steps }
    }
}

#[async_trait]
impl Sandbox for InProcessSandbox {
    async fn execute(&self, program: &ValidatedProgram) -> Result<ExecutionOutcome> {
        let mut capabilities = CapabilityTable::with_base();
        capabilities.register(SQL_FUNCTION, Capability::Sql(self.router.clone()));
        let mut interpreter = Interpreter::new(capabilities, self.max_steps);
        for (name, frame) in &self.frames {
            interpreter.bind(name.clone(), Value::Frame(frame.clone()));
        }
        debug!(statements = program.program.statements.len(), "executing program");
        interpreter.run(&program.program).await.map_err(into_crate_error)?;
        let mut globals = interpreter.into_globals();
        let value = globals.remove(RESULT_VARIABLE).ok_or_else(|| {
            SlateError::code_execution(format!(
                "the program never assigned the {RESULT_VARIABLE} variable"
            ))
        })?;
        Ok(ExecutionOutcome { value })
    }
}

/// Capability failures carry a typed error from the host and keep it;
/// everything else becomes a code-execution diagnostic for the retry
/// prompt.
fn into_crate_error(err: ScriptError) -> SlateError {
    match err {
        ScriptError::Capability { source, .. } => *source,
        other => SlateError::code_execution(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::SourceRegistry;
    use crate::script;
    use crate::validate::RewriteReport;
    use polars::df;

    fn sandbox_for(datasets: Vec<Dataset>) -> InProcessSandbox {
        let registry = Arc::new(SourceRegistry::build("9b1deb4d-test", &datasets).unwrap());
        let router = Arc::new(QueryRouter::new(registry));
        InProcessSandbox::new(router, &datasets, 100_000)
    }

    fn sales_sandbox() -> InProcessSandbox {
        let dataset = Dataset::new_local(
            "sales",
            df!(
                "cid" => [1i64, 2, 3],
                "amount" => [100i64, 250, 80],
            )
            .unwrap(),
        )
        .unwrap();
        sandbox_for(vec![dataset])
    }

    fn program(source: &str) -> ValidatedProgram {
        ValidatedProgram {
            program: script::parse(source).unwrap(),
            text: source.to_string(),
            report: RewriteReport::default(),
        }
    }

    #[tokio::test]
    async fn result_variable_is_extracted() {
        let sandbox = sales_sandbox();
        let outcome = sandbox.execute(&program("result = 1 + 1\n")).await.unwrap();
        assert_eq!(outcome.value, Value::Int(2));
    }

    #[tokio::test]
    async fn missing_result_variable_is_an_execution_error() {
        let sandbox = sales_sandbox();
        let err = sandbox.execute(&program("x = 1\n")).await.unwrap_err();
        match err {
            SlateError::CodeExecution { diagnostic } => {
                assert!(diagnostic.contains("result"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn runtime_failures_become_diagnostics_with_lines() {
        let sandbox = sales_sandbox();
        let err = sandbox
            .execute(&program("x = 1\nresult = x / 0\n"))
            .await
            .unwrap_err();
        match err {
            SlateError::CodeExecution { diagnostic } => {
                assert!(diagnostic.contains("line 2"), "diagnostic: {diagnostic}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn datasets_are_bound_by_name() {
        let sandbox = sales_sandbox();
        let outcome = sandbox
            .execute(&program("import frames\nresult = row_count(sales)\n"))
            .await
            .unwrap();
        assert_eq!(outcome.value, Value::Int(3));
    }

    #[tokio::test]
    async fn sql_capability_reaches_the_router() {
        let sandbox = sales_sandbox();
        let outcome = sandbox
            .execute(&program("result = execute_sql_query(\"SELECT * FROM sales\")\n"))
            .await
            .unwrap();
        match outcome.value {
            Value::Frame(frame) => assert_eq!(frame.height(), 3),
            other => panic!("unexpected value: {other:?}"),
        }
    }

    #[tokio::test]
    async fn router_rejections_keep_their_error_type() {
        let sandbox = sales_sandbox();
        let err = sandbox
            .execute(&program("result = execute_sql_query(\"SELECT * FROM orders\")\n"))
            .await
            .unwrap_err();
        assert!(matches!(err, SlateError::MaliciousQuery { .. }));
    }
}
