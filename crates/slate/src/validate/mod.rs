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

//! Static validation and rewriting of generated programs. The pipeline
//! either rejects the program with a typed error or returns one that is
//! safe to execute: imports allow-listed, no blocked callables, dataset
//! reconstructions repaired, and every embedded SQL literal resolved
//! against the session's table mapping.

use std::collections::HashSet;

use tracing::debug;

use crate::config::AgentConfig;
use crate::dataset::Dataset;
use crate::errors::{Result, SlateError};
use crate::query::rewrite::{looks_like_sql, parses_as_sql, rewrite_sql};
use crate::query::TableMapping;
use crate::script::{self, Expr, Literal, Program, Stmt, SQL_FUNCTION};

/// Callables associated with filesystem, process or dynamic-loading
/// access. None exist in the runtime, but naming one is classified as a
/// malicious pattern rather than left to fail as an unknown function.
const BLOCKED_CALLABLES: [&str; 12] = [
    "read_file",
    "write_file",
    "open",
    "shell",
    "exec",
    "spawn",
    "system",
    "getenv",
    "set_env",
    "eval",
    "import_module",
    "decode_base64",
];

/// What the pipeline changed, for logging and diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RewriteReport {
    /// Assignment targets whose table-literal reconstruction was replaced
    /// by a reference to the live dataset.
    pub repaired_redeclarations: Vec<String>,
    /// String literals whose SQL was rewritten against the mapping.
    pub rewritten_sql_literals: usize,
    /// A restated raw-SQL function definition was removed.
    pub direct_sql_definition_dropped: bool,
}

impl RewriteReport {
    pub fn is_clean(&self) -> bool {
        self.repaired_redeclarations.is_empty()
            && self.rewritten_sql_literals == 0
            && !self.direct_sql_definition_dropped
    }
}

/// A program that passed the pipeline, with its rendered text.
#[derive(Debug, Clone)]
pub struct ValidatedProgram {
    pub program: Program,
    pub text: String,
    pub report: RewriteReport,
}

pub struct CodeValidator<'a> {
    config: &'a AgentConfig,
    datasets: &'a [Dataset],
    mapping: &'a TableMapping,
}

impl<'a> CodeValidator<'a> {
    pub fn new(
        config: &'a AgentConfig,
        datasets: &'a [Dataset],
        mapping: &'a TableMapping,
    ) -> Self {
        Self { config, datasets, mapping }
    }

    pub fn validate(&self, source: &str) -> Result<ValidatedProgram> {
        let mut program =
            script::parse(source).map_err(|e| SlateError::invalid_code(e.to_string()))?;
        let mut report = RewriteReport::default();
        self.check_imports(&program)?;
        self.apply_direct_sql_gate(&mut program, &mut report)?;
        self.check_blocked_callables(&mut program)?;
        self.repair_redeclarations(&mut program, &mut report);
        self.rewrite_sql_literals(&mut program, &mut report)?;
        let text = program.render();
        Ok(ValidatedProgram { program, text, report })
    }

    fn check_imports(&self, program: &Program) -> Result<()> {
        for module in program.imports() {
            if !self.config.import_allowed(module) {
                return Err(SlateError::bad_import(module));
            }
        }
        Ok(())
    }

    /// A raw-SQL function may only be defined when direct SQL mode is
    /// enabled; the restated definition is then removed because the
    /// injected capability answers those calls.
    fn apply_direct_sql_gate(
        &self,
        program: &mut Program,
        report: &mut RewriteReport,
    ) -> Result<()> {
        if !program.defines_function(SQL_FUNCTION) {
            return Ok(());
        }
        if !self.config.direct_sql {
            return Err(SlateError::malicious_query(format!(
                "program defines {SQL_FUNCTION} but direct SQL mode is disabled"
            )));
        }
        program
            .statements
            .retain(|stmt| !matches!(stmt, Stmt::FnDef { name, .. } if name == SQL_FUNCTION));
        report.direct_sql_definition_dropped = true;
        debug!("dropped restated {SQL_FUNCTION} definition");
        Ok(())
    }

    fn check_blocked_callables(&self, program: &mut Program) -> Result<()> {
        visit_program(program, &mut |expr| {
            if let Expr::Call { callee, .. } = expr {
                if BLOCKED_CALLABLES.contains(&callee.as_str()) {
                    return Err(SlateError::malicious_query(format!(
                        "call to restricted primitive '{callee}'"
                    )));
                }
            }
            Ok(())
        })
    }

    /// Replaces `target = frame({...})` with `target = <dataset>` when the
    /// literal's column set matches a session dataset. The model sometimes
    /// reconstructs sample data instead of using the loaded input; the
    /// repair keeps execution on the real rows. Idempotent: a repaired
    /// assignment no longer matches the pattern.
    fn repair_redeclarations(&self, program: &mut Program, report: &mut RewriteReport) {
        for stmt in &mut program.statements {
            let Stmt::Assign { target, value, .. } = stmt else { continue };
            let Expr::Call { callee, args, .. } = value else { continue };
            if callee != "frame" || args.len() != 1 {
                continue;
            }
            let Some(Expr::Map(entries)) = args.first() else { continue };
            let keys: HashSet<String> =
                entries.iter().map(|(key, _)| key.to_lowercase()).collect();
            let matched = self.datasets.iter().find(|dataset| {
                let columns: HashSet<String> = dataset
                    .schema()
                    .column_names()
                    .iter()
                    .map(|c| c.to_lowercase())
                    .collect();
                !columns.is_empty() && columns == keys
            });
            let Some(dataset) = matched else { continue };
            debug!(
                variable = %target,
                dataset = dataset.name(),
                "repaired dataset redeclaration"
            );
            report.repaired_redeclarations.push(target.clone());
            *value = Expr::Ident(dataset.name().to_string());
        }
    }

    /// Rewrites every string literal the SQL parser accepts, wherever it
    /// appears, so a stored query string is corrected exactly like one
    /// passed straight to the executor.
    fn rewrite_sql_literals(
        &self,
        program: &mut Program,
        report: &mut RewriteReport,
    ) -> Result<()> {
        let mut rewritten_count = 0usize;
        visit_program(program, &mut |expr| {
            if let Expr::Literal(Literal::Str(text)) = expr {
                if looks_like_sql(text) && parses_as_sql(text) {
                    let rewritten = rewrite_sql(text, self.mapping)?;
                    if rewritten != *text {
                        rewritten_count += 1;
                        *text = rewritten;
                    }
                }
            }
            Ok(())
        })?;
        report.rewritten_sql_literals = rewritten_count;
        Ok(())
    }
}

fn visit_program(
    program: &mut Program,
    f: &mut impl FnMut(&mut Expr) -> Result<()>,
) -> Result<()> {
    for stmt in &mut program.statements {
        visit_stmt(stmt, f)?;
    }
    Ok(())
}

fn visit_stmt(stmt: &mut Stmt, f: &mut impl FnMut(&mut Expr) -> Result<()>) -> Result<()> {
    match stmt {
        Stmt::Assign { value, .. } => visit_expr(value, f),
        Stmt::Expr { expr, .. } => visit_expr(expr, f),
        Stmt::FnDef { body, .. } => {
            for inner in body {
                visit_stmt(inner, f)?;
            }
            Ok(())
        }
        Stmt::Import { .. } => Ok(()),
    }
}

fn visit_expr(expr: &mut Expr, f: &mut impl FnMut(&mut Expr) -> Result<()>) -> Result<()> {
    f(expr)?;
    match expr {
        Expr::List(items) => {
            for item in items {
                visit_expr(item, f)?;
            }
            Ok(())
        }
        Expr::Map(entries) => {
            for (_, value) in entries {
                visit_expr(value, f)?;
            }
            Ok(())
        }
        Expr::Unary { operand, .. } => visit_expr(operand, f),
        Expr::Binary { left, right, .. } => {
            visit_expr(left, f)?;
            visit_expr(right, f)
        }
        Expr::Call { args, .. } => {
            for arg in args {
                visit_expr(arg, f)?;
            }
            Ok(())
        }
        Expr::Index { target, index } => {
            visit_expr(target, f)?;
            visit_expr(index, f)
        }
        Expr::Literal(_) | Expr::Ident(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polars::df;

    fn sales() -> Dataset {
        Dataset::new_local(
            "sales",
            df!(
                "cid" => [1i64, 2, 3],
                "amount" => [100i64, 250, 80],
            )
            .unwrap(),
        )
        .unwrap()
    }

    fn mapping_for(datasets: &[Dataset]) -> TableMapping {
        let mut mapping = TableMapping::new();
        for dataset in datasets {
            mapping.insert(
                dataset.name(),
                format!("{}_t1", dataset.name()),
                dataset.schema().clone(),
            );
        }
        mapping
    }

    fn validate(source: &str) -> Result<ValidatedProgram> {
        let config = AgentConfig::default();
        let datasets = vec![sales()];
        let mapping = mapping_for(&datasets);
        CodeValidator::new(&config, &datasets, &mapping).validate(source)
    }

    #[test]
    fn allow_listed_imports_pass_unchanged() {
        let source = "import frames\nimport stats\nresult = {\"type\": \"number\", \"value\": sum(sales, \"amount\")}\n";
        let validated = validate(source).unwrap();
        assert_eq!(validated.text, source);
        assert!(validated.report.is_clean());
    }

    #[test]
    fn disallowed_imports_are_rejected_by_name() {
        let err = validate("import sockets\nresult = 1\n").unwrap_err();
        match err {
            SlateError::BadImport { module } => assert_eq!(module, "sockets"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn blocked_primitives_are_flagged_as_malicious() {
        let err = validate("x = read_file(\"/etc/passwd\")\n").unwrap_err();
        match err {
            SlateError::MaliciousQuery { reason } => assert!(reason.contains("read_file")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn unparseable_programs_are_invalid_code() {
        let err = validate("result = = 3\n").unwrap_err();
        assert!(matches!(err, SlateError::InvalidCode { .. }));
    }

    #[test]
    fn sql_function_definition_needs_direct_sql_mode() {
        let source = "fn execute_sql_query(sql) {\n    sql\n}\nresult = 1\n";
        let err = validate(source).unwrap_err();
        assert!(matches!(err, SlateError::MaliciousQuery { .. }));

        let mut config = AgentConfig::default();
        config.direct_sql = true;
        let datasets = vec![sales()];
        let mapping = mapping_for(&datasets);
        let validated = CodeValidator::new(&config, &datasets, &mapping)
            .validate(source)
            .unwrap();
        assert!(validated.report.direct_sql_definition_dropped);
        assert!(!validated.program.defines_function(SQL_FUNCTION));
    }

    #[test]
    fn dataset_reconstructions_are_repaired_to_references() {
        let source = "sales = frame({\"cid\": [1, 2], \"amount\": [10, 20]})\nresult = sales\n";
        let validated = validate(source).unwrap();
        assert_eq!(validated.report.repaired_redeclarations, vec!["sales".to_string()]);
        assert!(validated.text.starts_with("sales = sales\n"));
    }

    #[test]
    fn redeclaration_repair_is_idempotent() {
        let source = "df = frame({\"amount\": [1], \"cid\": [2]})\nresult = df\n";
        let once = validate(source).unwrap();
        let twice = validate(&once.text).unwrap();
        assert_eq!(once.text, twice.text);
        assert!(twice.report.repaired_redeclarations.is_empty());
    }

    #[test]
    fn literals_with_other_columns_are_not_repaired() {
        let source = "other = frame({\"x\": [1]})\nresult = other\n";
        let validated = validate(source).unwrap();
        assert!(validated.report.repaired_redeclarations.is_empty());
        assert!(validated.text.contains("frame("));
    }

    #[test]
    fn assigned_sql_literals_are_rewritten_in_place() {
        let source = "q = \"SELECT * FROM sales\"\nresult = execute_sql_query(q)\n";
        let validated = validate(source).unwrap();
        assert!(validated.text.contains("sales_t1"));
        assert_eq!(validated.report.rewritten_sql_literals, 1);
    }

    #[test]
    fn sql_literals_with_unknown_tables_are_rejected() {
        let err = validate("result = execute_sql_query(\"SELECT * FROM orders\")\n").unwrap_err();
        match err {
            SlateError::MaliciousQuery { reason } => assert!(reason.contains("orders")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn prose_that_starts_like_sql_is_left_alone() {
        let source = "result = \"select all of them, please!\"\n";
        let validated = validate(source).unwrap();
        assert_eq!(validated.text, source);
        assert_eq!(validated.report.rewritten_sql_literals, 0);
    }
}
