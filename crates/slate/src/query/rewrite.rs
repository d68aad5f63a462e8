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

//! SQL-aware rewriting of generated queries. Every table reference must
//! resolve through the session's [`TableMapping`]; anything else is
//! rejected before it can reach an engine. Substitution works on the
//! parsed syntax tree, never on raw text, so names inside string literals
//! and comments are untouched. Column identifiers are only case-corrected
//! against the declared schemas, because the model is not reliable about
//! case while downstream engines can be case-sensitive.

use std::collections::{HashMap, HashSet};

use sqlparser::ast::{
    Expr, FunctionArg, FunctionArgExpr, FunctionArguments, GroupByExpr, Ident, JoinConstraint,
    JoinOperator, ObjectName, ObjectNamePart, OrderByKind, Query, SelectItem, SetExpr, Statement,
    TableAlias, TableFactor, TableWithJoins,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use super::registry::TableMapping;
use crate::errors::{Result, SlateError};

/// Cheap recognition test used on string literals: does this text begin
/// like a query worth parsing?
pub fn looks_like_sql(text: &str) -> bool {
    let head = text.trim_start();
    starts_with_keyword(head, "select") || starts_with_keyword(head, "with")
}

/// Full recognition test: the text is SQL if the parser accepts it.
/// Multi-statement input still counts as recognised so [`rewrite_sql`]
/// gets the chance to reject it.
pub fn parses_as_sql(text: &str) -> bool {
    Parser::parse_sql(&GenericDialect {}, text).is_ok()
}

fn starts_with_keyword(text: &str, keyword: &str) -> bool {
    match (text.get(..keyword.len()), text.get(keyword.len()..)) {
        (Some(head), Some(rest)) => {
            head.eq_ignore_ascii_case(keyword)
                && rest
                    .chars()
                    .next()
                    .is_some_and(|c| c.is_whitespace() || c == '(' || c == '*')
        }
        _ => false,
    }
}

/// Rewrites one SQL statement against the mapping. Returns the input
/// string unchanged when no substitution was needed, so already-correct
/// queries survive byte-for-byte. Rewriting an already-rewritten query is
/// a no-op because physical names resolve back to their own entry.
pub fn rewrite_sql(sql: &str, mapping: &TableMapping) -> Result<String> {
    let mut statements = Parser::parse_sql(&GenericDialect {}, sql)
        .map_err(|e| SlateError::malicious_query(format!("SQL does not parse: {e}")))?;
    if statements.len() != 1 {
        return Err(SlateError::malicious_query(
            "exactly one SQL statement is allowed per query",
        ));
    }
    let statement = &mut statements[0];
    let before = statement.to_string();
    match statement {
        Statement::Query(query) => {
            let mut rewriter = SqlRewriter::new(mapping);
            rewriter.walk_query(query)?;
        }
        _ => {
            return Err(SlateError::malicious_query(
                "only SELECT queries are allowed",
            ))
        }
    }
    let after = statement.to_string();
    if after == before {
        return Ok(sql.to_string());
    }
    Ok(after)
}

struct SqlRewriter<'a> {
    mapping: &'a TableMapping,
    /// Names that are query-internal (CTE and derived-table aliases);
    /// qualifiers naming them are never treated as dataset references.
    opaque: HashSet<String>,
    /// Lowercased qualifier to the logical dataset it stands for.
    qualifiers: HashMap<String, String>,
}

impl<'a> SqlRewriter<'a> {
    fn new(mapping: &'a TableMapping) -> Self {
        Self { mapping, opaque: HashSet::new(), qualifiers: HashMap::new() }
    }

    fn walk_query(&mut self, query: &mut Query) -> Result<()> {
        if let Some(with) = query.with.as_mut() {
            for cte in &with.cte_tables {
                self.opaque.insert(cte.alias.name.value.to_lowercase());
            }
            for cte in with.cte_tables.iter_mut() {
                self.walk_query(&mut cte.query)?;
            }
        }
        self.walk_set_expr(&mut query.body)?;
        if let Some(order_by) = query.order_by.as_mut() {
            if let OrderByKind::Expressions(exprs) = &mut order_by.kind {
                for order_expr in exprs {
                    self.walk_expr(&mut order_expr.expr)?;
                }
            }
        }
        Ok(())
    }

    fn walk_set_expr(&mut self, set_expr: &mut SetExpr) -> Result<()> {
        match set_expr {
            SetExpr::Select(select) => {
                // FROM first: table rewriting binds the qualifiers the
                // remaining clauses are corrected against.
                for table in &mut select.from {
                    self.walk_table_with_joins(table)?;
                }
                for item in &mut select.projection {
                    match item {
                        SelectItem::UnnamedExpr(expr) => self.walk_expr(expr)?,
                        SelectItem::ExprWithAlias { expr, .. } => self.walk_expr(expr)?,
                        SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(_, _) => {}
                    }
                }
                if let Some(selection) = &mut select.selection {
                    self.walk_expr(selection)?;
                }
                if let GroupByExpr::Expressions(exprs, _) = &mut select.group_by {
                    for expr in exprs {
                        self.walk_expr(expr)?;
                    }
                }
                if let Some(having) = &mut select.having {
                    self.walk_expr(having)?;
                }
                Ok(())
            }
            SetExpr::Query(query) => self.walk_query(query),
            SetExpr::SetOperation { left, right, .. } => {
                self.walk_set_expr(left)?;
                self.walk_set_expr(right)
            }
            SetExpr::Values(_) => Ok(()),
            _ => Err(SlateError::malicious_query(
                "only SELECT-like statements are allowed in queries and subqueries",
            )),
        }
    }

    fn walk_table_with_joins(&mut self, table: &mut TableWithJoins) -> Result<()> {
        self.walk_table_factor(&mut table.relation)?;
        for join in &mut table.joins {
            self.walk_table_factor(&mut join.relation)?;
            self.walk_join_operator(&mut join.join_operator)?;
        }
        Ok(())
    }

    fn walk_join_operator(&mut self, operator: &mut JoinOperator) -> Result<()> {
        match operator {
            JoinOperator::Join(constraint)
            | JoinOperator::Inner(constraint)
            | JoinOperator::Left(constraint)
            | JoinOperator::LeftOuter(constraint)
            | JoinOperator::Right(constraint)
            | JoinOperator::RightOuter(constraint)
            | JoinOperator::FullOuter(constraint) => self.walk_join_constraint(constraint),
            _ => Ok(()),
        }
    }

    fn walk_join_constraint(&mut self, constraint: &mut JoinConstraint) -> Result<()> {
        match constraint {
            JoinConstraint::On(expr) => self.walk_expr(expr),
            JoinConstraint::Using(_) | JoinConstraint::Natural | JoinConstraint::None => Ok(()),
        }
    }

    fn walk_table_factor(&mut self, factor: &mut TableFactor) -> Result<()> {
        match factor {
            TableFactor::Table { name, alias, .. } => self.rewrite_table(name, alias),
            TableFactor::Derived { subquery, alias, .. } => {
                if let Some(alias) = alias {
                    self.opaque.insert(alias.name.value.to_lowercase());
                }
                self.walk_query(subquery)
            }
            TableFactor::NestedJoin { table_with_joins, .. } => {
                self.walk_table_with_joins(table_with_joins)
            }
            _ => Err(SlateError::malicious_query(
                "unsupported table reference syntax",
            )),
        }
    }

    fn rewrite_table(
        &mut self,
        name: &mut ObjectName,
        alias: &mut Option<TableAlias>,
    ) -> Result<()> {
        let written = object_name_text(name);
        if name.0.len() == 1 {
            let lower = written.to_lowercase();
            if self.opaque.contains(&lower) {
                if let Some(alias) = alias {
                    self.opaque.insert(alias.name.value.to_lowercase());
                }
                return Ok(());
            }
        }
        let Some(entry) = self.mapping.resolve(&written) else {
            return Err(SlateError::malicious_query(format!(
                "SQL references unknown table '{written}'"
            )));
        };
        let logical = entry.logical.clone();
        if entry.physical != written {
            *name = object_name_from(&entry.physical);
            // keep the logical name addressable in the rest of the query
            if alias.is_none() {
                *alias = Some(TableAlias { name: Ident::new(logical.clone()), columns: vec![] });
            }
        }
        let qualifier = alias
            .as_ref()
            .map(|a| a.name.value.to_lowercase())
            .unwrap_or_else(|| written.to_lowercase());
        self.qualifiers.insert(qualifier, logical.clone());
        self.qualifiers.insert(logical.to_lowercase(), logical);
        Ok(())
    }

    fn walk_expr(&mut self, expr: &mut Expr) -> Result<()> {
        match expr {
            Expr::Identifier(ident) => {
                self.correct_identifier(ident);
                Ok(())
            }
            Expr::CompoundIdentifier(parts) => {
                self.correct_compound(parts);
                Ok(())
            }
            Expr::Value(_) => Ok(()),
            Expr::BinaryOp { left, right, .. } => {
                self.walk_expr(left)?;
                self.walk_expr(right)
            }
            Expr::UnaryOp { expr, .. } => self.walk_expr(expr),
            Expr::Cast { expr, .. } => self.walk_expr(expr),
            Expr::Case { operand, conditions, else_result, .. } => {
                if let Some(operand) = operand {
                    self.walk_expr(operand)?;
                }
                for case_when in conditions {
                    self.walk_expr(&mut case_when.condition)?;
                    self.walk_expr(&mut case_when.result)?;
                }
                if let Some(else_result) = else_result {
                    self.walk_expr(else_result)?;
                }
                Ok(())
            }
            Expr::Function(func) => {
                match &mut func.args {
                    FunctionArguments::List(arg_list) => {
                        for arg in &mut arg_list.args {
                            match arg {
                                FunctionArg::Unnamed(FunctionArgExpr::Expr(expr)) => {
                                    self.walk_expr(expr)?;
                                }
                                FunctionArg::Named {
                                    arg: FunctionArgExpr::Expr(expr), ..
                                } => {
                                    self.walk_expr(expr)?;
                                }
                                _ => {}
                            }
                        }
                    }
                    FunctionArguments::Subquery(query) => self.walk_query(query)?,
                    FunctionArguments::None => {}
                }
                Ok(())
            }
            Expr::Subquery(query) => self.walk_query(query),
            Expr::InList { expr, list, .. } => {
                self.walk_expr(expr)?;
                for item in list {
                    self.walk_expr(item)?;
                }
                Ok(())
            }
            Expr::InSubquery { expr, subquery, .. } => {
                self.walk_expr(expr)?;
                self.walk_query(subquery)
            }
            Expr::Between { expr, low, high, .. } => {
                self.walk_expr(expr)?;
                self.walk_expr(low)?;
                self.walk_expr(high)
            }
            Expr::IsNull(expr) | Expr::IsNotNull(expr) => self.walk_expr(expr),
            Expr::Like { expr, pattern, .. }
            | Expr::ILike { expr, pattern, .. }
            | Expr::SimilarTo { expr, pattern, .. } => {
                self.walk_expr(expr)?;
                self.walk_expr(pattern)
            }
            Expr::Exists { subquery, .. } => self.walk_query(subquery),
            Expr::IsDistinctFrom(left, right) | Expr::IsNotDistinctFrom(left, right) => {
                self.walk_expr(left)?;
                self.walk_expr(right)
            }
            Expr::Nested(expr) => self.walk_expr(expr),
            Expr::Extract { expr, .. } => self.walk_expr(expr),
            Expr::Substring { expr, substring_from, substring_for, .. } => {
                self.walk_expr(expr)?;
                if let Some(from) = substring_from {
                    self.walk_expr(from)?;
                }
                if let Some(for_expr) = substring_for {
                    self.walk_expr(for_expr)?;
                }
                Ok(())
            }
            Expr::Trim { expr, trim_what, .. } => {
                self.walk_expr(expr)?;
                if let Some(what) = trim_what {
                    self.walk_expr(what)?;
                }
                Ok(())
            }
            Expr::Collate { expr, .. } => self.walk_expr(expr),
            Expr::Tuple(exprs) => {
                for expr in exprs {
                    self.walk_expr(expr)?;
                }
                Ok(())
            }
            Expr::Interval(interval) => self.walk_expr(&mut interval.value),
            other => Err(SlateError::malicious_query(format!(
                "unsupported SQL expression: {other}"
            ))),
        }
    }

    /// Case-corrects a bare column identifier when exactly one declared
    /// spelling matches across the session's schemas. Quoted identifiers
    /// are deliberate and left alone.
    fn correct_identifier(&self, ident: &mut Ident) {
        if ident.quote_style.is_some() {
            return;
        }
        let mut corrected: Option<&str> = None;
        for entry in self.mapping.tables() {
            if let Some(declared) = entry.schema.resolve_column(&ident.value) {
                match corrected {
                    None => corrected = Some(declared),
                    Some(existing) if existing == declared => {}
                    Some(_) => return,
                }
            }
        }
        if let Some(declared) = corrected {
            if declared != ident.value {
                ident.value = declared.to_string();
            }
        }
    }

    /// Case-corrects `qualifier.column` against the qualifier's dataset.
    /// A model-written alias stays as written; only a qualifier that is
    /// itself the logical name gets its case fixed.
    fn correct_compound(&self, parts: &mut [Ident]) {
        if parts.len() != 2 {
            return;
        }
        let qualifier_lower = parts[0].value.to_lowercase();
        if self.opaque.contains(&qualifier_lower) {
            return;
        }
        let Some(logical) = self.qualifiers.get(&qualifier_lower) else {
            return;
        };
        if parts[0].quote_style.is_none()
            && qualifier_lower == logical.to_lowercase()
            && parts[0].value != *logical
        {
            parts[0].value = logical.clone();
        }
        if parts[1].quote_style.is_some() {
            return;
        }
        if let Some(entry) = self.mapping.resolve(logical) {
            if let Some(declared) = entry.schema.resolve_column(&parts[1].value) {
                if declared != parts[1].value {
                    parts[1].value = declared.to_string();
                }
            }
        }
    }
}

fn object_name_text(name: &ObjectName) -> String {
    name.0
        .iter()
        .map(part_value)
        .collect::<Vec<_>>()
        .join(".")
}

fn part_value(part: &ObjectNamePart) -> String {
    match part {
        ObjectNamePart::Identifier(ident) => ident.value.clone(),
        _ => part.to_string(),
    }
}

fn object_name_from(physical: &str) -> ObjectName {
    ObjectName(
        physical
            .split('.')
            .map(|part| ObjectNamePart::Identifier(Ident::new(part)))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{ColumnSchema, ColumnType, DatasetSchema};

    fn schema(name: &str, columns: &[&str]) -> DatasetSchema {
        DatasetSchema::new(
            name,
            columns
                .iter()
                .map(|c| ColumnSchema {
                    name: (*c).to_string(),
                    dtype: ColumnType::Integer,
                    description: None,
                })
                .collect(),
        )
        .unwrap()
    }

    fn session_mapping() -> TableMapping {
        let mut mapping = TableMapping::new();
        mapping.insert("sales", "sales_9b1deb4d", schema("sales", &["cid", "amount"]));
        mapping.insert("customers", "customers_9b1deb4d", schema("customers", &["id", "name"]));
        mapping
    }

    #[test]
    fn identity_mapping_is_a_byte_level_noop() {
        let mut mapping = TableMapping::new();
        mapping.insert("my_table", "my_table", schema("my_table", &["a"]));
        let sql = "SELECT * FROM my_table;";
        assert_eq!(rewrite_sql(sql, &mapping).unwrap(), sql);
    }

    #[test]
    fn empty_mapping_rejects_every_table() {
        let err = rewrite_sql("SELECT * FROM my_table;", &TableMapping::new()).unwrap_err();
        match err {
            SlateError::MaliciousQuery { reason } => assert!(reason.contains("my_table")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn local_tables_get_physical_names_and_keep_logical_aliases() {
        let rewritten = rewrite_sql("SELECT amount FROM sales", &session_mapping()).unwrap();
        assert_eq!(rewritten, "SELECT amount FROM sales_9b1deb4d AS sales");
    }

    #[test]
    fn rewriting_twice_changes_nothing_further() {
        let mapping = session_mapping();
        let once = rewrite_sql("SELECT amount FROM sales", &mapping).unwrap();
        let twice = rewrite_sql(&once, &mapping).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn joins_rewrite_both_tables_and_correct_on_clause_case() {
        let sql = "SELECT * FROM sales JOIN customers ON sales.CID = customers.ID";
        let rewritten = rewrite_sql(sql, &session_mapping()).unwrap();
        assert_eq!(
            rewritten,
            "SELECT * FROM sales_9b1deb4d AS sales JOIN customers_9b1deb4d AS customers \
             ON sales.cid = customers.id"
        );
    }

    #[test]
    fn undeclared_tables_are_rejected_by_name() {
        let sql = "SELECT * FROM sales JOIN orders ON sales.cid = orders.id";
        let err = rewrite_sql(sql, &session_mapping()).unwrap_err();
        match err {
            SlateError::MaliciousQuery { reason } => assert!(reason.contains("orders")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn bare_columns_are_case_corrected_everywhere() {
        let sql = "SELECT Amount FROM sales WHERE AMOUNT > 100 ORDER BY aMount";
        let rewritten = rewrite_sql(sql, &session_mapping()).unwrap();
        assert_eq!(
            rewritten,
            "SELECT amount FROM sales_9b1deb4d AS sales WHERE amount > 100 ORDER BY amount"
        );
    }

    #[test]
    fn quoted_identifiers_are_left_alone() {
        let sql = "SELECT \"Amount\" FROM sales";
        let rewritten = rewrite_sql(sql, &session_mapping()).unwrap();
        assert_eq!(rewritten, "SELECT \"Amount\" FROM sales_9b1deb4d AS sales");
    }

    #[test]
    fn table_names_inside_string_literals_are_not_touched() {
        let sql = "SELECT amount FROM sales WHERE 'orders' = 'orders'";
        let rewritten = rewrite_sql(sql, &session_mapping()).unwrap();
        assert!(rewritten.contains("'orders' = 'orders'"));
    }

    #[test]
    fn cte_names_shadow_datasets() {
        let sql = "WITH t AS (SELECT * FROM sales) SELECT * FROM t";
        let rewritten = rewrite_sql(sql, &session_mapping()).unwrap();
        assert_eq!(
            rewritten,
            "WITH t AS (SELECT * FROM sales_9b1deb4d AS sales) SELECT * FROM t"
        );
    }

    #[test]
    fn derived_table_aliases_are_opaque() {
        let sql = "SELECT s.total FROM (SELECT amount AS total FROM sales) s";
        let rewritten = rewrite_sql(sql, &session_mapping()).unwrap();
        assert!(rewritten.contains("sales_9b1deb4d"));
        assert!(rewritten.contains("s.total"));
    }

    #[test]
    fn multiple_statements_are_rejected() {
        let err =
            rewrite_sql("SELECT * FROM sales; SELECT * FROM sales", &session_mapping())
                .unwrap_err();
        assert!(matches!(err, SlateError::MaliciousQuery { .. }));
    }

    #[test]
    fn non_select_statements_are_rejected() {
        for sql in ["DROP TABLE sales", "INSERT INTO sales VALUES (1, 2)", "UPDATE sales SET amount = 0"] {
            let err = rewrite_sql(sql, &session_mapping()).unwrap_err();
            assert!(matches!(err, SlateError::MaliciousQuery { .. }), "{sql}");
        }
    }

    #[test]
    fn sql_recognition_requires_a_query_keyword() {
        assert!(looks_like_sql("SELECT * FROM sales"));
        assert!(looks_like_sql("  with t as (select 1) select * from t"));
        assert!(!looks_like_sql("the total of selected rows"));
        assert!(!looks_like_sql("plain sentence"));
        assert!(!looks_like_sql("selection"));
    }
}
