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

use std::fmt::Write;

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
        }
    }

    fn precedence(&self) -> u8 {
        match self {
            BinaryOp::Or => 1,
            BinaryOp::And => 2,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt
            | BinaryOp::Ge => 3,
            BinaryOp::Add | BinaryOp::Sub => 4,
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Literal),
    Ident(String),
    List(Vec<Expr>),
    Map(Vec<(String, Expr)>),
    Unary { op: UnaryOp, operand: Box<Expr> },
    Binary { op: BinaryOp, left: Box<Expr>, right: Box<Expr> },
    Call { callee: String, args: Vec<Expr>, line: usize },
    Index { target: Box<Expr>, index: Box<Expr> },
}

impl Expr {
    pub fn str_literal(value: impl Into<String>) -> Self {
        Expr::Literal(Literal::Str(value.into()))
    }

    /// String payload when this expression is a plain string literal.
    pub fn as_str_literal(&self) -> Option<&str> {
        match self {
            Expr::Literal(Literal::Str(s)) => Some(s),
            _ => None,
        }
    }

    fn precedence(&self) -> u8 {
        match self {
            Expr::Binary { op, .. } => op.precedence(),
            Expr::Unary { .. } => 6,
            _ => 7,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Import { module: String, line: usize },
    Assign { target: String, value: Expr, line: usize },
    FnDef { name: String, params: Vec<String>, body: Vec<Stmt>, line: usize },
    Expr { expr: Expr, line: usize },
}

impl Stmt {
    pub fn line(&self) -> usize {
        match self {
            Stmt::Import { line, .. }
            | Stmt::Assign { line, .. }
            | Stmt::FnDef { line, .. }
            | Stmt::Expr { line, .. } => *line,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    pub statements: Vec<Stmt>,
}

impl Program {
    pub fn imports(&self) -> impl Iterator<Item = &str> {
        self.statements.iter().filter_map(|stmt| match stmt {
            Stmt::Import { module, .. } => Some(module.as_str()),
            _ => None,
        })
    }

    pub fn defines_function(&self, name: &str) -> bool {
        self.statements
            .iter()
            .any(|stmt| matches!(stmt, Stmt::FnDef { name: n, .. } if n == name))
    }

    /// Canonical text of the program, stable under reparsing.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for stmt in &self.statements {
            render_stmt(&mut out, stmt, 0);
        }
        out
    }
}

fn indent(out: &mut String, depth: usize) {
    for _ in 0..depth {
        out.push_str("    ");
    }
}

fn render_stmt(out: &mut String, stmt: &Stmt, depth: usize) {
    indent(out, depth);
    match stmt {
        Stmt::Import { module, .. } => {
            let _ = writeln!(out, "import {module}");
        }
        Stmt::Assign { target, value, .. } => {
            let _ = writeln!(out, "{target} = {}", render_expr(value));
        }
        Stmt::FnDef { name, params, body, .. } => {
            let _ = writeln!(out, "fn {name}({}) {{", params.join(", "));
            for inner in body {
                render_stmt(out, inner, depth + 1);
            }
            indent(out, depth);
            out.push_str("}\n");
        }
        Stmt::Expr { expr, .. } => {
            let _ = writeln!(out, "{}", render_expr(expr));
        }
    }
}

fn render_operand(expr: &Expr, parent_precedence: u8) -> String {
    if expr.precedence() < parent_precedence {
        format!("({})", render_expr(expr))
    } else {
        render_expr(expr)
    }
}

pub(crate) fn render_expr(expr: &Expr) -> String {
    match expr {
        Expr::Literal(Literal::Null) => "null".to_string(),
        Expr::Literal(Literal::Bool(b)) => b.to_string(),
        Expr::Literal(Literal::Int(n)) => n.to_string(),
        Expr::Literal(Literal::Float(x)) => {
            if x.fract() == 0.0 && x.is_finite() {
                format!("{x:.1}")
            } else {
                x.to_string()
            }
        }
        Expr::Literal(Literal::Str(s)) => format!("\"{}\"", escape_str(s)),
        Expr::Ident(name) => name.clone(),
        Expr::List(items) => {
            let rendered: Vec<String> = items.iter().map(render_expr).collect();
            format!("[{}]", rendered.join(", "))
        }
        Expr::Map(entries) => {
            let rendered: Vec<String> = entries
                .iter()
                .map(|(key, value)| format!("\"{}\": {}", escape_str(key), render_expr(value)))
                .collect();
            format!("{{{}}}", rendered.join(", "))
        }
        Expr::Unary { op, operand } => {
            let symbol = match op {
                UnaryOp::Neg => "-",
                UnaryOp::Not => "not ",
            };
            format!("{symbol}{}", render_operand(operand, 6))
        }
        Expr::Binary { op, left, right } => {
            let precedence = op.precedence();
            format!(
                "{} {} {}",
                render_operand(left, precedence),
                op.symbol(),
                render_operand(right, precedence + 1)
            )
        }
        Expr::Call { callee, args, .. } => {
            let rendered: Vec<String> = args.iter().map(render_expr).collect();
            format!("{callee}({})", rendered.join(", "))
        }
        Expr::Index { target, index } => {
            format!("{}[{}]", render_operand(target, 7), render_expr(index))
        }
    }
}

fn escape_str(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}
