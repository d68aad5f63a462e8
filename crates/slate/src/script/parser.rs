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

use super::ast::{BinaryOp, Expr, Literal, Program, Stmt, UnaryOp};
use super::token::{SpannedTok, Tok};
use super::{ScriptError, ScriptResult};

pub struct Parser {
    tokens: Vec<SpannedTok>,
    pos: usize,
}

impl Parser {
    pub fn new(tokens: Vec<SpannedTok>) -> Self {
        Self { tokens, pos: 0 }
    }

    pub fn parse_program(mut self) -> ScriptResult<Program> {
        let mut statements = Vec::new();
        self.skip_newlines();
        while !self.check(&Tok::Eof) {
            statements.push(self.parse_stmt()?);
            self.expect_statement_end()?;
            self.skip_newlines();
        }
        Ok(Program { statements })
    }

    fn peek(&self) -> &SpannedTok {
        &self.tokens[self.pos]
    }

    fn peek_next(&self) -> Option<&SpannedTok> {
        self.tokens.get(self.pos + 1)
    }

    fn line(&self) -> usize {
        self.peek().line
    }

    fn advance(&mut self) -> SpannedTok {
        let tok = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn check(&self, tok: &Tok) -> bool {
        &self.peek().tok == tok
    }

    fn matches(&mut self, tok: &Tok) -> bool {
        if self.check(tok) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: Tok, what: &str) -> ScriptResult<SpannedTok> {
        if self.check(&tok) {
            Ok(self.advance())
        } else {
            Err(ScriptError::parse(
                self.line(),
                format!("expected {what}, found {}", self.peek().tok.describe()),
            ))
        }
    }

    fn skip_newlines(&mut self) {
        while self.check(&Tok::Newline) {
            self.advance();
        }
    }

    fn expect_statement_end(&mut self) -> ScriptResult<()> {
        match &self.peek().tok {
            Tok::Newline | Tok::Eof => Ok(()),
            Tok::RBrace => Ok(()),
            other => Err(ScriptError::parse(
                self.line(),
                format!("expected end of statement, found {}", other.describe()),
            )),
        }
    }

    fn parse_stmt(&mut self) -> ScriptResult<Stmt> {
        let line = self.line();
        match &self.peek().tok {
            Tok::Import => {
                self.advance();
                let module = self.expect_ident("module name")?;
                Ok(Stmt::Import { module, line })
            }
            Tok::Fn => {
                self.advance();
                let name = self.expect_ident("function name")?;
                self.expect(Tok::LParen, "'('")?;
                let mut params = Vec::new();
                if !self.check(&Tok::RParen) {
                    loop {
                        params.push(self.expect_ident("parameter name")?);
                        if !self.matches(&Tok::Comma) {
                            break;
                        }
                    }
                }
                self.expect(Tok::RParen, "')'")?;
                let body = self.parse_block()?;
                Ok(Stmt::FnDef { name, params, body, line })
            }
            Tok::Ident(_) if matches!(self.peek_next().map(|t| &t.tok), Some(Tok::Assign)) => {
                let target = self.expect_ident("assignment target")?;
                self.expect(Tok::Assign, "'='")?;
                let value = self.parse_expr()?;
                Ok(Stmt::Assign { target, value, line })
            }
            _ => {
                let expr = self.parse_expr()?;
                Ok(Stmt::Expr { expr, line })
            }
        }
    }

    fn expect_ident(&mut self, what: &str) -> ScriptResult<String> {
        match &self.peek().tok {
            Tok::Ident(name) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            other => Err(ScriptError::parse(
                self.line(),
                format!("expected {what}, found {}", other.describe()),
            )),
        }
    }

    fn parse_block(&mut self) -> ScriptResult<Vec<Stmt>> {
        self.expect(Tok::LBrace, "'{'")?;
        let mut body = Vec::new();
        self.skip_newlines();
        while !self.check(&Tok::RBrace) {
            if self.check(&Tok::Eof) {
                return Err(ScriptError::parse(self.line(), "unterminated function body"));
            }
            body.push(self.parse_stmt()?);
            self.expect_statement_end()?;
            self.skip_newlines();
        }
        self.expect(Tok::RBrace, "'}'")?;
        Ok(body)
    }

    fn parse_expr(&mut self) -> ScriptResult<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> ScriptResult<Expr> {
        let mut left = self.parse_and()?;
        while self.matches(&Tok::Or) {
            let right = self.parse_and()?;
            left = Expr::Binary { op: BinaryOp::Or, left: Box::new(left), right: Box::new(right) };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> ScriptResult<Expr> {
        let mut left = self.parse_cmp()?;
        while self.matches(&Tok::And) {
            let right = self.parse_cmp()?;
            left = Expr::Binary { op: BinaryOp::And, left: Box::new(left), right: Box::new(right) };
        }
        Ok(left)
    }

    fn parse_cmp(&mut self) -> ScriptResult<Expr> {
        let left = self.parse_add()?;
        let op = match &self.peek().tok {
            Tok::EqEq => Some(BinaryOp::Eq),
            Tok::NotEq => Some(BinaryOp::Ne),
            Tok::Lt => Some(BinaryOp::Lt),
            Tok::Le => Some(BinaryOp::Le),
            Tok::Gt => Some(BinaryOp::Gt),
            Tok::Ge => Some(BinaryOp::Ge),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let right = self.parse_add()?;
            return Ok(Expr::Binary { op, left: Box::new(left), right: Box::new(right) });
        }
        Ok(left)
    }

    fn parse_add(&mut self) -> ScriptResult<Expr> {
        let mut left = self.parse_mul()?;
        loop {
            let op = match &self.peek().tok {
                Tok::Plus => BinaryOp::Add,
                Tok::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_mul()?;
            left = Expr::Binary { op, left: Box::new(left), right: Box::new(right) };
        }
        Ok(left)
    }

    fn parse_mul(&mut self) -> ScriptResult<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match &self.peek().tok {
                Tok::Star => BinaryOp::Mul,
                Tok::Slash => BinaryOp::Div,
                Tok::Percent => BinaryOp::Rem,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::Binary { op, left: Box::new(left), right: Box::new(right) };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> ScriptResult<Expr> {
        if self.matches(&Tok::Minus) {
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary { op: UnaryOp::Neg, operand: Box::new(operand) });
        }
        if self.matches(&Tok::Not) {
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary { op: UnaryOp::Not, operand: Box::new(operand) });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> ScriptResult<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.check(&Tok::LParen) {
                let line = self.line();
                self.advance();
                let callee = match expr {
                    Expr::Ident(name) => name,
                    _ => {
                        return Err(ScriptError::parse(
                            line,
                            "only named functions can be called",
                        ))
                    }
                };
                let args = self.parse_args(Tok::RParen)?;
                expr = Expr::Call { callee, args, line };
            } else if self.check(&Tok::LBracket) {
                self.advance();
                let index = self.parse_expr()?;
                self.expect(Tok::RBracket, "']'")?;
                expr = Expr::Index { target: Box::new(expr), index: Box::new(index) };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_args(&mut self, close: Tok) -> ScriptResult<Vec<Expr>> {
        let mut args = Vec::new();
        if self.check(&close) {
            self.advance();
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr()?);
            if self.matches(&Tok::Comma) {
                if self.check(&close) {
                    break;
                }
                continue;
            }
            break;
        }
        self.expect(close.clone(), &close.describe())?;
        Ok(args)
    }

    fn parse_primary(&mut self) -> ScriptResult<Expr> {
        let line = self.line();
        match self.advance().tok {
            Tok::Int(n) => Ok(Expr::Literal(Literal::Int(n))),
            Tok::Float(x) => Ok(Expr::Literal(Literal::Float(x))),
            Tok::Str(s) => Ok(Expr::Literal(Literal::Str(s))),
            Tok::True => Ok(Expr::Literal(Literal::Bool(true))),
            Tok::False => Ok(Expr::Literal(Literal::Bool(false))),
            Tok::Null => Ok(Expr::Literal(Literal::Null)),
            Tok::Ident(name) => Ok(Expr::Ident(name)),
            Tok::LParen => {
                let inner = self.parse_expr()?;
                self.expect(Tok::RParen, "')'")?;
                Ok(inner)
            }
            Tok::LBracket => {
                let items = self.parse_args(Tok::RBracket)?;
                Ok(Expr::List(items))
            }
            Tok::LBrace => self.parse_map(),
            other => Err(ScriptError::parse(
                line,
                format!("expected an expression, found {}", other.describe()),
            )),
        }
    }

    fn parse_map(&mut self) -> ScriptResult<Expr> {
        let mut entries = Vec::new();
        self.skip_newlines();
        if self.matches(&Tok::RBrace) {
            return Ok(Expr::Map(entries));
        }
        loop {
            let key = match self.advance().tok {
                Tok::Str(key) => key,
                Tok::Ident(key) => key,
                other => {
                    return Err(ScriptError::parse(
                        self.line(),
                        format!("expected map key, found {}", other.describe()),
                    ))
                }
            };
            self.expect(Tok::Colon, "':'")?;
            self.skip_newlines();
            let value = self.parse_expr()?;
            entries.push((key, value));
            self.skip_newlines();
            if self.matches(&Tok::Comma) {
                self.skip_newlines();
                if self.matches(&Tok::RBrace) {
                    break;
                }
                continue;
            }
            self.expect(Tok::RBrace, "'}'")?;
            break;
        }
        Ok(Expr::Map(entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::parse;

    #[test]
    fn parses_import_and_assignment() {
        let program = parse("import frames\ntop = head(sales, 3)\n").unwrap();
        assert_eq!(program.statements.len(), 2);
        assert!(matches!(&program.statements[0], Stmt::Import { module, .. } if module == "frames"));
        match &program.statements[1] {
            Stmt::Assign { target, value: Expr::Call { callee, args, .. }, .. } => {
                assert_eq!(target, "top");
                assert_eq!(callee, "head");
                assert_eq!(args.len(), 2);
            }
            other => panic!("unexpected statement: {other:?}"),
        }
    }

    #[test]
    fn parses_function_definition_with_body() {
        let source = "fn execute_sql_query(sql) {\n    cleaned = sql\n    cleaned\n}\n";
        let program = parse(source).unwrap();
        match &program.statements[0] {
            Stmt::FnDef { name, params, body, .. } => {
                assert_eq!(name, "execute_sql_query");
                assert_eq!(params, &vec!["sql".to_string()]);
                assert_eq!(body.len(), 2);
            }
            other => panic!("unexpected statement: {other:?}"),
        }
    }

    #[test]
    fn multiline_result_map_parses() {
        let source = "result = {\n    \"type\": \"dataframe\",\n    \"value\": top,\n}\n";
        let program = parse(source).unwrap();
        match &program.statements[0] {
            Stmt::Assign { value: Expr::Map(entries), .. } => {
                assert_eq!(entries[0].0, "type");
                assert_eq!(entries[1].0, "value");
            }
            other => panic!("unexpected statement: {other:?}"),
        }
    }

    #[test]
    fn precedence_matches_arithmetic_rules() {
        let program = parse("x = 1 + 2 * 3\n").unwrap();
        match &program.statements[0] {
            Stmt::Assign { value: Expr::Binary { op: BinaryOp::Add, right, .. }, .. } => {
                assert!(matches!(**right, Expr::Binary { op: BinaryOp::Mul, .. }));
            }
            other => panic!("unexpected statement: {other:?}"),
        }
    }

    #[test]
    fn chained_comparison_is_rejected() {
        assert!(parse("x = 1 < 2 < 3\n").is_err());
    }

    #[test]
    fn call_on_non_identifier_is_rejected() {
        assert!(parse("x = head(df)(5)\n").is_err());
        assert!(parse("x = \"head\"(df)\n").is_err());
    }

    #[test]
    fn missing_paren_reports_line() {
        let err = parse("x = head(df\ny = 2\n").unwrap_err();
        assert!(matches!(err, ScriptError::Parse { .. }));
    }

    #[test]
    fn sql_call_with_embedded_query_parses() {
        let source = "orders = execute_sql_query(\"SELECT * FROM sales;\")\n";
        let program = parse(source).unwrap();
        match &program.statements[0] {
            Stmt::Assign { value: Expr::Call { callee, args, .. }, .. } => {
                assert_eq!(callee, "execute_sql_query");
                assert_eq!(args[0].as_str_literal(), Some("SELECT * FROM sales;"));
            }
            other => panic!("unexpected statement: {other:?}"),
        }
    }
}
