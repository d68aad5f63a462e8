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

use super::{ScriptError, ScriptResult};

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    Import,
    Fn,
    True,
    False,
    Null,
    And,
    Or,
    Not,
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Colon,
    Assign,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Newline,
    Eof,
}

impl Tok {
    pub fn describe(&self) -> String {
        match self {
            Tok::Ident(name) => format!("identifier '{name}'"),
            Tok::Int(n) => format!("number {n}"),
            Tok::Float(x) => format!("number {x}"),
            Tok::Str(_) => "string literal".to_string(),
            Tok::Newline => "end of line".to_string(),
            Tok::Eof => "end of input".to_string(),
            other => format!("'{}'", other.text()),
        }
    }

    fn text(&self) -> &'static str {
        match self {
            Tok::Import => "import",
            Tok::Fn => "fn",
            Tok::True => "true",
            Tok::False => "false",
            Tok::Null => "null",
            Tok::And => "and",
            Tok::Or => "or",
            Tok::Not => "not",
            Tok::LParen => "(",
            Tok::RParen => ")",
            Tok::LBrace => "{",
            Tok::RBrace => "}",
            Tok::LBracket => "[",
            Tok::RBracket => "]",
            Tok::Comma => ",",
            Tok::Colon => ":",
            Tok::Assign => "=",
            Tok::Plus => "+",
            Tok::Minus => "-",
            Tok::Star => "*",
            Tok::Slash => "/",
            Tok::Percent => "%",
            Tok::EqEq => "==",
            Tok::NotEq => "!=",
            Tok::Lt => "<",
            Tok::Le => "<=",
            Tok::Gt => ">",
            Tok::Ge => ">=",
            _ => "",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpannedTok {
    pub tok: Tok,
    pub line: usize,
}

/// Splits source into tokens. Newlines are statement separators except
/// inside parentheses and brackets, where they are suppressed so call
/// arguments and list literals can span lines. Braces keep their newlines
/// because function bodies separate statements by line; the parser skips
/// them inside map literals.
pub fn tokenize(source: &str) -> ScriptResult<Vec<SpannedTok>> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();
    let mut line = 1usize;
    let mut group_depth = 0usize;

    while let Some(c) = chars.next() {
        match c {
            ' ' | '\t' | '\r' => {}
            '\n' => {
                if group_depth == 0 {
                    if !matches!(tokens.last(), Some(SpannedTok { tok: Tok::Newline, .. }) | None) {
                        tokens.push(SpannedTok { tok: Tok::Newline, line });
                    }
                }
                line += 1;
            }
            '#' => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        if group_depth == 0
                            && !matches!(
                                tokens.last(),
                                Some(SpannedTok { tok: Tok::Newline, .. }) | None
                            )
                        {
                            tokens.push(SpannedTok { tok: Tok::Newline, line });
                        }
                        line += 1;
                        break;
                    }
                }
            }
            '"' | '\'' => {
                let started_at = line;
                let mut literal = String::new();
                let mut closed = false;
                while let Some(next) = chars.next() {
                    match next {
                        '\\' => match chars.next() {
                            Some('n') => literal.push('\n'),
                            Some('t') => literal.push('\t'),
                            Some(escaped) => literal.push(escaped),
                            None => break,
                        },
                        '\n' => {
                            literal.push('\n');
                            line += 1;
                        }
                        next if next == c => {
                            closed = true;
                            break;
                        }
                        next => literal.push(next),
                    }
                }
                if !closed {
                    return Err(ScriptError::UnterminatedString { line: started_at });
                }
                tokens.push(SpannedTok { tok: Tok::Str(literal), line: started_at });
            }
            '(' => {
                group_depth += 1;
                tokens.push(SpannedTok { tok: Tok::LParen, line });
            }
            ')' => {
                group_depth = group_depth.saturating_sub(1);
                tokens.push(SpannedTok { tok: Tok::RParen, line });
            }
            '[' => {
                group_depth += 1;
                tokens.push(SpannedTok { tok: Tok::LBracket, line });
            }
            ']' => {
                group_depth = group_depth.saturating_sub(1);
                tokens.push(SpannedTok { tok: Tok::RBracket, line });
            }
            '{' => tokens.push(SpannedTok { tok: Tok::LBrace, line }),
            '}' => tokens.push(SpannedTok { tok: Tok::RBrace, line }),
            ',' => tokens.push(SpannedTok { tok: Tok::Comma, line }),
            ':' => tokens.push(SpannedTok { tok: Tok::Colon, line }),
            '+' => tokens.push(SpannedTok { tok: Tok::Plus, line }),
            '-' => tokens.push(SpannedTok { tok: Tok::Minus, line }),
            '*' => tokens.push(SpannedTok { tok: Tok::Star, line }),
            '/' => tokens.push(SpannedTok { tok: Tok::Slash, line }),
            '%' => tokens.push(SpannedTok { tok: Tok::Percent, line }),
            '=' => {
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(SpannedTok { tok: Tok::EqEq, line });
                } else {
                    tokens.push(SpannedTok { tok: Tok::Assign, line });
                }
            }
            '!' => {
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(SpannedTok { tok: Tok::NotEq, line });
                } else {
                    return Err(ScriptError::UnexpectedChar { line, found: c });
                }
            }
            '<' => {
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(SpannedTok { tok: Tok::Le, line });
                } else {
                    tokens.push(SpannedTok { tok: Tok::Lt, line });
                }
            }
            '>' => {
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(SpannedTok { tok: Tok::Ge, line });
                } else {
                    tokens.push(SpannedTok { tok: Tok::Gt, line });
                }
            }
            c if c.is_ascii_digit() => {
                let mut text = c.to_string();
                let mut is_float = false;
                while let Some(&next) = chars.peek() {
                    if next.is_ascii_digit() {
                        text.push(next);
                        chars.next();
                    } else if next == '.' && !is_float {
                        is_float = true;
                        text.push(next);
                        chars.next();
                    } else if next == '_' {
                        chars.next();
                    } else {
                        break;
                    }
                }
                let tok = if is_float {
                    Tok::Float(text.parse().map_err(|_| {
                        ScriptError::parse(line, format!("invalid number literal '{text}'"))
                    })?)
                } else {
                    Tok::Int(text.parse().map_err(|_| {
                        ScriptError::parse(line, format!("invalid number literal '{text}'"))
                    })?)
                };
                tokens.push(SpannedTok { tok, line });
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut text = c.to_string();
                while let Some(&next) = chars.peek() {
                    if next.is_ascii_alphanumeric() || next == '_' {
                        text.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let tok = match text.as_str() {
                    "import" => Tok::Import,
                    "fn" => Tok::Fn,
                    "true" => Tok::True,
                    "false" => Tok::False,
                    "null" => Tok::Null,
                    "and" => Tok::And,
                    "or" => Tok::Or,
                    "not" => Tok::Not,
                    _ => Tok::Ident(text),
                };
                tokens.push(SpannedTok { tok, line });
            }
            other => return Err(ScriptError::UnexpectedChar { line, found: other }),
        }
    }
    tokens.push(SpannedTok { tok: Tok::Eof, line });
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Tok> {
        tokenize(source).unwrap().into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn basic_statement_tokenizes() {
        let toks = kinds("sales = head(df, 5)\n");
        assert_eq!(
            toks,
            vec![
                Tok::Ident("sales".into()),
                Tok::Assign,
                Tok::Ident("head".into()),
                Tok::LParen,
                Tok::Ident("df".into()),
                Tok::Comma,
                Tok::Int(5),
                Tok::RParen,
                Tok::Newline,
                Tok::Eof,
            ]
        );
    }

    #[test]
    fn newlines_inside_calls_are_suppressed() {
        let toks = kinds("x = head(\n    df,\n    5\n)\n");
        assert!(!toks[..toks.len() - 2].contains(&Tok::Newline));
    }

    #[test]
    fn strings_keep_embedded_newlines_and_quotes() {
        let toks = kinds("q = \"SELECT *\nFROM sales\"\n");
        assert!(toks.contains(&Tok::Str("SELECT *\nFROM sales".into())));
        let toks = kinds("q = 'single'\n");
        assert!(toks.contains(&Tok::Str("single".into())));
    }

    #[test]
    fn comments_are_skipped() {
        let toks = kinds("# leading comment\nx = 1 # trailing\n");
        assert_eq!(toks[0], Tok::Ident("x".into()));
    }

    #[test]
    fn unterminated_string_reports_start_line() {
        let err = tokenize("x = 1\ny = \"open").unwrap_err();
        assert_eq!(err, ScriptError::UnterminatedString { line: 2 });
    }

    #[test]
    fn lone_bang_is_rejected() {
        assert!(tokenize("x ! y").is_err());
    }
}
