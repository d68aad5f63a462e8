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

//! Converts the raw result value left by an executed program into the
//! turn's declared answer shape. Programs report their answer as a map
//! with `type` and `value` keys; a shape mismatch is recoverable so the
//! orchestrator can ask for a corrected program.

use polars::prelude::DataFrame;
use serde::Serialize;
use serde_json::json;

use crate::errors::{Result, SlateError};
use crate::script::Value;

/// Answer shape a program can declare in its result map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Text,
    Number,
    Table,
    Plot,
}

impl OutputKind {
    /// Spelling used inside result maps and correction prompts.
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputKind::Text => "string",
            OutputKind::Number => "number",
            OutputKind::Table => "dataframe",
            OutputKind::Plot => "plot",
        }
    }

    pub fn from_declared(declared: &str) -> Option<Self> {
        match declared {
            "string" => Some(OutputKind::Text),
            "number" => Some(OutputKind::Number),
            "dataframe" => Some(OutputKind::Table),
            "plot" => Some(OutputKind::Plot),
            _ => None,
        }
    }
}

/// Chart description produced by the plotting capability.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartSpec {
    pub kind: String,
    pub x_label: String,
    pub y_label: String,
    pub x: Vec<serde_json::Value>,
    pub y: Vec<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub enum Answer {
    Text(String),
    Number(f64),
    Table(DataFrame),
    Plot(ChartSpec),
}

impl Answer {
    pub fn kind(&self) -> OutputKind {
        match self {
            Answer::Text(_) => OutputKind::Text,
            Answer::Number(_) => OutputKind::Number,
            Answer::Table(_) => OutputKind::Table,
            Answer::Plot(_) => OutputKind::Plot,
        }
    }
}

impl std::fmt::Display for Answer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Answer::Text(text) => write!(f, "{text}"),
            Answer::Number(n) => write!(f, "{n}"),
            Answer::Table(frame) => write!(f, "{frame}"),
            Answer::Plot(chart) => {
                write!(f, "{} chart of {} against {}", chart.kind, chart.y_label, chart.x_label)
            }
        }
    }
}

/// A completed turn: the parsed answer plus the program that produced it.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub answer: Answer,
    pub code: String,
}

/// Terminal failure for a turn, carrying what the caller needs to debug
/// or re-ask. Serialises with a literal `"type": "error"` discriminant.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    #[serde(rename = "type")]
    kind: ErrorKindTag,
    #[serde(rename = "value")]
    pub message: String,
    pub last_code_executed: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize)]
enum ErrorKindTag {
    #[serde(rename = "error")]
    Error,
}

impl ErrorResponse {
    pub fn new(error: &SlateError, last_code_executed: Option<String>) -> Self {
        Self { kind: ErrorKindTag::Error, message: error.to_string(), last_code_executed }
    }
}

impl std::fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ErrorResponse {}

/// Parses the result map against the optional declared expectation.
pub fn parse_result(value: &Value, expected: Option<OutputKind>) -> Result<Answer> {
    let declared = value
        .map_get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            SlateError::invalid_output_type(expected_label(expected), value.type_name())
        })?;
    let kind = OutputKind::from_declared(declared).ok_or_else(|| {
        SlateError::invalid_output_type(expected_label(expected), declared)
    })?;
    if let Some(want) = expected {
        if want != kind {
            return Err(SlateError::invalid_output_type(want.as_str(), declared));
        }
    }
    let payload = value.map_get("value").ok_or_else(|| {
        SlateError::invalid_output_type(kind.as_str(), "map without a value key")
    })?;
    match kind {
        OutputKind::Text => match payload {
            Value::Str(text) => Ok(Answer::Text(text.clone())),
            other => Err(mismatch(kind, other)),
        },
        OutputKind::Number => match payload.as_f64() {
            Some(n) => Ok(Answer::Number(n)),
            None => Err(mismatch(kind, payload)),
        },
        OutputKind::Table => match payload {
            Value::Frame(frame) => Ok(Answer::Table(frame.clone())),
            other => Err(mismatch(kind, other)),
        },
        OutputKind::Plot => chart_from_value(payload),
    }
}

fn expected_label(expected: Option<OutputKind>) -> String {
    match expected {
        Some(kind) => kind.as_str().to_string(),
        None => "a result map with type and value keys".to_string(),
    }
}

fn mismatch(kind: OutputKind, payload: &Value) -> SlateError {
    SlateError::invalid_output_type(kind.as_str(), payload.type_name())
}

fn chart_from_value(payload: &Value) -> Result<Answer> {
    Ok(Answer::Plot(ChartSpec {
        kind: chart_text(payload, "chart")?,
        x_label: chart_text(payload, "x_label")?,
        y_label: chart_text(payload, "y_label")?,
        x: chart_axis(payload, "x")?,
        y: chart_axis(payload, "y")?,
    }))
}

fn chart_field<'a>(payload: &'a Value, name: &str) -> Result<&'a Value> {
    payload.map_get(name).ok_or_else(|| {
        SlateError::invalid_output_type(
            OutputKind::Plot.as_str(),
            format!("chart map without a {name} key"),
        )
    })
}

fn chart_text(payload: &Value, name: &str) -> Result<String> {
    chart_field(payload, name)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| mismatch(OutputKind::Plot, payload))
}

fn chart_axis(payload: &Value, name: &str) -> Result<Vec<serde_json::Value>> {
    match chart_field(payload, name)? {
        Value::List(items) => items
            .iter()
            .map(|item| item.to_json().ok_or_else(|| mismatch(OutputKind::Plot, payload)))
            .collect(),
        other => Err(mismatch(OutputKind::Plot, other)),
    }
}

/// JSON rendering of an answer, used by callers that forward responses
/// over the wire. Tables serialise as a row-count stub since frames have
/// no canonical JSON form here.
pub fn answer_to_json(answer: &Answer) -> serde_json::Value {
    match answer {
        Answer::Text(text) => json!({"type": "string", "value": text}),
        Answer::Number(n) => json!({"type": "number", "value": n}),
        Answer::Table(frame) => json!({
            "type": "dataframe",
            "rows": frame.height(),
            "columns": frame.get_column_names().iter().map(|s| s.to_string()).collect::<Vec<_>>(),
        }),
        Answer::Plot(chart) => json!({"type": "plot", "value": chart}),
    }
}
