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

use crate::dataset::Dataset;
use polars::prelude::AnyValue;
use std::fmt::Write;

const SAMPLE_ROWS: usize = 5;

/// Renders one dataset as the tagged text block embedded in the system
/// prompt: dimensions, typed column list and a short CSV sample.
pub fn describe_for_prompt(dataset: &Dataset) -> String {
    let mut out = String::new();
    let _ = write!(
        out,
        "<table name=\"{}\" dimensions=\"{}x{}\"",
        dataset.name(),
        dataset.row_count(),
        dataset.column_count()
    );
    if let Some(description) = dataset.schema().description.as_deref() {
        let _ = write!(out, " description=\"{}\"", description.replace('"', "'"));
    }
    out.push_str(">\n");

    out.push_str("columns: ");
    let columns: Vec<String> = dataset
        .schema()
        .columns
        .iter()
        .map(|c| format!("{} ({})", c.name, c.dtype.as_str()))
        .collect();
    out.push_str(&columns.join(", "));
    out.push('\n');

    let head = dataset.head(SAMPLE_ROWS);
    if head.height() > 0 {
        out.push_str("sample:\n");
        out.push_str(&dataset.schema().column_names().join(","));
        out.push('\n');
        for row in 0..head.height() {
            let cells: Vec<String> = head
                .get_columns()
                .iter()
                .map(|column| {
                    column
                        .as_materialized_series()
                        .get(row)
                        .map(|value| render_cell(&value))
                        .unwrap_or_default()
                })
                .collect();
            out.push_str(&cells.join(","));
            out.push('\n');
        }
    }
    out.push_str("</table>");
    out
}

fn render_cell(value: &AnyValue) -> String {
    match value {
        AnyValue::Null => String::new(),
        AnyValue::String(s) => (*s).to_string(),
        AnyValue::StringOwned(s) => s.to_string(),
        other => other.to_string(),
    }
}
