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

//! Builtin capabilities of the analysis language. A handful of scalar
//! helpers are always present; the table-manipulation, statistics and
//! chart families are gated behind `import` declarations so the validator
//! can police them against the configured allow-list.

use polars::prelude::{
    col, AnyValue, Column, DataFrame, IntoColumn, IntoLazy, NamedFrom, PlSmallStr, PolarsError,
    Series, SortMultipleOptions,
};

use super::interpreter::{Capability, CapabilityTable};
use super::value::Value;
use super::{ScriptError, ScriptResult};

pub const MODULE_FRAMES: &str = "frames";
pub const MODULE_STATS: &str = "stats";
pub const MODULE_CHARTS: &str = "charts";

const CHART_KINDS: [&str; 4] = ["bar", "line", "scatter", "pie"];

const DEFAULT_HEAD_ROWS: usize = 5;

/// Registers the always-available helpers.
pub fn install_base(table: &mut CapabilityTable) {
    table.register("len", Capability::Native(builtin_len));
    table.register("str", Capability::Native(builtin_str));
    table.register("num", Capability::Native(builtin_num));
    table.register("round", Capability::Native(builtin_round));
    table.register("abs", Capability::Native(builtin_abs));
    table.register("columns", Capability::Native(builtin_columns));
    table.register("frame", Capability::Native(builtin_frame));
}

/// Registers one import family. Returns false for names this runtime
/// does not provide.
pub fn install_module(table: &mut CapabilityTable, module: &str) -> bool {
    match module {
        MODULE_FRAMES => {
            table.register("head", Capability::Native(builtin_head));
            table.register("tail", Capability::Native(builtin_tail));
            table.register("sort", Capability::Native(builtin_sort));
            table.register("select", Capability::Native(builtin_select));
            table.register("row_count", Capability::Native(builtin_row_count));
            true
        }
        MODULE_STATS => {
            table.register("sum", Capability::Native(builtin_sum));
            table.register("mean", Capability::Native(builtin_mean));
            table.register("min", Capability::Native(builtin_min));
            table.register("max", Capability::Native(builtin_max));
            table.register("median", Capability::Native(builtin_median));
            true
        }
        MODULE_CHARTS => {
            table.register("plot", Capability::Native(builtin_plot));
            true
        }
        _ => false,
    }
}

fn arity(name: &str, args: &[Value], min: usize, max: usize, line: usize) -> ScriptResult<()> {
    if args.len() >= min && args.len() <= max {
        return Ok(());
    }
    let wanted = if min == max {
        format!("{min}")
    } else {
        format!("{min} to {max}")
    };
    Err(ScriptError::runtime(
        line,
        format!("{name} expects {wanted} argument(s), got {}", args.len()),
    ))
}

fn want_frame<'a>(
    name: &str,
    args: &'a [Value],
    idx: usize,
    line: usize,
) -> ScriptResult<&'a DataFrame> {
    match args.get(idx) {
        Some(Value::Frame(frame)) => Ok(frame),
        Some(other) => Err(ScriptError::runtime(
            line,
            format!(
                "{name}: argument {} must be a dataframe, got {}",
                idx + 1,
                other.type_name()
            ),
        )),
        None => Err(ScriptError::runtime(
            line,
            format!("{name}: missing argument {}", idx + 1),
        )),
    }
}

fn want_str<'a>(
    name: &str,
    args: &'a [Value],
    idx: usize,
    line: usize,
) -> ScriptResult<&'a str> {
    match args.get(idx) {
        Some(Value::Str(s)) => Ok(s),
        Some(other) => Err(ScriptError::runtime(
            line,
            format!(
                "{name}: argument {} must be a string, got {}",
                idx + 1,
                other.type_name()
            ),
        )),
        None => Err(ScriptError::runtime(
            line,
            format!("{name}: missing argument {}", idx + 1),
        )),
    }
}

fn want_rows(name: &str, args: &[Value], idx: usize, line: usize) -> ScriptResult<usize> {
    match args.get(idx) {
        Some(Value::Int(n)) if *n >= 0 => Ok(*n as usize),
        Some(other) => Err(ScriptError::runtime(
            line,
            format!(
                "{name}: argument {} must be a non-negative whole number, got {other}",
                idx + 1
            ),
        )),
        None => Err(ScriptError::runtime(
            line,
            format!("{name}: missing argument {}", idx + 1),
        )),
    }
}

fn polars_err(line: usize, err: PolarsError) -> ScriptError {
    ScriptError::runtime(line, err.to_string())
}

pub(crate) fn anyvalue_to_value(av: &AnyValue) -> Value {
    match av {
        AnyValue::Null => Value::Null,
        AnyValue::Boolean(b) => Value::Bool(*b),
        AnyValue::Int8(v) => Value::Int(i64::from(*v)),
        AnyValue::Int16(v) => Value::Int(i64::from(*v)),
        AnyValue::Int32(v) => Value::Int(i64::from(*v)),
        AnyValue::Int64(v) => Value::Int(*v),
        AnyValue::UInt8(v) => Value::Int(i64::from(*v)),
        AnyValue::UInt16(v) => Value::Int(i64::from(*v)),
        AnyValue::UInt32(v) => Value::Int(i64::from(*v)),
        AnyValue::UInt64(v) => Value::Int(*v as i64),
        AnyValue::Float32(v) => Value::Float(f64::from(*v)),
        AnyValue::Float64(v) => Value::Float(*v),
        AnyValue::String(s) => Value::Str((*s).to_string()),
        AnyValue::StringOwned(s) => Value::Str(s.to_string()),
        other => Value::Str(other.to_string()),
    }
}

pub(crate) fn column_values(frame: &DataFrame, name: &str, line: usize) -> ScriptResult<Vec<Value>> {
    let series = frame
        .column(name)
        .map_err(|e| polars_err(line, e))?
        .as_materialized_series();
    let mut values = Vec::with_capacity(series.len());
    for i in 0..series.len() {
        let av = series.get(i).map_err(|e| polars_err(line, e))?;
        values.push(anyvalue_to_value(&av));
    }
    Ok(values)
}

fn builtin_len(args: &[Value], line: usize) -> ScriptResult<Value> {
    arity("len", args, 1, 1, line)?;
    let n = match &args[0] {
        Value::Str(s) => s.chars().count(),
        Value::List(items) => items.len(),
        Value::Map(entries) => entries.len(),
        Value::Frame(frame) => frame.height(),
        other => {
            return Err(ScriptError::runtime(
                line,
                format!("len: cannot measure a {}", other.type_name()),
            ))
        }
    };
    Ok(Value::Int(n as i64))
}

fn builtin_str(args: &[Value], line: usize) -> ScriptResult<Value> {
    arity("str", args, 1, 1, line)?;
    Ok(Value::Str(args[0].to_string()))
}

fn builtin_num(args: &[Value], line: usize) -> ScriptResult<Value> {
    arity("num", args, 1, 1, line)?;
    match &args[0] {
        Value::Int(n) => Ok(Value::Int(*n)),
        Value::Float(x) => Ok(Value::Float(*x)),
        Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
        Value::Str(s) => {
            let trimmed = s.trim();
            if let Ok(n) = trimmed.parse::<i64>() {
                return Ok(Value::Int(n));
            }
            trimmed
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| ScriptError::runtime(line, format!("num: '{s}' is not numeric")))
        }
        other => Err(ScriptError::runtime(
            line,
            format!("num: cannot convert a {}", other.type_name()),
        )),
    }
}

fn builtin_round(args: &[Value], line: usize) -> ScriptResult<Value> {
    arity("round", args, 1, 2, line)?;
    let digits = if args.len() == 2 {
        match args[1] {
            Value::Int(d) if (0..=12).contains(&d) => d as i32,
            _ => {
                return Err(ScriptError::runtime(
                    line,
                    "round: digits must be a whole number between 0 and 12",
                ))
            }
        }
    } else {
        0
    };
    match &args[0] {
        Value::Int(n) => Ok(Value::Int(*n)),
        Value::Float(x) => {
            let factor = 10f64.powi(digits);
            let rounded = (x * factor).round() / factor;
            if digits == 0 {
                Ok(Value::Int(rounded as i64))
            } else {
                Ok(Value::Float(rounded))
            }
        }
        other => Err(ScriptError::runtime(
            line,
            format!("round: expected a number, got {}", other.type_name()),
        )),
    }
}

fn builtin_abs(args: &[Value], line: usize) -> ScriptResult<Value> {
    arity("abs", args, 1, 1, line)?;
    match &args[0] {
        Value::Int(n) => Ok(Value::Int(n.abs())),
        Value::Float(x) => Ok(Value::Float(x.abs())),
        other => Err(ScriptError::runtime(
            line,
            format!("abs: expected a number, got {}", other.type_name()),
        )),
    }
}

fn builtin_columns(args: &[Value], line: usize) -> ScriptResult<Value> {
    arity("columns", args, 1, 1, line)?;
    let frame = want_frame("columns", args, 0, line)?;
    let names = frame
        .get_column_names()
        .iter()
        .map(|name| Value::Str(name.to_string()))
        .collect();
    Ok(Value::List(names))
}

fn builtin_frame(args: &[Value], line: usize) -> ScriptResult<Value> {
    arity("frame", args, 1, 1, line)?;
    let entries = match &args[0] {
        Value::Map(entries) => entries,
        other => {
            return Err(ScriptError::runtime(
                line,
                format!(
                    "frame: expected a map of column name to list, got {}",
                    other.type_name()
                ),
            ))
        }
    };
    if entries.is_empty() {
        return Err(ScriptError::runtime(line, "frame: at least one column is required"));
    }
    let mut columns = Vec::with_capacity(entries.len());
    for (name, value) in entries {
        let items = match value {
            Value::List(items) => items.as_slice(),
            other => {
                return Err(ScriptError::runtime(
                    line,
                    format!("frame: column '{name}' must be a list, got {}", other.type_name()),
                ))
            }
        };
        columns.push(column_from_items(name, items, line)?);
    }
    DataFrame::new(columns)
        .map(Value::Frame)
        .map_err(|e| polars_err(line, e))
}

fn column_from_items(name: &str, items: &[Value], line: usize) -> ScriptResult<Column> {
    let mut has_int = false;
    let mut has_float = false;
    let mut has_str = false;
    let mut has_bool = false;
    for item in items {
        match item {
            Value::Null => {}
            Value::Int(_) => has_int = true,
            Value::Float(_) => has_float = true,
            Value::Str(_) => has_str = true,
            Value::Bool(_) => has_bool = true,
            other => {
                return Err(ScriptError::runtime(
                    line,
                    format!(
                        "frame: column '{name}' may only hold scalars, found a {}",
                        other.type_name()
                    ),
                ))
            }
        }
    }
    let numeric = has_int || has_float;
    if (has_str && (numeric || has_bool)) || (has_bool && numeric) {
        return Err(ScriptError::runtime(
            line,
            format!("frame: column '{name}' mixes incompatible value types"),
        ));
    }
    let pl_name = PlSmallStr::from(name);
    let series = if has_str {
        let values: Vec<Option<&str>> = items
            .iter()
            .map(|v| match v {
                Value::Str(s) => Some(s.as_str()),
                _ => None,
            })
            .collect();
        Series::new(pl_name, values)
    } else if has_bool {
        let values: Vec<Option<bool>> = items
            .iter()
            .map(|v| match v {
                Value::Bool(b) => Some(*b),
                _ => None,
            })
            .collect();
        Series::new(pl_name, values)
    } else if has_float {
        let values: Vec<Option<f64>> = items
            .iter()
            .map(|v| v.as_f64())
            .collect();
        Series::new(pl_name, values)
    } else if has_int {
        let values: Vec<Option<i64>> = items
            .iter()
            .map(|v| match v {
                Value::Int(n) => Some(*n),
                _ => None,
            })
            .collect();
        Series::new(pl_name, values)
    } else {
        let values: Vec<Option<f64>> = items.iter().map(|_| None).collect();
        Series::new(pl_name, values)
    };
    Ok(series.into_column())
}

fn builtin_head(args: &[Value], line: usize) -> ScriptResult<Value> {
    arity("head", args, 1, 2, line)?;
    let frame = want_frame("head", args, 0, line)?;
    let rows = if args.len() == 2 {
        want_rows("head", args, 1, line)?
    } else {
        DEFAULT_HEAD_ROWS
    };
    Ok(Value::Frame(frame.head(Some(rows))))
}

fn builtin_tail(args: &[Value], line: usize) -> ScriptResult<Value> {
    arity("tail", args, 1, 2, line)?;
    let frame = want_frame("tail", args, 0, line)?;
    let rows = if args.len() == 2 {
        want_rows("tail", args, 1, line)?
    } else {
        DEFAULT_HEAD_ROWS
    };
    Ok(Value::Frame(frame.tail(Some(rows))))
}

fn builtin_sort(args: &[Value], line: usize) -> ScriptResult<Value> {
    arity("sort", args, 2, 3, line)?;
    let frame = want_frame("sort", args, 0, line)?;
    let by = sort_keys("sort", args, 1, line)?;
    let descending = match args.get(2) {
        None => false,
        Some(Value::Bool(b)) => *b,
        Some(other) => {
            return Err(ScriptError::runtime(
                line,
                format!("sort: argument 3 must be true or false, got {}", other.type_name()),
            ))
        }
    };
    frame
        .sort(by, SortMultipleOptions::default().with_order_descending(descending))
        .map(Value::Frame)
        .map_err(|e| polars_err(line, e))
}

fn sort_keys(
    name: &str,
    args: &[Value],
    idx: usize,
    line: usize,
) -> ScriptResult<Vec<PlSmallStr>> {
    match args.get(idx) {
        Some(Value::Str(s)) => Ok(vec![PlSmallStr::from(s.as_str())]),
        Some(Value::List(items)) => {
            let mut keys = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::Str(s) => keys.push(PlSmallStr::from(s.as_str())),
                    other => {
                        return Err(ScriptError::runtime(
                            line,
                            format!(
                                "{name}: column names must be strings, got {}",
                                other.type_name()
                            ),
                        ))
                    }
                }
            }
            Ok(keys)
        }
        Some(other) => Err(ScriptError::runtime(
            line,
            format!(
                "{name}: argument {} must be a column name or list of names, got {}",
                idx + 1,
                other.type_name()
            ),
        )),
        None => Err(ScriptError::runtime(
            line,
            format!("{name}: missing argument {}", idx + 1),
        )),
    }
}

fn builtin_select(args: &[Value], line: usize) -> ScriptResult<Value> {
    arity("select", args, 2, 2, line)?;
    let frame = want_frame("select", args, 0, line)?;
    let names = sort_keys("select", args, 1, line)?;
    frame
        .select(names)
        .map(Value::Frame)
        .map_err(|e| polars_err(line, e))
}

fn builtin_row_count(args: &[Value], line: usize) -> ScriptResult<Value> {
    arity("row_count", args, 1, 1, line)?;
    let frame = want_frame("row_count", args, 0, line)?;
    Ok(Value::Int(frame.height() as i64))
}

fn builtin_sum(args: &[Value], line: usize) -> ScriptResult<Value> {
    stat("sum", args, line)
}

fn builtin_mean(args: &[Value], line: usize) -> ScriptResult<Value> {
    stat("mean", args, line)
}

fn builtin_min(args: &[Value], line: usize) -> ScriptResult<Value> {
    stat("min", args, line)
}

fn builtin_max(args: &[Value], line: usize) -> ScriptResult<Value> {
    stat("max", args, line)
}

fn builtin_median(args: &[Value], line: usize) -> ScriptResult<Value> {
    stat("median", args, line)
}

/// Statistics accept either a dataframe with a column name, or a plain
/// list of numbers.
fn stat(name: &str, args: &[Value], line: usize) -> ScriptResult<Value> {
    arity(name, args, 1, 2, line)?;
    match &args[0] {
        Value::Frame(frame) => {
            let column = want_str(name, args, 1, line)?;
            frame_stat(name, frame, column, line)
        }
        Value::List(items) => {
            if args.len() != 1 {
                return Err(ScriptError::runtime(
                    line,
                    format!("{name}: a list takes no further arguments"),
                ));
            }
            list_stat(name, items, line)
        }
        other => Err(ScriptError::runtime(
            line,
            format!(
                "{name}: argument 1 must be a dataframe or a list of numbers, got {}",
                other.type_name()
            ),
        )),
    }
}

fn frame_stat(name: &str, frame: &DataFrame, column: &str, line: usize) -> ScriptResult<Value> {
    let expr = col(column);
    let aggregated = match name {
        "sum" => expr.sum(),
        "mean" => expr.mean(),
        "min" => expr.min(),
        "max" => expr.max(),
        "median" => expr.median(),
        _ => return Err(ScriptError::runtime(line, format!("unknown statistic {name}"))),
    };
    let out = frame
        .clone()
        .lazy()
        .select([aggregated])
        .collect()
        .map_err(|e| polars_err(line, e))?;
    let av = out
        .get_columns()
        .first()
        .ok_or_else(|| ScriptError::runtime(line, format!("{name}: no result column")))?
        .as_materialized_series()
        .get(0)
        .map_err(|e| polars_err(line, e))?;
    Ok(anyvalue_to_value(&av))
}

fn list_stat(name: &str, items: &[Value], line: usize) -> ScriptResult<Value> {
    if items.is_empty() {
        return Err(ScriptError::runtime(line, format!("{name}: the list is empty")));
    }
    let mut floats = Vec::with_capacity(items.len());
    let mut all_ints = true;
    for item in items {
        match item {
            Value::Int(n) => floats.push(*n as f64),
            Value::Float(x) => {
                all_ints = false;
                floats.push(*x);
            }
            other => {
                return Err(ScriptError::runtime(
                    line,
                    format!("{name}: list items must be numbers, got {}", other.type_name()),
                ))
            }
        }
    }
    match name {
        "sum" => {
            let total: f64 = floats.iter().sum();
            if all_ints {
                Ok(Value::Int(total as i64))
            } else {
                Ok(Value::Float(total))
            }
        }
        "mean" => Ok(Value::Float(floats.iter().sum::<f64>() / floats.len() as f64)),
        "min" => pick_extreme(items, &floats, |a, b| a < b),
        "max" => pick_extreme(items, &floats, |a, b| a > b),
        "median" => {
            let mut sorted = floats;
            sorted.sort_by(f64::total_cmp);
            let mid = sorted.len() / 2;
            let median = if sorted.len() % 2 == 0 {
                (sorted[mid - 1] + sorted[mid]) / 2.0
            } else {
                sorted[mid]
            };
            Ok(Value::Float(median))
        }
        _ => Err(ScriptError::runtime(line, format!("unknown statistic {name}"))),
    }
}

fn pick_extreme(
    items: &[Value],
    floats: &[f64],
    better: fn(f64, f64) -> bool,
) -> ScriptResult<Value> {
    let mut best = 0usize;
    for (i, x) in floats.iter().enumerate().skip(1) {
        if better(*x, floats[best]) {
            best = i;
        }
    }
    Ok(items[best].clone())
}

fn builtin_plot(args: &[Value], line: usize) -> ScriptResult<Value> {
    arity("plot", args, 4, 4, line)?;
    let kind = want_str("plot", args, 0, line)?;
    if !CHART_KINDS.contains(&kind) {
        return Err(ScriptError::runtime(
            line,
            format!("plot: unknown chart kind '{kind}', expected one of {CHART_KINDS:?}"),
        ));
    }
    let frame = want_frame("plot", args, 1, line)?;
    let x_column = want_str("plot", args, 2, line)?;
    let y_column = want_str("plot", args, 3, line)?;
    let xs = column_values(frame, x_column, line)?;
    let ys = column_values(frame, y_column, line)?;
    Ok(Value::Map(vec![
        ("chart".to_string(), Value::Str(kind.to_string())),
        ("x_label".to_string(), Value::Str(x_column.to_string())),
        ("y_label".to_string(), Value::Str(y_column.to_string())),
        ("x".to_string(), Value::List(xs)),
        ("y".to_string(), Value::List(ys)),
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use polars::df;

    fn sample() -> DataFrame {
        df!(
            "product" => ["widget", "gadget", "sprocket"],
            "total" => [120i64, 340, 75],
        )
        .unwrap()
    }

    #[test]
    fn frame_builtin_builds_typed_columns() {
        let map = Value::Map(vec![
            (
                "name".to_string(),
                Value::List(vec![Value::Str("a".into()), Value::Str("b".into())]),
            ),
            (
                "score".to_string(),
                Value::List(vec![Value::Int(1), Value::Float(2.5)]),
            ),
        ]);
        let built = builtin_frame(&[map], 1).unwrap();
        let frame = built.as_frame().unwrap();
        assert_eq!(frame.height(), 2);
        assert_eq!(frame.width(), 2);
    }

    #[test]
    fn frame_builtin_rejects_mixed_columns() {
        let map = Value::Map(vec![(
            "bad".to_string(),
            Value::List(vec![Value::Str("a".into()), Value::Int(1)]),
        )]);
        assert!(builtin_frame(&[map], 1).is_err());
    }

    #[test]
    fn sort_and_head_compose() {
        let sorted = builtin_sort(
            &[
                Value::Frame(sample()),
                Value::Str("total".into()),
                Value::Bool(true),
            ],
            1,
        )
        .unwrap();
        let top = builtin_head(&[sorted, Value::Int(1)], 1).unwrap();
        let frame = top.as_frame().unwrap();
        assert_eq!(frame.height(), 1);
        let values = column_values(frame, "product", 1).unwrap();
        assert_eq!(values[0], Value::Str("gadget".into()));
    }

    #[test]
    fn frame_statistics_read_one_column() {
        let total = frame_stat("sum", &sample(), "total", 1).unwrap();
        assert_eq!(total, Value::Int(535));
        let mean = frame_stat("mean", &sample(), "total", 1).unwrap();
        assert!(matches!(mean, Value::Float(x) if (x - 178.333).abs() < 0.01));
        assert!(frame_stat("sum", &sample(), "missing", 1).is_err());
    }

    #[test]
    fn list_statistics_preserve_int_shape() {
        let items = vec![Value::Int(4), Value::Int(1), Value::Int(9)];
        assert_eq!(list_stat("sum", &items, 1).unwrap(), Value::Int(14));
        assert_eq!(list_stat("min", &items, 1).unwrap(), Value::Int(1));
        assert_eq!(list_stat("median", &items, 1).unwrap(), Value::Float(4.0));
    }

    #[test]
    fn plot_emits_chart_specification() {
        let spec = builtin_plot(
            &[
                Value::Str("bar".into()),
                Value::Frame(sample()),
                Value::Str("product".into()),
                Value::Str("total".into()),
            ],
            1,
        )
        .unwrap();
        assert_eq!(spec.map_get("chart"), Some(&Value::Str("bar".into())));
        match spec.map_get("y") {
            Some(Value::List(ys)) => assert_eq!(ys.len(), 3),
            other => panic!("unexpected y payload: {other:?}"),
        }
        assert!(builtin_plot(
            &[
                Value::Str("sunburst".into()),
                Value::Frame(sample()),
                Value::Str("product".into()),
                Value::Str("total".into()),
            ],
            1,
        )
        .is_err());
    }
}
