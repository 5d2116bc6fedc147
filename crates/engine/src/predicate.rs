// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Filters: file skipping from statistics, and exact row evaluation.
//!
//! A filter list is a conjunction. [`can_skip`] answers "can this file hold
//! no matching row?" from min/max/null-count alone; it may only say yes when
//! that is certain. [`evaluate`] decides row by row and is the source of
//! truth for results.

use crate::error::{EngineError, Result};
use arrow::array::{Array, ArrayRef, BooleanArray, Datum, Scalar};
use arrow::compute::kernels::cmp;
use arrow::compute::{and, filter_record_batch, or, prep_null_mask_filter};
use arrow::record_batch::RecordBatch;
use deltalog::{ColumnType, FileStats, ScalarValue, TableSchema};
use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Gt,
    Lt,
    GtEq,
    LtEq,
    In,
}

impl fmt::Display for FilterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FilterOp::Eq => "=",
            FilterOp::Gt => ">",
            FilterOp::Lt => "<",
            FilterOp::GtEq => ">=",
            FilterOp::LtEq => "<=",
            FilterOp::In => "IN",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Scalar(ScalarValue),
    List(Vec<ScalarValue>),
}

/// `column op value`. An empty column name matches every row.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
    pub value: FilterValue,
}

impl Filter {
    pub fn new(column: impl Into<String>, op: FilterOp, value: impl Into<ScalarValue>) -> Self {
        Self {
            column: column.into(),
            op,
            value: FilterValue::Scalar(value.into()),
        }
    }

    pub fn eq(column: impl Into<String>, value: impl Into<ScalarValue>) -> Self {
        Self::new(column, FilterOp::Eq, value)
    }

    pub fn gt(column: impl Into<String>, value: impl Into<ScalarValue>) -> Self {
        Self::new(column, FilterOp::Gt, value)
    }

    pub fn lt(column: impl Into<String>, value: impl Into<ScalarValue>) -> Self {
        Self::new(column, FilterOp::Lt, value)
    }

    pub fn gt_eq(column: impl Into<String>, value: impl Into<ScalarValue>) -> Self {
        Self::new(column, FilterOp::GtEq, value)
    }

    pub fn lt_eq(column: impl Into<String>, value: impl Into<ScalarValue>) -> Self {
        Self::new(column, FilterOp::LtEq, value)
    }

    pub fn in_list<I, V>(column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<ScalarValue>,
    {
        Self {
            column: column.into(),
            op: FilterOp::In,
            value: FilterValue::List(values.into_iter().map(Into::into).collect()),
        }
    }

    /// Parse `column op value`, e.g. `id >= 10`, `name = 'x'`, `id IN (1, 2)`.
    ///
    /// The operator is the first one outside quotes, so string literals may
    /// hold `<`, `=` or commas.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let bad = || EngineError::InvalidFilter(format!("cannot parse filter '{text}'"));
        let head = &text[..text.find('\'').unwrap_or(text.len())];

        if let Some(idx) = find_keyword(head, " IN ") {
            let column = text[..idx].trim();
            let list = text[idx + 4..].trim();
            let inner = list
                .strip_prefix('(')
                .and_then(|l| l.strip_suffix(')'))
                .ok_or_else(bad)?;
            let values = split_list(inner)
                .into_iter()
                .map(|v| parse_literal(v.trim()))
                .collect::<Result<Vec<_>>>()?;
            return Ok(Filter::in_list(column, values));
        }

        let (idx, token, op) = find_operator(head).ok_or_else(bad)?;
        let column = text[..idx].trim();
        if column.is_empty() {
            return Err(bad());
        }
        let literal = parse_literal(text[idx + token.len()..].trim())?;
        Ok(Filter::new(column, op, literal))
    }
}

fn find_keyword(text: &str, keyword: &str) -> Option<usize> {
    text.to_ascii_uppercase().find(keyword)
}

/// Leftmost comparison operator; two-character tokens win at a position.
fn find_operator(text: &str) -> Option<(usize, &'static str, FilterOp)> {
    const TOKENS: [(&str, FilterOp); 5] = [
        (">=", FilterOp::GtEq),
        ("<=", FilterOp::LtEq),
        ("=", FilterOp::Eq),
        (">", FilterOp::Gt),
        ("<", FilterOp::Lt),
    ];
    text.char_indices().find_map(|(idx, _)| {
        TOKENS
            .iter()
            .find(|(token, _)| text[idx..].starts_with(token))
            .map(|(token, op)| (idx, *token, *op))
    })
}

/// Split an IN list on commas that are not inside quotes.
fn split_list(inner: &str) -> Vec<&str> {
    let mut items = Vec::new();
    let mut quoted = false;
    let mut start = 0;
    for (idx, c) in inner.char_indices() {
        match c {
            '\'' => quoted = !quoted,
            ',' if !quoted => {
                items.push(&inner[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    items.push(&inner[start..]);
    items
}

/// Literal syntax: `'text'`, `true`/`false`, `null`, integers, floats.
pub fn parse_literal(text: &str) -> Result<ScalarValue> {
    if let Some(inner) = text.strip_prefix('\'').and_then(|t| t.strip_suffix('\'')) {
        return Ok(ScalarValue::Utf8(inner.to_string()));
    }
    match text.to_ascii_lowercase().as_str() {
        "null" => return Ok(ScalarValue::Null),
        "true" => return Ok(ScalarValue::Boolean(true)),
        "false" => return Ok(ScalarValue::Boolean(false)),
        _ => {}
    }
    if let Ok(v) = text.parse::<i64>() {
        return Ok(ScalarValue::Int64(v));
    }
    if let Ok(v) = text.parse::<f64>() {
        return Ok(ScalarValue::Float64(v));
    }
    Err(EngineError::InvalidFilter(format!("cannot parse literal '{text}'")))
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            FilterValue::Scalar(v) => write!(f, "{} {} {v}", self.column, self.op),
            FilterValue::List(values) => {
                let items: Vec<String> = values.iter().map(ToString::to_string).collect();
                write!(f, "{} IN ({})", self.column, items.join(", "))
            }
        }
    }
}

/// A filter checked against a schema, with values coerced to the column type.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedFilter {
    pub column: String,
    pub column_type: ColumnType,
    pub op: FilterOp,
    /// One value for comparisons, the list for IN
    pub values: Vec<ScalarValue>,
}

/// Check filters against `schema` and coerce their values.
///
/// Filters with an empty column name are dropped: they match everything.
pub fn resolve(filters: &[Filter], schema: &TableSchema) -> Result<Vec<ResolvedFilter>> {
    filters
        .iter()
        .filter(|f| !f.column.is_empty())
        .map(|f| {
            let column = schema.column(&f.column).ok_or_else(|| {
                EngineError::InvalidFilter(format!("unknown column '{}'", f.column))
            })?;
            let values = match (&f.op, &f.value) {
                (FilterOp::In, FilterValue::List(values)) => values.clone(),
                (FilterOp::In, FilterValue::Scalar(value)) => vec![value.clone()],
                (_, FilterValue::Scalar(value)) => vec![value.clone()],
                (op, FilterValue::List(_)) => {
                    return Err(EngineError::InvalidFilter(format!(
                        "operator {op} on '{}' takes a single value",
                        f.column
                    )));
                }
            };
            let values = values
                .iter()
                .map(|v| {
                    v.cast_to(column.data_type).map_err(|e| {
                        EngineError::InvalidFilter(format!("filter on '{}': {e}", f.column))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(ResolvedFilter {
                column: f.column.clone(),
                column_type: column.data_type,
                op: f.op,
                values,
            })
        })
        .collect()
}

impl ResolvedFilter {
    /// True when no row of a file with these statistics can match.
    fn excludes(&self, stats: &FileStats, row_count: i64) -> bool {
        let live: Vec<&ScalarValue> = self.values.iter().filter(|v| !v.is_null()).collect();
        if live.is_empty() {
            // Comparisons with NULL are never true
            return true;
        }
        if row_count > 0 && stats.null_count(&self.column) == Some(row_count) {
            return true;
        }
        let (Some(min), Some(max)) = (stats.min(&self.column), stats.max(&self.column)) else {
            return false;
        };

        let outside = |value: &ScalarValue| {
            matches!(value.compare(min), Some(Ordering::Less))
                || matches!(value.compare(max), Some(Ordering::Greater))
        };

        match self.op {
            FilterOp::Eq => outside(live[0]),
            FilterOp::In => live.iter().all(|v| outside(v)),
            // max <= value
            FilterOp::Gt => matches!(max.compare(live[0]), Some(Ordering::Less | Ordering::Equal)),
            FilterOp::GtEq => matches!(max.compare(live[0]), Some(Ordering::Less)),
            // min >= value
            FilterOp::Lt => matches!(min.compare(live[0]), Some(Ordering::Greater | Ordering::Equal)),
            FilterOp::LtEq => matches!(min.compare(live[0]), Some(Ordering::Greater)),
        }
    }

    fn mask(&self, column: &ArrayRef) -> Result<BooleanArray> {
        let rows = column.len();
        let mut result: Option<BooleanArray> = None;
        for value in &self.values {
            let matched = if value.is_null() {
                BooleanArray::from(vec![false; rows])
            } else {
                let scalar = Scalar::new(value.to_array(column.data_type(), 1)?);
                compare(column, &scalar, self.op)?
            };
            result = Some(match result {
                None => matched,
                Some(previous) => or(&previous, &matched)?,
            });
        }
        Ok(result.unwrap_or_else(|| BooleanArray::from(vec![false; rows])))
    }
}

fn compare(column: &ArrayRef, scalar: &dyn Datum, op: FilterOp) -> Result<BooleanArray> {
    let column: &dyn Datum = column;
    Ok(match op {
        FilterOp::Eq | FilterOp::In => cmp::eq(column, scalar)?,
        FilterOp::Gt => cmp::gt(column, scalar)?,
        FilterOp::GtEq => cmp::gt_eq(column, scalar)?,
        FilterOp::Lt => cmp::lt(column, scalar)?,
        FilterOp::LtEq => cmp::lt_eq(column, scalar)?,
    })
}

/// True when the statistics prove no row can satisfy every filter.
#[must_use]
pub fn can_skip(filters: &[ResolvedFilter], stats: &FileStats, row_count: i64) -> bool {
    filters.iter().any(|f| f.excludes(stats, row_count))
}

/// Row-by-row match of all filters. NULL comparisons count as no match.
pub fn evaluate(filters: &[ResolvedFilter], batch: &RecordBatch) -> Result<BooleanArray> {
    let mut result = BooleanArray::from(vec![true; batch.num_rows()]);
    for filter in filters {
        let column = batch.column_by_name(&filter.column).ok_or_else(|| {
            EngineError::InvalidFilter(format!("column '{}' missing from batch", filter.column))
        })?;
        result = and(&result, &filter.mask(column)?)?;
    }
    // NULL comparisons count as false
    if result.null_count() > 0 {
        result = prep_null_mask_filter(&result);
    }
    Ok(result)
}

/// Keep only the rows of `batch` matching every filter.
pub fn filter_batch(filters: &[ResolvedFilter], batch: &RecordBatch) -> Result<RecordBatch> {
    if filters.is_empty() {
        return Ok(batch.clone());
    }
    let mask = evaluate(filters, batch)?;
    Ok(filter_record_batch(batch, &mask)?)
}
