// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Typed scalar values used in file statistics, filters and SET clauses.

use crate::error::{DeltaLogError, Result};
use crate::schema::ColumnType;
use arrow::array::{
    Array, ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray, new_null_array,
};
use arrow::datatypes::DataType;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// A single value. Serialized untagged so stats JSON reads naturally:
/// `{"id": 3, "name": "x", "price": 1.5}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Null,
    Boolean(bool),
    Int64(i64),
    Float64(f64),
    Utf8(String),
}

impl ScalarValue {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, ScalarValue::Null)
    }

    /// Compare two values of compatible types.
    ///
    /// Int64 and Float64 compare numerically. Floats use the IEEE total
    /// order, as the Arrow comparison kernels do: `-0.0 < 0.0` and NaN sorts
    /// above every number. Returns `None` for NULLs and mismatched types.
    #[must_use]
    pub fn compare(&self, other: &ScalarValue) -> Option<Ordering> {
        match (self, other) {
            (ScalarValue::Int64(a), ScalarValue::Int64(b)) => Some(a.cmp(b)),
            (ScalarValue::Float64(a), ScalarValue::Float64(b)) => Some(a.total_cmp(b)),
            (ScalarValue::Int64(a), ScalarValue::Float64(b)) => Some((*a as f64).total_cmp(b)),
            (ScalarValue::Float64(a), ScalarValue::Int64(b)) => Some(a.total_cmp(&(*b as f64))),
            (ScalarValue::Utf8(a), ScalarValue::Utf8(b)) => Some(a.cmp(b)),
            (ScalarValue::Boolean(a), ScalarValue::Boolean(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Coerce to a column type. Int64 widens to Float64; integral floats
    /// narrow to Int64. NULL casts to anything.
    pub fn cast_to(&self, target: ColumnType) -> Result<ScalarValue> {
        let cast = match (self, target) {
            (ScalarValue::Null, _) => Some(ScalarValue::Null),
            (ScalarValue::Int64(v), ColumnType::Int64) => Some(ScalarValue::Int64(*v)),
            (ScalarValue::Int64(v), ColumnType::Float64) => Some(ScalarValue::Float64(*v as f64)),
            (ScalarValue::Float64(v), ColumnType::Float64) => Some(ScalarValue::Float64(*v)),
            (ScalarValue::Float64(v), ColumnType::Int64)
                if v.fract() == 0.0 && *v >= i64::MIN as f64 && *v < i64::MAX as f64 =>
            {
                Some(ScalarValue::Int64(*v as i64))
            }
            (ScalarValue::Utf8(v), ColumnType::Utf8) => Some(ScalarValue::Utf8(v.clone())),
            (ScalarValue::Boolean(v), ColumnType::Boolean) => Some(ScalarValue::Boolean(*v)),
            _ => None,
        };
        cast.ok_or_else(|| {
            DeltaLogError::InvalidArgument(format!("cannot use {self} as {target:?}"))
        })
    }

    /// Read row `idx` of an array.
    pub fn try_from_array(array: &dyn Array, idx: usize) -> Result<ScalarValue> {
        if array.is_null(idx) {
            return Ok(ScalarValue::Null);
        }
        let value = match array.data_type() {
            DataType::Int64 => array
                .as_any()
                .downcast_ref::<Int64Array>()
                .map(|a| ScalarValue::Int64(a.value(idx))),
            DataType::Float64 => array
                .as_any()
                .downcast_ref::<Float64Array>()
                .map(|a| ScalarValue::Float64(a.value(idx))),
            DataType::Utf8 => array
                .as_any()
                .downcast_ref::<StringArray>()
                .map(|a| ScalarValue::Utf8(a.value(idx).to_string())),
            DataType::Boolean => array
                .as_any()
                .downcast_ref::<BooleanArray>()
                .map(|a| ScalarValue::Boolean(a.value(idx))),
            _ => None,
        };
        value.ok_or_else(|| {
            DeltaLogError::InvalidArgument(format!(
                "unsupported array type {:?}",
                array.data_type()
            ))
        })
    }

    /// Build an array of `len` copies of this value with the given type.
    pub fn to_array(&self, data_type: &DataType, len: usize) -> Result<ArrayRef> {
        let array: ArrayRef = match (self, data_type) {
            (ScalarValue::Null, dt) => new_null_array(dt, len),
            (ScalarValue::Int64(v), DataType::Int64) => Arc::new(Int64Array::from(vec![*v; len])),
            (ScalarValue::Float64(v), DataType::Float64) => {
                Arc::new(Float64Array::from(vec![*v; len]))
            }
            (ScalarValue::Int64(v), DataType::Float64) => {
                Arc::new(Float64Array::from(vec![*v as f64; len]))
            }
            (ScalarValue::Utf8(v), DataType::Utf8) => {
                Arc::new(StringArray::from(vec![v.as_str(); len]))
            }
            (ScalarValue::Boolean(v), DataType::Boolean) => {
                Arc::new(BooleanArray::from(vec![*v; len]))
            }
            (value, dt) => {
                return Err(DeltaLogError::InvalidArgument(format!(
                    "cannot build {dt:?} array from {value}"
                )));
            }
        };
        Ok(array)
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Null => f.write_str("NULL"),
            ScalarValue::Boolean(v) => write!(f, "{v}"),
            ScalarValue::Int64(v) => write!(f, "{v}"),
            ScalarValue::Float64(v) => write!(f, "{v}"),
            ScalarValue::Utf8(v) => write!(f, "'{v}'"),
        }
    }
}

impl From<i64> for ScalarValue {
    fn from(v: i64) -> Self {
        ScalarValue::Int64(v)
    }
}

impl From<i32> for ScalarValue {
    fn from(v: i32) -> Self {
        ScalarValue::Int64(i64::from(v))
    }
}

impl From<f64> for ScalarValue {
    fn from(v: f64) -> Self {
        ScalarValue::Float64(v)
    }
}

impl From<bool> for ScalarValue {
    fn from(v: bool) -> Self {
        ScalarValue::Boolean(v)
    }
}

impl From<&str> for ScalarValue {
    fn from(v: &str) -> Self {
        ScalarValue::Utf8(v.to_string())
    }
}

impl From<String> for ScalarValue {
    fn from(v: String) -> Self {
        ScalarValue::Utf8(v)
    }
}
