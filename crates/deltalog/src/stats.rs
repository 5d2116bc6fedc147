// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Per-file column statistics used for data skipping.

use crate::error::Result;
use crate::scalar::ScalarValue;
use arrow::array::{Array, BooleanArray, Float64Array, Int64Array, StringArray};
use arrow::compute;
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Min/max/null-count per column. Columns whose values are all NULL have
/// a null count but no min/max.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileStats {
    pub min_values: BTreeMap<String, ScalarValue>,
    pub max_values: BTreeMap<String, ScalarValue>,
    pub null_counts: BTreeMap<String, i64>,
}

impl FileStats {
    /// Collect statistics for every supported column of a batch.
    #[must_use]
    pub fn from_batch(batch: &RecordBatch) -> Self {
        let mut stats = FileStats::default();
        for (field, column) in batch.schema().fields().iter().zip(batch.columns()) {
            let name = field.name().to_string();
            let _ = stats
                .null_counts
                .insert(name.clone(), column.null_count() as i64);

            if let Some((min, max)) = min_max(column.as_ref()) {
                let _ = stats.min_values.insert(name.clone(), min);
                let _ = stats.max_values.insert(name, max);
            }
        }
        stats
    }

    #[must_use]
    pub fn min(&self, column: &str) -> Option<&ScalarValue> {
        self.min_values.get(column)
    }

    #[must_use]
    pub fn max(&self, column: &str) -> Option<&ScalarValue> {
        self.max_values.get(column)
    }

    #[must_use]
    pub fn null_count(&self, column: &str) -> Option<i64> {
        self.null_counts.get(column).copied()
    }

    pub fn min_values_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.min_values)?)
    }

    pub fn max_values_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.max_values)?)
    }

    pub fn null_counts_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.null_counts)?)
    }

    pub fn from_json(min_values: &str, max_values: &str, null_counts: &str) -> Result<Self> {
        Ok(Self {
            min_values: serde_json::from_str(min_values)?,
            max_values: serde_json::from_str(max_values)?,
            null_counts: serde_json::from_str(null_counts)?,
        })
    }
}

fn min_max(array: &dyn Array) -> Option<(ScalarValue, ScalarValue)> {
    match array.data_type() {
        DataType::Int64 => {
            let a = array.as_any().downcast_ref::<Int64Array>()?;
            Some((
                ScalarValue::Int64(compute::min(a)?),
                ScalarValue::Int64(compute::max(a)?),
            ))
        }
        DataType::Float64 => {
            let a = array.as_any().downcast_ref::<Float64Array>()?;
            // NaN has no place in a range; leave the column without bounds
            if a.iter().flatten().any(f64::is_nan) {
                return None;
            }
            // Total order, so -0.0 is below 0.0 as in the comparison kernels
            let min = a.iter().flatten().min_by(f64::total_cmp)?;
            let max = a.iter().flatten().max_by(f64::total_cmp)?;
            Some((ScalarValue::Float64(min), ScalarValue::Float64(max)))
        }
        DataType::Utf8 => {
            let a = array.as_any().downcast_ref::<StringArray>()?;
            Some((
                ScalarValue::Utf8(compute::min_string(a)?.to_string()),
                ScalarValue::Utf8(compute::max_string(a)?.to_string()),
            ))
        }
        DataType::Boolean => {
            let a = array.as_any().downcast_ref::<BooleanArray>()?;
            Some((
                ScalarValue::Boolean(compute::min_boolean(a)?),
                ScalarValue::Boolean(compute::max_boolean(a)?),
            ))
        }
        _ => None,
    }
}
