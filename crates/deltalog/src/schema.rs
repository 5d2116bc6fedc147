// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Table identity, logical schema and table-level metadata.

use crate::error::{DeltaLogError, Result};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Metadata property keys recorded in METADATA entries
pub mod properties {
    /// `database` or `table`
    pub const KIND: &str = "deltacore.kind";
    /// Present with value `true` once the object has been dropped
    pub const DROPPED: &str = "deltacore.dropped";

    pub const KIND_DATABASE: &str = "database";
    pub const KIND_TABLE: &str = "table";
}

/// Identifier of one table's log. Also the name of its directory in a store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableId(String);

impl TableId {
    /// Validate and wrap a table id.
    ///
    /// Ids name directories, so path separators and leading `_`/`.` are rejected.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let reason = if id.is_empty() {
            Some("must not be empty")
        } else if id.starts_with('_') || id.starts_with('.') {
            Some("must not start with '_' or '.'")
        } else if id.contains(['/', '\\']) {
            Some("must not contain path separators")
        } else if id.chars().any(char::is_whitespace) {
            Some("must not contain whitespace")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(DeltaLogError::InvalidTableId {
                id,
                reason: reason.to_string(),
            }),
            None => Ok(Self(id)),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The database part of a `database.table` id, if any.
    #[must_use]
    pub fn database(&self) -> Option<&str> {
        self.0.split_once('.').map(|(db, _)| db)
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for TableId {
    type Error = DeltaLogError;

    fn try_from(value: &str) -> Result<Self> {
        TableId::new(value)
    }
}

/// Column types supported by the storage core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Int64,
    Float64,
    Utf8,
    Boolean,
}

impl ColumnType {
    #[must_use]
    pub fn to_arrow(self) -> DataType {
        match self {
            ColumnType::Int64 => DataType::Int64,
            ColumnType::Float64 => DataType::Float64,
            ColumnType::Utf8 => DataType::Utf8,
            ColumnType::Boolean => DataType::Boolean,
        }
    }

    pub fn from_arrow(data_type: &DataType) -> Result<Self> {
        match data_type {
            DataType::Int64 => Ok(ColumnType::Int64),
            DataType::Float64 => Ok(ColumnType::Float64),
            DataType::Utf8 => Ok(ColumnType::Utf8),
            DataType::Boolean => Ok(ColumnType::Boolean),
            other => Err(DeltaLogError::InvalidArgument(format!(
                "unsupported column type {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: ColumnType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, data_type: ColumnType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable,
        }
    }
}

/// Ordered list of columns; serialized as `schema_json` in METADATA entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnDef>,
}

impl TableSchema {
    #[must_use]
    pub fn new(columns: Vec<ColumnDef>) -> Self {
        Self { columns }
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    #[must_use]
    pub fn to_arrow(&self) -> SchemaRef {
        Arc::new(Schema::new(
            self.columns
                .iter()
                .map(|c| Field::new(&c.name, c.data_type.to_arrow(), c.nullable))
                .collect::<Vec<_>>(),
        ))
    }

    pub fn from_arrow(schema: &Schema) -> Result<Self> {
        let columns = schema
            .fields()
            .iter()
            .map(|f| {
                Ok(ColumnDef::new(
                    f.name(),
                    ColumnType::from_arrow(f.data_type())?,
                    f.is_nullable(),
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { columns })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Payload of a METADATA entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableMetadata {
    pub schema: TableSchema,
    pub properties: BTreeMap<String, String>,
}

impl TableMetadata {
    #[must_use]
    pub fn table(schema: TableSchema) -> Self {
        let mut properties = BTreeMap::new();
        properties.insert(
            properties::KIND.to_string(),
            properties::KIND_TABLE.to_string(),
        );
        Self { schema, properties }
    }

    #[must_use]
    pub fn database() -> Self {
        let mut properties = BTreeMap::new();
        properties.insert(
            properties::KIND.to_string(),
            properties::KIND_DATABASE.to_string(),
        );
        Self {
            schema: TableSchema::default(),
            properties,
        }
    }

    /// The same object marked as dropped.
    #[must_use]
    pub fn dropped(&self) -> Self {
        let mut next = self.clone();
        next.properties
            .insert(properties::DROPPED.to_string(), "true".to_string());
        next
    }

    #[must_use]
    pub fn is_dropped(&self) -> bool {
        self.properties
            .get(properties::DROPPED)
            .is_some_and(|v| v == "true")
    }

    #[must_use]
    pub fn is_database(&self) -> bool {
        self.properties
            .get(properties::KIND)
            .is_some_and(|v| v == properties::KIND_DATABASE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_id_validation() {
        assert!(TableId::new("sales").is_ok());
        assert_eq!(
            TableId::new("db.sales").expect("valid").database(),
            Some("db")
        );
        assert!(TableId::new("").is_err());
        assert!(TableId::new("_delta_log").is_err());
        assert!(TableId::new("a/b").is_err());
        assert!(TableId::new("a b").is_err());
    }

    #[test]
    fn test_schema_json_roundtrip_keeps_column_order() {
        let schema = TableSchema::new(vec![
            ColumnDef::new("id", ColumnType::Int64, false),
            ColumnDef::new("value", ColumnType::Utf8, true),
        ]);
        let json = schema.to_json().expect("serialize");
        assert_eq!(
            json,
            r#"{"columns":[{"name":"id","data_type":"int64","nullable":false},{"name":"value","data_type":"utf8","nullable":true}]}"#
        );
        assert_eq!(TableSchema::from_json(&json).expect("parse"), schema);

        let arrow = schema.to_arrow();
        assert_eq!(arrow.field(0).name(), "id");
        assert!(!arrow.field(0).is_nullable());
        assert_eq!(TableSchema::from_arrow(&arrow).expect("convert"), schema);
    }

    #[test]
    fn test_dropped_marker() {
        let meta = TableMetadata::table(TableSchema::default());
        assert!(!meta.is_dropped());
        assert!(meta.dropped().is_dropped());
        assert!(!meta.is_database());
        assert!(TableMetadata::database().is_database());
    }
}
