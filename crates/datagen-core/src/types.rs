use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DatagenError;

/// One generated record. The workspace enables serde_json's `preserve_order`
/// so keys keep the order of the task's field list.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// A single column definition handed to the data generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Column name in the generated record.
    pub name: String,
    /// Generator type, e.g. `"uuid"`, `"email"`, `"enum"`.
    #[serde(rename = "type", default = "default_field_type")]
    pub field_type: String,
    /// Type-specific options (`min`/`max`, `values`, `value`, ...).
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub options: serde_json::Value,
}

impl FieldSpec {
    pub fn new(name: &str, field_type: &str) -> Self {
        Self {
            name: name.to_string(),
            field_type: field_type.to_string(),
            options: serde_json::Value::Null,
        }
    }

    pub fn with_options(mut self, options: serde_json::Value) -> Self {
        self.options = options;
        self
    }
}

fn default_field_type() -> String {
    "string".to_string()
}

/// Serialisation format used when exporting a generated batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    #[default]
    Json,
    Csv,
    Sql,
}

impl ExportFormat {
    /// File extension for exported files.
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
            ExportFormat::Sql => "sql",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ExportFormat {
    type Err = DatagenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            "sql" => Ok(ExportFormat::Sql),
            other => Err(DatagenError::UnknownExportFormat(other.to_string())),
        }
    }
}
