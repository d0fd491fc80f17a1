//! Render a generated batch as JSON, CSV or SQL text.

use datagen_core::types::{ExportFormat, FieldSpec, Row};
use serde_json::Value;

use crate::error::{GenerateError, Result};

/// Table name used by SQL export when the task does not name one.
pub const DEFAULT_TABLE_NAME: &str = "test_data";

/// Render `rows` in `format`, ordering columns as in `fields`.
///
/// An empty batch renders as `[]` for JSON and as an empty string for CSV/SQL.
pub fn render(
    rows: &[Row],
    fields: &[FieldSpec],
    format: ExportFormat,
    table_name: Option<&str>,
) -> Result<String> {
    match format {
        ExportFormat::Json => to_json(rows, fields),
        ExportFormat::Csv => to_csv(rows, fields),
        ExportFormat::Sql => Ok(to_sql(rows, fields, table_name.unwrap_or(DEFAULT_TABLE_NAME))),
    }
}

fn to_json(rows: &[Row], fields: &[FieldSpec]) -> Result<String> {
    let ordered: Vec<Row> = rows
        .iter()
        .map(|row| {
            if fields.is_empty() {
                return row.clone();
            }
            fields
                .iter()
                .filter_map(|f| row.get(&f.name).map(|v| (f.name.clone(), v.clone())))
                .collect()
        })
        .collect();
    Ok(serde_json::to_string_pretty(&ordered)?)
}

fn to_csv(rows: &[Row], fields: &[FieldSpec]) -> Result<String> {
    if rows.is_empty() || fields.is_empty() {
        return Ok(String::new());
    }
    let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());
    writer.write_record(fields.iter().map(|f| f.name.as_str()))?;
    for row in rows {
        let cells: Vec<String> = fields
            .iter()
            .map(|f| row.get(&f.name).map(csv_cell).unwrap_or_default())
            .collect();
        writer.write_record(&cells)?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| GenerateError::Failed(format!("flush CSV writer: {e}")))?;
    String::from_utf8(bytes).map_err(|e| GenerateError::Failed(e.to_string()))
}

fn csv_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn to_sql(rows: &[Row], fields: &[FieldSpec], table: &str) -> String {
    if rows.is_empty() || fields.is_empty() {
        return String::new();
    }
    let columns: Vec<&str> = fields.iter().map(|f| f.name.as_str()).collect();
    let values: Vec<String> = rows
        .iter()
        .map(|row| {
            let cells: Vec<String> = fields
                .iter()
                .map(|f| sql_literal(row.get(&f.name).unwrap_or(&Value::Null)))
                .collect();
            format!("({})", cells.join(", "))
        })
        .collect();
    format!(
        "INSERT INTO {} ({}) VALUES\n{};",
        table,
        columns.join(", "),
        values.join(",\n")
    )
}

fn sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => (if *b { "1" } else { "0" }).to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        other => format!("'{}'", other.to_string().replace('\'', "''")),
    }
}
