//! Read-only [`RemoteApi`] over a workbook snapshot.

use std::collections::HashMap;
use std::path::Path;

use calamine::{DataType, Reader, Xlsx, open_workbook};
use serde_json::{Number, Value};
use tracing::{debug, instrument};

use crate::error::{Result, SyncError};
use crate::io::remote::{Fields, Page, RemoteApi};
use crate::model::ExternalId;
use crate::snapshot::sheet_name;

/// Serves the sheets of a workbook as remote tables. A table read through a
/// view is looked up on the `table@view` sheet.
#[derive(Debug, Default)]
pub struct WorkbookRemote {
    sheets: HashMap<String, Vec<Fields>>,
}

impl WorkbookRemote {
    /// Loads every sheet eagerly; the header row names the fields.
    #[instrument(level = "info", fields(path = %path.display()))]
    pub fn open(path: &Path) -> Result<Self> {
        let mut workbook: Xlsx<_> = open_workbook(path)?;
        let mut sheets = HashMap::new();
        for name in workbook.sheet_names().to_vec() {
            let range = workbook
                .worksheet_range(&name)
                .ok_or_else(|| SyncError::RemoteApi(format!("missing sheet '{name}'")))??;
            let rows = read_rows(&range);
            debug!(sheet = %name, rows = rows.len(), "loaded sheet");
            sheets.insert(name, rows);
        }
        Ok(Self { sheets })
    }

    pub fn sheet(&self, name: &str) -> Option<&[Fields]> {
        self.sheets.get(name).map(Vec::as_slice)
    }
}

impl RemoteApi for WorkbookRemote {
    fn fetch_page(
        &self,
        table: &str,
        view: Option<&str>,
        offset: usize,
        limit: usize,
    ) -> Result<Page> {
        let name = sheet_name(table, view);
        let rows = self
            .sheets
            .get(&name)
            .ok_or_else(|| SyncError::RemoteApi(format!("workbook has no sheet '{name}'")))?;
        let start = offset.min(rows.len());
        let end = offset.saturating_add(limit).min(rows.len());
        Ok(Page {
            rows: rows[start..end].to_vec(),
            is_last: end >= rows.len(),
        })
    }

    fn create_row(&self, table: &str, _fields: &Fields) -> Result<ExternalId> {
        Err(read_only(table))
    }

    fn update_row(&self, table: &str, _id: &ExternalId, _fields: &Fields) -> Result<()> {
        Err(read_only(table))
    }

    fn link_rows(
        &self,
        table: &str,
        _link_field: &str,
        _id: &ExternalId,
        _targets: &[ExternalId],
    ) -> Result<()> {
        Err(read_only(table))
    }
}

fn read_only(table: &str) -> SyncError {
    SyncError::RemoteApi(format!("workbook snapshots are read-only (table '{table}')"))
}

fn read_rows(range: &calamine::Range<DataType>) -> Vec<Fields> {
    let headers: Vec<String> = match range.rows().next() {
        Some(first_row) => first_row.iter().map(cell_to_string).collect(),
        None => return Vec::new(),
    };

    let mut rows = Vec::new();
    for row in range.rows().skip(1) {
        let mut fields = Fields::new();
        for (header, cell) in headers.iter().zip(row) {
            if header.is_empty() {
                continue;
            }
            if let Some(value) = cell_to_value(cell) {
                fields.insert(header.clone(), value);
            }
        }
        if !fields.is_empty() {
            rows.push(fields);
        }
    }
    rows
}

fn cell_to_string(cell: &DataType) -> String {
    match cell {
        DataType::String(value) => value.trim().to_string(),
        DataType::Empty => String::new(),
        other => other.to_string(),
    }
}

fn cell_to_value(cell: &DataType) -> Option<Value> {
    match cell {
        DataType::Empty => None,
        DataType::String(text) if text.trim().is_empty() => None,
        DataType::String(text) => Some(parse_text(text)),
        DataType::Int(value) => Some(Value::from(*value)),
        DataType::Float(value) if value.fract() == 0.0 && value.abs() < i64::MAX as f64 => {
            Some(Value::from(*value as i64))
        }
        DataType::Float(value) => Number::from_f64(*value).map(Value::Number),
        DataType::Bool(value) => Some(Value::Bool(*value)),
        other => Some(Value::String(other.to_string())),
    }
}

/// Strings holding JSON arrays or objects were written from structured
/// attributes and are parsed back.
fn parse_text(text: &str) -> Value {
    let trimmed = text.trim();
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
            return value;
        }
    }
    Value::String(text.to_string())
}
