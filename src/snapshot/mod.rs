use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::config::{Config, EntityConfig, ViewConfig};
use crate::error::{Result, SyncError};
use crate::export::{relation_references, relation_value};
use crate::io::store::LocalStore;
use crate::mapping::FieldMapper;
use crate::model::Record;
use crate::sync::DEPENDENCY_ORDER;

/// Separates the table name from the view id in sheet names.
pub const VIEW_SEPARATOR: char = '@';

/// A table that will be materialised as an Excel sheet.
#[derive(Debug, Clone, PartialEq)]
pub struct SheetTable {
    pub sheet_name: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

/// Represents all tables required to materialise the Excel workbook.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkbookData {
    pub tables: Vec<SheetTable>,
}

/// Lays the remote-origin records of the local store out as one sheet per
/// table (or per view), in the shape the remote serves its rows. Records
/// created locally and placeholders are left out.
#[instrument(level = "info", skip_all)]
pub fn build_snapshot(config: &Config, store: &dyn LocalStore) -> Result<WorkbookData> {
    let mut sheet_names = SheetNameRegistry::default();
    let mut tables = Vec::new();

    for kind in DEPENDENCY_ORDER {
        let Some(entity) = config.entity(kind) else {
            continue;
        };
        let records: Vec<Record> = store
            .records(kind)?
            .into_iter()
            .filter(|record| record.external_id.is_some() && !record.is_placeholder())
            .collect();

        let views: Vec<Option<&ViewConfig>> = if entity.views.is_empty() {
            vec![None]
        } else {
            entity.views.iter().map(Some).collect()
        };
        for view in views {
            let mut builder = SheetBuilder::new(&entity.id_field);
            for record in records
                .iter()
                .filter(|record| view.is_none_or(|view| view.matches(&record.attributes)))
            {
                builder.push(snapshot_row(config, store, entity, view, record)?);
            }

            let raw_name = sheet_name(&entity.table, view.map(|view| view.id.as_str()));
            let sheet_name = sheet_names.claim(raw_name)?;
            debug!(kind = %kind, sheet = %sheet_name, rows = builder.rows.len(), "sheet built");
            tables.push(builder.into_table(sheet_name));
        }
    }

    info!(sheets = tables.len(), "snapshot built");
    Ok(WorkbookData { tables })
}

fn snapshot_row(
    config: &Config,
    store: &dyn LocalStore,
    entity: &EntityConfig,
    view: Option<&ViewConfig>,
    record: &Record,
) -> Result<BTreeMap<String, Value>> {
    let mapper = FieldMapper::new(record.kind, entity.fields_for(view), config.null_label.clone());
    let mut row: BTreeMap<String, Value> =
        mapper.to_payload(&record.attributes).into_iter().collect();
    if let Some(external_id) = &record.external_id {
        row.insert(entity.id_field.clone(), external_id.to_value());
    }
    if let Some(field) = &entity.sync_uuid_field {
        row.insert(field.clone(), Value::String(record.sync_uuid.to_string()));
    }

    let links = store.links(record.id)?;
    for relation in &entity.relations {
        let references = relation_references(store, record, relation, &links)?;
        row.insert(relation.field.clone(), relation_value(relation, &references));
    }
    Ok(row)
}

/// Sheet holding the rows of `table`, or of one of its views.
pub fn sheet_name(table: &str, view: Option<&str>) -> String {
    match view {
        Some(view) => sanitize_sheet_name(&format!("{table}{VIEW_SEPARATOR}{view}")),
        None => sanitize_sheet_name(table),
    }
}

/// Sheet names are derived from table names on both sides of a snapshot, so
/// two tables mapping onto one name cannot be told apart.
#[derive(Debug, Default)]
struct SheetNameRegistry {
    used: HashSet<String>,
}

impl SheetNameRegistry {
    fn claim(&mut self, name: String) -> Result<String> {
        if !self.used.insert(name.to_lowercase()) {
            return Err(SyncError::InvalidConfig(format!(
                "sheet name '{name}' is used by more than one table"
            )));
        }
        Ok(name)
    }
}

fn sanitize_sheet_name(raw: &str) -> String {
    let invalid = [':', '\\', '/', '?', '*', '[', ']', '\'', '"'];
    let mut sanitized: String = raw
        .chars()
        .map(|ch| {
            if invalid.contains(&ch) || ch.is_control() {
                '_'
            } else {
                ch
            }
        })
        .collect();

    sanitized = sanitized.trim().to_string();
    if sanitized.is_empty() {
        sanitized = "Sheet".to_string();
    }

    if sanitized.chars().count() > 31 {
        sanitized = sanitized.chars().take(31).collect();
    }

    sanitized
}

struct SheetBuilder {
    id_column: String,
    columns: BTreeSet<String>,
    rows: Vec<BTreeMap<String, Value>>,
}

impl SheetBuilder {
    fn new(id_column: &str) -> Self {
        Self {
            id_column: id_column.to_string(),
            columns: BTreeSet::new(),
            rows: Vec::new(),
        }
    }

    fn push(&mut self, row: BTreeMap<String, Value>) {
        for column in row.keys() {
            if *column != self.id_column {
                self.columns.insert(column.clone());
            }
        }
        self.rows.push(row);
    }

    fn into_table(self, sheet_name: String) -> SheetTable {
        let mut columns = Vec::with_capacity(self.columns.len() + 1);
        columns.push(self.id_column);
        columns.extend(self.columns);

        let rows = self
            .rows
            .into_iter()
            .map(|mut row| {
                columns
                    .iter()
                    .map(|column| row.remove(column).unwrap_or(Value::Null))
                    .collect()
            })
            .collect();

        SheetTable {
            sheet_name,
            columns,
            rows,
        }
    }
}
