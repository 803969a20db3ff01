#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;

use serde_json::{Value, json};
use tablesync::{Result, SyncError};
use tablesync::config::Config;
use tablesync::io::remote::{Fields, Page, RemoteApi};
use tablesync::io::store::{LocalStore, SqliteStore};
use tablesync::model::{EntityKind, ExternalId, Record};

pub const CONFIG: &str = r#"
null_label = "(none)"

[remote]
base_url = "http://remote.invalid/api/v2"
page_size = 2

[entities.actor]
table = "actors"
export = true
sync_uuid_field = "SyncUuid"

[entities.actor.fields]
name = { field = "Name", coerce = "text", required = true }
actor_kind = { field = "Kind", default = "person" }

[[entities.actor.relations]]
name = "parent"
field = "Parent"
target = "actor"
cardinality = "one"

[entities.role]
table = "roles"

[entities.role.fields]
label = { field = "Title", required = true }

[entities.affiliation]
table = "affiliations"
export = true

[entities.affiliation.fields]
start_date = { field = "Start", coerce = "date" }
end_date = { field = "End", coerce = "date" }

[[entities.affiliation.relations]]
name = "source_actor"
field = "Source"
target = "actor"
cardinality = "one"
required = true

[[entities.affiliation.relations]]
name = "target_actor"
field = "Target"
target = "actor"
cardinality = "one"
required = true

[[entities.affiliation.relations]]
name = "role"
field = "Role"
target = "role"
cardinality = "one"
link_field = "Role"

[entities.evidence]
table = "evidence"

[entities.evidence.fields]
title = { field = "Title", required = true }
date = { field = "Date", coerce = "date" }

[[entities.evidence.relations]]
name = "channels"
field = "Channels"
target = "channel"
lazy_create = true

[[entities.evidence.relations]]
name = "actors"
field = "Actors"
target = "actor"
"#;

pub fn config() -> Config {
    Config::from_toml_str(CONFIG).expect("fixture config is valid")
}

pub fn lenient_config() -> Config {
    let mut config = config();
    config.debug = true;
    config
}

/// In-memory table service with the paging and write semantics of the real
/// one. Views filter on a single field value.
#[derive(Debug, Default)]
pub struct MemoryRemote {
    tables: RefCell<BTreeMap<String, Vec<Fields>>>,
    views: BTreeMap<String, (String, Value)>,
    next_id: Cell<i64>,
    fetches: Cell<usize>,
    links: RefCell<Vec<(String, String, ExternalId, Vec<ExternalId>)>>,
    /// Table whose pages fail to load.
    unreachable: RefCell<Option<String>>,
    /// Number of upcoming link pushes that fail.
    failing_links: Cell<usize>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self {
            next_id: Cell::new(1000),
            ..Self::default()
        }
    }

    /// Remote rows used across the tests: Ada's parent (3) comes after her,
    /// and the two affiliations link actors and roles.
    pub fn seeded() -> Self {
        let remote = Self::new();
        remote.put(
            "actors",
            vec![
                json!({ "Id": 1, "Name": "Ada Lovelace", "Kind": "(none)", "Parent": [{ "Id": 3 }] }),
                json!({ "Id": 2, "Name": "Analytical Society", "Kind": "organization" }),
                json!({ "Id": 3, "Name": "Charles Babbage", "Kind": "person" }),
            ],
        );
        remote.put(
            "roles",
            vec![
                json!({ "Id": 10, "Title": "Member" }),
                json!({ "Id": 11, "Title": "Founder" }),
            ],
        );
        remote.put(
            "affiliations",
            vec![
                json!({ "Id": 100, "Source": [{ "Id": 1 }], "Target": [{ "Id": 2 }], "Role": [{ "Id": 10 }], "Start": "1834-01-01" }),
                json!({ "Id": 101, "Source": [{ "Id": 3 }], "Target": [{ "Id": 2 }], "Role": [{ "Id": 11 }], "Start": "1812-05-01" }),
                json!({ "Id": 102, "Source": 3, "Target": "2", "Role": null }),
            ],
        );
        remote.put(
            "evidence",
            vec![json!({ "Id": 500, "Title": "Letter", "Date": "1843-07-10", "Channels": "post, email", "Actors": [{ "Id": 1 }, { "Id": 3 }] })],
        );
        remote
    }

    pub fn with_view(mut self, view: &str, field: &str, value: Value) -> Self {
        self.views.insert(view.to_string(), (field.to_string(), value));
        self
    }

    pub fn put(&self, table: &str, rows: Vec<Value>) {
        let rows = rows
            .into_iter()
            .map(|row| match row {
                Value::Object(fields) => fields,
                other => panic!("fixture row is not an object: {other}"),
            })
            .collect();
        self.tables.borrow_mut().insert(table.to_string(), rows);
    }

    /// Overwrites one field of one row, as an edit in the remote UI would.
    pub fn edit(&self, table: &str, id: i64, field: &str, value: Value) {
        let mut tables = self.tables.borrow_mut();
        let row = tables
            .get_mut(table)
            .and_then(|rows| rows.iter_mut().find(|row| row["Id"] == json!(id)))
            .expect("row exists");
        row.insert(field.to_string(), value);
    }

    pub fn rows(&self, table: &str) -> Vec<Fields> {
        self.tables.borrow().get(table).cloned().unwrap_or_default()
    }

    pub fn fetches(&self) -> usize {
        self.fetches.get()
    }

    /// Makes every page request for `table` fail as a rate-limited call would.
    pub fn fail_fetches(&self, table: &str) {
        self.unreachable.replace(Some(table.to_string()));
    }

    pub fn fail_next_links(&self, times: usize) {
        self.failing_links.set(times);
    }

    /// Link pushes that reached the remote.
    pub fn link_calls(&self) -> Vec<(String, String, ExternalId, Vec<ExternalId>)> {
        self.links.borrow().clone()
    }
}

impl RemoteApi for MemoryRemote {
    fn fetch_page(
        &self,
        table: &str,
        view: Option<&str>,
        offset: usize,
        limit: usize,
    ) -> Result<Page> {
        self.fetches.set(self.fetches.get() + 1);
        if self.unreachable.borrow().as_deref() == Some(table) {
            return Err(SyncError::RemoteApi(format!("rate limited reading {table}")));
        }
        let filter = view.and_then(|view| self.views.get(view));
        let rows: Vec<Fields> = self
            .rows(table)
            .into_iter()
            .filter(|row| filter.is_none_or(|(field, value)| row.get(field) == Some(value)))
            .collect();
        let end = (offset + limit).min(rows.len());
        let start = offset.min(end);
        Ok(Page {
            rows: rows[start..end].to_vec(),
            is_last: end >= rows.len(),
        })
    }

    fn create_row(&self, table: &str, fields: &Fields) -> Result<ExternalId> {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let mut row = fields.clone();
        row.insert("Id".to_string(), json!(id));
        self.tables
            .borrow_mut()
            .entry(table.to_string())
            .or_default()
            .push(row);
        Ok(ExternalId::new(id.to_string()))
    }

    fn update_row(&self, table: &str, id: &ExternalId, fields: &Fields) -> Result<()> {
        let mut tables = self.tables.borrow_mut();
        let row = tables
            .get_mut(table)
            .and_then(|rows| {
                rows.iter_mut().find(|row| {
                    row.get("Id").and_then(ExternalId::from_value).as_ref() == Some(id)
                })
            })
            .ok_or_else(|| SyncError::RemoteApi(format!("no row {id} in {table}")))?;
        for (field, value) in fields {
            row.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    fn link_rows(
        &self,
        table: &str,
        link_field: &str,
        id: &ExternalId,
        targets: &[ExternalId],
    ) -> Result<()> {
        let failing = self.failing_links.get();
        if failing > 0 {
            self.failing_links.set(failing - 1);
            return Err(SyncError::RemoteApi(format!("rate limited linking {table}.{link_field}")));
        }
        self.links.borrow_mut().push((
            table.to_string(),
            link_field.to_string(),
            id.clone(),
            targets.to_vec(),
        ));
        let linked: Vec<Value> = targets
            .iter()
            .map(|target| json!({ "Id": target.to_value() }))
            .collect();
        let mut tables = self.tables.borrow_mut();
        if let Some(row) = tables.get_mut(table).and_then(|rows| {
            rows.iter_mut()
                .find(|row| row.get("Id").and_then(ExternalId::from_value).as_ref() == Some(id))
        }) {
            row.insert(link_field.to_string(), Value::Array(linked));
        }
        Ok(())
    }
}

pub fn store() -> SqliteStore {
    SqliteStore::open_in_memory().expect("in-memory store")
}

pub fn find(store: &dyn LocalStore, kind: EntityKind, id: &str) -> Record {
    store
        .find(kind, &ExternalId::new(id))
        .expect("store query")
        .unwrap_or_else(|| panic!("{kind} {id} is missing"))
}

pub fn count(store: &dyn LocalStore, kind: EntityKind) -> usize {
    store.records(kind).expect("store query").len()
}
