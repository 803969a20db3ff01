//! Local relational store of synchronized entities.

use std::collections::BTreeSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::model::{
    Attributes, EntityKind, ExternalId, Links, NewRecord, Record, RecordId, SyncState,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS records (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    kind        TEXT NOT NULL,
    external_id TEXT,
    sync_uuid   TEXT NOT NULL UNIQUE,
    attributes  TEXT NOT NULL,
    state       TEXT NOT NULL,
    dirty       INTEGER NOT NULL DEFAULT 0,
    synced_at   TEXT,
    UNIQUE (kind, external_id)
);
CREATE TABLE IF NOT EXISTS links (
    source_id INTEGER NOT NULL REFERENCES records(id),
    relation  TEXT NOT NULL,
    target_id INTEGER NOT NULL REFERENCES records(id),
    PRIMARY KEY (source_id, relation, target_id)
);
CREATE INDEX IF NOT EXISTS records_by_kind ON records(kind);
";

const RECORD_COLUMNS: &str =
    "id, kind, external_id, sync_uuid, attributes, state, dirty, synced_at";

/// Transactional access to local records, keyed by (kind, external id).
///
/// Scopes nest: `begin` opens a named scope inside the current one, `commit`
/// folds it into its parent and `rollback` discards everything written since
/// the matching `begin`.
pub trait LocalStore {
    fn begin(&mut self, scope: &str) -> Result<()>;
    fn commit(&mut self, scope: &str) -> Result<()>;
    fn rollback(&mut self, scope: &str) -> Result<()>;

    fn get(&self, id: RecordId) -> Result<Option<Record>>;
    fn find(&self, kind: EntityKind, external_id: &ExternalId) -> Result<Option<Record>>;
    fn records(&self, kind: EntityKind) -> Result<Vec<Record>>;

    /// Inserts a record written by import. It starts clean.
    fn insert(&mut self, record: &NewRecord) -> Result<Record>;
    /// Overwrites the attributes of an imported record, which then mirrors
    /// its remote row again.
    fn update(&mut self, id: RecordId, attributes: &Attributes, state: SyncState) -> Result<()>;

    fn links(&self, id: RecordId) -> Result<Links>;
    /// Replaces the targets of one relation of a record.
    fn set_links(&mut self, id: RecordId, relation: &str, targets: &BTreeSet<RecordId>)
    -> Result<()>;

    /// Creates a local-origin record with no external identifier.
    fn create_local(&mut self, kind: EntityKind, attributes: &Attributes, links: &Links)
    -> Result<Record>;
    /// Applies a local edit and marks the record for export.
    fn edit_local(&mut self, id: RecordId, attributes: &Attributes) -> Result<()>;

    fn assign_external_id(&mut self, id: RecordId, external_id: &ExternalId) -> Result<()>;
    /// Marks a record as exported.
    fn mark_synced(&mut self, id: RecordId, at: DateTime<Utc>) -> Result<()>;
}

/// [`LocalStore`] backed by SQLite. Scopes map onto savepoints.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    fn query_records(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Record>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, RawRecord::from_row)?;
        let records = rows.map(|row| row?.into_record()).collect();
        records
    }

    fn query_record(&self, sql: &str, params: impl rusqlite::Params) -> Result<Option<Record>> {
        let raw = self
            .conn
            .query_row(sql, params, RawRecord::from_row)
            .optional()?;
        raw.map(RawRecord::into_record).transpose()
    }

    fn expect_record(&self, id: RecordId) -> Result<Record> {
        self.get(id)?
            .ok_or(SyncError::Store(rusqlite::Error::QueryReturnedNoRows))
    }
}

impl LocalStore for SqliteStore {
    fn begin(&mut self, scope: &str) -> Result<()> {
        self.conn.execute_batch(&format!("SAVEPOINT {scope};"))?;
        Ok(())
    }

    fn commit(&mut self, scope: &str) -> Result<()> {
        self.conn.execute_batch(&format!("RELEASE {scope};"))?;
        Ok(())
    }

    fn rollback(&mut self, scope: &str) -> Result<()> {
        self.conn
            .execute_batch(&format!("ROLLBACK TO {scope}; RELEASE {scope};"))?;
        Ok(())
    }

    fn get(&self, id: RecordId) -> Result<Option<Record>> {
        self.query_record(
            &format!("SELECT {RECORD_COLUMNS} FROM records WHERE id = ?1"),
            params![id],
        )
    }

    fn find(&self, kind: EntityKind, external_id: &ExternalId) -> Result<Option<Record>> {
        self.query_record(
            &format!("SELECT {RECORD_COLUMNS} FROM records WHERE kind = ?1 AND external_id = ?2"),
            params![kind.as_str(), external_id.as_str()],
        )
    }

    fn records(&self, kind: EntityKind) -> Result<Vec<Record>> {
        self.query_records(
            &format!("SELECT {RECORD_COLUMNS} FROM records WHERE kind = ?1 ORDER BY id"),
            params![kind.as_str()],
        )
    }

    fn insert(&mut self, record: &NewRecord) -> Result<Record> {
        self.conn.execute(
            "INSERT INTO records (kind, external_id, sync_uuid, attributes, state, dirty)
             VALUES (?1, ?2, ?3, ?4, ?5, 0)",
            params![
                record.kind.as_str(),
                record.external_id.as_ref().map(ExternalId::as_str),
                Uuid::new_v4().to_string(),
                serde_json::to_string(&record.attributes)?,
                record.state.as_str(),
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        self.expect_record(id)
    }

    fn update(&mut self, id: RecordId, attributes: &Attributes, state: SyncState) -> Result<()> {
        self.conn.execute(
            "UPDATE records SET attributes = ?2, state = ?3, dirty = 0 WHERE id = ?1",
            params![id, serde_json::to_string(attributes)?, state.as_str()],
        )?;
        Ok(())
    }

    fn links(&self, id: RecordId) -> Result<Links> {
        let mut stmt = self
            .conn
            .prepare("SELECT relation, target_id FROM links WHERE source_id = ?1")?;
        let rows = stmt.query_map(params![id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, RecordId>(1)?))
        })?;
        let mut links = Links::new();
        for row in rows {
            let (relation, target) = row?;
            links.entry(relation).or_default().insert(target);
        }
        Ok(links)
    }

    fn set_links(
        &mut self,
        id: RecordId,
        relation: &str,
        targets: &BTreeSet<RecordId>,
    ) -> Result<()> {
        self.conn.execute(
            "DELETE FROM links WHERE source_id = ?1 AND relation = ?2",
            params![id, relation],
        )?;
        let mut insert = self.conn.prepare(
            "INSERT INTO links (source_id, relation, target_id) VALUES (?1, ?2, ?3)",
        )?;
        for target in targets {
            insert.execute(params![id, relation, target])?;
        }
        Ok(())
    }

    fn create_local(
        &mut self,
        kind: EntityKind,
        attributes: &Attributes,
        links: &Links,
    ) -> Result<Record> {
        self.conn.execute(
            "INSERT INTO records (kind, external_id, sync_uuid, attributes, state, dirty)
             VALUES (?1, NULL, ?2, ?3, ?4, 1)",
            params![
                kind.as_str(),
                Uuid::new_v4().to_string(),
                serde_json::to_string(attributes)?,
                SyncState::Complete.as_str(),
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        for (relation, targets) in links {
            self.set_links(id, relation, targets)?;
        }
        self.expect_record(id)
    }

    fn edit_local(&mut self, id: RecordId, attributes: &Attributes) -> Result<()> {
        self.conn.execute(
            "UPDATE records SET attributes = ?2, dirty = 1 WHERE id = ?1",
            params![id, serde_json::to_string(attributes)?],
        )?;
        Ok(())
    }

    fn assign_external_id(&mut self, id: RecordId, external_id: &ExternalId) -> Result<()> {
        self.conn.execute(
            "UPDATE records SET external_id = ?2 WHERE id = ?1",
            params![id, external_id.as_str()],
        )?;
        Ok(())
    }

    fn mark_synced(&mut self, id: RecordId, at: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "UPDATE records SET dirty = 0, synced_at = ?2 WHERE id = ?1",
            params![id, at.to_rfc3339()],
        )?;
        Ok(())
    }
}

struct RawRecord {
    id: RecordId,
    kind: String,
    external_id: Option<String>,
    sync_uuid: String,
    attributes: String,
    state: String,
    dirty: bool,
    synced_at: Option<String>,
}

impl RawRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            external_id: row.get(2)?,
            sync_uuid: row.get(3)?,
            attributes: row.get(4)?,
            state: row.get(5)?,
            dirty: row.get(6)?,
            synced_at: row.get(7)?,
        })
    }

    fn into_record(self) -> Result<Record> {
        let corrupt = |what: &str| SyncError::Corrupt(format!("record {} has a bad {what}", self.id));
        let kind = EntityKind::parse(&self.kind).ok_or_else(|| corrupt("kind"))?;
        let state = SyncState::parse(&self.state).ok_or_else(|| corrupt("state"))?;
        let sync_uuid = Uuid::parse_str(&self.sync_uuid).map_err(|_| corrupt("sync uuid"))?;
        let synced_at = self
            .synced_at
            .as_deref()
            .map(DateTime::parse_from_rfc3339)
            .transpose()
            .map_err(|_| corrupt("synced_at"))?
            .map(|stamp| stamp.with_timezone(&Utc));
        Ok(Record {
            id: self.id,
            kind,
            external_id: self.external_id.map(ExternalId::new),
            sync_uuid,
            attributes: serde_json::from_str(&self.attributes)?,
            state,
            dirty: self.dirty,
            synced_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn attributes(value: serde_json::Value) -> Attributes {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn rollback_discards_scope() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        store.begin("outer").unwrap();
        store
            .insert(&NewRecord::new(
                EntityKind::Role,
                Some(ExternalId::new("1")),
                attributes(json!({ "label": "Chair" })),
            ))
            .unwrap();
        store.rollback("outer").unwrap();

        assert!(store.records(EntityKind::Role).unwrap().is_empty());
    }

    #[test]
    fn external_ids_are_unique_per_kind() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let id = Some(ExternalId::new("5"));
        store
            .insert(&NewRecord::new(EntityKind::Role, id.clone(), Attributes::new()))
            .unwrap();
        store
            .insert(&NewRecord::new(EntityKind::Actor, id.clone(), Attributes::new()))
            .unwrap();

        let duplicate = store.insert(&NewRecord::new(EntityKind::Role, id, Attributes::new()));
        assert!(matches!(duplicate, Err(SyncError::Store(_))));
    }

    #[test]
    fn set_links_replaces_targets() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let a = store
            .create_local(EntityKind::Actor, &Attributes::new(), &Links::new())
            .unwrap();
        let b = store
            .create_local(EntityKind::Actor, &Attributes::new(), &Links::new())
            .unwrap();
        let evidence = store
            .create_local(EntityKind::Evidence, &Attributes::new(), &Links::new())
            .unwrap();

        store
            .set_links(evidence.id, "actors", &BTreeSet::from([a.id, b.id]))
            .unwrap();
        store
            .set_links(evidence.id, "actors", &BTreeSet::from([b.id]))
            .unwrap();

        let links = store.links(evidence.id).unwrap();
        assert_eq!(links["actors"], BTreeSet::from([b.id]));
        assert!(store.get(a.id).unwrap().is_some());
        assert!(evidence.dirty);
    }
}
