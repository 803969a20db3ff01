//! Pushes locally created or edited records back to the remote tables.

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::config::{Config, EntityConfig};
use crate::error::{Result, SyncError};
use crate::io::remote::RemoteApi;
use crate::io::store::LocalStore;
use crate::mapping::FieldMapper;
use crate::model::{EntityKind, ExternalId, Links, Record, RecordId, entities};
use crate::policy::{Boundary, Failure, FailurePolicy, for_debug_flag, isolate};
use crate::resolve::{Cardinality, RelationSpec};
use crate::sync::DEPENDENCY_ORDER;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportStats {
    pub created: usize,
    pub updated: usize,
    /// Link field writes through the links endpoint.
    pub linked: usize,
    /// Clean records not selected for export.
    pub skipped: usize,
    pub placeholders: usize,
    /// Records whose row write or link push failed. A record whose row was
    /// written but whose links failed counts here as well as in `created` or
    /// `updated`.
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExportReport {
    pub kind: EntityKind,
    pub stats: ExportStats,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExportRunReport {
    pub policy: &'static str,
    pub steps: Vec<ExportReport>,
    pub failures: Vec<Failure>,
}

impl ExportRunReport {
    pub fn step(&self, kind: EntityKind) -> Option<&ExportReport> {
        self.steps.iter().find(|step| step.kind == kind)
    }
}

/// A record's row written to the remote, with the link pushes still due.
struct Written<'e> {
    external_id: ExternalId,
    created: bool,
    pushes: Vec<(&'e str, Vec<ExternalId>)>,
}

/// Writes local changes of every exported kind, in dependency order so that
/// link targets already carry an external identifier.
pub struct Exporter<'a> {
    config: &'a Config,
    api: &'a dyn RemoteApi,
    store: &'a mut dyn LocalStore,
}

impl<'a> Exporter<'a> {
    pub fn new(config: &'a Config, api: &'a dyn RemoteApi, store: &'a mut dyn LocalStore) -> Self {
        Self { config, api, store }
    }

    pub fn run(&mut self) -> Result<ExportRunReport> {
        let mut policy = for_debug_flag(self.config.debug);
        self.run_with(policy.as_mut())
    }

    /// Every record is pushed inside its own scopes whatever the policy: remote
    /// writes cannot be undone, so the local bookkeeping of rows that were
    /// already written is kept when a later push fails.
    #[instrument(level = "info", skip_all, fields(policy = policy.name()))]
    pub fn run_with(&mut self, policy: &mut dyn FailurePolicy) -> Result<ExportRunReport> {
        let config = self.config;
        let mut steps = Vec::new();
        for kind in DEPENDENCY_ORDER {
            let Some(entity) = config.entity(kind).filter(|entity| entity.export) else {
                continue;
            };
            steps.push(self.export_kind(kind, entity, policy)?);
        }

        let report = ExportRunReport {
            policy: policy.name(),
            steps,
            failures: policy.failures().to_vec(),
        };
        info!(
            steps = report.steps.len(),
            failures = report.failures.len(),
            "export finished"
        );
        Ok(report)
    }

    #[instrument(level = "info", skip_all, fields(kind = %kind, table = %entity.table))]
    fn export_kind(
        &mut self,
        kind: EntityKind,
        entity: &EntityConfig,
        policy: &mut dyn FailurePolicy,
    ) -> Result<ExportReport> {
        let mut stats = ExportStats::default();
        for record in self.store.records(kind)? {
            if record.is_placeholder() {
                stats.placeholders += 1;
                continue;
            }
            let selected = entity.export_all || record.dirty || record.external_id.is_none();
            if !selected {
                stats.skipped += 1;
                continue;
            }

            let label = match &record.external_id {
                Some(external_id) => external_id.to_string(),
                None => format!("local:{}", record.id),
            };
            let boundary = Boundary::row(kind, label);
            let config = self.config;
            let api = self.api;

            // The row write commits on its own so a newly assigned external id
            // survives a failing link push.
            let written = isolate(policy, &mut *self.store, &boundary, |store, _| {
                write_record(config, api, store, entity, &record)
            })?;
            let Some(written) = written else {
                stats.failed += 1;
                continue;
            };
            if written.created {
                stats.created += 1;
            } else {
                stats.updated += 1;
            }

            let boundary = Boundary::row(kind, written.external_id.to_string());
            let linked = isolate(policy, &mut *self.store, &boundary, |store, _| {
                push_links(api, store, entity, &record, &written)
            })?;
            match linked {
                Some(linked) => stats.linked += linked,
                None => stats.failed += 1,
            }
        }

        info!(
            created = stats.created,
            updated = stats.updated,
            linked = stats.linked,
            skipped = stats.skipped,
            failed = stats.failed,
            "exported"
        );
        Ok(ExportReport { kind, stats })
    }
}

/// Creates or updates the remote row of `record`. A new row's external id is
/// stored right away.
fn write_record<'e>(
    config: &Config,
    api: &dyn RemoteApi,
    store: &mut dyn LocalStore,
    entity: &'e EntityConfig,
    record: &Record,
) -> Result<Written<'e>> {
    let view = entity
        .views
        .iter()
        .find(|view| view.matches(&record.attributes));
    let mapper = FieldMapper::new(record.kind, entity.fields_for(view), config.null_label.clone());
    let mut payload = mapper.to_payload(&record.attributes);
    if let Some(field) = &entity.sync_uuid_field {
        payload.insert(field.clone(), Value::String(record.sync_uuid.to_string()));
    }
    if let Some(view) = view {
        for (field, value) in &view.payload {
            payload.insert(field.clone(), value.clone());
        }
    }

    let links = store.links(record.id)?;
    let mut pushes = Vec::new();
    for relation in &entity.relations {
        let references = relation_references(store, record, relation, &links)?;
        match &relation.link_field {
            Some(link_field) => pushes.push((link_field.as_str(), references)),
            None => {
                payload.insert(relation.field.clone(), relation_value(relation, &references));
            }
        }
    }

    let (external_id, created) = match &record.external_id {
        Some(external_id) => {
            api.update_row(&entity.table, external_id, &payload)?;
            (external_id.clone(), false)
        }
        None => {
            let external_id = api.create_row(&entity.table, &payload)?;
            store.assign_external_id(record.id, &external_id)?;
            (external_id, true)
        }
    };
    Ok(Written {
        external_id,
        created,
        pushes,
    })
}

/// Pushes link fields and marks the record clean. Until this succeeds the
/// record stays dirty and is exported again next time.
fn push_links(
    api: &dyn RemoteApi,
    store: &mut dyn LocalStore,
    entity: &EntityConfig,
    record: &Record,
    written: &Written<'_>,
) -> Result<usize> {
    let mut linked = 0;
    for (link_field, references) in &written.pushes {
        if references.is_empty() {
            continue;
        }
        api.link_rows(&entity.table, link_field, &written.external_id, references)?;
        linked += 1;
    }

    store.mark_synced(record.id, Utc::now())?;
    debug!(
        kind = %record.kind,
        id = record.id,
        external_id = %written.external_id,
        created = written.created,
        linked,
        "pushed"
    );
    Ok(linked)
}

/// Remote references of the targets of one relation of `record`.
pub(crate) fn relation_references(
    store: &dyn LocalStore,
    record: &Record,
    relation: &RelationSpec,
    links: &Links,
) -> Result<Vec<ExternalId>> {
    let Some(targets) = links.get(&relation.name) else {
        return Ok(Vec::new());
    };
    targets
        .iter()
        .map(|target| target_reference(store, record, relation, *target))
        .collect()
}

/// The remote reference of a link target: its label for vocabularies, its
/// external identifier otherwise.
fn target_reference(
    store: &dyn LocalStore,
    record: &Record,
    relation: &RelationSpec,
    target: RecordId,
) -> Result<ExternalId> {
    let missing = || SyncError::ReferentialIntegrity {
        kind: record.kind,
        external_id: record
            .external_id
            .as_ref()
            .map_or_else(|| format!("local:{}", record.id), ExternalId::to_string),
        relation: relation.name.clone(),
        target: relation.target,
        missing: format!("local:{target}"),
    };

    let target = store.get(target)?.ok_or_else(missing)?;
    if !relation.target.is_tabled() {
        if let Some(label) = target.text(entities::LABEL) {
            return Ok(ExternalId::new(label));
        }
    }
    target.external_id.ok_or_else(missing)
}

/// Renders references the way link fields are read back on import. To-many
/// relations are written as arrays so labels containing commas stay whole.
pub(crate) fn relation_value(relation: &RelationSpec, references: &[ExternalId]) -> Value {
    match (relation.cardinality, references) {
        (_, []) => Value::Null,
        (Cardinality::One, [reference]) => reference.to_value(),
        _ => Value::Array(references.iter().map(ExternalId::to_value).collect()),
    }
}
