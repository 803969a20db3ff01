//! Per entity kind diff of remote rows against local records.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::config::{Config, EntityConfig, ViewConfig};
use crate::error::{Result, SyncError};
use crate::io::remote::{Fields, RemoteApi, fetch_rows};
use crate::io::store::LocalStore;
use crate::mapping::FieldMapper;
use crate::model::{Attributes, EntityKind, ExternalId, NewRecord, RecordId, SyncState};
use crate::policy::{Boundary, FailurePolicy, guard};
use crate::resolve::RelationResolver;

/// State shared by the reconciliation steps of one run.
#[derive(Debug, Default)]
pub struct RunContext {
    pub reconciled: BTreeSet<EntityKind>,
}

/// A change applied to the local store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Create {
        external_id: ExternalId,
    },
    /// Names the attributes and relations that differed.
    Update {
        external_id: ExternalId,
        changed: Vec<String>,
    },
    /// Relationship rows removed; the previously linked records stay.
    Unlink {
        external_id: ExternalId,
        relation: String,
        removed: usize,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub unlinked: usize,
    pub placeholders: usize,
    /// Local records whose row is no longer in the remote set.
    pub orphaned: usize,
    /// Rows discarded by the lenient policy.
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileReport {
    pub kind: EntityKind,
    pub stats: ReconcileStats,
    pub operations: Vec<Operation>,
}

impl ReconcileReport {
    pub fn has_changes(&self) -> bool {
        self.stats.created + self.stats.updated + self.stats.unlinked + self.stats.placeholders > 0
    }

    pub fn updates(&self) -> impl Iterator<Item = &Operation> {
        self.operations
            .iter()
            .filter(|operation| matches!(operation, Operation::Update { .. }))
    }
}

struct RemoteRow<'c> {
    external_id: ExternalId,
    view: Option<&'c ViewConfig>,
    fields: Fields,
}

struct RowOutcome {
    operations: Vec<Operation>,
    placeholders: usize,
}

/// Brings the local records of one kind in line with its remote table.
pub struct Reconciler<'a> {
    config: &'a Config,
    kind: EntityKind,
    entity: &'a EntityConfig,
}

impl<'a> Reconciler<'a> {
    pub fn new(config: &'a Config, kind: EntityKind) -> Result<Self> {
        let entity = config
            .entity(kind)
            .ok_or_else(|| SyncError::InvalidConfig(format!("{kind} has no table configured")))?;
        Ok(Self {
            config,
            kind,
            entity,
        })
    }

    #[instrument(level = "info", skip_all, fields(kind = %self.kind, table = %self.entity.table))]
    pub fn run(
        &self,
        api: &dyn RemoteApi,
        store: &mut dyn LocalStore,
        policy: &mut dyn FailurePolicy,
        context: &RunContext,
    ) -> Result<ReconcileReport> {
        let existing: HashSet<ExternalId> = store
            .records(self.kind)?
            .into_iter()
            .filter_map(|record| record.external_id)
            .collect();

        let rows = self.fetch(api)?;
        let pending: HashSet<ExternalId> = rows
            .iter()
            .filter_map(|row| row.as_ref().ok())
            .map(|row| row.external_id.clone())
            .collect();
        info!(rows = rows.len(), local = existing.len(), "fetched remote rows");

        let resolver = RelationResolver::new(self.config, self.kind, &context.reconciled, &pending);
        for spec in &self.entity.relations {
            resolver.check_order(spec)?;
        }

        let mut report = ReconcileReport {
            kind: self.kind,
            stats: ReconcileStats::default(),
            operations: Vec::new(),
        };

        for row in rows {
            let outcome = match row {
                Ok(row) => {
                    let boundary = Boundary::row(self.kind, row.external_id.to_string());
                    guard(policy, store, &boundary, |store, _| {
                        self.apply_row(store, &resolver, &row)
                    })?
                }
                Err(error) => {
                    let boundary = Boundary::row(self.kind, "<missing>");
                    guard(policy, store, &boundary, |_, _| Err::<RowOutcome, _>(error))?
                }
            };
            let Some(outcome) = outcome else {
                report.stats.failed += 1;
                continue;
            };
            report.stats.placeholders += outcome.placeholders;
            if outcome.operations.is_empty() {
                report.stats.unchanged += 1;
            }
            for operation in &outcome.operations {
                match operation {
                    Operation::Create { .. } => report.stats.created += 1,
                    Operation::Update { .. } => report.stats.updated += 1,
                    Operation::Unlink { removed, .. } => report.stats.unlinked += removed,
                }
            }
            report.operations.extend(outcome.operations);
        }

        report.stats.orphaned = existing.difference(&pending).count();
        info!(
            created = report.stats.created,
            updated = report.stats.updated,
            unchanged = report.stats.unchanged,
            unlinked = report.stats.unlinked,
            placeholders = report.stats.placeholders,
            orphaned = report.stats.orphaned,
            failed = report.stats.failed,
            "reconciled"
        );
        Ok(report)
    }

    /// Reads every view of the table (or the whole table) into memory so
    /// forward references between rows of this kind can be recognised.
    /// Rows without an identifier are kept as errors for the row guard.
    fn fetch(&self, api: &dyn RemoteApi) -> Result<Vec<Result<RemoteRow<'a>>>> {
        let views: Vec<Option<&'a ViewConfig>> = if self.entity.views.is_empty() {
            vec![None]
        } else {
            self.entity.views.iter().map(Some).collect()
        };

        let mut rows = Vec::new();
        for view in views {
            let stream = fetch_rows(
                api,
                &self.entity.table,
                view.map(|view| view.id.as_str()),
                self.config.remote.page_size,
            );
            for fields in stream {
                let fields = fields?;
                let row = match fields.get(&self.entity.id_field).and_then(ExternalId::from_value) {
                    Some(external_id) => Ok(RemoteRow {
                        external_id,
                        view,
                        fields,
                    }),
                    None => Err(SyncError::Mapping {
                        kind: self.kind,
                        external_id: "<missing>".to_string(),
                        attribute: self.entity.id_field.clone(),
                        message: "row has no identifier".to_string(),
                    }),
                };
                rows.push(row);
            }
        }
        Ok(rows)
    }

    fn apply_row(
        &self,
        store: &mut dyn LocalStore,
        resolver: &RelationResolver<'_>,
        row: &RemoteRow<'_>,
    ) -> Result<RowOutcome> {
        let external_id = row.external_id.as_str();
        let mapper = FieldMapper::new(
            self.kind,
            self.entity.fields_for(row.view),
            self.config.null_label.clone(),
        );
        let mut attributes = mapper.map_row(external_id, &row.fields)?;
        if let Some(view) = row.view {
            attributes.extend(view.constants.clone());
        }

        let mut placeholders = 0;
        let mut targets: BTreeMap<&str, BTreeSet<RecordId>> = BTreeMap::new();
        for spec in &self.entity.relations {
            let references = resolver.references(spec, &row.fields, external_id)?;
            let resolved = resolver.resolve(store, spec, external_id, &references)?;
            placeholders += resolved.placeholders;
            targets.insert(spec.name.as_str(), resolved.targets);
        }

        let operations = match store.find(self.kind, &row.external_id)? {
            None => {
                let record = store.insert(&NewRecord::new(
                    self.kind,
                    Some(row.external_id.clone()),
                    attributes,
                ))?;
                for (relation, ids) in &targets {
                    if !ids.is_empty() {
                        store.set_links(record.id, relation, ids)?;
                    }
                }
                debug!(external_id, id = record.id, "created");
                vec![Operation::Create {
                    external_id: row.external_id.clone(),
                }]
            }
            Some(record) => {
                let mut changed = changed_attributes(&record.attributes, &attributes);
                let mut unlinks = Vec::new();
                let current = store.links(record.id)?;
                for (relation, ids) in &targets {
                    let before = current.get(*relation).cloned().unwrap_or_default();
                    if before == *ids {
                        continue;
                    }
                    changed.push(relation.to_string());
                    let removed = before.difference(ids).count();
                    if removed > 0 {
                        unlinks.push(Operation::Unlink {
                            external_id: row.external_id.clone(),
                            relation: relation.to_string(),
                            removed,
                        });
                    }
                    store.set_links(record.id, relation, ids)?;
                }
                if record.is_placeholder() {
                    changed.push("state".to_string());
                }

                if changed.is_empty() {
                    Vec::new()
                } else {
                    store.update(record.id, &attributes, SyncState::Complete)?;
                    debug!(external_id, id = record.id, ?changed, "updated");
                    let mut operations = vec![Operation::Update {
                        external_id: row.external_id.clone(),
                        changed,
                    }];
                    operations.extend(unlinks);
                    operations
                }
            }
        };

        Ok(RowOutcome {
            operations,
            placeholders,
        })
    }
}

/// Attributes whose stored value differs from the mapped one, including
/// attributes that disappeared from the mapping.
fn changed_attributes(stored: &Attributes, mapped: &Attributes) -> Vec<String> {
    let keys: BTreeSet<&String> = stored.keys().chain(mapped.keys()).collect();
    keys.into_iter()
        .filter(|key| {
            stored.get(*key).unwrap_or(&Value::Null) != mapped.get(*key).unwrap_or(&Value::Null)
        })
        .cloned()
        .collect()
}
