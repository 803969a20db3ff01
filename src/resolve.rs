//! Resolution of linked-row references into local relationships.

use std::collections::{BTreeSet, HashSet};

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::io::remote::Fields;
use crate::io::store::LocalStore;
use crate::mapping::normalize;
use crate::model::{Attributes, EntityKind, ExternalId, NewRecord, RecordId, entities};

/// A relation from one entity kind to another, read from a link field.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RelationSpec {
    /// Local relation name.
    pub name: String,
    /// Remote field holding the references.
    pub field: String,
    pub target: EntityKind,
    #[serde(default)]
    pub cardinality: Cardinality,
    #[serde(default)]
    pub required: bool,
    /// Create missing targets instead of failing.
    #[serde(default)]
    pub lazy_create: bool,
    /// Key holding the identifier when references are linked-row objects.
    #[serde(default = "default_link_key")]
    pub link_key: String,
    /// Remote link field written through the links endpoint on export.
    #[serde(default)]
    pub link_field: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cardinality {
    One,
    #[default]
    Many,
}

fn default_link_key() -> String {
    "Id".to_string()
}

/// Local targets of one relation of one row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolved {
    pub targets: BTreeSet<RecordId>,
    pub placeholders: usize,
}

/// Resolves the relations of one entity kind during a run.
pub struct RelationResolver<'a> {
    config: &'a Config,
    kind: EntityKind,
    /// Kinds whose reconciliation step already ran in this run.
    reconciled: &'a BTreeSet<EntityKind>,
    /// External ids of the rows of `kind` in the current remote set.
    pending: &'a HashSet<ExternalId>,
}

impl<'a> RelationResolver<'a> {
    pub fn new(
        config: &'a Config,
        kind: EntityKind,
        reconciled: &'a BTreeSet<EntityKind>,
        pending: &'a HashSet<ExternalId>,
    ) -> Self {
        Self {
            config,
            kind,
            reconciled,
            pending,
        }
    }

    /// Reads the references of a relation from a row, enforcing cardinality
    /// and presence.
    pub fn references(
        &self,
        spec: &RelationSpec,
        row: &Fields,
        external_id: &str,
    ) -> Result<Vec<ExternalId>> {
        let null_label = self.config.null_label.as_deref();
        let mut references: Vec<ExternalId> = Vec::new();
        let mut push = |id: ExternalId| {
            if Some(id.as_str()) != null_label && !references.contains(&id) {
                references.push(id);
            }
        };

        match normalize(row.get(&spec.field), null_label) {
            None => {}
            Some(Value::Array(items)) => {
                for item in &items {
                    push(self.reference(spec, item, external_id)?);
                }
            }
            Some(Value::String(text)) => {
                text.split(',')
                    .filter_map(|part| ExternalId::from_value(&Value::String(part.into())))
                    .for_each(&mut push);
            }
            Some(other) => push(self.reference(spec, &other, external_id)?),
        }

        if spec.cardinality == Cardinality::One && references.len() > 1 {
            return Err(self.mapping_error(
                spec,
                external_id,
                format!("expected one reference, got {}", references.len()),
            ));
        }
        if spec.required && references.is_empty() {
            return Err(self.mapping_error(spec, external_id, "required link is empty".into()));
        }
        Ok(references)
    }

    fn reference(&self, spec: &RelationSpec, item: &Value, external_id: &str) -> Result<ExternalId> {
        let id = match item {
            Value::Object(object) => object.get(&spec.link_key).and_then(ExternalId::from_value),
            scalar => ExternalId::from_value(scalar),
        };
        id.ok_or_else(|| {
            self.mapping_error(spec, external_id, format!("unreadable link reference {item}"))
        })
    }

    /// Fails when the relation targets a tabled kind that has not been
    /// reconciled yet in this run.
    pub fn check_order(&self, spec: &RelationSpec) -> Result<()> {
        let target = spec.target;
        if target != self.kind && self.config.has_table(target) && !self.reconciled.contains(&target)
        {
            return Err(SyncError::DependencyOrder {
                kind: self.kind,
                depends_on: target,
            });
        }
        Ok(())
    }

    /// Maps references to local record ids, creating placeholders or
    /// vocabulary entries where the relation allows it.
    pub fn resolve(
        &self,
        store: &mut dyn LocalStore,
        spec: &RelationSpec,
        external_id: &str,
        references: &[ExternalId],
    ) -> Result<Resolved> {
        self.check_order(spec)?;
        let mut resolved = Resolved::default();

        for reference in references {
            if let Some(record) = store.find(spec.target, reference)? {
                resolved.targets.insert(record.id);
                continue;
            }

            let record = if !self.config.has_table(spec.target) && spec.lazy_create {
                let mut attributes = Attributes::new();
                attributes.insert(
                    entities::LABEL.to_string(),
                    Value::String(reference.to_string()),
                );
                store.insert(&NewRecord::new(
                    spec.target,
                    Some(reference.clone()),
                    attributes,
                ))?
            } else if spec.lazy_create
                || (spec.target == self.kind && self.pending.contains(reference))
            {
                resolved.placeholders += 1;
                store.insert(&NewRecord::placeholder(spec.target, reference.clone()))?
            } else {
                return Err(SyncError::ReferentialIntegrity {
                    kind: self.kind,
                    external_id: external_id.to_string(),
                    relation: spec.name.clone(),
                    target: spec.target,
                    missing: reference.to_string(),
                });
            };

            debug!(
                kind = %self.kind,
                relation = %spec.name,
                target = %spec.target,
                reference = %reference,
                placeholder = record.is_placeholder(),
                "created missing link target"
            );
            resolved.targets.insert(record.id);
        }

        Ok(resolved)
    }

    fn mapping_error(&self, spec: &RelationSpec, external_id: &str, message: String) -> SyncError {
        SyncError::Mapping {
            kind: self.kind,
            external_id: external_id.to_string(),
            attribute: spec.name.clone(),
            message,
        }
    }
}
