//! Typed read views over generic [`Record`]s.
//!
//! The engine itself only ever handles attribute maps; these views exist for
//! collaborators that want the fixed entity shapes back. They rely on the
//! attribute and relation naming conventions listed as constants below.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ExternalId, Links, Record, RecordId};
use crate::error::{Result, SyncError};

pub const NAME: &str = "name";
pub const ACTOR_KIND: &str = "actor_kind";
pub const METADATA: &str = "metadata";
pub const LABEL: &str = "label";
pub const START_DATE: &str = "start_date";
pub const END_DATE: &str = "end_date";
pub const TITLE: &str = "title";
pub const DESCRIPTION: &str = "description";
pub const DATE: &str = "date";
pub const EVIDENCE_TYPE: &str = "evidence_type";
pub const SPREAD_LEVEL: &str = "spread_level";
pub const ATTACHMENTS: &str = "attachments";
pub const URL: &str = "url";
pub const DOMAIN: &str = "domain";
pub const DOCUMENT_NUMBER: &str = "document_number";

pub const REL_SOURCE_ACTOR: &str = "source_actor";
pub const REL_TARGET_ACTOR: &str = "target_actor";
pub const REL_ROLE: &str = "role";
pub const REL_ACTORS: &str = "actors";
pub const REL_CHANNELS: &str = "channels";
pub const REL_CATEGORIES: &str = "categories";
pub const REL_SOURCES: &str = "sources";
pub const REL_SUBMITTER: &str = "submitter";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorKind {
    Person,
    Organization,
}

impl ActorKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "person" => Some(ActorKind::Person),
            "organization" => Some(ActorKind::Organization),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Actor {
    pub id: RecordId,
    pub external_id: Option<ExternalId>,
    pub name: String,
    pub kind: ActorKind,
    pub metadata: Value,
}

impl Actor {
    /// A missing kind reads as a person; any other unknown value is a
    /// mapping error.
    pub fn from_record(record: &Record) -> Result<Self> {
        let kind = match record.text(ACTOR_KIND) {
            None => ActorKind::Person,
            Some(text) => ActorKind::parse(text).ok_or_else(|| SyncError::Mapping {
                kind: record.kind,
                external_id: record
                    .external_id
                    .as_ref()
                    .map_or_else(|| format!("local:{}", record.id), ExternalId::to_string),
                attribute: ACTOR_KIND.to_string(),
                message: format!("unknown actor kind '{text}'"),
            })?,
        };
        Ok(Self {
            id: record.id,
            external_id: record.external_id.clone(),
            name: record.text(NAME).unwrap_or_default().to_string(),
            kind,
            metadata: record.attribute(METADATA).cloned().unwrap_or(Value::Null),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Role {
    pub id: RecordId,
    pub external_id: Option<ExternalId>,
    pub label: String,
}

impl Role {
    pub fn from_record(record: &Record) -> Self {
        Self {
            id: record.id,
            external_id: record.external_id.clone(),
            label: record.text(LABEL).unwrap_or_default().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Affiliation {
    pub id: RecordId,
    pub external_id: Option<ExternalId>,
    pub source_actor: Option<RecordId>,
    pub target_actor: Option<RecordId>,
    pub role: Option<RecordId>,
    pub valid_from: Option<NaiveDate>,
    pub valid_until: Option<NaiveDate>,
}

impl Affiliation {
    pub fn from_record(record: &Record, links: &Links) -> Self {
        Self {
            id: record.id,
            external_id: record.external_id.clone(),
            source_actor: single_link(links, REL_SOURCE_ACTOR),
            target_actor: single_link(links, REL_TARGET_ACTOR),
            role: single_link(links, REL_ROLE),
            valid_from: date_attribute(record, START_DATE),
            valid_until: date_attribute(record, END_DATE),
        }
    }

    /// Whether the affiliation was in effect on the given day. Open bounds
    /// count as unbounded.
    pub fn is_valid_on(&self, day: NaiveDate) -> bool {
        self.valid_from.is_none_or(|from| from <= day)
            && self.valid_until.is_none_or(|until| day <= until)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Evidence {
    pub id: RecordId,
    pub external_id: Option<ExternalId>,
    pub title: String,
    pub description: Option<String>,
    pub date: Option<NaiveDate>,
    pub evidence_type: Option<String>,
    pub spread_level: Option<String>,
    pub attachments: Vec<Value>,
    pub actors: Vec<RecordId>,
    pub channels: Vec<RecordId>,
    pub categories: Vec<RecordId>,
    pub sources: Vec<RecordId>,
}

impl Evidence {
    pub fn from_record(record: &Record, links: &Links) -> Self {
        let attachments = match record.attribute(ATTACHMENTS) {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        };
        Self {
            id: record.id,
            external_id: record.external_id.clone(),
            title: record.text(TITLE).unwrap_or_default().to_string(),
            description: record.text(DESCRIPTION).map(str::to_string),
            date: date_attribute(record, DATE),
            evidence_type: record.text(EVIDENCE_TYPE).map(str::to_string),
            spread_level: record.text(SPREAD_LEVEL).map(str::to_string),
            attachments,
            actors: all_links(links, REL_ACTORS),
            channels: all_links(links, REL_CHANNELS),
            categories: all_links(links, REL_CATEGORIES),
            sources: all_links(links, REL_SOURCES),
        }
    }
}

/// Provenance of an evidence item.
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    /// A recorded submission made by an actor.
    Submission {
        id: RecordId,
        submitter: Option<RecordId>,
        document_number: String,
    },
    /// A record derived from a public URL.
    Url {
        id: RecordId,
        url: String,
        domain: Option<String>,
    },
}

impl Source {
    pub fn from_record(record: &Record, links: &Links) -> Self {
        match record.text(DOCUMENT_NUMBER).filter(|number| !number.is_empty()) {
            Some(number) => Source::Submission {
                id: record.id,
                submitter: single_link(links, REL_SUBMITTER),
                document_number: number.to_string(),
            },
            None => Source::Url {
                id: record.id,
                url: record.text(URL).unwrap_or_default().to_string(),
                domain: record.text(DOMAIN).map(str::to_string),
            },
        }
    }
}

fn single_link(links: &Links, relation: &str) -> Option<RecordId> {
    links.get(relation).and_then(|ids| ids.iter().next().copied())
}

fn all_links(links: &Links, relation: &str) -> Vec<RecordId> {
    links
        .get(relation)
        .map(|ids| ids.iter().copied().collect())
        .unwrap_or_default()
}

fn date_attribute(record: &Record, name: &str) -> Option<NaiveDate> {
    record
        .text(name)
        .and_then(|text| NaiveDate::parse_from_str(text, "%Y-%m-%d").ok())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::model::{Attributes, EntityKind, SyncState};

    fn record(kind: EntityKind, attributes: serde_json::Value) -> Record {
        let attributes: Attributes = serde_json::from_value(attributes).unwrap();
        Record {
            id: 7,
            kind,
            external_id: Some(ExternalId::new("12")),
            sync_uuid: Uuid::nil(),
            attributes,
            state: SyncState::Complete,
            dirty: false,
            synced_at: None,
        }
    }

    #[test]
    fn affiliation_validity_uses_open_bounds() {
        let record = record(
            EntityKind::Affiliation,
            json!({ "start_date": "2020-01-01", "end_date": null }),
        );
        let mut links = Links::new();
        links.insert(REL_ROLE.to_string(), BTreeSet::from([3]));
        let affiliation = Affiliation::from_record(&record, &links);

        assert_eq!(affiliation.role, Some(3));
        assert!(affiliation.is_valid_on(NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()));
        assert!(!affiliation.is_valid_on(NaiveDate::from_ymd_opt(2019, 12, 31).unwrap()));
    }

    #[test]
    fn actor_kind_defaults_to_person_and_rejects_unknown_values() {
        let unset = record(EntityKind::Actor, json!({ "name": "Ada" }));
        let group = record(EntityKind::Actor, json!({ "name": "Society", "actor_kind": "organization" }));
        let robot = record(EntityKind::Actor, json!({ "name": "Engine", "actor_kind": "machine" }));

        assert_eq!(Actor::from_record(&unset).unwrap().kind, ActorKind::Person);
        assert_eq!(Actor::from_record(&group).unwrap().kind, ActorKind::Organization);
        assert!(matches!(
            Actor::from_record(&robot),
            Err(SyncError::Mapping { attribute, external_id, .. })
                if attribute == ACTOR_KIND && external_id == "12"
        ));
    }

    #[test]
    fn source_variant_follows_document_number() {
        let submission = record(EntityKind::Source, json!({ "document_number": "19/123" }));
        let from_url = record(
            EntityKind::Source,
            json!({ "url": "https://example.org/a", "domain": "example.org" }),
        );

        assert!(matches!(
            Source::from_record(&submission, &Links::new()),
            Source::Submission { .. }
        ));
        assert_eq!(
            Source::from_record(&from_url, &Links::new()),
            Source::Url {
                id: 7,
                url: "https://example.org/a".into(),
                domain: Some("example.org".into()),
            }
        );
    }
}
