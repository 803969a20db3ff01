use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::mapping::FieldMap;
use crate::model::{Attributes, EntityKind};
use crate::resolve::RelationSpec;

/// Environment variable overriding `remote.api_token`.
pub const TOKEN_ENV: &str = "TABLESYNC_API_TOKEN";

const DEFAULT_PAGE_SIZE: usize = 100;

/// Top-level configuration consumed by the engine.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub remote: RemoteConfig,
    /// Sentinel the remote uses for "no value" in select fields.
    #[serde(default)]
    pub null_label: Option<String>,
    /// Switches the orchestrator to the lenient failure policy.
    #[serde(default)]
    pub debug: bool,
    /// Per entity kind configuration keyed by the kind's lowercase name.
    #[serde(default)]
    pub entities: BTreeMap<String, EntityConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_token: String,
    /// Header carrying the token. `authorization` sends a bearer token.
    #[serde(default = "default_auth_header")]
    pub auth_header: String,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

/// How one entity kind maps onto a remote table.
#[derive(Debug, Clone, Deserialize)]
pub struct EntityConfig {
    pub table: String,
    /// Views splitting the table into row subsets. Without views the whole
    /// table is read.
    #[serde(default)]
    pub views: Vec<ViewConfig>,
    /// Remote field holding the row identifier.
    #[serde(default = "default_id_field")]
    pub id_field: String,
    /// Import-optional kinds only run in `full` mode. Defaults to `true` for
    /// evidence and sources.
    #[serde(default)]
    pub optional: Option<bool>,
    #[serde(default)]
    pub export: bool,
    /// Export every record instead of only the ones changed locally.
    #[serde(default)]
    pub export_all: bool,
    #[serde(default)]
    pub sync_uuid_field: Option<String>,
    #[serde(default)]
    pub fields: FieldMap,
    #[serde(default)]
    pub relations: Vec<RelationSpec>,
}

/// A view of the entity's table with attributes that are implied by it.
#[derive(Debug, Clone, Deserialize)]
pub struct ViewConfig {
    pub id: String,
    /// Attribute values set on every row read through this view.
    #[serde(default)]
    pub constants: Attributes,
    /// Field mappings that extend or override the entity's mapping.
    #[serde(default)]
    pub fields: FieldMap,
    /// Remote fields written on export for records matching `constants`.
    #[serde(default)]
    pub payload: Attributes,
}

impl Config {
    /// Loads and validates a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let source = fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&source)?;
        if let Ok(token) = std::env::var(TOKEN_ENV) {
            debug!(env = TOKEN_ENV, "using API token from environment");
            config.remote.api_token = token;
        }
        Ok(config)
    }

    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Config = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations the engine cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.remote.page_size == 0 {
            return Err(SyncError::InvalidConfig("remote.page_size must be positive".into()));
        }
        for (name, entity) in &self.entities {
            let kind = EntityKind::parse(name).ok_or_else(|| {
                SyncError::InvalidConfig(format!("unknown entity kind '{name}'"))
            })?;
            if !kind.is_tabled() {
                return Err(SyncError::InvalidConfig(format!(
                    "{kind} is a vocabulary and cannot have a table"
                )));
            }
            if entity.table.trim().is_empty() {
                return Err(SyncError::InvalidConfig(format!("{kind} has no table")));
            }
            if entity.id_field.trim().is_empty() {
                return Err(SyncError::InvalidConfig(format!("{kind} has no id_field")));
            }
            for relation in &entity.relations {
                if relation.target.is_tabled() && !self.has_table(relation.target) {
                    return Err(SyncError::InvalidConfig(format!(
                        "{kind}.{} targets {} which has no table",
                        relation.name, relation.target
                    )));
                }
                if entity.fields.contains_key(&relation.name) {
                    return Err(SyncError::InvalidConfig(format!(
                        "{kind}.{} is declared both as field and relation",
                        relation.name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn entity(&self, kind: EntityKind) -> Option<&EntityConfig> {
        self.entities.get(kind.as_str())
    }

    /// Whether the kind is backed by a remote table. Kinds without one are
    /// vocabularies keyed by label.
    pub fn has_table(&self, kind: EntityKind) -> bool {
        self.entity(kind).is_some()
    }

    pub fn is_optional(&self, kind: EntityKind) -> bool {
        self.entity(kind)
            .and_then(|entity| entity.optional)
            .unwrap_or(matches!(kind, EntityKind::Evidence | EntityKind::Source))
    }
}

impl ViewConfig {
    /// Whether a record with `attributes` belongs to this view.
    pub fn matches(&self, attributes: &Attributes) -> bool {
        self.constants
            .iter()
            .all(|(name, value)| attributes.get(name) == Some(value))
    }
}

impl EntityConfig {
    /// The field mapping in effect for rows read through `view`.
    pub fn fields_for(&self, view: Option<&ViewConfig>) -> FieldMap {
        let mut fields = self.fields.clone();
        if let Some(view) = view {
            fields.extend(view.fields.clone());
        }
        fields
    }
}

fn default_auth_header() -> String {
    "xc-token".to_string()
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

fn default_id_field() -> String {
    "Id".to_string()
}
