//! Configuration driven translation between remote rows and local attributes.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{Result, SyncError};
use crate::io::remote::Fields;
use crate::model::{Attributes, EntityKind};

/// Local attribute → remote source mapping for one entity kind.
pub type FieldMap = BTreeMap<String, FieldSource>;

/// Where an attribute comes from. The short form names the remote field only.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum FieldSource {
    Field(String),
    Spec(FieldSpec),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FieldSpec {
    pub field: String,
    #[serde(default)]
    pub coerce: Coercion,
    #[serde(default)]
    pub required: bool,
    /// Value used when the remote field is absent or blank.
    #[serde(default)]
    pub default: Option<Value>,
}

impl FieldSource {
    pub fn spec(&self) -> FieldSpec {
        match self {
            FieldSource::Field(field) => FieldSpec {
                field: field.clone(),
                coerce: Coercion::default(),
                required: false,
                default: None,
            },
            FieldSource::Spec(spec) => spec.clone(),
        }
    }
}

/// Type conversion applied to a non-blank remote value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Coercion {
    /// Keep the value, trimming strings.
    #[default]
    Raw,
    Text,
    Integer,
    Float,
    Boolean,
    /// ISO `YYYY-MM-DD`; timestamps are truncated and spreadsheet serial
    /// numbers are converted.
    Date,
    /// RFC 3339 timestamp normalised to UTC.
    Datetime,
    /// Comma separated string or array of scalars → array of strings.
    List,
    /// Nested values passed through untouched.
    Json,
    /// Host part of a URL, without a leading `www.`. Import only.
    Domain,
}

impl Coercion {
    pub fn apply(self, value: Value) -> std::result::Result<Value, String> {
        match self {
            Coercion::Raw => Ok(match value {
                Value::String(text) => Value::String(text.trim().to_string()),
                other => other,
            }),
            Coercion::Json => Ok(value),
            Coercion::Text => scalar_text(&value).map(Value::String),
            Coercion::Integer => match &value {
                Value::Number(number) => number
                    .as_i64()
                    .or_else(|| number.as_f64().filter(|f| is_integral(*f)).map(|f| f as i64))
                    .map(Value::from)
                    .ok_or_else(|| format!("{number} is not an integer")),
                Value::String(text) => text
                    .trim()
                    .parse::<i64>()
                    .map(Value::from)
                    .map_err(|_| format!("'{text}' is not an integer")),
                other => Err(format!("expected integer, got {other}")),
            },
            Coercion::Float => match &value {
                Value::Number(number) => number
                    .as_f64()
                    .map(Value::from)
                    .ok_or_else(|| format!("{number} is not a number")),
                Value::String(text) => text
                    .trim()
                    .parse::<f64>()
                    .map(Value::from)
                    .map_err(|_| format!("'{text}' is not a number")),
                other => Err(format!("expected number, got {other}")),
            },
            Coercion::Boolean => match &value {
                Value::Bool(flag) => Ok(Value::Bool(*flag)),
                Value::Number(number) => match number.as_i64() {
                    Some(0) => Ok(Value::Bool(false)),
                    Some(1) => Ok(Value::Bool(true)),
                    _ => Err(format!("{number} is not a boolean")),
                },
                Value::String(text) => match text.trim().to_lowercase().as_str() {
                    "true" | "yes" | "1" => Ok(Value::Bool(true)),
                    "false" | "no" | "0" => Ok(Value::Bool(false)),
                    _ => Err(format!("'{text}' is not a boolean")),
                },
                other => Err(format!("expected boolean, got {other}")),
            },
            Coercion::Date => parse_date(&value).map(|date| Value::String(date.to_string())),
            Coercion::Datetime => {
                parse_datetime(&value).map(|stamp| Value::String(stamp.to_rfc3339()))
            }
            Coercion::List => match value {
                Value::String(text) => Ok(Value::Array(
                    text.split(',')
                        .map(str::trim)
                        .filter(|item| !item.is_empty())
                        .map(|item| Value::String(item.to_string()))
                        .collect(),
                )),
                Value::Array(items) => items
                    .iter()
                    .map(|item| scalar_text(item).map(Value::String))
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map(Value::Array),
                other => Err(format!("expected list, got {other}")),
            },
            Coercion::Domain => {
                let text = scalar_text(&value)?;
                let parsed = url::Url::parse(&text).map_err(|err| format!("'{text}': {err}"))?;
                let host = parsed
                    .host_str()
                    .ok_or_else(|| format!("'{text}' has no host"))?
                    .to_lowercase();
                Ok(Value::String(
                    host.strip_prefix("www.").unwrap_or(&host).to_string(),
                ))
            }
        }
    }

    /// Derived attributes are not written back to the remote.
    pub fn is_exportable(self) -> bool {
        self != Coercion::Domain
    }
}

/// Returns `None` for values that count as absent: null, blank strings, empty
/// arrays and the configured null label.
pub fn normalize(value: Option<&Value>, null_label: Option<&str>) -> Option<Value> {
    match value? {
        Value::Null => None,
        Value::String(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() || Some(trimmed) == null_label {
                None
            } else {
                Some(Value::String(text.clone()))
            }
        }
        Value::Array(items) if items.is_empty() => None,
        other => Some(other.clone()),
    }
}

/// Translates rows of one entity kind according to a [`FieldMap`].
#[derive(Debug, Clone)]
pub struct FieldMapper {
    kind: EntityKind,
    fields: FieldMap,
    null_label: Option<String>,
}

impl FieldMapper {
    pub fn new(kind: EntityKind, fields: FieldMap, null_label: Option<String>) -> Self {
        Self {
            kind,
            fields,
            null_label,
        }
    }

    /// Maps a remote row into local attributes. Every configured attribute is
    /// present in the result, `null` when absent without default.
    pub fn map_row(&self, external_id: &str, row: &Fields) -> Result<Attributes> {
        let mut attributes = Attributes::new();
        for (attribute, source) in &self.fields {
            let spec = source.spec();
            let raw = normalize(row.get(&spec.field), self.null_label.as_deref());
            let value = match raw {
                Some(value) => spec
                    .coerce
                    .apply(value)
                    .map_err(|message| self.error(external_id, attribute, message))?,
                None => match &spec.default {
                    Some(default) => default.clone(),
                    None if spec.required => {
                        return Err(self.error(
                            external_id,
                            attribute,
                            format!("required field '{}' is missing", spec.field),
                        ));
                    }
                    None => Value::Null,
                },
            };
            attributes.insert(attribute.clone(), value);
        }
        Ok(attributes)
    }

    /// Renders attributes back into remote fields.
    pub fn to_payload(&self, attributes: &Attributes) -> Fields {
        let mut payload = Fields::new();
        for (attribute, source) in &self.fields {
            let spec = source.spec();
            if !spec.coerce.is_exportable() {
                continue;
            }
            let value = match attributes.get(attribute) {
                Some(Value::Array(items)) if spec.coerce == Coercion::List => {
                    let joined = items
                        .iter()
                        .filter_map(|item| scalar_text(item).ok())
                        .collect::<Vec<_>>()
                        .join(",");
                    Value::String(joined)
                }
                Some(value) => value.clone(),
                None => Value::Null,
            };
            let value = normalize(Some(&value), None).unwrap_or(Value::Null);
            payload.insert(spec.field, value);
        }
        payload
    }

    fn error(&self, external_id: &str, attribute: &str, message: String) -> SyncError {
        SyncError::Mapping {
            kind: self.kind,
            external_id: external_id.to_string(),
            attribute: attribute.to_string(),
            message,
        }
    }
}

fn scalar_text(value: &Value) -> std::result::Result<String, String> {
    match value {
        Value::String(text) => Ok(text.trim().to_string()),
        Value::Number(number) => Ok(number.to_string()),
        Value::Bool(flag) => Ok(flag.to_string()),
        other => Err(format!("expected text, got {other}")),
    }
}

fn parse_date(value: &Value) -> std::result::Result<NaiveDate, String> {
    match value {
        Value::String(text) => {
            let text = text.trim();
            let day = text.get(..10).unwrap_or(text);
            NaiveDate::parse_from_str(day, "%Y-%m-%d")
                .map_err(|_| format!("'{text}' is not a date"))
        }
        Value::Number(number) => {
            let serial = number
                .as_i64()
                .ok_or_else(|| format!("{number} is not a day number"))?;
            let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)
                .ok_or_else(|| "invalid spreadsheet epoch".to_string())?;
            epoch
                .checked_add_signed(Duration::days(serial))
                .ok_or_else(|| format!("{serial} is out of range"))
        }
        other => Err(format!("expected date, got {other}")),
    }
}

fn parse_datetime(value: &Value) -> std::result::Result<DateTime<Utc>, String> {
    let text = scalar_text(value)?;
    if let Ok(stamp) = DateTime::parse_from_rfc3339(&text) {
        return Ok(stamp.with_timezone(&Utc));
    }
    if let Ok(stamp) = DateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S%:z") {
        return Ok(stamp.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|_| format!("'{text}' is not a timestamp"))
}

/// Whether `value` is a whole number that fits an `i64` without saturating.
fn is_integral(value: f64) -> bool {
    const BOUND: f64 = 9_223_372_036_854_775_808.0;
    value.fract() == 0.0 && (-BOUND..BOUND).contains(&value)
}
