//! Core record model, normalization and error taxonomy for the APOD pipeline.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "apod-core";

/// Fields projected out of the upstream payload, in payload order.
pub const SOURCE_FIELDS: [&str; 7] = [
    "date",
    "title",
    "url",
    "explanation",
    "media_type",
    "hdurl",
    "copyright",
];

/// Column order of a persisted [`Record`] (flat file header).
pub const RECORD_COLUMNS: [&str; 8] = [
    "date",
    "title",
    "url",
    "explanation",
    "media_type",
    "hdurl",
    "extracted_at",
    "copyright",
];

pub const NATURAL_KEY: &str = "date";

/// One normalized observation. `date` is the natural key.
///
/// Absent optional fields serialize as explicit nulls (JSON) or empty cells (CSV),
/// never by dropping the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub date: NaiveDate,
    pub title: Option<String>,
    pub url: Option<String>,
    pub explanation: Option<String>,
    pub media_type: Option<String>,
    pub hdurl: Option<String>,
    pub extracted_at: DateTime<Utc>,
    pub copyright: Option<String>,
}

impl Record {
    pub fn natural_key(&self) -> String {
        self.date.format("%Y-%m-%d").to_string()
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("storage failure while {context}: {message}")]
    Storage { context: String, message: String },
    #[error("io failure on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("schema mismatch in {}: expected [{expected}], found [{found}]", path.display())]
    SchemaMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },
    #[error("versioning failure: {0}")]
    Versioning(String),
    #[error("commit failure: {0}")]
    Commit(String),
    #[error("fetch failure: {0}")]
    Fetch(String),
}

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn storage(context: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Storage {
            context: context.into(),
            message: err.to_string(),
        }
    }

    /// Stable category label used in structured logs.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Storage { .. } => "storage",
            Self::Io { .. } | Self::SchemaMismatch { .. } => "io",
            Self::Versioning(_) => "versioning",
            Self::Commit(_) => "commit",
            Self::Fetch(_) => "fetch",
        }
    }

    /// Deterministic failures fail identically on every attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Validation(_) | Self::SchemaMismatch { .. })
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

/// Typed outcome for idempotent store initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InitOutcome {
    Initialized,
    AlreadyInitialized,
}

/// Project an arbitrary JSON object onto `allow_list`.
///
/// Every allow-listed key is present in the output; keys missing from the payload,
/// null values and empty strings map to `None`.
pub fn project_fields(
    payload: &JsonValue,
    allow_list: &[&str],
) -> Result<BTreeMap<String, Option<String>>> {
    let object = payload.as_object().ok_or_else(|| {
        PipelineError::Validation(format!(
            "payload must be a JSON object, got {}",
            json_type_name(payload)
        ))
    })?;

    let mut projected = BTreeMap::new();
    for field in allow_list {
        let value = match object.get(*field) {
            None | Some(JsonValue::Null) => None,
            Some(JsonValue::String(s)) if s.trim().is_empty() => None,
            Some(JsonValue::String(s)) => Some(s.clone()),
            Some(other) => {
                return Err(PipelineError::Validation(format!(
                    "field `{field}` must be a string or null, got {}",
                    json_type_name(other)
                )))
            }
        };
        projected.insert((*field).to_string(), value);
    }
    Ok(projected)
}

/// Normalize an upstream payload into a [`Record`] stamped with `extracted_at`.
pub fn normalize_payload(payload: &JsonValue, extracted_at: DateTime<Utc>) -> Result<Record> {
    let mut fields = project_fields(payload, &SOURCE_FIELDS)?;
    let mut take = |name: &str| fields.remove(name).flatten();

    let raw_date = take(NATURAL_KEY).ok_or_else(|| {
        PipelineError::Validation(format!("natural key `{NATURAL_KEY}` is absent"))
    })?;
    let date = NaiveDate::parse_from_str(raw_date.trim(), "%Y-%m-%d").map_err(|err| {
        PipelineError::Validation(format!("natural key `{NATURAL_KEY}`={raw_date:?}: {err}"))
    })?;

    Ok(Record {
        date,
        title: take("title"),
        url: take("url"),
        explanation: take("explanation"),
        media_type: take("media_type"),
        hdurl: take("hdurl"),
        extracted_at,
        copyright: take("copyright"),
    })
}

fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn stamp() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).single().unwrap()
    }

    #[test]
    fn missing_fields_become_explicit_absent_values() {
        let payload = json!({
            "date": "2024-06-01",
            "title": "Nebula",
            "url": "http://x/img.jpg",
            "explanation": "...",
            "media_type": "image",
            "service_version": "v1"
        });

        let record = normalize_payload(&payload, stamp()).unwrap();
        assert_eq!(record.natural_key(), "2024-06-01");
        assert_eq!(record.title.as_deref(), Some("Nebula"));
        assert_eq!(record.hdurl, None);
        assert_eq!(record.copyright, None);
        assert_eq!(record.extracted_at, stamp());

        let as_json = serde_json::to_value(&record).unwrap();
        let object = as_json.as_object().unwrap();
        assert_eq!(object.len(), RECORD_COLUMNS.len());
        assert_eq!(object["hdurl"], JsonValue::Null);
        assert!(!object.contains_key("service_version"));
    }

    #[test]
    fn projection_keeps_every_allow_listed_key() {
        let projected = project_fields(&json!({"title": "", "url": null}), &SOURCE_FIELDS).unwrap();
        assert_eq!(projected.len(), SOURCE_FIELDS.len());
        assert!(projected.values().all(Option::is_none));
    }

    #[test]
    fn non_object_payload_is_a_validation_error() {
        let err = normalize_payload(&json!(["2024-06-01"]), stamp()).unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
        assert_eq!(err.category(), "validation");
    }

    #[test]
    fn non_string_field_is_rejected() {
        let err = normalize_payload(&json!({"date": "2024-06-01", "title": 42}), stamp()).unwrap_err();
        assert!(err.to_string().contains("title"));
    }

    #[test]
    fn natural_key_must_be_present_and_well_formed() {
        assert!(normalize_payload(&json!({"title": "x"}), stamp()).is_err());
        assert!(normalize_payload(&json!({"date": "06/01/2024"}), stamp()).is_err());
    }
}
