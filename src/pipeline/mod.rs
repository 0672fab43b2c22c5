//! Log ingestion pipeline: wire types, batch validation, and the
//! all-or-nothing persistence path.

pub mod persistence;
pub mod projects;
pub mod tagging;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

/// Hard cap on one ingestion batch.
pub const MAX_BATCH: usize = 1000;

/// Client clocks may run ahead of ours by at most this much.
const CLOCK_SKEW_MINUTES: i64 = 5;

/// Batch entries land with this `service`; the submitting application's own
/// name is preserved in `service_name`.
pub const EXTERNAL_SERVICE: &str = "external";

/// Wire format for `POST /ingest`. Unknown fields are tolerated and dropped.
#[derive(Debug, Deserialize)]
pub struct IngestBatch {
    pub project_slug: String,
    #[serde(default)]
    pub logs: Vec<IngestEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestEntry {
    pub timestamp: String,
    pub level: String,
    pub message: String,
    #[serde(default)]
    pub service_name: Option<String>,
    #[serde(default)]
    pub context: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub accepted: usize,
    pub message: String,
}

/// A validated entry, ready for the bulk insert.
#[derive(Debug, Clone)]
pub struct NewLog {
    pub level: String,
    pub message: String,
    pub service_name: Option<String>,
    pub metadata: String,
    pub timestamp: DateTime<Utc>,
}

/// Rejection of a whole batch, naming the first offending entry so clients
/// can fix it and safely retry the identical batch.
#[derive(Debug)]
pub struct BatchReject {
    pub index: Option<usize>,
    pub code: &'static str,
    pub message: String,
}

impl BatchReject {
    fn at(index: usize, code: &'static str, message: String) -> Self {
        Self {
            index: Some(index),
            code,
            message,
        }
    }
}

/// Normalizes a wire-level string. The ingest contract accepts
/// DEBUG/INFO/WARN/ERROR (plus the `WARNING` spelling); CRITICAL exists
/// on the read side only.
pub fn normalize_level(raw: &str) -> Option<&'static str> {
    match raw.trim().to_uppercase().as_str() {
        "DEBUG" => Some("DEBUG"),
        "INFO" => Some("INFO"),
        "WARN" | "WARNING" => Some("WARN"),
        "ERROR" => Some("ERROR"),
        _ => None,
    }
}

/// Validates a batch. All-or-nothing: the first invalid entry rejects the
/// whole request and nothing is persisted.
pub fn validate_batch(entries: &[IngestEntry]) -> Result<Vec<NewLog>, BatchReject> {
    if entries.is_empty() {
        return Err(BatchReject {
            index: None,
            code: "EMPTY_BATCH",
            message: "logs array must contain at least one entry".to_string(),
        });
    }
    if entries.len() > MAX_BATCH {
        return Err(BatchReject {
            index: None,
            code: "BATCH_TOO_LARGE",
            message: format!("batch of {} exceeds the {} entry cap", entries.len(), MAX_BATCH),
        });
    }

    let ceiling = Utc::now() + ChronoDuration::minutes(CLOCK_SKEW_MINUTES);
    let mut rows = Vec::with_capacity(entries.len());

    for (i, entry) in entries.iter().enumerate() {
        let timestamp = DateTime::parse_from_rfc3339(&entry.timestamp)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| {
                BatchReject::at(
                    i,
                    "INVALID_TIMESTAMP",
                    format!("logs[{i}].timestamp is not RFC3339: {e}"),
                )
            })?;
        if timestamp > ceiling {
            return Err(BatchReject::at(
                i,
                "TIMESTAMP_IN_FUTURE",
                format!("logs[{i}].timestamp is more than {CLOCK_SKEW_MINUTES} minutes in the future"),
            ));
        }

        let level = normalize_level(&entry.level).ok_or_else(|| {
            BatchReject::at(
                i,
                "INVALID_LEVEL",
                format!(
                    "logs[{i}].level '{}' is not one of DEBUG, INFO, WARN, ERROR",
                    entry.level
                ),
            )
        })?;

        let metadata = match &entry.context {
            None | Some(serde_json::Value::Null) => "{}".to_string(),
            Some(serde_json::Value::Object(map)) => {
                serde_json::to_string(map).map_err(|e| {
                    BatchReject::at(
                        i,
                        "INVALID_CONTEXT",
                        format!("logs[{i}].context failed to serialize: {e}"),
                    )
                })?
            }
            Some(_) => {
                return Err(BatchReject::at(
                    i,
                    "INVALID_CONTEXT",
                    format!("logs[{i}].context must be a JSON object"),
                ))
            }
        };

        rows.push(NewLog {
            level: level.to_string(),
            message: entry.message.clone(),
            service_name: entry
                .service_name
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            metadata,
            timestamp,
        });
    }

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(level: &str, message: &str) -> IngestEntry {
        IngestEntry {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string(),
            message: message.to_string(),
            service_name: Some("api".to_string()),
            context: None,
        }
    }

    #[test]
    fn accepts_a_clean_batch() {
        let rows = validate_batch(&[entry("INFO", "x"), entry("error", "y")]).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].level, "INFO");
        assert_eq!(rows[1].level, "ERROR", "levels normalize to uppercase");
        assert_eq!(rows[0].metadata, "{}");
    }

    #[test]
    fn warning_normalizes_to_warn() {
        let rows = validate_batch(&[entry("Warning", "w")]).unwrap();
        assert_eq!(rows[0].level, "WARN");
    }

    #[test]
    fn unknown_level_names_the_index() {
        let err = validate_batch(&[
            entry("INFO", "a"),
            entry("WARN", "b"),
            entry("INFORMATIONAL", "c"),
        ])
        .unwrap_err();
        assert_eq!(err.index, Some(2));
        assert_eq!(err.code, "INVALID_LEVEL");
    }

    #[test]
    fn critical_is_write_side_rejected() {
        let err = validate_batch(&[entry("CRITICAL", "boom")]).unwrap_err();
        assert_eq!(err.code, "INVALID_LEVEL");
    }

    #[test]
    fn bad_timestamp_rejected() {
        let mut bad = entry("INFO", "x");
        bad.timestamp = "yesterday".to_string();
        let err = validate_batch(&[entry("INFO", "ok"), bad]).unwrap_err();
        assert_eq!(err.index, Some(1));
        assert_eq!(err.code, "INVALID_TIMESTAMP");
    }

    #[test]
    fn future_timestamp_beyond_skew_rejected() {
        let mut bad = entry("INFO", "x");
        bad.timestamp = (Utc::now() + ChronoDuration::minutes(10)).to_rfc3339();
        let err = validate_batch(&[bad]).unwrap_err();
        assert_eq!(err.code, "TIMESTAMP_IN_FUTURE");
    }

    #[test]
    fn small_future_skew_tolerated() {
        let mut ok = entry("INFO", "x");
        ok.timestamp = (Utc::now() + ChronoDuration::minutes(2)).to_rfc3339();
        assert!(validate_batch(&[ok]).is_ok());
    }

    #[test]
    fn non_object_context_rejected() {
        let mut bad = entry("INFO", "x");
        bad.context = Some(serde_json::json!([1, 2, 3]));
        let err = validate_batch(&[bad]).unwrap_err();
        assert_eq!(err.code, "INVALID_CONTEXT");
    }

    #[test]
    fn object_context_marshaled() {
        let mut ok = entry("INFO", "x");
        ok.context = Some(serde_json::json!({"request_id": "abc"}));
        let rows = validate_batch(&[ok]).unwrap();
        assert!(rows[0].metadata.contains("request_id"));
    }

    #[test]
    fn oversized_batch_rejected() {
        let batch: Vec<_> = (0..=MAX_BATCH).map(|_| entry("INFO", "x")).collect();
        let err = validate_batch(&batch).unwrap_err();
        assert_eq!(err.code, "BATCH_TOO_LARGE");
        assert_eq!(err.index, None);
    }
}
