//! Raw change record → [`ChangeEvent`] normalization.
//!
//! Two source shapes are supported, both arriving as a connector-style
//! envelope `{op, before, after, ts_ms}`:
//!
//! - **Row** sources: each column maps directly to a payload field.
//! - **Document** sources: nested substructures are flattened into scalar
//!   fields with a `_`-joined key path (`metadata.device` →
//!   `metadata_device`), deterministically, so downstream consumers see
//!   fixed field names.
//!
//! Malformed records (missing key, operation, or timestamp) are dropped and
//! counted, never fatal to the batch.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::NormalizeError;

use super::{ChangeEvent, Operation};

/// Shape of a configured source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Relational rows; columns are already flat.
    Row,
    /// Documents; nested structures get flattened.
    Document,
}

/// Per-source normalization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSpec {
    /// Entity name stamped on every event from this source.
    pub entity: String,
    /// Row or document handling.
    pub kind: SourceKind,
    /// Payload field holding the natural key.
    pub key_field: String,
}

/// Counters returned by batch normalization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizeStats {
    /// Records successfully normalized.
    pub normalized: usize,
    /// Records dropped as malformed.
    pub malformed: usize,
}

/// Converts raw records from one configured source into [`ChangeEvent`]s.
pub struct Normalizer {
    spec: SourceSpec,
}

impl Normalizer {
    /// Create a normalizer for the given source.
    #[must_use]
    pub const fn new(spec: SourceSpec) -> Self {
        Self { spec }
    }

    /// The source this normalizer serves.
    #[must_use]
    pub const fn spec(&self) -> &SourceSpec {
        &self.spec
    }

    /// Normalize one raw envelope.
    ///
    /// # Errors
    ///
    /// Returns [`NormalizeError`] when the record is missing its operation
    /// marker, source timestamp, or natural key. The caller decides whether
    /// that is fatal; [`Self::normalize_lines`] drops and counts.
    pub fn normalize(
        &self,
        raw: &Value,
        received_ts_us: i64,
    ) -> Result<ChangeEvent, NormalizeError> {
        let envelope = raw.as_object().ok_or(NormalizeError::NotAnObject)?;

        let op = envelope
            .get("op")
            .and_then(Value::as_str)
            .and_then(|s| Operation::from_str(s).ok())
            .ok_or(NormalizeError::MissingOperation)?;

        let source_ts_us = extract_source_ts(envelope).ok_or(NormalizeError::MissingTimestamp)?;

        // Deletes describe the row as it was; everything else as it is.
        let image = match op {
            Operation::Delete => envelope.get("before").or_else(|| envelope.get("after")),
            _ => envelope.get("after").or_else(|| envelope.get("before")),
        };
        let fields = image.and_then(Value::as_object);

        let payload = match (self.spec.kind, fields) {
            (SourceKind::Row, Some(obj)) => {
                obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
            }
            (SourceKind::Document, Some(obj)) => flatten_document(obj),
            // A tombstone delete carries no image; the reconciler keeps the
            // last-known payload in that case.
            (_, None) if op == Operation::Delete => BTreeMap::new(),
            (_, None) => {
                return Err(NormalizeError::MissingKey {
                    field: self.spec.key_field.clone(),
                });
            }
        };

        let key = extract_key(envelope, &payload, &self.spec.key_field).ok_or_else(|| {
            NormalizeError::MissingKey {
                field: self.spec.key_field.clone(),
            }
        })?;

        Ok(ChangeEvent {
            entity: self.spec.entity.clone(),
            key,
            op,
            payload,
            source_ts_us,
            received_ts_us,
        })
    }

    /// Normalize newline-delimited JSON, dropping and counting malformed
    /// records.
    ///
    /// Blank lines are ignored. Each drop is logged with its reason and the
    /// batch always completes.
    pub fn normalize_lines(
        &self,
        input: &str,
        received_ts_us: i64,
    ) -> (Vec<ChangeEvent>, NormalizeStats) {
        let mut events = Vec::new();
        let mut stats = NormalizeStats::default();

        for (idx, line) in input.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let parsed: Result<Value, _> = serde_json::from_str(line);
            let outcome = match parsed {
                Ok(raw) => self.normalize(&raw, received_ts_us),
                Err(source) => Err(NormalizeError::InvalidJson {
                    line: idx + 1,
                    source,
                }),
            };
            match outcome {
                Ok(event) => {
                    events.push(event);
                    stats.normalized += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        entity = %self.spec.entity,
                        line = idx + 1,
                        code = %e.code(),
                        error = %e,
                        "dropping malformed change record"
                    );
                    stats.malformed += 1;
                }
            }
        }

        (events, stats)
    }
}

/// Flatten a document into scalar fields keyed by `_`-joined paths.
///
/// Deterministic: output ordering follows the sorted key paths, and the same
/// input always produces the same field names. Arrays are preserved as
/// canonical JSON text rather than exploded.
#[must_use]
pub fn flatten_document(obj: &Map<String, Value>) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    flatten_into(&mut out, "", obj);
    out
}

fn flatten_into(out: &mut BTreeMap<String, Value>, prefix: &str, obj: &Map<String, Value>) {
    for (k, v) in obj {
        let path = if prefix.is_empty() {
            k.clone()
        } else {
            format!("{prefix}_{k}")
        };
        match v {
            Value::Object(nested) => flatten_into(out, &path, nested),
            Value::Array(_) => {
                let text = serde_json::to_string(v).unwrap_or_else(|_| "[]".to_string());
                out.insert(path, Value::String(text));
            }
            scalar => {
                out.insert(path, scalar.clone());
            }
        }
    }
}

fn extract_source_ts(envelope: &Map<String, Value>) -> Option<i64> {
    if let Some(us) = envelope.get("ts_us").and_then(Value::as_i64) {
        return Some(us);
    }
    envelope
        .get("ts_ms")
        .and_then(Value::as_i64)
        .map(|ms| ms.saturating_mul(1_000))
}

/// Key lookup order: explicit envelope `key`, then the configured payload
/// field. Numbers are stringified so keys compare uniformly.
fn extract_key(
    envelope: &Map<String, Value>,
    payload: &BTreeMap<String, Value>,
    key_field: &str,
) -> Option<String> {
    let value = envelope.get("key").or_else(|| payload.get(key_field))?;
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
