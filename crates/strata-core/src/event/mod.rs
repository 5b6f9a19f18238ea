//! Uniform change-event representation.
//!
//! This module defines the core [`ChangeEvent`] struct, the [`Operation`]
//! enum, and the normalizers that turn heterogeneous raw change records
//! (relational row changes, document changes) into this one shape.
//!
//! Ordering within one key is whatever the source emitted; there is no
//! global ordering across keys. `source_ts_us` is the logical version:
//! monotonically non-decreasing per source process.

pub mod normalize;
pub mod types;

pub use normalize::{NormalizeStats, Normalizer, SourceKind, SourceSpec, flatten_document};
pub use types::{Operation, UnknownOperation};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// A single normalized change event.
///
/// Every raw record, whichever source shape it came from, becomes one of
/// these. Payload fields are flat scalars: nested document structures have
/// already been flattened by the normalizer with `_`-joined key paths, so
/// schema-on-read consumers can rely on fixed field names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Source entity (table or collection) this event belongs to.
    pub entity: String,

    /// Natural key of the changed row/document within the entity.
    pub key: String,

    /// What happened at the source.
    pub op: Operation,

    /// Flattened field values. Sorted map so serialization is deterministic.
    pub payload: BTreeMap<String, Value>,

    /// Source change timestamp, epoch microseconds. The logical version:
    /// for a given key, a higher value always supersedes a lower one.
    pub source_ts_us: i64,

    /// When this process first saw the event, epoch microseconds. Breaks
    /// version ties deterministically (later arrival wins).
    pub received_ts_us: i64,
}

impl ChangeEvent {
    /// Payload serialized as a canonical JSON object string.
    ///
    /// `BTreeMap` ordering makes the output stable for identical content,
    /// which the event store relies on for fingerprinting.
    #[must_use]
    pub fn payload_json(&self) -> String {
        serde_json::to_string(&self.payload).unwrap_or_else(|_| "{}".to_string())
    }

    /// Look up a payload field as a string, if present and textual.
    #[must_use]
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.payload.get(name).and_then(Value::as_str)
    }
}

impl fmt::Display for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{}\t{}\t{}",
            self.source_ts_us, self.entity, self.op, self.key
        )
    }
}
