//! Change operation enum covering the 4 CDC operation kinds.
//!
//! The string representation uses the full word (`insert`, `update`,
//! `delete`, `snapshot`); the single-character markers emitted by log-based
//! connectors (`c`/`u`/`d`/`r`) are accepted on parse.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The 4 operation kinds a change event can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// A new row/document appeared in the source.
    Insert,
    /// An existing row/document changed.
    Update,
    /// The row/document was removed at the source (soft-deleted here).
    Delete,
    /// Initial-load read of existing state (connector marker `r`).
    Snapshot,
}

/// Error returned when parsing an unknown operation string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownOperation {
    /// The unrecognised input string.
    pub raw: String,
}

impl fmt::Display for UnknownOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown operation '{}': expected one of insert, update, delete, \
             snapshot (or connector markers c, u, d, r)",
            self.raw
        )
    }
}

impl std::error::Error for UnknownOperation {}

impl Operation {
    /// All known operations in catalog order.
    pub const ALL: [Self; 4] = [Self::Insert, Self::Update, Self::Delete, Self::Snapshot];

    /// Return the canonical string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Snapshot => "snapshot",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = UnknownOperation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" | "c" => Ok(Self::Insert),
            "update" | "u" => Ok(Self::Update),
            "delete" | "d" => Ok(Self::Delete),
            "snapshot" | "r" => Ok(Self::Snapshot),
            _ => Err(UnknownOperation { raw: s.to_string() }),
        }
    }
}

// Custom serde: serialize as the canonical word.
impl Serialize for Operation {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Operation {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_all_operations() {
        let expected = [
            (Operation::Insert, "insert"),
            (Operation::Update, "update"),
            (Operation::Delete, "delete"),
            (Operation::Snapshot, "snapshot"),
        ];

        for (op, s) in expected {
            assert_eq!(op.to_string(), s);
            assert_eq!(op.as_str(), s);
        }
    }

    #[test]
    fn fromstr_accepts_words_and_markers() {
        for op in Operation::ALL {
            let parsed: Operation = op.as_str().parse().expect("should parse");
            assert_eq!(parsed, op);
        }
        assert_eq!("c".parse::<Operation>(), Ok(Operation::Insert));
        assert_eq!("u".parse::<Operation>(), Ok(Operation::Update));
        assert_eq!("d".parse::<Operation>(), Ok(Operation::Delete));
        assert_eq!("r".parse::<Operation>(), Ok(Operation::Snapshot));
    }

    #[test]
    fn fromstr_rejects_unknown() {
        let err = "truncate".parse::<Operation>().unwrap_err();
        assert_eq!(err.raw, "truncate");
        assert!(err.to_string().contains("expected one of"));
    }

    #[test]
    fn fromstr_rejects_empty() {
        assert!("".parse::<Operation>().is_err());
    }

    #[test]
    fn serde_json_roundtrip() {
        for op in Operation::ALL {
            let json = serde_json::to_string(&op).expect("serialize");
            assert_eq!(json, format!("\"{}\"", op.as_str()));

            let deser: Operation = serde_json::from_str(&json).expect("deserialize");
            assert_eq!(deser, op);
        }
    }

    #[test]
    fn serde_accepts_connector_markers() {
        let op: Operation = serde_json::from_str("\"d\"").expect("deserialize marker");
        assert_eq!(op, Operation::Delete);
    }
}
