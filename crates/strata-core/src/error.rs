use std::fmt;

/// Machine-readable error codes for operator-friendly decision making.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotInitialized,
    ConfigParseError,
    MalformedEvent,
    UnknownSource,
    StoreCorrupt,
    TransientStorage,
    PeriodBusy,
    JobPreconditionFailed,
    JobVerificationFailed,
    JobTimedOut,
    LockContention,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::NotInitialized => "E1001",
            Self::ConfigParseError => "E1002",
            Self::MalformedEvent => "E2001",
            Self::UnknownSource => "E2002",
            Self::StoreCorrupt => "E3001",
            Self::TransientStorage => "E3002",
            Self::PeriodBusy => "E4001",
            Self::JobPreconditionFailed => "E4002",
            Self::JobVerificationFailed => "E4003",
            Self::JobTimedOut => "E4004",
            Self::LockContention => "E5001",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::NotInitialized => "Store not initialized",
            Self::ConfigParseError => "Config file parse error",
            Self::MalformedEvent => "Malformed change record",
            Self::UnknownSource => "Unknown source entity",
            Self::StoreCorrupt => "Corrupt SQLite store",
            Self::TransientStorage => "Transient storage failure",
            Self::PeriodBusy => "Period job already running",
            Self::JobPreconditionFailed => "Job precondition failed",
            Self::JobVerificationFailed => "Job verification failed",
            Self::JobTimedOut => "Job timed out",
            Self::LockContention => "Lock contention",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint that can be surfaced to operators.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::NotInitialized => Some("Run `st init` to initialize this directory."),
            Self::ConfigParseError => Some("Fix syntax in .strata/config.toml and retry."),
            Self::MalformedEvent => {
                Some("Record was dropped and counted; check the source connector's output.")
            }
            Self::UnknownSource => Some("Add a [[sources]] entry for this entity to the config."),
            Self::StoreCorrupt => Some("Delete .strata/store.db and re-ingest from the transport."),
            Self::TransientStorage => Some("Retry; the storage layer reported a transient failure."),
            Self::PeriodBusy => Some("Another job holds this period; wait for it or check `st status`."),
            Self::JobPreconditionFailed => {
                Some("Source tables are inconsistent for this period; investigate before retrying.")
            }
            Self::JobVerificationFailed => {
                Some("Computed rows failed sanity checks; the partition was left empty. Safe to retry.")
            }
            Self::JobTimedOut => Some("Raise [aggregate].timeout_secs or retry during lower load."),
            Self::LockContention => Some("Retry after the other strata process releases its lock."),
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Why a raw change record could not be normalized.
///
/// Malformed records are dropped and counted, never fatal: event-level
/// failures stay isolated from the batch.
#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error("missing entity key field '{field}'")]
    MissingKey { field: String },
    #[error("missing or unrecognized operation marker")]
    MissingOperation,
    #[error("missing source timestamp")]
    MissingTimestamp,
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("invalid JSON on line {line}: {source}")]
    InvalidJson {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

impl NormalizeError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        ErrorCode::MalformedEvent
    }
}

/// Terminal failure of a per-period aggregation job.
#[derive(Debug, thiserror::Error)]
pub enum AggregateError {
    #[error("{}: period {period} is already claimed by a running job", ErrorCode::PeriodBusy)]
    PeriodBusy { period: String },
    #[error("{}: {detail}", ErrorCode::JobPreconditionFailed)]
    PreconditionFailed { detail: String },
    #[error("{}: {detail}", ErrorCode::JobVerificationFailed)]
    VerificationFailed { detail: String },
    #[error("{}: job for {period} exceeded {timeout_secs}s", ErrorCode::JobTimedOut)]
    TimedOut { period: String, timeout_secs: u64 },
    #[error("{}: {source}", ErrorCode::TransientStorage)]
    TransientStorage {
        #[source]
        source: rusqlite::Error,
    },
    #[error("storage error: {source}")]
    Storage {
        #[source]
        source: rusqlite::Error,
    },
    #[error("{}: {source}", ErrorCode::LockContention)]
    Lock {
        #[source]
        source: crate::lock::LockError,
    },
}

impl AggregateError {
    /// Machine-readable code for this failure.
    #[must_use]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::PeriodBusy { .. } => ErrorCode::PeriodBusy,
            Self::PreconditionFailed { .. } => ErrorCode::JobPreconditionFailed,
            Self::VerificationFailed { .. } => ErrorCode::JobVerificationFailed,
            Self::TimedOut { .. } => ErrorCode::JobTimedOut,
            Self::TransientStorage { .. } => ErrorCode::TransientStorage,
            Self::Storage { .. } => ErrorCode::StoreCorrupt,
            Self::Lock { .. } => ErrorCode::LockContention,
        }
    }

    /// Whether the coordinator should retry this failure with backoff.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::TransientStorage { .. } | Self::TimedOut { .. })
    }
}

impl From<rusqlite::Error> for AggregateError {
    fn from(err: rusqlite::Error) -> Self {
        if is_transient_sqlite(&err) {
            Self::TransientStorage { source: err }
        } else {
            Self::Storage { source: err }
        }
    }
}

/// True for SQLite failures that a bounded retry is expected to clear.
#[must_use]
pub fn is_transient_sqlite(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => matches!(
            e.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::{AggregateError, ErrorCode, NormalizeError};
    use std::collections::HashSet;

    #[test]
    fn all_codes_are_unique() {
        let all = [
            ErrorCode::NotInitialized,
            ErrorCode::ConfigParseError,
            ErrorCode::MalformedEvent,
            ErrorCode::UnknownSource,
            ErrorCode::StoreCorrupt,
            ErrorCode::TransientStorage,
            ErrorCode::PeriodBusy,
            ErrorCode::JobPreconditionFailed,
            ErrorCode::JobVerificationFailed,
            ErrorCode::JobTimedOut,
            ErrorCode::LockContention,
            ErrorCode::InternalUnexpected,
        ];

        let mut seen = HashSet::new();
        for code in all {
            assert!(seen.insert(code.code()), "duplicate code {}", code.code());
        }
    }

    #[test]
    fn code_format_is_machine_friendly() {
        let code = ErrorCode::JobVerificationFailed.code();
        assert_eq!(code.len(), 5);
        assert!(code.starts_with('E'));
        assert!(code.chars().skip(1).all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn normalize_errors_map_to_malformed_event() {
        let err = NormalizeError::MissingOperation;
        assert_eq!(err.code(), ErrorCode::MalformedEvent);
    }

    #[test]
    fn transient_classification() {
        let busy = AggregateError::TimedOut {
            period: "2024-01-15".into(),
            timeout_secs: 30,
        };
        assert!(busy.is_transient());

        let verify = AggregateError::VerificationFailed {
            detail: "category sum mismatch".into(),
        };
        assert!(!verify.is_transient());
        assert_eq!(verify.error_code(), ErrorCode::JobVerificationFailed);
    }

    #[test]
    fn aggregate_error_display_includes_code() {
        let err = AggregateError::PeriodBusy {
            period: "2024-01-15".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("E4001"));
        assert!(msg.contains("2024-01-15"));
    }
}
