//! Canonical SQLite schema for the strata store.
//!
//! The schema maps the three ownership domains onto tables:
//! - `entity_snapshots` holds exactly one current row per `(entity, key)` —
//!   the reconciled silver view with soft-delete flags
//! - `events` is the append-only immutable event log; re-records append and
//!   reads resolve to the highest `seq` per `event_id`
//! - `aggregates` holds one row per `(period, key)` gold aggregate
//! - `aggregate_jobs` is the per-period claim record and status source
//! - `store_meta` tracks schema version metadata

/// Migration v1: core tables plus store metadata.
pub const MIGRATION_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS entity_snapshots (
    entity TEXT NOT NULL CHECK (length(trim(entity)) > 0),
    key TEXT NOT NULL CHECK (length(trim(key)) > 0),
    payload TEXT NOT NULL DEFAULT '{}',
    deleted INTEGER NOT NULL DEFAULT 0 CHECK (deleted IN (0, 1)),
    version_us INTEGER NOT NULL,
    received_us INTEGER NOT NULL,
    PRIMARY KEY (entity, key)
);

CREATE TABLE IF NOT EXISTS events (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id TEXT NOT NULL CHECK (length(trim(event_id)) > 0),
    entity TEXT NOT NULL,
    event_ts_us INTEGER NOT NULL,
    payload TEXT NOT NULL DEFAULT '{}',
    fingerprint TEXT NOT NULL,
    recorded_us INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS aggregates (
    period TEXT NOT NULL CHECK (period GLOB '[0-9][0-9][0-9][0-9]-[0-9][0-9]-[0-9][0-9]'),
    key TEXT NOT NULL,
    event_count INTEGER NOT NULL CHECK (event_count >= 0),
    last_event_us INTEGER NOT NULL,
    category_counts TEXT NOT NULL DEFAULT '{}',
    context TEXT NOT NULL DEFAULT '{}',
    context_active INTEGER NOT NULL DEFAULT 1 CHECK (context_active IN (0, 1)),
    computed_us INTEGER NOT NULL,
    PRIMARY KEY (period, key)
);

CREATE TABLE IF NOT EXISTS aggregate_jobs (
    period TEXT PRIMARY KEY,
    status TEXT NOT NULL CHECK (status IN ('pending', 'running', 'done', 'failed')),
    rows_written INTEGER NOT NULL DEFAULT 0,
    started_us INTEGER NOT NULL,
    finished_us INTEGER,
    error TEXT
);

CREATE TABLE IF NOT EXISTS store_meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    schema_version INTEGER NOT NULL,
    created_at_us INTEGER NOT NULL DEFAULT 0
);

INSERT OR IGNORE INTO store_meta (id, schema_version, created_at_us)
VALUES (1, 1, 0);
";

/// Migration v2: read-path indexes for period scans and dedup lookups.
pub const MIGRATION_V2_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_events_id_seq
    ON events(event_id, seq DESC);

CREATE INDEX IF NOT EXISTS idx_events_entity_ts
    ON events(entity, event_ts_us);

CREATE INDEX IF NOT EXISTS idx_snapshots_entity_deleted
    ON entity_snapshots(entity, deleted);

CREATE INDEX IF NOT EXISTS idx_aggregates_period
    ON aggregates(period);

UPDATE store_meta
SET schema_version = 2
WHERE id = 1;
";

/// Indexes expected by the period-scan and view query paths.
pub const REQUIRED_INDEXES: &[&str] = &[
    "idx_events_id_seq",
    "idx_events_entity_ts",
    "idx_snapshots_entity_deleted",
    "idx_aggregates_period",
];
