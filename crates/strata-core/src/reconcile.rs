//! Change event → current-state reconciliation.
//!
//! The [`Reconciler`] applies normalized change events to the
//! `entity_snapshots` table, keeping exactly one current row per
//! `(entity, key)`. A write only lands when its version (the source
//! timestamp) is strictly greater than the stored one; equal versions
//! resolve to the later-arriving event. Both checks happen inside a single
//! guarded upsert, so per-key atomicity comes from the statement itself —
//! concurrent readers never see a row mixing fields from two versions.
//!
//! Deletes are soft: the row flips `deleted = 1` and keeps its last-known
//! payload, because downstream aggregation still needs entity context for
//! deleted keys. A tombstone delete (empty payload) preserves the stored
//! payload untouched.

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::event::{ChangeEvent, Operation};

/// What happened to a single applied event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The snapshot was created or replaced.
    Applied,
    /// The event's version was not newer; ignored (safe re-delivery no-op).
    Stale,
}

/// Statistics returned after a batch apply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyStats {
    /// Events that created or replaced a snapshot.
    pub applied: usize,
    /// Events ignored as stale (version ≤ current).
    pub stale: usize,
    /// Events that caused errors (logged and skipped).
    pub errors: usize,
}

/// One reconciled entity snapshot as returned by the read paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntitySnapshot {
    pub entity: String,
    pub key: String,
    pub payload: BTreeMap<String, Value>,
    pub deleted: bool,
    pub version_us: i64,
    pub received_us: i64,
}

/// Ingestion lag summary over the reconciled snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct IngestLag {
    /// Worst observed source-to-snapshot delay, microseconds.
    pub max_us: i64,
    /// Mean observed delay, microseconds.
    pub avg_us: f64,
    /// Snapshots measured.
    pub rows: u64,
}

/// Applies change events to the current-state table.
///
/// Create a `Reconciler` with a connection, then call [`apply`] for each
/// event or [`apply_batch`] for a slice.
///
/// [`apply`]: Reconciler::apply
/// [`apply_batch`]: Reconciler::apply_batch
pub struct Reconciler<'conn> {
    conn: &'conn Connection,
}

impl<'conn> Reconciler<'conn> {
    /// Create a new reconciler backed by the given connection.
    #[must_use]
    pub const fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    /// Apply one event, returning whether it landed or was stale.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying statement fails. A stale event is
    /// not an error.
    pub fn apply(&self, event: &ChangeEvent) -> Result<ApplyOutcome> {
        let deleted = i64::from(event.op == Operation::Delete);
        let payload = event.payload_json();

        // The WHERE clause on the conflict arm is the version gate: strictly
        // newer versions replace, equal versions defer to arrival order, and
        // older versions leave the row untouched (changes() = 0).
        let changed = self
            .conn
            .execute(
                "INSERT INTO entity_snapshots
                    (entity, key, payload, deleted, version_us, received_us)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(entity, key) DO UPDATE SET
                    payload = CASE
                        WHEN excluded.payload = '{}' THEN entity_snapshots.payload
                        ELSE excluded.payload
                    END,
                    deleted = excluded.deleted,
                    version_us = excluded.version_us,
                    received_us = excluded.received_us
                 WHERE excluded.version_us > entity_snapshots.version_us
                    OR (excluded.version_us = entity_snapshots.version_us
                        AND excluded.received_us >= entity_snapshots.received_us)",
                params![
                    event.entity,
                    event.key,
                    payload,
                    deleted,
                    event.source_ts_us,
                    event.received_ts_us,
                ],
            )
            .with_context(|| format!("apply {} event for {}/{}", event.op, event.entity, event.key))?;

        if changed == 0 {
            Ok(ApplyOutcome::Stale)
        } else {
            Ok(ApplyOutcome::Applied)
        }
    }

    /// Apply a batch of events inside a single transaction.
    ///
    /// Individual event failures are logged and counted in `stats.errors`
    /// but never abort the batch — the reconciler does not block on one bad
    /// event.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction itself fails to commit.
    pub fn apply_batch(&self, events: &[ChangeEvent]) -> Result<ApplyStats> {
        let mut stats = ApplyStats::default();

        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .context("begin reconcile transaction")?;

        for event in events {
            match self.apply(event) {
                Ok(ApplyOutcome::Applied) => stats.applied += 1,
                Ok(ApplyOutcome::Stale) => {
                    tracing::debug!(
                        entity = %event.entity,
                        key = %event.key,
                        version_us = event.source_ts_us,
                        "ignoring stale event"
                    );
                    stats.stale += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        entity = %event.entity,
                        key = %event.key,
                        error = %e,
                        "skipping event due to apply error"
                    );
                    stats.errors += 1;
                }
            }
        }

        self.conn
            .execute_batch("COMMIT")
            .context("commit reconcile transaction")?;

        Ok(stats)
    }

    /// The current (non-deleted) snapshots for an entity, ordered by key.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn current_view(&self, entity: &str) -> Result<Vec<EntitySnapshot>> {
        self.view(entity, false)
    }

    /// All snapshots for an entity including soft-deleted ones, ordered by
    /// key. This is the audit view.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn all_view(&self, entity: &str) -> Result<Vec<EntitySnapshot>> {
        self.view(entity, true)
    }

    fn view(&self, entity: &str, include_deleted: bool) -> Result<Vec<EntitySnapshot>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT entity, key, payload, deleted, version_us, received_us
                 FROM entity_snapshots
                 WHERE entity = ?1 AND (?2 OR deleted = 0)
                 ORDER BY key",
            )
            .context("prepare view query")?;

        let rows = stmt
            .query_map(params![entity, include_deleted], row_to_snapshot)
            .context("run view query")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("collect view rows")?;

        Ok(rows)
    }

    /// Fetch one snapshot (deleted or not) by key.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn get(&self, entity: &str, key: &str) -> Result<Option<EntitySnapshot>> {
        self.conn
            .query_row(
                "SELECT entity, key, payload, deleted, version_us, received_us
                 FROM entity_snapshots
                 WHERE entity = ?1 AND key = ?2",
                params![entity, key],
                row_to_snapshot,
            )
            .optional()
            .with_context(|| format!("get snapshot {entity}/{key}"))
    }

    /// Source-to-snapshot lag over the whole table.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn ingest_lag(&self) -> Result<IngestLag> {
        let lag = self
            .conn
            .query_row(
                "SELECT
                    COALESCE(MAX(received_us - version_us), 0),
                    COALESCE(AVG(received_us - version_us), 0.0),
                    COUNT(*)
                 FROM entity_snapshots",
                [],
                |row| {
                    Ok(IngestLag {
                        max_us: row.get(0)?,
                        avg_us: row.get(1)?,
                        rows: row.get::<_, i64>(2)?.unsigned_abs(),
                    })
                },
            )
            .context("query ingest lag")?;
        Ok(lag)
    }
}

fn row_to_snapshot(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntitySnapshot> {
    let payload_json: String = row.get(2)?;
    let payload: BTreeMap<String, Value> =
        serde_json::from_str(&payload_json).unwrap_or_default();
    Ok(EntitySnapshot {
        entity: row.get(0)?,
        key: row.get(1)?,
        payload,
        deleted: row.get::<_, i64>(3)? != 0,
        version_us: row.get(4)?,
        received_us: row.get(5)?,
    })
}
