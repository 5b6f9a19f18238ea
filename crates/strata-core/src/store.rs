//! Append-only event history.
//!
//! The [`EventStore`] keeps every non-delete change event as an immutable
//! row. Corrections to an event arrive as new rows sharing the same
//! `event_id`; reads resolve to the row with the highest `seq` per id, so
//! the aggregation layer sees latest-write semantics without the store ever
//! mutating history in place.

use anyhow::{Context, Result};
use chrono::DateTime;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;

use crate::event::{ChangeEvent, Operation};
use crate::period::Period;

/// What happened to a single recorded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// A new row was appended.
    Recorded,
    /// The latest row for this event id already has identical content.
    Duplicate,
    /// Delete operations are not events; nothing recorded.
    Skipped,
}

/// Statistics returned after a batch record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordStats {
    pub recorded: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// One resolved (latest-write) event row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEvent {
    pub seq: i64,
    pub event_id: String,
    pub entity: String,
    pub event_ts_us: i64,
    pub payload: String,
    pub fingerprint: String,
    pub recorded_us: i64,
}

/// Append-only writer and latest-write reader over the `events` table.
pub struct EventStore<'conn> {
    conn: &'conn Connection,
    /// Payload field holding event time; absent or unparseable values fall
    /// back to the change event's source timestamp.
    time_field: String,
}

impl<'conn> EventStore<'conn> {
    #[must_use]
    pub const fn new(conn: &'conn Connection, time_field: String) -> Self {
        Self { conn, time_field }
    }

    /// Record one change event, deduplicating identical re-deliveries.
    ///
    /// # Errors
    ///
    /// Returns an error if reading the current latest row or appending
    /// fails.
    pub fn record(&self, event: &ChangeEvent) -> Result<RecordOutcome> {
        if event.op == Operation::Delete {
            return Ok(RecordOutcome::Skipped);
        }

        let payload = event.payload_json();
        let fingerprint = blake3::hash(payload.as_bytes()).to_hex().to_string();

        let latest: Option<String> = self
            .conn
            .query_row(
                "SELECT fingerprint FROM events
                 WHERE event_id = ?1
                 ORDER BY seq DESC LIMIT 1",
                params![event.key],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("look up latest row for event {}", event.key))?;

        if latest.as_deref() == Some(fingerprint.as_str()) {
            return Ok(RecordOutcome::Duplicate);
        }

        let event_ts_us = self.extract_event_ts(event);
        self.conn
            .execute(
                "INSERT INTO events
                    (event_id, entity, event_ts_us, payload, fingerprint, recorded_us)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event.key,
                    event.entity,
                    event_ts_us,
                    payload,
                    fingerprint,
                    event.received_ts_us,
                ],
            )
            .with_context(|| format!("append event {}", event.key))?;

        Ok(RecordOutcome::Recorded)
    }

    /// Record a batch inside one transaction, counting per-event outcomes.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails to commit.
    pub fn record_batch(&self, events: &[ChangeEvent]) -> Result<RecordStats> {
        let mut stats = RecordStats::default();

        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .context("begin record transaction")?;

        for event in events {
            match self.record(event) {
                Ok(RecordOutcome::Recorded) => stats.recorded += 1,
                Ok(RecordOutcome::Duplicate) => stats.duplicates += 1,
                Ok(RecordOutcome::Skipped) => stats.skipped += 1,
                Err(e) => {
                    tracing::warn!(
                        entity = %event.entity,
                        key = %event.key,
                        error = %e,
                        "skipping event due to record error"
                    );
                    stats.errors += 1;
                }
            }
        }

        self.conn
            .execute_batch("COMMIT")
            .context("commit record transaction")?;

        Ok(stats)
    }

    /// Latest-write events whose event time falls in the given period.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn events_for_period(&self, period: Period) -> Result<Vec<StoredEvent>> {
        self.events_in(period.start_us(), period.end_us())
    }

    /// Latest-write events with event time in `[start_us, end_us)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn events_in(&self, start_us: i64, end_us: i64) -> Result<Vec<StoredEvent>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT seq, event_id, entity, event_ts_us, payload, fingerprint, recorded_us
                 FROM events
                 WHERE seq IN (SELECT MAX(seq) FROM events GROUP BY event_id)
                   AND event_ts_us >= ?1 AND event_ts_us < ?2
                 ORDER BY event_ts_us, seq",
            )
            .context("prepare event range query")?;

        let rows = stmt
            .query_map(params![start_us, end_us], row_to_event)
            .context("run event range query")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("collect event rows")?;

        Ok(rows)
    }

    /// Count of latest-write events in a period, for validation.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn count_for_period(&self, period: Period) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM events
                 WHERE seq IN (SELECT MAX(seq) FROM events GROUP BY event_id)
                   AND event_ts_us >= ?1 AND event_ts_us < ?2",
                params![period.start_us(), period.end_us()],
                |row| row.get(0),
            )
            .context("count period events")?;
        Ok(count.unsigned_abs())
    }

    /// Drop superseded physical rows for a period, keeping the latest write
    /// per event id. Returns rows pruned.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn compact_period(&self, period: Period) -> Result<usize> {
        let pruned = self
            .conn
            .execute(
                "DELETE FROM events
                 WHERE event_ts_us >= ?1 AND event_ts_us < ?2
                   AND seq NOT IN (SELECT MAX(seq) FROM events GROUP BY event_id)",
                params![period.start_us(), period.end_us()],
            )
            .with_context(|| format!("compact events for {period}"))?;
        Ok(pruned)
    }

    fn extract_event_ts(&self, event: &ChangeEvent) -> i64 {
        match event.payload.get(&self.time_field) {
            Some(Value::Number(n)) => n.as_i64().unwrap_or(event.source_ts_us),
            Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
                .map_or(event.source_ts_us, |dt| dt.timestamp_micros()),
            _ => event.source_ts_us,
        }
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredEvent> {
    Ok(StoredEvent {
        seq: row.get(0)?,
        event_id: row.get(1)?,
        entity: row.get(2)?,
        event_ts_us: row.get(3)?,
        payload: row.get(4)?,
        fingerprint: row.get(5)?,
        recorded_us: row.get(6)?,
    })
}
