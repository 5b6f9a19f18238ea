//! Idempotent per-period aggregation.
//!
//! The [`Aggregator`] turns one calendar day of append-only events into the
//! `aggregates` partition for that day, one row per group key. A run walks
//! a fixed sequence of phases:
//!
//! ```text
//! pending -> validating -> clearing -> computing -> verifying -> done
//!                                                              \-> failed
//! ```
//!
//! Clearing is the idempotency anchor: the target partition is deleted
//! before anything is written, scoped strictly to the requested period, and
//! committed on its own so a failed or crashed run always leaves the
//! partition empty rather than half-written. Computing and verifying share
//! one transaction; a verification failure rolls the inserts back.
//!
//! Mutual exclusion per period is the advisory file lock; the `running`
//! claim row in `aggregate_jobs` records job state for observers but does
//! not gate a run. A `running` row left behind by a crashed process is
//! reclaimed on the next run, since the OS releases the crashed holder's
//! lock. Distinct periods never contend.

use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::{Duration, Instant};

use crate::config::AggregateConfig;
use crate::error::AggregateError;
use crate::lock::{LockError, PeriodLock};
use crate::period::Period;

/// External job state as recorded in `aggregate_jobs`.
///
/// The intermediate phases (validating, clearing, computing, verifying) all
/// surface as `Running`; they exist in logs, not in the claim row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = UnknownJobStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(UnknownJobStatus(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown job status: {0}")]
pub struct UnknownJobStatus(pub String);

/// One row of `aggregate_jobs`, the per-period status record.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub period: Period,
    pub status: JobStatus,
    pub rows_written: u64,
    pub started_us: i64,
    pub finished_us: Option<i64>,
    pub error: Option<String>,
}

/// One computed aggregate row as read back from the store.
#[derive(Debug, Clone, Serialize)]
pub struct AggregateRow {
    pub period: Period,
    pub key: String,
    pub event_count: u64,
    pub last_event_us: i64,
    pub category_counts: BTreeMap<String, u64>,
    pub context: BTreeMap<String, Value>,
    pub context_active: bool,
    pub computed_us: i64,
}

/// Summary of a completed run, rendered by the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub period: Period,
    pub events_seen: u64,
    pub context_rows: u64,
    pub cleared: u64,
    pub rows_written: u64,
    pub compacted: u64,
    pub elapsed_ms: u64,
}

/// Per-group accumulator built during the computing phase.
#[derive(Debug, Default)]
struct GroupAcc {
    count: u64,
    last_event_us: i64,
    categories: BTreeMap<String, u64>,
}

/// Runs per-period aggregation jobs against a single store connection.
pub struct Aggregator<'conn> {
    conn: &'conn Connection,
    config: AggregateConfig,
    lock_dir: PathBuf,
}

impl<'conn> Aggregator<'conn> {
    #[must_use]
    pub const fn new(conn: &'conn Connection, config: AggregateConfig, lock_dir: PathBuf) -> Self {
        Self {
            conn,
            config,
            lock_dir,
        }
    }

    /// Run the full job for one period.
    ///
    /// # Errors
    ///
    /// `PeriodBusy` when another job holds this period; `TimedOut`,
    /// `VerificationFailed`, `PreconditionFailed` or storage errors when a
    /// claimed job fails. Claimed failures are recorded in `aggregate_jobs`
    /// before returning.
    pub fn run(&self, period: Period) -> Result<JobReport, AggregateError> {
        let _lock = match PeriodLock::acquire(&self.lock_dir, period, Duration::ZERO) {
            Ok(lock) => lock,
            Err(LockError::Timeout { .. }) => {
                return Err(AggregateError::PeriodBusy {
                    period: period.to_string(),
                });
            }
            Err(e @ LockError::IoError(_)) => return Err(AggregateError::Lock { source: e }),
        };

        let started_us = now_us();
        self.claim(period, started_us)?;

        let started = Instant::now();
        match self.execute(period, started, started_us) {
            Ok(report) => {
                self.finish(period, JobStatus::Done, report.rows_written, None)?;
                tracing::info!(
                    period = %period,
                    rows = report.rows_written,
                    elapsed_ms = report.elapsed_ms,
                    "aggregation done"
                );
                Ok(report)
            }
            Err(e) => {
                // Claim row must not stay `running` after a failure; a retry
                // needs to be able to re-claim.
                if let Err(mark) = self.finish(period, JobStatus::Failed, 0, Some(&e.to_string())) {
                    tracing::error!(period = %period, error = %mark, "failed to mark job failed");
                }
                tracing::warn!(period = %period, error = %e, "aggregation failed");
                Err(e)
            }
        }
    }

    /// The recorded job state for a period, if any job ever ran.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the query fails.
    pub fn status(&self, period: Period) -> Result<Option<JobRecord>, AggregateError> {
        let record = self
            .conn
            .query_row(
                "SELECT status, rows_written, started_us, finished_us, error
                 FROM aggregate_jobs WHERE period = ?1",
                params![period.to_string()],
                |row| {
                    let status: String = row.get(0)?;
                    let rows: i64 = row.get(1)?;
                    Ok((status, rows, row.get(2)?, row.get(3)?, row.get(4)?))
                },
            )
            .optional()?;

        let Some((status, rows, started_us, finished_us, error)) = record else {
            return Ok(None);
        };
        let status = status
            .parse::<JobStatus>()
            .map_err(|e| AggregateError::PreconditionFailed {
                detail: e.to_string(),
            })?;

        Ok(Some(JobRecord {
            period,
            status,
            rows_written: rows.unsigned_abs(),
            started_us,
            finished_us,
            error,
        }))
    }

    /// Computed rows for a period, ordered by group key.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the query fails.
    pub fn rows_for_period(&self, period: Period) -> Result<Vec<AggregateRow>, AggregateError> {
        let mut stmt = self.conn.prepare(
            "SELECT key, event_count, last_event_us, category_counts,
                    context, context_active, computed_us
             FROM aggregates WHERE period = ?1 ORDER BY key",
        )?;

        let rows = stmt
            .query_map(params![period.to_string()], |row| {
                let counts_json: String = row.get(3)?;
                let context_json: String = row.get(4)?;
                Ok(AggregateRow {
                    period,
                    key: row.get(0)?,
                    event_count: row.get::<_, i64>(1)?.unsigned_abs(),
                    last_event_us: row.get(2)?,
                    category_counts: serde_json::from_str(&counts_json).unwrap_or_default(),
                    context: serde_json::from_str(&context_json).unwrap_or_default(),
                    context_active: row.get::<_, i64>(5)? != 0,
                    computed_us: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows)
    }

    /// Mark the job row `running`. Called with the period lock held, so an
    /// existing `running` row can only be a crash leftover (the OS released
    /// the previous holder's lock) and is reclaimed rather than rejected.
    fn claim(&self, period: Period, started_us: i64) -> Result<(), AggregateError> {
        self.conn.execute(
            "INSERT INTO aggregate_jobs (period, status, rows_written, started_us)
             VALUES (?1, 'running', 0, ?2)
             ON CONFLICT(period) DO UPDATE SET
                status = 'running',
                rows_written = 0,
                started_us = excluded.started_us,
                finished_us = NULL,
                error = NULL",
            params![period.to_string(), started_us],
        )?;
        Ok(())
    }

    fn finish(
        &self,
        period: Period,
        status: JobStatus,
        rows_written: u64,
        error: Option<&str>,
    ) -> Result<(), AggregateError> {
        let written = i64::try_from(rows_written).unwrap_or(i64::MAX);
        self.conn.execute(
            "UPDATE aggregate_jobs
             SET status = ?2, rows_written = ?3, finished_us = ?4, error = ?5
             WHERE period = ?1",
            params![period.to_string(), status.as_str(), written, now_us(), error],
        )?;
        Ok(())
    }

    fn execute(
        &self,
        period: Period,
        started: Instant,
        computed_us: i64,
    ) -> Result<JobReport, AggregateError> {
        let (events_seen, context_rows) = self.validate(period)?;
        self.check_deadline(period, started)?;

        let cleared = self.clear(period)?;
        self.check_deadline(period, started)?;

        let rows_written = if events_seen == 0 {
            tracing::info!(period = %period, cleared, "period has no events; nothing to compute");
            0
        } else {
            self.compute_and_verify(period, computed_us, started)?
        };

        let compacted = self.compact(period);

        Ok(JobReport {
            period,
            events_seen,
            context_rows,
            cleared,
            rows_written,
            compacted,
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        })
    }

    /// Validating phase: confirm source counts and schema integrity.
    fn validate(&self, period: Period) -> Result<(u64, u64), AggregateError> {
        let version: i64 =
            self.conn
                .query_row("SELECT schema_version FROM store_meta WHERE id = 1", [], |row| {
                    row.get(0)
                })?;
        if version != i64::from(crate::db::migrations::LATEST_SCHEMA_VERSION) {
            return Err(AggregateError::PreconditionFailed {
                detail: format!(
                    "store schema version {version} does not match expected {}",
                    crate::db::migrations::LATEST_SCHEMA_VERSION
                ),
            });
        }

        let events_seen: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM events
             WHERE seq IN (SELECT MAX(seq) FROM events GROUP BY event_id)
               AND entity = ?1 AND event_ts_us >= ?2 AND event_ts_us < ?3",
            params![self.config.event_entity, period.start_us(), period.end_us()],
            |row| row.get(0),
        )?;

        let context_rows: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM entity_snapshots WHERE entity = ?1",
            params![self.config.context_entity],
            |row| row.get(0),
        )?;

        tracing::debug!(
            period = %period,
            events = events_seen,
            context = context_rows,
            "validated period sources"
        );
        Ok((events_seen.unsigned_abs(), context_rows.unsigned_abs()))
    }

    /// Clearing phase: wipe exactly this partition, committed on its own.
    fn clear(&self, period: Period) -> Result<u64, AggregateError> {
        let cleared = self.conn.execute(
            "DELETE FROM aggregates WHERE period = ?1",
            params![period.to_string()],
        )?;
        tracing::debug!(period = %period, cleared, "cleared partition");
        Ok(cleared as u64)
    }

    /// Computing and verifying phases, one transaction. Verification failure
    /// rolls the inserts back, leaving the cleared partition empty.
    fn compute_and_verify(
        &self,
        period: Period,
        computed_us: i64,
        started: Instant,
    ) -> Result<u64, AggregateError> {
        let groups = self.group_events(period)?;
        self.check_deadline(period, started)?;

        let mut grouped_events: u64 = 0;
        for acc in groups.values() {
            grouped_events += acc.count;
        }

        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        let result = self.insert_and_verify(period, computed_us, &groups, grouped_events, started);
        match result {
            Ok(rows) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(rows)
            }
            Err(e) => {
                if let Err(rollback) = self.conn.execute_batch("ROLLBACK") {
                    tracing::error!(period = %period, error = %rollback, "rollback failed");
                }
                Err(e)
            }
        }
    }

    fn insert_and_verify(
        &self,
        period: Period,
        computed_us: i64,
        groups: &BTreeMap<String, GroupAcc>,
        grouped_events: u64,
        started: Instant,
    ) -> Result<u64, AggregateError> {
        let mut stmt = self.conn.prepare(
            "INSERT INTO aggregates
                (period, key, event_count, last_event_us, category_counts,
                 context, context_active, computed_us)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;

        for (key, acc) in groups {
            let (context, active) = self.context_for(key)?;
            stmt.execute(params![
                period.to_string(),
                key,
                i64::try_from(acc.count).unwrap_or(i64::MAX),
                acc.last_event_us,
                counts_json(&acc.categories),
                context,
                i64::from(active),
                computed_us,
            ])?;
        }
        drop(stmt);

        self.check_deadline(period, started)?;

        // Verifying phase: the partition must exactly mirror what grouping
        // produced before the job may go `done`.
        let (rows, total): (i64, i64) = self.conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(event_count), 0)
             FROM aggregates WHERE period = ?1",
            params![period.to_string()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        if rows.unsigned_abs() != groups.len() as u64 {
            return Err(AggregateError::VerificationFailed {
                detail: format!("expected {} rows, found {rows}", groups.len()),
            });
        }
        if total.unsigned_abs() != grouped_events {
            return Err(AggregateError::VerificationFailed {
                detail: format!("event_count sum {total} does not match {grouped_events} grouped events"),
            });
        }
        for (key, acc) in groups {
            let sum: u64 = acc.categories.values().sum();
            if sum != acc.count {
                return Err(AggregateError::VerificationFailed {
                    detail: format!("category sum {sum} != event count {} for key {key}", acc.count),
                });
            }
        }

        Ok(rows.unsigned_abs())
    }

    /// Group the period's latest-write events by the configured field.
    fn group_events(&self, period: Period) -> Result<BTreeMap<String, GroupAcc>, AggregateError> {
        let mut stmt = self.conn.prepare(
            "SELECT payload, event_ts_us FROM events
             WHERE seq IN (SELECT MAX(seq) FROM events GROUP BY event_id)
               AND entity = ?1 AND event_ts_us >= ?2 AND event_ts_us < ?3
             ORDER BY seq",
        )?;

        let rows = stmt.query_map(
            params![self.config.event_entity, period.start_us(), period.end_us()],
            |row| {
                let payload: String = row.get(0)?;
                let ts: i64 = row.get(1)?;
                Ok((payload, ts))
            },
        )?;

        let mut groups: BTreeMap<String, GroupAcc> = BTreeMap::new();
        let mut ungrouped: u64 = 0;
        for row in rows {
            let (payload, event_ts_us) = row?;
            let fields: BTreeMap<String, Value> =
                serde_json::from_str(&payload).unwrap_or_default();

            let Some(key) = field_string(&fields, &self.config.group_field) else {
                ungrouped += 1;
                continue;
            };
            let category = field_string(&fields, &self.config.category_field)
                .unwrap_or_else(|| "unknown".to_string());

            let acc = groups.entry(key).or_insert_with(|| GroupAcc {
                count: 0,
                last_event_us: i64::MIN,
                categories: self
                    .config
                    .categories
                    .iter()
                    .map(|c| (c.clone(), 0))
                    .collect(),
            });
            acc.count += 1;
            acc.last_event_us = acc.last_event_us.max(event_ts_us);
            *acc.categories.entry(category).or_insert(0) += 1;
        }

        if ungrouped > 0 {
            tracing::warn!(
                period = %period,
                field = %self.config.group_field,
                skipped = ungrouped,
                "events missing group field were excluded"
            );
        }
        Ok(groups)
    }

    /// Current snapshot context for a group key, deleted entities included.
    /// A key with no reconciled snapshot gets empty context and counts as
    /// inactive, the same as an unmatched left join.
    fn context_for(&self, key: &str) -> Result<(String, bool), AggregateError> {
        let found: Option<(String, i64)> = self
            .conn
            .query_row(
                "SELECT payload, deleted FROM entity_snapshots
                 WHERE entity = ?1 AND key = ?2",
                params![self.config.context_entity, key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match found {
            Some((payload, deleted)) => Ok((payload, deleted == 0)),
            None => Ok(("{}".to_string(), false)),
        }
    }

    /// Prune superseded physical event rows for the period. Best-effort,
    /// mirrors a post-run partition optimize: failure is logged, never
    /// failing a job that already committed.
    fn compact(&self, period: Period) -> u64 {
        let pruned = self.conn.execute(
            "DELETE FROM events
             WHERE entity = ?1 AND event_ts_us >= ?2 AND event_ts_us < ?3
               AND seq NOT IN (SELECT MAX(seq) FROM events GROUP BY event_id)",
            params![self.config.event_entity, period.start_us(), period.end_us()],
        );

        match pruned {
            Ok(n) => n as u64,
            Err(e) => {
                tracing::warn!(period = %period, error = %e, "compaction failed; continuing");
                0
            }
        }
    }

    fn check_deadline(&self, period: Period, started: Instant) -> Result<(), AggregateError> {
        let timeout = Duration::from_secs(self.config.timeout_secs);
        if started.elapsed() >= timeout {
            return Err(AggregateError::TimedOut {
                period: period.to_string(),
                timeout_secs: self.config.timeout_secs,
            });
        }
        Ok(())
    }
}

fn field_string(fields: &BTreeMap<String, Value>, field: &str) -> Option<String> {
    match fields.get(field) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn counts_json(categories: &BTreeMap<String, u64>) -> String {
    let map: serde_json::Map<String, Value> = categories
        .iter()
        .map(|(k, v)| (k.clone(), Value::from(*v)))
        .collect();
    Value::Object(map).to_string()
}

fn now_us() -> i64 {
    chrono::Utc::now().timestamp_micros()
}
