//! Pipeline coordination: retries, backfills, and the operational surface.
//!
//! The [`Coordinator`] owns paths and config rather than a live connection;
//! every operation opens its own connection, which is what lets backfill
//! workers run disjoint periods on parallel threads. Scheduling stays
//! external: callers decide when a period should run, the coordinator only
//! sequences one run (with bounded retries) or one range.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use crate::aggregate::{Aggregator, JobRecord, JobReport};
use crate::config::AggregateConfig;
use crate::db;
use crate::error::ErrorCode;
use crate::event::ChangeEvent;
use crate::period::Period;
use crate::reconcile::{IngestLag, Reconciler};
use crate::store::EventStore;

/// Terminal result of one coordinated period run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum PeriodOutcome {
    Done { report: JobReport, attempts: u32 },
    Failed {
        period: Period,
        code: String,
        error: String,
        attempts: u32,
    },
}

impl PeriodOutcome {
    #[must_use]
    pub const fn is_done(&self) -> bool {
        matches!(self, Self::Done { .. })
    }

    #[must_use]
    pub const fn period(&self) -> Period {
        match self {
            Self::Done { report, .. } => report.period,
            Self::Failed { period, .. } => *period,
        }
    }
}

/// Results of a backfill over a period range, oldest first.
#[derive(Debug, Serialize)]
pub struct BackfillSummary {
    pub done: usize,
    pub failed: usize,
    pub outcomes: Vec<PeriodOutcome>,
}

/// Counters from one ingested batch of normalized events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub applied: usize,
    pub stale: usize,
    pub recorded: usize,
    pub duplicates: usize,
    pub errors: usize,
}

pub struct Coordinator {
    store_path: PathBuf,
    lock_dir: PathBuf,
    config: AggregateConfig,
}

impl Coordinator {
    #[must_use]
    pub const fn new(store_path: PathBuf, lock_dir: PathBuf, config: AggregateConfig) -> Self {
        Self {
            store_path,
            lock_dir,
            config,
        }
    }

    /// Route a batch of normalized events: the aggregation entity goes to
    /// the append-only store, everything else to the current-state table.
    /// Activity events never become snapshots, so the reconciled view (and
    /// its lag metric) covers only context entities.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be opened or a batch
    /// transaction fails. Per-event failures are counted, not raised.
    pub fn ingest(&self, events: &[ChangeEvent]) -> Result<IngestStats> {
        let conn = db::open_store(&self.store_path)?;
        let reconciler = Reconciler::new(&conn);
        let store = EventStore::new(&conn, self.config.time_field.clone());

        let (stream, context): (Vec<ChangeEvent>, Vec<ChangeEvent>) = events
            .iter()
            .cloned()
            .partition(|e| e.entity == self.config.event_entity);

        let apply = reconciler.apply_batch(&context)?;
        let record = store.record_batch(&stream)?;

        Ok(IngestStats {
            applied: apply.applied,
            stale: apply.stale,
            recorded: record.recorded,
            duplicates: record.duplicates,
            errors: apply.errors + record.errors,
        })
    }

    /// Run one period to a terminal state, retrying transient failures with
    /// capped exponential backoff.
    ///
    /// # Errors
    ///
    /// Returns an error only if the store cannot be opened; job failures
    /// come back as [`PeriodOutcome::Failed`].
    pub fn run_period(&self, period: Period) -> Result<PeriodOutcome> {
        let conn = db::open_store(&self.store_path)
            .with_context(|| format!("open store at {}", self.store_path.display()))?;
        let aggregator = Aggregator::new(&conn, self.config.clone(), self.lock_dir.clone());

        let mut attempts = 0;
        loop {
            attempts += 1;
            match aggregator.run(period) {
                Ok(report) => return Ok(PeriodOutcome::Done { report, attempts }),
                Err(e) if e.is_transient() && attempts <= self.config.retries => {
                    let backoff = self.backoff_for(attempts);
                    tracing::warn!(
                        period = %period,
                        attempt = attempts,
                        backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "transient failure; retrying"
                    );
                    thread::sleep(backoff);
                }
                Err(e) => {
                    return Ok(PeriodOutcome::Failed {
                        period,
                        code: e.error_code().code().to_string(),
                        error: e.to_string(),
                        attempts,
                    });
                }
            }
        }
    }

    /// Run every period from `start` through `end` inclusive, oldest first,
    /// on up to `max_concurrent` worker threads. Periods are disjoint
    /// partitions, so parallel runs never contend on data.
    ///
    /// # Errors
    ///
    /// Returns an error if `start > end`.
    pub fn backfill(&self, start: Period, end: Period) -> Result<BackfillSummary> {
        anyhow::ensure!(start <= end, "backfill start {start} is after end {end}");

        let queue: Mutex<VecDeque<Period>> = Mutex::new(start.through(end).collect());
        let outcomes: Mutex<Vec<PeriodOutcome>> = Mutex::new(Vec::new());
        let workers = self.config.max_concurrent.max(1);

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        let Some(period) = self.next_period(&queue) else {
                            break;
                        };
                        let outcome = self.run_period(period).unwrap_or_else(|e| {
                            PeriodOutcome::Failed {
                                period,
                                code: ErrorCode::InternalUnexpected.code().to_string(),
                                error: e.to_string(),
                                attempts: 0,
                            }
                        });
                        if let Ok(mut acc) = outcomes.lock() {
                            acc.push(outcome);
                        }
                    }
                });
            }
        });

        let mut outcomes = outcomes.into_inner().unwrap_or_default();
        outcomes.sort_by_key(PeriodOutcome::period);
        let done = outcomes.iter().filter(|o| o.is_done()).count();
        Ok(BackfillSummary {
            done,
            failed: outcomes.len() - done,
            outcomes,
        })
    }

    /// Job status for one period, `None` if no job ever ran.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be opened or queried.
    pub fn status(&self, period: Period) -> Result<Option<JobRecord>> {
        let conn = db::open_store(&self.store_path)?;
        let aggregator = Aggregator::new(&conn, self.config.clone(), self.lock_dir.clone());
        aggregator
            .status(period)
            .with_context(|| format!("query job status for {period}"))
    }

    /// Source-to-snapshot ingestion lag across all reconciled entities.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be opened or queried.
    pub fn ingest_lag(&self) -> Result<IngestLag> {
        let conn = db::open_store(&self.store_path)?;
        Reconciler::new(&conn).ingest_lag()
    }

    fn next_period(&self, queue: &Mutex<VecDeque<Period>>) -> Option<Period> {
        queue.lock().ok()?.pop_front()
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = self
            .config
            .backoff_ms
            .saturating_mul(1_u64 << attempt.saturating_sub(1).min(16));
        Duration::from_millis(exp.min(self.config.max_backoff_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Operation;
    use serde_json::json;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    const DAY_US: i64 = 86_400_000_000;

    fn coordinator(dir: &TempDir) -> Coordinator {
        Coordinator::new(
            dir.path().join("store.db"),
            dir.path().join("locks"),
            AggregateConfig {
                backoff_ms: 1,
                max_backoff_ms: 4,
                ..AggregateConfig::default()
            },
        )
    }

    fn activity(id: &str, user: &str, kind: &str, ts_us: i64) -> ChangeEvent {
        let mut payload = BTreeMap::new();
        payload.insert("event_id".to_string(), json!(id));
        payload.insert("user_id".to_string(), json!(user));
        payload.insert("event_type".to_string(), json!(kind));
        payload.insert("event_timestamp".to_string(), json!(ts_us));
        ChangeEvent {
            entity: "events".to_string(),
            key: id.to_string(),
            op: Operation::Insert,
            payload,
            source_ts_us: ts_us,
            received_ts_us: ts_us,
        }
    }

    fn profile(key: &str, name: &str) -> ChangeEvent {
        let mut payload = BTreeMap::new();
        payload.insert("user_id".to_string(), json!(key));
        payload.insert("full_name".to_string(), json!(name));
        ChangeEvent {
            entity: "users".to_string(),
            key: key.to_string(),
            op: Operation::Insert,
            payload,
            source_ts_us: 1,
            received_ts_us: 1,
        }
    }

    #[test]
    fn ingest_routes_by_entity() {
        let dir = tempfile::tempdir().expect("temp dir");
        let coord = coordinator(&dir);

        let stats = coord
            .ingest(&[
                profile("u1", "Alice"),
                activity("e1", "u1", "page_view", DAY_US),
                activity("e1", "u1", "page_view", DAY_US), // duplicate record
            ])
            .expect("ingest");

        // Only the profile hits the reconciler; activity rows go to the
        // store and never become snapshots.
        assert_eq!(stats.applied, 1);
        assert_eq!(stats.recorded, 1);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.errors, 0);

        let lag = coord.ingest_lag().expect("lag");
        assert_eq!(lag.rows, 1);
    }

    #[test]
    fn run_period_completes_end_to_end() {
        let dir = tempfile::tempdir().expect("temp dir");
        let coord = coordinator(&dir);

        coord
            .ingest(&[
                profile("u1", "Alice"),
                activity("e1", "u1", "page_view", DAY_US + 100),
                activity("e2", "u1", "purchase", DAY_US + 200),
            ])
            .expect("ingest");

        let period: Period = "1970-01-02".parse().expect("period");
        let outcome = coord.run_period(period).expect("run");
        let PeriodOutcome::Done { report, attempts } = outcome else {
            panic!("expected done, got {outcome:?}");
        };
        assert_eq!(attempts, 1);
        assert_eq!(report.rows_written, 1);

        let record = coord.status(period).expect("status").expect("recorded");
        assert_eq!(record.rows_written, 1);
    }

    #[test]
    fn transient_failures_exhaust_retries() {
        let dir = tempfile::tempdir().expect("temp dir");
        let coord = Coordinator::new(
            dir.path().join("store.db"),
            dir.path().join("locks"),
            AggregateConfig {
                // A zero deadline times out on the first phase check, and a
                // timeout is transient, so every retry burns the same way.
                timeout_secs: 0,
                retries: 2,
                backoff_ms: 1,
                max_backoff_ms: 2,
                ..AggregateConfig::default()
            },
        );

        let period: Period = "1970-01-02".parse().expect("period");
        let outcome = coord.run_period(period).expect("run");
        let PeriodOutcome::Failed { code, attempts, .. } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(code, "E4004");
        assert_eq!(attempts, 3); // initial try + 2 retries
    }

    #[test]
    fn backfill_covers_range_oldest_first() {
        let dir = tempfile::tempdir().expect("temp dir");
        let coord = coordinator(&dir);

        coord
            .ingest(&[
                activity("a", "u1", "click", DAY_US + 1),
                activity("b", "u2", "login", 2 * DAY_US + 1),
            ])
            .expect("ingest");

        let start: Period = "1970-01-01".parse().expect("period");
        let end: Period = "1970-01-04".parse().expect("period");
        let summary = coord.backfill(start, end).expect("backfill");

        assert_eq!(summary.done, 4);
        assert_eq!(summary.failed, 0);
        let periods: Vec<String> = summary
            .outcomes
            .iter()
            .map(|o| o.period().to_string())
            .collect();
        assert_eq!(
            periods,
            vec!["1970-01-01", "1970-01-02", "1970-01-03", "1970-01-04"]
        );
    }

    #[test]
    fn backfill_rejects_inverted_range() {
        let dir = tempfile::tempdir().expect("temp dir");
        let coord = coordinator(&dir);
        let start: Period = "1970-01-05".parse().expect("period");
        let end: Period = "1970-01-01".parse().expect("period");
        assert!(coord.backfill(start, end).is_err());
    }

    #[test]
    fn lag_over_ingested_snapshots() {
        let dir = tempfile::tempdir().expect("temp dir");
        let coord = coordinator(&dir);

        let mut late = profile("u1", "Alice");
        late.source_ts_us = 1_000;
        late.received_ts_us = 5_000;
        coord.ingest(&[late]).expect("ingest");

        let lag = coord.ingest_lag().expect("lag");
        assert_eq!(lag.max_us, 4_000);
        assert_eq!(lag.rows, 1);
    }

    #[test]
    fn backoff_is_capped() {
        let dir = tempfile::tempdir().expect("temp dir");
        let coord = Coordinator::new(
            dir.path().join("store.db"),
            dir.path().join("locks"),
            AggregateConfig {
                backoff_ms: 100,
                max_backoff_ms: 250,
                ..AggregateConfig::default()
            },
        );

        assert_eq!(coord.backoff_for(1), Duration::from_millis(100));
        assert_eq!(coord.backoff_for(2), Duration::from_millis(200));
        assert_eq!(coord.backoff_for(3), Duration::from_millis(250));
        assert_eq!(coord.backoff_for(30), Duration::from_millis(250));
    }
}
