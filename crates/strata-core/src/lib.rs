//! strata-core library.
//!
//! Synchronizes operational change streams into an analytics-shaped SQLite
//! store: normalized change events feed a reconciled current-state view and
//! an append-only event log, which per-period jobs fold into idempotent
//! aggregates.
//!
//! # Conventions
//!
//! - **Errors**: `anyhow::Result` with context at orchestration seams;
//!   typed errors (`thiserror`) at the leaves, each mapped to a stable
//!   [`error::ErrorCode`].
//! - **Logging**: `tracing` macros (`info!`, `warn!`, `error!`, `debug!`).
//! - **Timestamps**: microseconds since the Unix epoch, `_us` suffix.

pub mod aggregate;
pub mod config;
pub mod coordinate;
pub mod db;
pub mod error;
pub mod event;
pub mod lock;
pub mod period;
pub mod reconcile;
pub mod store;

pub use aggregate::{Aggregator, JobReport, JobStatus};
pub use config::{AggregateConfig, ProjectConfig};
pub use coordinate::{Coordinator, PeriodOutcome};
pub use error::{AggregateError, ErrorCode, NormalizeError};
pub use event::{ChangeEvent, Operation};
pub use period::Period;
pub use reconcile::{ApplyOutcome, Reconciler};
pub use store::{EventStore, RecordOutcome};
