use anyhow::Result;
use clap::Args;
use std::path::Path;

use strata_core::config;
use strata_core::period::Period;

use crate::output::{self, OutputMode};

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Period to query, as YYYY-MM-DD.
    #[arg(value_name = "PERIOD")]
    pub period: Period,
}

pub fn run_status(args: &StatusArgs, mode: OutputMode, project_root: &Path) -> Result<()> {
    super::ensure_initialized(project_root)?;
    let config = config::load_project_config(project_root)?;
    let coordinator = super::coordinator(project_root, &config);

    match coordinator.status(args.period)? {
        Some(record) => output::render(mode, &record, |r, w| {
            output::kv(w, "period", r.period.to_string())?;
            output::kv(w, "status", r.status.to_string())?;
            output::kv(w, "rows", r.rows_written.to_string())?;
            output::kv(w, "started_us", r.started_us.to_string())?;
            if let Some(finished) = r.finished_us {
                output::kv(w, "finished_us", finished.to_string())?;
            }
            if let Some(error) = &r.error {
                output::kv(w, "error", error)?;
            }
            Ok(())
        }),
        None => {
            // A never-run period is pending by definition.
            #[derive(serde::Serialize)]
            struct PendingStatus<'a> {
                period: Period,
                status: &'a str,
            }
            let pending = PendingStatus {
                period: args.period,
                status: "pending",
            };
            output::render(mode, &pending, |p, w| {
                output::kv(w, "period", p.period.to_string())?;
                output::kv(w, "status", p.status)
            })
        }
    }
}
