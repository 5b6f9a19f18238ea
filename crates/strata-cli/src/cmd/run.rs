use anyhow::Result;
use clap::Args;
use std::io::Write;
use std::path::Path;

use strata_core::config;
use strata_core::coordinate::PeriodOutcome;
use strata_core::period::Period;

use crate::output::{self, OutputMode};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Period to aggregate, as YYYY-MM-DD.
    #[arg(value_name = "PERIOD")]
    pub period: Period,
}

pub fn run_run(args: &RunArgs, mode: OutputMode, project_root: &Path) -> Result<()> {
    super::ensure_initialized(project_root)?;
    let config = config::load_project_config(project_root)?;
    let coordinator = super::coordinator(project_root, &config);

    let outcome = coordinator.run_period(args.period)?;
    output::render(mode, &outcome, render_outcome)?;

    // A terminal job failure is a command failure; the details already went
    // to stdout in the selected format.
    if let PeriodOutcome::Failed { code, error, .. } = &outcome {
        anyhow::bail!("{code}: {error}");
    }
    Ok(())
}

pub fn render_outcome(outcome: &PeriodOutcome, w: &mut dyn Write) -> std::io::Result<()> {
    match outcome {
        PeriodOutcome::Done { report, attempts } => {
            output::kv(w, "period", report.period.to_string())?;
            output::kv(w, "status", "done")?;
            output::kv(w, "events", report.events_seen.to_string())?;
            output::kv(w, "cleared", report.cleared.to_string())?;
            output::kv(w, "rows", report.rows_written.to_string())?;
            output::kv(w, "compacted", report.compacted.to_string())?;
            output::kv(w, "attempts", attempts.to_string())?;
            output::kv(w, "elapsed_ms", report.elapsed_ms.to_string())
        }
        PeriodOutcome::Failed {
            period,
            code,
            error,
            attempts,
        } => {
            output::kv(w, "period", period.to_string())?;
            output::kv(w, "status", "failed")?;
            output::kv(w, "code", code)?;
            output::kv(w, "attempts", attempts.to_string())?;
            output::kv(w, "error", error)
        }
    }
}
