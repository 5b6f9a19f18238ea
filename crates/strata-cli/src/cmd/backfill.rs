use anyhow::Result;
use clap::Args;
use std::path::Path;

use strata_core::config;
use strata_core::period::Period;

use crate::output::{self, OutputMode};

#[derive(Args, Debug)]
pub struct BackfillArgs {
    /// First period to aggregate, as YYYY-MM-DD.
    #[arg(value_name = "START")]
    pub start: Period,

    /// Last period (inclusive), as YYYY-MM-DD.
    #[arg(value_name = "END")]
    pub end: Period,
}

pub fn run_backfill(args: &BackfillArgs, mode: OutputMode, project_root: &Path) -> Result<()> {
    super::ensure_initialized(project_root)?;
    let config = config::load_project_config(project_root)?;
    let coordinator = super::coordinator(project_root, &config);

    let summary = coordinator.backfill(args.start, args.end)?;

    output::render(mode, &summary, |s, w| {
        output::kv(w, "periods", s.outcomes.len().to_string())?;
        output::kv(w, "done", s.done.to_string())?;
        output::kv(w, "failed", s.failed.to_string())?;
        output::rule(w)?;
        for outcome in &s.outcomes {
            super::run::render_outcome(outcome, w)?;
            output::rule(w)?;
        }
        Ok(())
    })?;

    if summary.failed > 0 {
        anyhow::bail!("{} of {} periods failed", summary.failed, summary.outcomes.len());
    }
    Ok(())
}
