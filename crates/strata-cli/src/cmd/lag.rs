use anyhow::Result;
use clap::Args;
use std::path::Path;

use strata_core::config;

use crate::output::{self, OutputMode};

#[derive(Args, Debug)]
pub struct LagArgs {}

pub fn run_lag(_args: &LagArgs, mode: OutputMode, project_root: &Path) -> Result<()> {
    super::ensure_initialized(project_root)?;
    let config = config::load_project_config(project_root)?;
    let coordinator = super::coordinator(project_root, &config);

    let lag = coordinator.ingest_lag()?;
    output::render(mode, &lag, |lag, w| {
        output::kv(w, "snapshots", lag.rows.to_string())?;
        output::kv(w, "max_lag_us", lag.max_us.to_string())?;
        output::kv(w, "avg_lag_us", format!("{:.0}", lag.avg_us))
    })
}
