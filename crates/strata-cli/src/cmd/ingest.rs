use anyhow::{Context as _, Result};
use clap::Args;
use std::io::Read;
use std::path::{Path, PathBuf};

use strata_core::config;
use strata_core::error::ErrorCode;
use strata_core::event::Normalizer;

use crate::output::{self, OutputMode};

#[derive(Args, Debug)]
pub struct IngestArgs {
    /// Configured source entity these records belong to.
    #[arg(long)]
    pub source: String,

    /// NDJSON file of raw change records; reads stdin when omitted.
    #[arg(long)]
    pub file: Option<PathBuf>,
}

pub fn run_ingest(args: &IngestArgs, mode: OutputMode, project_root: &Path) -> Result<()> {
    super::ensure_initialized(project_root)?;
    let config = config::load_project_config(project_root)?;

    let Some(spec) = config.sources.iter().find(|s| s.entity == args.source) else {
        let code = ErrorCode::UnknownSource;
        anyhow::bail!(
            "{}: {} '{}'. {}",
            code.code(),
            code.message(),
            args.source,
            code.hint().unwrap_or_default()
        );
    };

    let input = match &args.file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read stdin")?;
            buf
        }
    };

    let received_us = chrono::Utc::now().timestamp_micros();
    let normalizer = Normalizer::new(spec.clone());
    let (events, norm) = normalizer.normalize_lines(&input, received_us);

    let coordinator = super::coordinator(project_root, &config);
    let stats = coordinator.ingest(&events)?;

    #[derive(serde::Serialize)]
    struct IngestResult {
        source: String,
        normalized: usize,
        malformed: usize,
        applied: usize,
        stale: usize,
        recorded: usize,
        duplicates: usize,
        errors: usize,
    }

    let result = IngestResult {
        source: args.source.clone(),
        normalized: norm.normalized,
        malformed: norm.malformed,
        applied: stats.applied,
        stale: stats.stale,
        recorded: stats.recorded,
        duplicates: stats.duplicates,
        errors: stats.errors,
    };

    output::render(mode, &result, |r, w| {
        output::kv(w, "source", &r.source)?;
        output::kv(w, "normalized", r.normalized.to_string())?;
        output::kv(w, "malformed", r.malformed.to_string())?;
        output::kv(w, "applied", r.applied.to_string())?;
        output::kv(w, "stale", r.stale.to_string())?;
        output::kv(w, "recorded", r.recorded.to_string())?;
        output::kv(w, "duplicates", r.duplicates.to_string())
    })
}
