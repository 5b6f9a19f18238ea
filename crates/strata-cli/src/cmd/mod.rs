//! Command handlers, one module per subcommand.

pub mod backfill;
pub mod ingest;
pub mod init;
pub mod lag;
pub mod run;
pub mod status;
pub mod view;

use anyhow::Result;
use std::path::Path;

use strata_core::config::{self, ProjectConfig};
use strata_core::coordinate::Coordinator;
use strata_core::error::ErrorCode;

/// Fail with a remediation hint unless `st init` has run here.
pub fn ensure_initialized(project_root: &Path) -> Result<()> {
    if config::data_dir(project_root).exists() {
        return Ok(());
    }
    let code = ErrorCode::NotInitialized;
    anyhow::bail!(
        "{}: {}. {}",
        code.code(),
        code.message(),
        code.hint().unwrap_or_default()
    )
}

/// Build a coordinator from the project's config and standard paths.
pub fn coordinator(project_root: &Path, config: &ProjectConfig) -> Coordinator {
    Coordinator::new(
        config::store_path(project_root),
        config::lock_dir(project_root),
        config.aggregate.clone(),
    )
}
