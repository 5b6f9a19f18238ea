use anyhow::{Context as _, Result};
use clap::Args;
use std::path::Path;

use strata_core::config;
use strata_core::db;

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Force re-initialization even if `.strata/` already exists.
    #[arg(long)]
    pub force: bool,
}

const CONFIG_TOML: &str = "[aggregate]\n\
    event_entity = \"events\"\n\
    context_entity = \"users\"\n\
    group_field = \"user_id\"\n\
    category_field = \"event_type\"\n\
    time_field = \"event_timestamp\"\n\
    categories = [\"page_view\", \"click\", \"purchase\", \"search\", \"add_to_cart\", \"login\"]\n\
    retries = 3\n\
    backoff_ms = 500\n\
    max_backoff_ms = 10000\n\
    max_concurrent = 4\n\
    timeout_secs = 300\n\
    \n\
    [[sources]]\n\
    entity = \"users\"\n\
    kind = \"row\"\n\
    key_field = \"user_id\"\n\
    \n\
    [[sources]]\n\
    entity = \"events\"\n\
    kind = \"document\"\n\
    key_field = \"event_id\"\n";

const GITIGNORE: &str = "store.db\nstore.db-wal\nstore.db-shm\nlocks/\n";

/// Execute `st init`. Creates the project skeleton:
///
/// ```text
/// .strata/
///   store.db            (SQLite store, migrated to the latest schema)
///   locks/              (per-period advisory lock files)
///   config.toml         (default project config template)
///   .gitignore          (store.db, WAL sidecars, locks/)
/// ```
///
/// # Errors
///
/// Returns an error if `.strata/` already exists and `--force` is not set,
/// or if any filesystem or storage operation fails.
pub fn run_init(args: &InitArgs, project_root: &Path) -> Result<()> {
    let data_dir = config::data_dir(project_root);

    if data_dir.exists() && !args.force {
        anyhow::bail!(".strata/ already exists. Use `st init --force` to reinitialize.");
    }

    let lock_dir = config::lock_dir(project_root);
    std::fs::create_dir_all(&lock_dir)
        .with_context(|| format!("Failed to create lock directory: {}", lock_dir.display()))?;

    let config_path = data_dir.join("config.toml");
    if !config_path.exists() || args.force {
        std::fs::write(&config_path, CONFIG_TOML)
            .with_context(|| format!("Failed to write config: {}", config_path.display()))?;
    }

    std::fs::write(data_dir.join(".gitignore"), GITIGNORE).context("Failed to write .gitignore")?;

    // Opening runs migrations, so the store is query-ready immediately.
    let store_path = config::store_path(project_root);
    db::open_store(&store_path)
        .with_context(|| format!("Failed to initialize store: {}", store_path.display()))?;

    println!("Initialized strata store in {}", data_dir.display());
    Ok(())
}
