use anyhow::Result;
use clap::Args;
use std::path::Path;

use strata_core::aggregate::Aggregator;
use strata_core::config;
use strata_core::db;
use strata_core::period::Period;
use strata_core::reconcile::Reconciler;

use crate::output::{self, OutputMode};

#[derive(Args, Debug)]
pub struct ViewArgs {
    /// Entity whose reconciled snapshots to show.
    #[arg(value_name = "ENTITY", required_unless_present = "period")]
    pub entity: Option<String>,

    /// Show computed aggregate rows for this period instead.
    #[arg(long, conflicts_with = "entity")]
    pub period: Option<Period>,

    /// Include soft-deleted snapshots.
    #[arg(long)]
    pub all: bool,
}

pub fn run_view(args: &ViewArgs, mode: OutputMode, project_root: &Path) -> Result<()> {
    super::ensure_initialized(project_root)?;
    let config = config::load_project_config(project_root)?;
    let conn = db::open_store(&config::store_path(project_root))?;

    if let Some(period) = args.period {
        let aggregator = Aggregator::new(
            &conn,
            config.aggregate.clone(),
            config::lock_dir(project_root),
        );
        let rows = aggregator.rows_for_period(period)?;
        return output::render(mode, &rows, |rows, w| {
            for row in rows {
                output::kv(w, "key", &row.key)?;
                output::kv(w, "events", row.event_count.to_string())?;
                output::kv(w, "last_event_us", row.last_event_us.to_string())?;
                let counts: Vec<String> = row
                    .category_counts
                    .iter()
                    .filter(|(_, n)| **n > 0)
                    .map(|(k, n)| format!("{k}={n}"))
                    .collect();
                output::kv(w, "categories", counts.join(" "))?;
                output::kv(w, "active", row.context_active.to_string())?;
                output::rule(w)?;
            }
            Ok(())
        });
    }

    let entity = args.entity.as_deref().unwrap_or_default();
    let reconciler = Reconciler::new(&conn);
    let snapshots = if args.all {
        reconciler.all_view(entity)?
    } else {
        reconciler.current_view(entity)?
    };

    output::render(mode, &snapshots, |snapshots, w| {
        for snap in snapshots {
            output::kv(w, "key", &snap.key)?;
            output::kv(w, "deleted", snap.deleted.to_string())?;
            output::kv(w, "version_us", snap.version_us.to_string())?;
            output::kv(
                w,
                "payload",
                serde_json::to_string(&snap.payload).unwrap_or_default(),
            )?;
            output::rule(w)?;
        }
        Ok(())
    })
}
