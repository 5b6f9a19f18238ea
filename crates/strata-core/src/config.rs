use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::event::normalize::SourceSpec;

/// Directory holding the store, locks, and config, relative to the project
/// root.
pub const DATA_DIR: &str = ".strata";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProjectConfig {
    #[serde(default)]
    pub aggregate: AggregateConfig,
    #[serde(default)]
    pub sources: Vec<SourceSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateConfig {
    /// Entity whose append-only events feed aggregation.
    #[serde(default = "default_event_entity")]
    pub event_entity: String,
    /// Entity whose reconciled snapshots provide denormalized context.
    #[serde(default = "default_context_entity")]
    pub context_entity: String,
    /// Payload field events are grouped by.
    #[serde(default = "default_group_field")]
    pub group_field: String,
    /// Payload field whose values are counted per category.
    #[serde(default = "default_category_field")]
    pub category_field: String,
    /// Payload field holding event time (epoch micros or RFC 3339).
    #[serde(default = "default_time_field")]
    pub time_field: String,
    /// Categories pre-seeded to zero in every aggregate row, so consumers
    /// see a stable set of columns even in quiet periods.
    #[serde(default = "default_categories")]
    pub categories: Vec<String>,
    /// Transient-failure retries per period run.
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Initial retry backoff, doubled per attempt.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Backoff ceiling.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Worker threads for backfills.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Per-period job deadline.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            event_entity: default_event_entity(),
            context_entity: default_context_entity(),
            group_field: default_group_field(),
            category_field: default_category_field(),
            time_field: default_time_field(),
            categories: default_categories(),
            retries: default_retries(),
            backoff_ms: default_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_concurrent: default_max_concurrent(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// `<root>/.strata`
#[must_use]
pub fn data_dir(project_root: &Path) -> PathBuf {
    project_root.join(DATA_DIR)
}

/// `<root>/.strata/store.db`
#[must_use]
pub fn store_path(project_root: &Path) -> PathBuf {
    data_dir(project_root).join("store.db")
}

/// `<root>/.strata/locks`
#[must_use]
pub fn lock_dir(project_root: &Path) -> PathBuf {
    data_dir(project_root).join("locks")
}

pub fn load_project_config(project_root: &Path) -> Result<ProjectConfig> {
    let path = data_dir(project_root).join("config.toml");
    if !path.exists() {
        return Ok(ProjectConfig::default());
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<ProjectConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

fn default_event_entity() -> String {
    "events".to_string()
}

fn default_context_entity() -> String {
    "users".to_string()
}

fn default_group_field() -> String {
    "user_id".to_string()
}

fn default_category_field() -> String {
    "event_type".to_string()
}

fn default_time_field() -> String {
    "event_timestamp".to_string()
}

fn default_categories() -> Vec<String> {
    ["page_view", "click", "purchase", "search", "add_to_cart", "login"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

const fn default_retries() -> u32 {
    3
}

const fn default_backoff_ms() -> u64 {
    500
}

const fn default_max_backoff_ms() -> u64 {
    10_000
}

const fn default_max_concurrent() -> usize {
    4
}

const fn default_timeout_secs() -> u64 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::normalize::SourceKind;

    #[test]
    fn missing_config_uses_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let cfg = load_project_config(dir.path()).expect("load should succeed");
        assert_eq!(cfg.aggregate.group_field, "user_id");
        assert_eq!(cfg.aggregate.retries, 3);
        assert_eq!(cfg.aggregate.categories.len(), 6);
        assert!(cfg.sources.is_empty());
    }

    #[test]
    fn partial_config_fills_remaining_fields() {
        let dir = tempfile::tempdir().expect("temp dir");
        std::fs::create_dir_all(data_dir(dir.path())).expect("data dir");
        std::fs::write(
            data_dir(dir.path()).join("config.toml"),
            r#"
[aggregate]
group_field = "account_id"
retries = 5

[[sources]]
entity = "users"
kind = "row"
key_field = "user_id"

[[sources]]
entity = "events"
kind = "document"
key_field = "event_id"
"#,
        )
        .expect("write config");

        let cfg = load_project_config(dir.path()).expect("load should succeed");
        assert_eq!(cfg.aggregate.group_field, "account_id");
        assert_eq!(cfg.aggregate.retries, 5);
        // Untouched fields keep their defaults.
        assert_eq!(cfg.aggregate.category_field, "event_type");
        assert_eq!(cfg.aggregate.backoff_ms, 500);

        assert_eq!(cfg.sources.len(), 2);
        assert_eq!(cfg.sources[0].entity, "users");
        assert_eq!(cfg.sources[1].kind, SourceKind::Document);
    }

    #[test]
    fn malformed_config_is_an_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        std::fs::create_dir_all(data_dir(dir.path())).expect("data dir");
        std::fs::write(data_dir(dir.path()).join("config.toml"), "[aggregate\n")
            .expect("write config");

        assert!(load_project_config(dir.path()).is_err());
    }
}
