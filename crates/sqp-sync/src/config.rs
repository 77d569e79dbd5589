//! Environment settings and the YAML table registry.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqp_core::{
    DependencyKind, DestinationTarget, ExtractFilter, NewRefreshConfig, RefreshDependency, TableId,
    TemporalColumn, MAX_FREQUENCY_HOURS,
};
use sqp_extract::PageErrorPolicy;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// `None` runs against the in-process store.
    pub database_url: Option<String>,
    pub warehouse_url: Option<String>,
    pub warehouse_token: Option<String>,
    pub warehouse_fixture: PathBuf,
    pub scheduler_enabled: bool,
    pub cycle_cron: String,
    pub max_concurrency: usize,
    pub table_timeout_secs: u64,
    pub child_batch_size: usize,
    pub partial_success_ratio: f64,
    pub http_timeout_secs: u64,
    pub web_port: u16,
    pub workspace_root: PathBuf,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let workspace_root = std::env::var("SQP_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            warehouse_url: std::env::var("SQP_WAREHOUSE_URL").ok().filter(|v| !v.is_empty()),
            warehouse_token: std::env::var("SQP_WAREHOUSE_TOKEN").ok().filter(|v| !v.is_empty()),
            warehouse_fixture: std::env::var("SQP_WAREHOUSE_FIXTURE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("fixtures/warehouse/sample.json")),
            scheduler_enabled: std::env::var("SQP_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            cycle_cron: std::env::var("SQP_CYCLE_CRON")
                .unwrap_or_else(|_| "0 0 * * * *".to_string()),
            max_concurrency: env_parse("SQP_MAX_CONCURRENCY", 4usize).max(1),
            table_timeout_secs: env_parse("SQP_TABLE_TIMEOUT_SECS", 1800),
            child_batch_size: env_parse("SQP_CHILD_BATCH_SIZE", crate::loader::DEFAULT_CHILD_BATCH_SIZE)
                .max(1),
            partial_success_ratio: env_parse("SQP_PARTIAL_SUCCESS_RATIO", 0.0f64).clamp(0.0, 1.0),
            http_timeout_secs: env_parse("SQP_HTTP_TIMEOUT_SECS", 30),
            web_port: env_parse("SQP_WEB_PORT", 8080),
            workspace_root,
        }
    }

    pub fn table_timeout(&self) -> Duration {
        Duration::from_secs(self.table_timeout_secs)
    }

    pub fn registry_path(&self) -> PathBuf {
        self.workspace_root.join("refresh.yaml")
    }
}

/// How a table's refresh is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshMode {
    #[default]
    Full,
    Incremental,
    /// Store-side rebuild of a table derived from other tables.
    Derived,
}

/// Typed view of `RefreshConfig::custom_parameters`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshParams {
    pub mode: RefreshMode,
    pub cursor_column: TemporalColumn,
    pub filter: ExtractFilter,
    pub batch_size: usize,
    /// Required for incremental tables; there is no implicit page policy.
    pub on_page_error: Option<PageErrorPolicy>,
    pub max_consecutive_failures: usize,
    pub pipeline_id: Option<String>,
    pub parent_table: Option<String>,
    pub child_table: Option<String>,
}

impl Default for RefreshParams {
    fn default() -> Self {
        Self {
            mode: RefreshMode::default(),
            cursor_column: TemporalColumn::default(),
            filter: ExtractFilter::default(),
            batch_size: 500,
            on_page_error: None,
            max_consecutive_failures: 3,
            pipeline_id: None,
            parent_table: None,
            child_table: None,
        }
    }
}

impl RefreshParams {
    pub fn from_json(value: &JsonValue) -> Result<Self> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value.clone()).context("parsing refresh custom_parameters")
    }

    /// Settings that must be present before a cycle may start.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.batch_size > 0, "batch_size must be positive");
        if self.mode == RefreshMode::Incremental {
            anyhow::ensure!(
                self.on_page_error.is_some(),
                "missing setting on_page_error for incremental refresh"
            );
        }
        Ok(())
    }

    pub fn to_json(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }

    pub fn pipeline_id_for(&self, table: &TableId) -> String {
        self.pipeline_id
            .clone()
            .unwrap_or_else(|| table.qualified())
    }

    /// Destination tables for a load, defaulting the parent table to the
    /// refreshed table itself.
    pub fn destination_for(&self, table: &TableId) -> DestinationTarget {
        let defaults = DestinationTarget::default();
        DestinationTarget {
            schema: table.schema.clone(),
            parent_table: self
                .parent_table
                .clone()
                .unwrap_or_else(|| table.table.clone()),
            child_table: self.child_table.clone().unwrap_or(defaults.child_table),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefreshRegistry {
    pub tables: Vec<TableEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableEntry {
    pub table: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub frequency_hours: i64,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub depends_on: Vec<DependsOn>,
    #[serde(default)]
    pub parameters: RefreshParams,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DependsOn {
    pub table: String,
    #[serde(default)]
    pub kind: DependencyKind,
}

fn default_true() -> bool {
    true
}

impl RefreshRegistry {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing refresh registry")
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn configs(&self) -> Result<Vec<NewRefreshConfig>> {
        self.tables
            .iter()
            .map(|entry| {
                let table: TableId = entry
                    .table
                    .parse()
                    .with_context(|| format!("registry entry `{}`", entry.table))?;
                anyhow::ensure!(
                    (1..=MAX_FREQUENCY_HOURS).contains(&entry.frequency_hours),
                    "{table}: frequency_hours must be between 1 and {MAX_FREQUENCY_HOURS}"
                );
                entry
                    .parameters
                    .validate()
                    .with_context(|| format!("registry entry `{table}`"))?;
                Ok(NewRefreshConfig {
                    table,
                    enabled: entry.enabled,
                    frequency_hours: entry.frequency_hours,
                    priority: entry.priority,
                    custom_parameters: entry.parameters.to_json(),
                })
            })
            .collect()
    }

    pub fn dependencies(&self) -> Result<Vec<RefreshDependency>> {
        let mut out = Vec::new();
        for entry in &self.tables {
            let dependent: TableId = entry
                .table
                .parse()
                .with_context(|| format!("registry entry `{}`", entry.table))?;
            for dep in &entry.depends_on {
                let parent: TableId = dep
                    .table
                    .parse()
                    .with_context(|| format!("{dependent}: depends_on `{}`", dep.table))?;
                out.push(RefreshDependency {
                    parent,
                    dependent: dependent.clone(),
                    kind: dep.kind,
                });
            }
        }
        Ok(out)
    }
}
