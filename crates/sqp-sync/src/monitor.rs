//! Pipeline state, health classification, alerts and run-history exports.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use arrow_array::{Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqp_core::{RefreshConfig, RunStatus, Severity, SyncRun, TableId};
use sqp_storage::{RefreshStore, StoreResult};
use tokio::fs;
use tracing::info;

use crate::errors::{window_start, ErrorSummary, ErrorTracker};
use crate::scheduler::{CycleHandle, CycleState};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthThresholds {
    /// Failure rate in `window` at which the pipeline is degraded.
    pub failure_rate_degraded: f64,
    pub failure_rate_unhealthy: f64,
    /// A table is stale once `hours_since_refresh > frequency * stale_factor`.
    pub stale_factor: f64,
    pub window: Duration,
    pub max_execution_ms: i64,
    /// `running` runs older than this are failed by cleanup.
    pub stale_run_after: Duration,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            failure_rate_degraded: 0.2,
            failure_rate_unhealthy: 0.5,
            stale_factor: 2.0,
            window: Duration::from_secs(24 * 3600),
            max_execution_ms: 30 * 60 * 1000,
            stale_run_after: Duration::from_secs(6 * 3600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableState {
    pub table: TableId,
    pub enabled: bool,
    pub priority: i32,
    pub frequency_hours: i64,
    pub last_refresh_at: Option<DateTime<Utc>>,
    pub next_refresh_at: Option<DateTime<Utc>>,
    pub due: bool,
    pub hours_since_refresh: Option<f64>,
    pub staleness_score: f64,
    pub last_run: Option<SyncRun>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineState {
    pub generated_at: DateTime<Utc>,
    pub cycle: CycleState,
    pub tables: Vec<TableState>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub runs_in_window: usize,
    pub failed_in_window: usize,
    pub failure_rate: f64,
    pub stale_tables: Vec<TableId>,
    pub unresolved_critical: usize,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Freshness,
    ErrorRate,
    ExecutionTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: Severity,
    pub table: Option<TableId>,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub generated_at: DateTime<Utc>,
    pub health: HealthReport,
    pub state: PipelineState,
    pub alerts: Vec<Alert>,
    pub errors: ErrorSummary,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub runs_purged: u64,
    pub stale_runs_failed: u64,
    pub errors_purged: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub generated_at: DateTime<Utc>,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

fn is_stale(config: &RefreshConfig, now: DateTime<Utc>, stale_factor: f64) -> bool {
    match config.hours_since_refresh(now) {
        Some(hours) => config.enabled && hours > config.frequency_hours as f64 * stale_factor,
        None => false,
    }
}

pub struct Monitor {
    store: Arc<dyn RefreshStore>,
    tracker: Arc<ErrorTracker>,
    cycle: CycleHandle,
    thresholds: HealthThresholds,
}

impl Monitor {
    pub fn new(
        store: Arc<dyn RefreshStore>,
        tracker: Arc<ErrorTracker>,
        cycle: CycleHandle,
        thresholds: HealthThresholds,
    ) -> Self {
        Self {
            store,
            tracker,
            cycle,
            thresholds,
        }
    }

    pub fn thresholds(&self) -> &HealthThresholds {
        &self.thresholds
    }

    pub async fn state(&self) -> StoreResult<PipelineState> {
        self.state_at(Utc::now()).await
    }

    async fn state_at(&self, now: DateTime<Utc>) -> StoreResult<PipelineState> {
        let configs = self.store.list_configs().await?;
        let latest = self.store.latest_run_per_table().await?;
        let mut tables: Vec<TableState> = configs
            .into_iter()
            .map(|config| TableState {
                last_run: latest.iter().find(|r| r.table == config.table).cloned(),
                due: config.is_due(now),
                hours_since_refresh: config.hours_since_refresh(now),
                staleness_score: config.staleness(now),
                table: config.table,
                enabled: config.enabled,
                priority: config.priority,
                frequency_hours: config.frequency_hours,
                last_refresh_at: config.last_refresh_at,
                next_refresh_at: config.next_refresh_at,
            })
            .collect();
        tables.sort_by(|a, b| a.table.cmp(&b.table));
        Ok(PipelineState {
            generated_at: now,
            cycle: self.cycle.get().await,
            tables,
        })
    }

    pub async fn health(&self) -> StoreResult<HealthReport> {
        self.health_at(Utc::now()).await
    }

    async fn health_at(&self, now: DateTime<Utc>) -> StoreResult<HealthReport> {
        let runs = self
            .store
            .runs_since(window_start(now, self.thresholds.window))
            .await?;
        let finished: Vec<&SyncRun> = runs.iter().filter(|r| r.status.is_terminal()).collect();
        let failed = finished
            .iter()
            .filter(|r| r.status == RunStatus::Failed)
            .count();
        let failure_rate = if finished.is_empty() {
            0.0
        } else {
            failed as f64 / finished.len() as f64
        };

        let stale_tables: Vec<TableId> = self
            .store
            .list_configs()
            .await?
            .into_iter()
            .filter(|c| is_stale(c, now, self.thresholds.stale_factor))
            .map(|c| c.table)
            .collect();
        let unresolved_critical = self.tracker.unresolved_critical().await.len();

        let mut reasons = Vec::new();
        let mut status = HealthStatus::Healthy;
        if failure_rate >= self.thresholds.failure_rate_unhealthy {
            status = status.max(HealthStatus::Unhealthy);
            reasons.push(format!("failure rate {:.0}% in window", failure_rate * 100.0));
        } else if failure_rate >= self.thresholds.failure_rate_degraded {
            status = status.max(HealthStatus::Degraded);
            reasons.push(format!("failure rate {:.0}% in window", failure_rate * 100.0));
        }
        if unresolved_critical > 0 {
            status = status.max(HealthStatus::Unhealthy);
            reasons.push(format!("{unresolved_critical} unresolved critical errors"));
        }
        if !stale_tables.is_empty() {
            status = status.max(HealthStatus::Degraded);
            reasons.push(format!("{} stale tables", stale_tables.len()));
        }

        Ok(HealthReport {
            status,
            runs_in_window: finished.len(),
            failed_in_window: failed,
            failure_rate,
            stale_tables,
            unresolved_critical,
            reasons,
        })
    }

    /// Newest first.
    pub async fn history(&self, limit: usize, offset: usize) -> StoreResult<Vec<SyncRun>> {
        self.store.run_history(limit, offset).await
    }

    pub async fn check_alerts(&self) -> StoreResult<Vec<Alert>> {
        self.check_alerts_at(Utc::now()).await
    }

    async fn check_alerts_at(&self, now: DateTime<Utc>) -> StoreResult<Vec<Alert>> {
        let t = &self.thresholds;
        let mut alerts = Vec::new();

        for config in self.store.list_configs().await? {
            if !is_stale(&config, now, t.stale_factor) {
                continue;
            }
            let hours = config.hours_since_refresh(now).unwrap_or_default();
            let limit = config.frequency_hours as f64 * t.stale_factor;
            alerts.push(Alert {
                kind: AlertKind::Freshness,
                severity: Severity::High,
                message: format!(
                    "{} last refreshed {hours:.1}h ago (limit {limit:.1}h)",
                    config.table
                ),
                table: Some(config.table),
                value: hours,
                threshold: limit,
            });
        }

        let health = self.health_at(now).await?;
        if health.runs_in_window > 0 && health.failure_rate >= t.failure_rate_degraded {
            alerts.push(Alert {
                kind: AlertKind::ErrorRate,
                severity: if health.failure_rate >= t.failure_rate_unhealthy {
                    Severity::High
                } else {
                    Severity::Medium
                },
                table: None,
                message: format!(
                    "{} of {} runs failed in the last {}h",
                    health.failed_in_window,
                    health.runs_in_window,
                    t.window.as_secs() / 3600
                ),
                value: health.failure_rate,
                threshold: t.failure_rate_degraded,
            });
        }

        for run in self.store.latest_run_per_table().await? {
            let elapsed_ms = match (run.status, run.duration_ms) {
                (RunStatus::Running, _) => (now - run.started_at).num_milliseconds(),
                (_, Some(ms)) => ms,
                (_, None) => continue,
            };
            if elapsed_ms > t.max_execution_ms {
                alerts.push(Alert {
                    kind: AlertKind::ExecutionTime,
                    severity: Severity::Medium,
                    message: format!(
                        "{} run {} took {elapsed_ms}ms (limit {}ms)",
                        run.table, run.id, t.max_execution_ms
                    ),
                    table: Some(run.table),
                    value: elapsed_ms as f64,
                    threshold: t.max_execution_ms as f64,
                });
            }
        }

        Ok(alerts)
    }

    pub async fn export_metrics(&self) -> StoreResult<MetricsSnapshot> {
        let now = Utc::now();
        Ok(MetricsSnapshot {
            generated_at: now,
            health: self.health_at(now).await?,
            state: self.state_at(now).await?,
            alerts: self.check_alerts_at(now).await?,
            errors: self.tracker.export().await,
        })
    }

    /// Purge history older than `days_to_keep`, fail abandoned `running` runs
    /// and drop old resolved errors. Safe to repeat.
    pub async fn cleanup_old_data(&self, days_to_keep: u32) -> StoreResult<CleanupReport> {
        let now = Utc::now();
        let retention = Duration::from_secs(u64::from(days_to_keep) * 24 * 3600);
        let report = CleanupReport {
            stale_runs_failed: self
                .store
                .fail_stale_runs(window_start(now, self.thresholds.stale_run_after), now)
                .await?,
            runs_purged: self
                .store
                .purge_runs_before(window_start(now, retention))
                .await?,
            errors_purged: self.tracker.cleanup(retention).await,
        };
        info!(
            days_to_keep,
            runs_purged = report.runs_purged,
            stale_runs_failed = report.stale_runs_failed,
            errors_purged = report.errors_purged,
            "cleanup finished"
        );
        Ok(report)
    }

    /// Write run history and table state as parquet files under
    /// `dir/snapshots`, plus a checksum manifest. Returns the manifest path.
    pub async fn write_history_snapshot(&self, dir: &Path, limit: usize) -> Result<PathBuf> {
        let snapshot_dir = dir.join("snapshots");
        fs::create_dir_all(&snapshot_dir)
            .await
            .with_context(|| format!("creating {}", snapshot_dir.display()))?;

        let runs = self
            .store
            .run_history(limit, 0)
            .await
            .context("reading run history")?;
        let state = self.state().await.context("reading pipeline state")?;

        let runs_path = snapshot_dir.join("sync_runs.parquet");
        let tables_path = snapshot_dir.join("table_state.parquet");
        write_runs_parquet(&runs_path, &runs)?;
        write_table_state_parquet(&tables_path, &state.tables)?;

        let manifest = ParquetManifest {
            schema_version: 1,
            generated_at: state.generated_at,
            files: vec![
                manifest_entry("sync_runs", dir, &runs_path, runs.len())?,
                manifest_entry("table_state", dir, &tables_path, state.tables.len())?,
            ],
        };
        let manifest_path = snapshot_dir.join("manifest.json");
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
        fs::write(&manifest_path, bytes)
            .await
            .with_context(|| format!("writing {}", manifest_path.display()))?;
        Ok(manifest_path)
    }
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_runs_parquet(path: &Path, runs: &[SyncRun]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::Int64, false),
        ArrowField::new("table", DataType::Utf8, false),
        ArrowField::new("cycle_id", DataType::Utf8, true),
        ArrowField::new("status", DataType::Utf8, false),
        ArrowField::new("started_at", DataType::Utf8, false),
        ArrowField::new("completed_at", DataType::Utf8, true),
        ArrowField::new("rows_processed", DataType::Int64, false),
        ArrowField::new("duration_ms", DataType::Int64, true),
        ArrowField::new("warnings", DataType::Int64, false),
        ArrowField::new("error_message", DataType::Utf8, true),
    ]));

    let ids = Int64Array::from(runs.iter().map(|r| r.id).collect::<Vec<_>>());
    let tables = StringArray::from(runs.iter().map(|r| r.table.qualified()).collect::<Vec<_>>());
    let cycles = StringArray::from(
        runs.iter()
            .map(|r| r.cycle_id.map(|id| id.to_string()))
            .collect::<Vec<_>>(),
    );
    let statuses = StringArray::from(runs.iter().map(|r| r.status.as_str()).collect::<Vec<_>>());
    let started = StringArray::from(
        runs.iter()
            .map(|r| r.started_at.to_rfc3339())
            .collect::<Vec<_>>(),
    );
    let completed = StringArray::from(
        runs.iter()
            .map(|r| r.completed_at.map(|t| t.to_rfc3339()))
            .collect::<Vec<_>>(),
    );
    let rows = Int64Array::from(runs.iter().map(|r| r.rows_processed).collect::<Vec<_>>());
    let durations = Int64Array::from(runs.iter().map(|r| r.duration_ms).collect::<Vec<_>>());
    let warnings = Int64Array::from(runs.iter().map(|r| r.warnings).collect::<Vec<_>>());
    let messages = StringArray::from(
        runs.iter()
            .map(|r| r.error_message.as_deref())
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ids),
            Arc::new(tables),
            Arc::new(cycles),
            Arc::new(statuses),
            Arc::new(started),
            Arc::new(completed),
            Arc::new(rows),
            Arc::new(durations),
            Arc::new(warnings),
            Arc::new(messages),
        ],
    )
    .context("building sync_runs record batch")?;
    write_parquet(path, batch)
}

fn write_table_state_parquet(path: &Path, tables: &[TableState]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("table", DataType::Utf8, false),
        ArrowField::new("frequency_hours", DataType::Int64, false),
        ArrowField::new("last_refresh_at", DataType::Utf8, true),
        ArrowField::new("next_refresh_at", DataType::Utf8, true),
        ArrowField::new("staleness_score", DataType::Float64, false),
        ArrowField::new("last_status", DataType::Utf8, true),
    ]));

    let names = StringArray::from(tables.iter().map(|t| t.table.qualified()).collect::<Vec<_>>());
    let frequencies = Int64Array::from(tables.iter().map(|t| t.frequency_hours).collect::<Vec<_>>());
    let last = StringArray::from(
        tables
            .iter()
            .map(|t| t.last_refresh_at.map(|v| v.to_rfc3339()))
            .collect::<Vec<_>>(),
    );
    let next = StringArray::from(
        tables
            .iter()
            .map(|t| t.next_refresh_at.map(|v| v.to_rfc3339()))
            .collect::<Vec<_>>(),
    );
    let staleness = arrow_array::Float64Array::from(
        tables.iter().map(|t| t.staleness_score).collect::<Vec<_>>(),
    );
    let statuses = StringArray::from(
        tables
            .iter()
            .map(|t| t.last_run.as_ref().map(|r| r.status.as_str()))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(names),
            Arc::new(frequencies),
            Arc::new(last),
            Arc::new(next),
            Arc::new(staleness),
            Arc::new(statuses),
        ],
    )
    .context("building table_state record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, base: &Path, path: &Path, rows: usize) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(base)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
        rows,
    })
}
