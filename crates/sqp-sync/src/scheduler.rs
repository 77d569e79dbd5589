//! Refresh cycles: due set, dependency waves and per-table runs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::json;
use sqp_core::{
    DestinationTarget, ErrorCategory, ExtractionState, PipelineStatus, RefreshConfig,
    RunCompletion, RunStatus, Severity, TableId,
};
use sqp_extract::{Batch, Extractor, StreamObserver, StreamOptions};
use sqp_storage::{DestinationStore, RefreshStore, StoreError};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{RefreshMode, RefreshParams, SyncConfig};
use crate::errors::{ErrorTracker, NewError};
use crate::graph::{DependencyGraph, GraphError};
use crate::loader::{LoadReport, Loader, LoaderConfig};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid refresh configuration: {0}")]
    Configuration(#[from] GraphError),
    #[error("invalid refresh parameters for {table}: {message}")]
    Parameters { table: TableId, message: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrency: usize,
    pub table_timeout: Duration,
    /// Dropped-row ratio above which a run is `partial_success` instead of
    /// `success`. `0.0` makes any dropped row count.
    pub partial_success_ratio: f64,
    pub loader: LoaderConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            table_timeout: Duration::from_secs(1800),
            partial_success_ratio: 0.0,
            loader: LoaderConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn from_sync_config(config: &SyncConfig) -> Self {
        Self {
            max_concurrency: config.max_concurrency.max(1),
            table_timeout: config.table_timeout(),
            partial_success_ratio: config.partial_success_ratio,
            loader: LoaderConfig {
                child_batch_size: config.child_batch_size,
                ..LoaderConfig::default()
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TableStatus {
    Success,
    PartialSuccess,
    Failed,
    /// A hard parent has no successful run in this cycle; the table stays due.
    Blocked,
    /// Another run for the table is still in progress.
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableOutcome {
    pub table: TableId,
    pub status: TableStatus,
    pub run_id: Option<i64>,
    pub rows_processed: i64,
    pub warnings: i64,
    pub error: Option<String>,
    pub blocked_by: Vec<TableId>,
}

impl TableOutcome {
    fn skipped(table: TableId, status: TableStatus) -> Self {
        Self {
            table,
            status,
            run_id: None,
            rows_processed: 0,
            warnings: 0,
            error: None,
            blocked_by: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleSummary {
    pub due: usize,
    pub succeeded: usize,
    pub partial: usize,
    pub failed: usize,
    pub blocked: usize,
    pub already_running: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub due: Vec<TableId>,
    pub outcomes: Vec<TableOutcome>,
}

impl CycleReport {
    pub fn summary(&self) -> CycleSummary {
        let mut summary = CycleSummary {
            due: self.due.len(),
            ..CycleSummary::default()
        };
        for outcome in &self.outcomes {
            match outcome.status {
                TableStatus::Success => summary.succeeded += 1,
                TableStatus::PartialSuccess => summary.partial += 1,
                TableStatus::Failed => summary.failed += 1,
                TableStatus::Blocked => summary.blocked += 1,
                TableStatus::AlreadyRunning => summary.already_running += 1,
            }
        }
        summary
    }

    pub fn outcome(&self, table: &TableId) -> Option<&TableOutcome> {
        self.outcomes.iter().find(|o| &o.table == table)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CycleState {
    #[default]
    Idle,
    Running {
        cycle_id: Uuid,
        started_at: DateTime<Utc>,
    },
    Completed {
        cycle_id: Uuid,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        summary: CycleSummary,
    },
    Failed {
        cycle_id: Uuid,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        error: String,
    },
}

/// Shared view of the latest cycle, read by the monitor.
#[derive(Debug, Clone, Default)]
pub struct CycleHandle(Arc<RwLock<CycleState>>);

impl CycleHandle {
    pub async fn get(&self) -> CycleState {
        self.0.read().await.clone()
    }

    async fn set(&self, state: CycleState) {
        *self.0.write().await = state;
    }
}

/// Enabled configs due at `now`, by priority descending then table name.
pub fn due_set(configs: &[RefreshConfig], now: DateTime<Utc>) -> Vec<RefreshConfig> {
    let mut due: Vec<RefreshConfig> = configs.iter().filter(|c| c.is_due(now)).cloned().collect();
    due.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.table.cmp(&b.table)));
    due
}

/// Final status of a table run that produced a load report.
pub fn run_status(report: &LoadReport, skipped_pages: usize, partial_success_ratio: f64) -> RunStatus {
    if skipped_pages > 0 {
        return RunStatus::PartialSuccess;
    }
    let dropped = report.dropped_rows();
    if dropped == 0 || report.source_rows == 0 {
        return RunStatus::Success;
    }
    if dropped as f64 / report.source_rows as f64 > partial_success_ratio {
        RunStatus::PartialSuccess
    } else {
        RunStatus::Success
    }
}

fn failed_completion(message: &str) -> RunCompletion {
    RunCompletion {
        status: RunStatus::Failed,
        completed_at: Utc::now(),
        rows_processed: 0,
        warnings: 0,
        error_message: Some(message.to_string()),
    }
}

#[derive(Debug, Default)]
struct TableWork {
    rows_processed: i64,
    report: LoadReport,
    skipped_pages: usize,
}

pub struct RefreshScheduler {
    store: Arc<dyn RefreshStore>,
    destination: Arc<dyn DestinationStore>,
    extractor: Extractor,
    loader: Loader,
    tracker: Arc<ErrorTracker>,
    config: SchedulerConfig,
    cycle: CycleHandle,
    shutdown: CancellationToken,
}

impl RefreshScheduler {
    pub fn new(
        store: Arc<dyn RefreshStore>,
        destination: Arc<dyn DestinationStore>,
        extractor: Extractor,
        tracker: Arc<ErrorTracker>,
        config: SchedulerConfig,
    ) -> Self {
        let loader = Loader::new(destination.clone(), config.loader);
        Self {
            store,
            destination,
            extractor,
            loader,
            tracker,
            config,
            cycle: CycleHandle::default(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn cycle_handle(&self) -> CycleHandle {
        self.cycle.clone()
    }

    pub fn tracker(&self) -> Arc<ErrorTracker> {
        self.tracker.clone()
    }

    /// Stop in-flight streams at their next batch boundary.
    pub fn cancel(&self) {
        self.shutdown.cancel();
    }

    pub async fn due_configs(&self, now: DateTime<Utc>) -> Result<Vec<RefreshConfig>, StoreError> {
        Ok(due_set(&self.store.list_configs().await?, now))
    }

    pub async fn run_cycle(&self) -> Result<CycleReport, SchedulerError> {
        let cycle_id = Uuid::new_v4();
        let started_at = Utc::now();
        self.cycle
            .set(CycleState::Running {
                cycle_id,
                started_at,
            })
            .await;

        let span = info_span!("refresh_cycle", %cycle_id);
        let result = self
            .run_cycle_inner(cycle_id, started_at)
            .instrument(span)
            .await;

        let completed_at = Utc::now();
        match &result {
            Ok(report) => {
                let summary = report.summary();
                info!(
                    %cycle_id,
                    due = summary.due,
                    succeeded = summary.succeeded,
                    partial = summary.partial,
                    failed = summary.failed,
                    blocked = summary.blocked,
                    "refresh cycle finished"
                );
                self.cycle
                    .set(CycleState::Completed {
                        cycle_id,
                        started_at,
                        completed_at,
                        summary,
                    })
                    .await;
            }
            Err(err) => {
                error!(%cycle_id, error = %err, "refresh cycle aborted");
                self.cycle
                    .set(CycleState::Failed {
                        cycle_id,
                        started_at,
                        completed_at,
                        error: err.to_string(),
                    })
                    .await;
            }
        }
        result
    }

    async fn run_cycle_inner(
        &self,
        cycle_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<CycleReport, SchedulerError> {
        let configs = self.store.list_configs().await?;
        let dependencies = self.store.list_dependencies().await?;
        let graph = match DependencyGraph::build(&configs, &dependencies) {
            Ok(graph) => graph,
            Err(err) => {
                self.tracker
                    .track_error(
                        NewError::new(ErrorCategory::Configuration, Severity::Critical, err.to_string())
                            .with_context(json!({ "cycle_id": cycle_id })),
                    )
                    .await;
                return Err(err.into());
            }
        };

        for config in configs.iter().filter(|c| c.enabled) {
            let checked = RefreshParams::from_json(&config.custom_parameters)
                .and_then(|params| params.validate());
            if let Err(err) = checked {
                let message = format!("{err:#}");
                self.tracker
                    .track_error(
                        NewError::new(ErrorCategory::Configuration, Severity::Critical, message.clone())
                            .with_context(json!({
                                "cycle_id": cycle_id,
                                "table": config.table.qualified(),
                            })),
                    )
                    .await;
                return Err(SchedulerError::Parameters {
                    table: config.table.clone(),
                    message,
                });
            }
        }

        let due = due_set(&configs, started_at);
        info!(due = due.len(), "starting refresh cycle");
        let due_ids: Vec<TableId> = due.iter().map(|c| c.table.clone()).collect();
        let mut by_table: HashMap<TableId, RefreshConfig> =
            due.into_iter().map(|c| (c.table.clone(), c)).collect();

        let graph = &graph;
        let mut outcomes = Vec::with_capacity(due_ids.len());
        for wave in graph.waves(&due_ids) {
            let jobs: Vec<(usize, RefreshConfig)> = wave
                .iter()
                .filter_map(|table| by_table.remove(table))
                .enumerate()
                .collect();
            let mut results: Vec<(usize, TableOutcome)> = stream::iter(jobs)
                .map(|(index, config)| async move {
                    (index, self.run_table(config, graph, cycle_id, started_at).await)
                })
                .buffer_unordered(self.config.max_concurrency.max(1))
                .collect()
                .await;
            results.sort_by_key(|(index, _)| *index);
            outcomes.extend(results.into_iter().map(|(_, outcome)| outcome));
        }

        Ok(CycleReport {
            cycle_id,
            started_at,
            completed_at: Utc::now(),
            due: due_ids,
            outcomes,
        })
    }

    async fn blocking_parents(
        &self,
        graph: &DependencyGraph,
        table: &TableId,
        cycle_started: DateTime<Utc>,
    ) -> Result<Vec<TableId>, StoreError> {
        let parents: Vec<&TableId> = graph.hard_parents(table).collect();
        if parents.is_empty() {
            return Ok(Vec::new());
        }
        let runs = self.store.runs_since(cycle_started).await?;
        Ok(parents
            .into_iter()
            .filter(|parent| {
                !runs
                    .iter()
                    .any(|r| &r.table == *parent && r.status == RunStatus::Success)
            })
            .cloned()
            .collect())
    }

    async fn run_table(
        &self,
        config: RefreshConfig,
        graph: &DependencyGraph,
        cycle_id: Uuid,
        cycle_started: DateTime<Utc>,
    ) -> TableOutcome {
        let span = info_span!("table_run", table = %config.table);
        self.run_table_inner(config, graph, cycle_id, cycle_started)
            .instrument(span)
            .await
    }

    async fn run_table_inner(
        &self,
        config: RefreshConfig,
        graph: &DependencyGraph,
        cycle_id: Uuid,
        cycle_started: DateTime<Utc>,
    ) -> TableOutcome {
        let table = config.table.clone();

        let blocked_by = match self.blocking_parents(graph, &table, cycle_started).await {
            Ok(blocked_by) => blocked_by,
            Err(err) => return self.fail_before_start(table, cycle_id, err).await,
        };
        if !blocked_by.is_empty() {
            info!(blocked_by = ?blocked_by, "hard parents have not refreshed this cycle; skipping");
            return TableOutcome {
                blocked_by,
                ..TableOutcome::skipped(table, TableStatus::Blocked)
            };
        }

        match self.store.running_run(&table).await {
            Ok(Some(existing)) => {
                warn!(run_id = existing.id, "table already has a running sync run; skipping");
                return TableOutcome::skipped(table, TableStatus::AlreadyRunning);
            }
            Ok(None) => {}
            Err(err) => return self.fail_before_start(table, cycle_id, err).await,
        }

        let run = match self.store.begin_run(&table, Some(cycle_id), Utc::now()).await {
            Ok(Some(run)) => run,
            Ok(None) => {
                warn!("another process started a run for this table; skipping");
                return TableOutcome::skipped(table, TableStatus::AlreadyRunning);
            }
            Err(err) => return self.fail_before_start(table, cycle_id, err).await,
        };

        let params = RefreshParams::from_json(&config.custom_parameters);
        let result = match params {
            Ok(params) => {
                match tokio::time::timeout(self.config.table_timeout, self.execute(&table, &params))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => {
                        if params.mode == RefreshMode::Incremental {
                            self.mark_pipeline_failed(&params.pipeline_id_for(&table)).await;
                        }
                        Err(anyhow!(
                            "table refresh timed out after {:?}",
                            self.config.table_timeout
                        ))
                    }
                }
            }
            Err(err) => Err(err.context(format!("invalid configuration for {table}"))),
        };

        let completed_at = Utc::now();
        match result {
            Ok(work) => {
                let status = run_status(
                    &work.report,
                    work.skipped_pages,
                    self.config.partial_success_ratio,
                );
                let warnings = work.report.warning_count() as i64 + work.skipped_pages as i64;
                let completion = RunCompletion {
                    status,
                    completed_at,
                    rows_processed: work.rows_processed,
                    warnings,
                    error_message: None,
                };
                if let Err(err) = self
                    .store
                    .complete_run(run.id, &completion, config.after_interval(completed_at))
                    .await
                {
                    return self.fail_after_start(table, cycle_id, run.id, err.into()).await;
                }
                if work.report.dropped_rows() > 0 {
                    self.tracker
                        .track_error(
                            NewError::new(
                                ErrorCategory::DataQuality,
                                Severity::Low,
                                format!(
                                    "{table}: {} unresolved and {} invalid rows dropped",
                                    work.report.unresolved, work.report.invalid_rows
                                ),
                            )
                            .with_context(json!({
                                "table": table.qualified(),
                                "cycle_id": cycle_id,
                                "run_id": run.id,
                                "source_rows": work.report.source_rows,
                            })),
                        )
                        .await;
                }
                info!(
                    status = %status,
                    rows = work.rows_processed,
                    warnings,
                    "table refresh finished"
                );
                TableOutcome {
                    table,
                    status: if status == RunStatus::Success {
                        TableStatus::Success
                    } else {
                        TableStatus::PartialSuccess
                    },
                    run_id: Some(run.id),
                    rows_processed: work.rows_processed,
                    warnings,
                    error: None,
                    blocked_by: Vec::new(),
                }
            }
            Err(err) => self.fail_after_start(table, cycle_id, run.id, err).await,
        }
    }

    /// A store failure before the run row existed. The attempt is still
    /// recorded as a failed run when the store accepts the write.
    async fn fail_before_start(
        &self,
        table: TableId,
        cycle_id: Uuid,
        err: StoreError,
    ) -> TableOutcome {
        let message = err.to_string();
        let run_id = self.record_failed_attempt(&table, cycle_id, &message).await;
        self.tracker
            .track_auto_error(
                &message,
                json!({ "table": table.qualified(), "cycle_id": cycle_id, "run_id": run_id }),
            )
            .await;
        TableOutcome {
            run_id,
            error: Some(message),
            ..TableOutcome::skipped(table, TableStatus::Failed)
        }
    }

    async fn record_failed_attempt(
        &self,
        table: &TableId,
        cycle_id: Uuid,
        message: &str,
    ) -> Option<i64> {
        let run = match self.store.begin_run(table, Some(cycle_id), Utc::now()).await {
            Ok(Some(run)) => run,
            Ok(None) => return None,
            Err(err) => {
                error!(error = %err, "could not record failed attempt");
                return None;
            }
        };
        match self.store.finish_run(run.id, &failed_completion(message)).await {
            Ok(_) => Some(run.id),
            Err(err) => {
                error!(run_id = run.id, error = %err, "could not record failed attempt");
                Some(run.id)
            }
        }
    }

    /// Close the run as failed. `next_refresh_at` is left alone so the table
    /// stays due.
    async fn fail_after_start(
        &self,
        table: TableId,
        cycle_id: Uuid,
        run_id: i64,
        err: anyhow::Error,
    ) -> TableOutcome {
        let message = format!("{err:#}");
        if let Err(finish_err) = self.store.finish_run(run_id, &failed_completion(&message)).await {
            error!(run_id, error = %finish_err, "could not record failed run");
        }
        self.tracker
            .track_auto_error(
                &message,
                json!({ "table": table.qualified(), "cycle_id": cycle_id, "run_id": run_id }),
            )
            .await;
        TableOutcome {
            run_id: Some(run_id),
            error: Some(message),
            ..TableOutcome::skipped(table, TableStatus::Failed)
        }
    }

    async fn execute(&self, table: &TableId, params: &RefreshParams) -> anyhow::Result<TableWork> {
        match params.mode {
            RefreshMode::Full => {
                let target = params.destination_for(table);
                let mut filter = params.filter.clone();
                filter.order_by = params.cursor_column;
                let extraction = self.extractor.extract_full(&filter, true).await?;
                let report = self
                    .loader
                    .load_parent_then_child(&target, &extraction.rows)
                    .await?;
                Ok(TableWork {
                    rows_processed: extraction.rows.len() as i64,
                    report,
                    skipped_pages: 0,
                })
            }
            RefreshMode::Incremental => self.execute_incremental(table, params).await,
            RefreshMode::Derived => {
                let rows = self
                    .destination
                    .refresh_derived(table)
                    .await
                    .with_context(|| format!("refreshing derived table {table}"))?;
                Ok(TableWork {
                    rows_processed: rows as i64,
                    ..TableWork::default()
                })
            }
        }
    }

    async fn execute_incremental(
        &self,
        table: &TableId,
        params: &RefreshParams,
    ) -> anyhow::Result<TableWork> {
        let Some(policy) = params.on_page_error else {
            bail!("missing setting on_page_error for incremental table {table}");
        };
        let pipeline_id = params.pipeline_id_for(table);
        let mut state = self
            .store
            .load_extraction_state(&pipeline_id)
            .await?
            .unwrap_or_else(|| ExtractionState::new(pipeline_id.clone(), Utc::now()));
        state.status = PipelineStatus::Running;
        state.updated_at = Utc::now();
        self.store.save_extraction_state(&state).await?;

        let filter = params
            .filter
            .clone()
            .with_since(params.cursor_column, state.last_watermark);
        let options = StreamOptions::new(params.batch_size, policy)
            .with_cursor_column(params.cursor_column)
            .with_max_consecutive_failures(params.max_consecutive_failures)
            .with_cancel(self.shutdown.child_token());

        let mut observer = LoadObserver {
            loader: &self.loader,
            store: self.store.as_ref(),
            target: params.destination_for(table),
            state,
            report: LoadReport::default(),
        };
        let result = self
            .extractor
            .stream_extraction(&filter, &mut observer, &options)
            .await;

        let LoadObserver {
            mut state, report, ..
        } = observer;
        state.updated_at = Utc::now();
        let summary = match result {
            Ok(summary) if !summary.cancelled => summary,
            Ok(_) => {
                state.status = PipelineStatus::Failed;
                self.store.save_extraction_state(&state).await?;
                bail!("incremental refresh of {table} was cancelled");
            }
            Err(err) => {
                state.status = PipelineStatus::Failed;
                self.store.save_extraction_state(&state).await?;
                return Err(err.into());
            }
        };
        state.status = PipelineStatus::Completed;
        self.store.save_extraction_state(&state).await?;

        Ok(TableWork {
            rows_processed: summary.rows_processed as i64,
            report,
            skipped_pages: summary.skipped_pages,
        })
    }

    async fn mark_pipeline_failed(&self, pipeline_id: &str) {
        let result = async {
            if let Some(mut state) = self.store.load_extraction_state(pipeline_id).await? {
                state.status = PipelineStatus::Failed;
                state.updated_at = Utc::now();
                self.store.save_extraction_state(&state).await?;
            }
            Ok::<_, StoreError>(())
        }
        .await;
        if let Err(err) = result {
            warn!(pipeline_id, error = %err, "could not mark pipeline failed");
        }
    }

    /// Recurring cycle on `cron` (six-field, seconds first).
    pub async fn build_cron_scheduler(self: Arc<Self>, cron: &str) -> anyhow::Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let scheduler = self;
        let job = Job::new_async(cron, move |_uuid, _lock| {
            let scheduler = scheduler.clone();
            Box::pin(async move {
                if let Err(err) = scheduler.run_cycle().await {
                    error!(error = %err, "scheduled refresh cycle failed");
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(sched)
    }
}

/// Commits each streamed batch and persists the watermark it makes safe.
struct LoadObserver<'a> {
    loader: &'a Loader,
    store: &'a dyn RefreshStore,
    target: DestinationTarget,
    state: ExtractionState,
    report: LoadReport,
}

#[async_trait]
impl StreamObserver for LoadObserver<'_> {
    async fn on_data(&mut self, batch: Batch) -> anyhow::Result<()> {
        let report = self
            .loader
            .load_parent_then_child(&self.target, &batch.rows)
            .await?;
        self.report.merge(report);
        self.state
            .advance(batch.commit_watermark, batch.rows.len(), Utc::now());
        self.store.save_extraction_state(&self.state).await?;
        Ok(())
    }
}
