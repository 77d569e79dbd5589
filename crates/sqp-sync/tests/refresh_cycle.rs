use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use sqp_core::{
    ChildUpsert, DestinationTarget, ErrorCategory, ExtractFilter, NewRefreshConfig, ParentKey,
    ParentUpsert, PipelineStatus, RefreshDependency, RunStatus, Severity, SourceRow, TableId,
};
use sqp_extract::{load_snapshot, ExtractError, Extractor, FixtureWarehouse, WarehouseSource};
use sqp_storage::{DestinationStore, MemoryStore, RefreshStore, StoreResult};
use sqp_sync::{
    apply_registry, ErrorTracker, RefreshRegistry, RefreshScheduler, SchedulerConfig,
    SchedulerError, TableStatus,
};
use tokio::sync::Notify;

fn sample_path() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/warehouse/sample.json")
}

async fn sample_rows() -> Vec<SourceRow> {
    load_snapshot(sample_path()).await.expect("sample").rows
}

fn reports() -> TableId {
    TableId::new("public", "search_query_reports")
}

fn rollup() -> TableId {
    TableId::new("reporting", "search_query_rollup")
}

struct Harness {
    store: Arc<MemoryStore>,
    tracker: Arc<ErrorTracker>,
    scheduler: Arc<RefreshScheduler>,
}

fn harness_with(
    source: Arc<dyn WarehouseSource>,
    destination: Arc<dyn DestinationStore>,
    store: Arc<MemoryStore>,
    config: SchedulerConfig,
) -> Harness {
    let tracker = Arc::new(ErrorTracker::default());
    let scheduler = RefreshScheduler::new(
        store.clone(),
        destination,
        Extractor::new(source).with_page_size(5),
        tracker.clone(),
        config,
    );
    Harness {
        store,
        tracker,
        scheduler: Arc::new(scheduler),
    }
}

async fn harness(source: Arc<dyn WarehouseSource>, registry: &str) -> Harness {
    let store = Arc::new(MemoryStore::default());
    let registry = RefreshRegistry::from_yaml(registry).expect("registry");
    apply_registry(store.as_ref(), &registry, false)
        .await
        .expect("apply registry");
    harness_with(source, store.clone(), store, SchedulerConfig::default())
}

async fn sample_warehouse() -> Arc<FixtureWarehouse> {
    Arc::new(FixtureWarehouse::from_rows("sample", sample_rows().await))
}

/// Warehouse that always fails.
struct BrokenWarehouse;

#[async_trait]
impl WarehouseSource for BrokenWarehouse {
    fn name(&self) -> &str {
        "broken"
    }

    async fn count(&self, _filter: &ExtractFilter) -> Result<Option<u64>, ExtractError> {
        Ok(None)
    }

    async fn fetch_page(
        &self,
        _filter: &ExtractFilter,
        _offset: u64,
        _limit: usize,
    ) -> Result<Vec<SourceRow>, ExtractError> {
        Err(ExtractError::Warehouse("connection refused".into()))
    }
}

/// Holds every fetch until `open` is called.
struct GatedWarehouse {
    inner: FixtureWarehouse,
    open: AtomicBool,
    gate: Notify,
}

impl GatedWarehouse {
    fn new(rows: Vec<SourceRow>) -> Self {
        Self {
            inner: FixtureWarehouse::from_rows("gated", rows),
            open: AtomicBool::new(false),
            gate: Notify::new(),
        }
    }

    fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
        self.gate.notify_one();
    }
}

#[async_trait]
impl WarehouseSource for GatedWarehouse {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn count(&self, filter: &ExtractFilter) -> Result<Option<u64>, ExtractError> {
        self.inner.count(filter).await
    }

    async fn fetch_page(
        &self,
        filter: &ExtractFilter,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<SourceRow>, ExtractError> {
        if !self.open.load(Ordering::SeqCst) {
            self.gate.notified().await;
        }
        self.inner.fetch_page(filter, offset, limit).await
    }
}

/// Destination whose id lookup never finds one entity's parents.
struct LosesParent {
    inner: Arc<MemoryStore>,
    lost_entity: String,
}

#[async_trait]
impl DestinationStore for LosesParent {
    async fn upsert_parents(
        &self,
        target: &DestinationTarget,
        parents: &[ParentUpsert],
    ) -> StoreResult<u64> {
        self.inner.upsert_parents(target, parents).await
    }

    async fn parent_ids(
        &self,
        target: &DestinationTarget,
        keys: &[ParentKey],
    ) -> StoreResult<HashMap<ParentKey, i64>> {
        let mut ids = self.inner.parent_ids(target, keys).await?;
        ids.retain(|k, _| k.entity_id != self.lost_entity);
        Ok(ids)
    }

    async fn upsert_children(
        &self,
        target: &DestinationTarget,
        children: &[ChildUpsert],
    ) -> StoreResult<u64> {
        self.inner.upsert_children(target, children).await
    }

    async fn refresh_derived(&self, table: &TableId) -> StoreResult<u64> {
        self.inner.refresh_derived(table).await
    }
}

const FULL_WITH_ROLLUP: &str = r#"
tables:
  - table: search_query_reports
    frequency_hours: 24
    priority: 90
  - table: reporting.search_query_rollup
    frequency_hours: 24
    priority: 10
    depends_on:
      - table: search_query_reports
        kind: hard
    parameters:
      mode: derived
  - table: legacy_terms
    enabled: false
    frequency_hours: 24
"#;

const INCREMENTAL: &str = r#"
tables:
  - table: search_query_reports
    frequency_hours: 24
    parameters:
      mode: incremental
      cursor_column: observed_at
      batch_size: 5
      on_page_error: abort
"#;

#[tokio::test]
async fn sample_cycle_loads_parents_then_children_and_reschedules() {
    let h = harness(sample_warehouse().await, FULL_WITH_ROLLUP).await;

    let report = h.scheduler.run_cycle().await.expect("cycle");
    let summary = report.summary();
    assert_eq!(summary.due, 2);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(report.outcomes[0].table, reports());
    assert_eq!(report.outcomes[0].rows_processed, 16);
    assert_eq!(report.outcomes[1].table, rollup());

    let target = DestinationTarget::default();
    assert_eq!(h.store.parents(&target).await.len(), 6);
    assert_eq!(h.store.children(&target).await.len(), 16);
    assert_eq!(h.store.derived_refresh_count(&rollup()).await, 1);
    assert_eq!(
        h.store.derived_refresh_count(&TableId::new("public", "legacy_terms")).await,
        0
    );

    let config = h.store.get_config(&reports()).await.unwrap().unwrap();
    let last = config.last_refresh_at.expect("refreshed");
    assert_eq!(config.next_refresh_at, Some(last + ChronoDuration::hours(24)));

    let history = h.store.run_history(10, 0).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|r| r.status == RunStatus::Success));

    let again = h.scheduler.run_cycle().await.expect("second cycle");
    assert!(again.outcomes.is_empty());
}

#[tokio::test]
async fn failed_hard_parent_blocks_its_dependent() {
    let h = harness(Arc::new(BrokenWarehouse), FULL_WITH_ROLLUP).await;

    let report = h.scheduler.run_cycle().await.expect("cycle");
    let parent = report.outcome(&reports()).unwrap();
    assert_eq!(parent.status, TableStatus::Failed);
    let dependent = report.outcome(&rollup()).unwrap();
    assert_eq!(dependent.status, TableStatus::Blocked);
    assert_eq!(dependent.blocked_by, vec![reports()]);
    assert_eq!(h.store.derived_refresh_count(&rollup()).await, 0);

    // Both stay due; the failure left the schedule alone.
    let due = h.scheduler.due_configs(Utc::now()).await.unwrap();
    assert_eq!(due.len(), 2);
    let history = h.store.run_history(10, 0).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, RunStatus::Failed);
    assert!(history[0].error_message.is_some());

    let errors = h.tracker.errors().await;
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].context["table"], "public.search_query_reports");
}

#[tokio::test]
async fn soft_dependencies_never_block() {
    let registry = FULL_WITH_ROLLUP.replace("kind: hard", "kind: soft");
    let h = harness(Arc::new(BrokenWarehouse), &registry).await;

    let report = h.scheduler.run_cycle().await.expect("cycle");
    assert_eq!(report.outcome(&reports()).unwrap().status, TableStatus::Failed);
    assert_eq!(report.outcome(&rollup()).unwrap().status, TableStatus::Success);
    assert_eq!(h.store.derived_refresh_count(&rollup()).await, 1);
}

#[tokio::test]
async fn incremental_rerun_from_the_watermark_is_idempotent() {
    let h = harness(sample_warehouse().await, INCREMENTAL).await;

    let first = h.scheduler.run_cycle().await.expect("first cycle");
    assert_eq!(first.outcomes[0].status, TableStatus::Success);
    assert_eq!(first.outcomes[0].rows_processed, 16);

    let state = h
        .store
        .load_extraction_state("public.search_query_reports")
        .await
        .unwrap()
        .expect("state");
    assert_eq!(state.status, PipelineStatus::Completed);
    let watermark = state.last_watermark.expect("watermark");
    assert_eq!(watermark.to_rfc3339(), "2026-03-15T02:00:00+00:00");

    h.store.set_schedule(&reports(), None, None).await.unwrap();
    let second = h.scheduler.run_cycle().await.expect("second cycle");
    // Rows at the watermark are read again and merge onto the same keys.
    assert_eq!(second.outcomes[0].rows_processed, 8);

    let target = DestinationTarget::default();
    assert_eq!(h.store.parents(&target).await.len(), 6);
    assert_eq!(h.store.children(&target).await.len(), 16);
    let state = h
        .store
        .load_extraction_state("public.search_query_reports")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.last_watermark, Some(watermark));
}

#[tokio::test]
async fn unresolved_children_follow_the_partial_success_ratio() {
    for (ratio, expected) in [
        (0.0, TableStatus::PartialSuccess),
        (0.5, TableStatus::Success),
    ] {
        let store = Arc::new(MemoryStore::default());
        let registry = RefreshRegistry::from_yaml(FULL_WITH_ROLLUP).unwrap();
        apply_registry(store.as_ref(), &registry, false).await.unwrap();
        let destination = Arc::new(LosesParent {
            inner: store.clone(),
            lost_entity: "acct-1003".into(),
        });
        let h = harness_with(
            sample_warehouse().await,
            destination,
            store,
            SchedulerConfig {
                partial_success_ratio: ratio,
                ..SchedulerConfig::default()
            },
        );

        let report = h.scheduler.run_cycle().await.expect("cycle");
        let outcome = report.outcome(&reports()).unwrap();
        assert_eq!(outcome.status, expected, "ratio {ratio}");
        assert_eq!(outcome.warnings, 4);
        assert_eq!(h.store.children(&DestinationTarget::default()).await.len(), 12);

        // Only a `success` parent unblocks the dependent.
        let dependent = report.outcome(&rollup()).unwrap();
        if expected == TableStatus::Success {
            assert_eq!(dependent.status, TableStatus::Success);
        } else {
            assert_eq!(dependent.status, TableStatus::Blocked);
        }

        let errors = h.tracker.errors().await;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].category, ErrorCategory::DataQuality);
        assert_eq!(errors[0].severity, Severity::Low);
    }
}

#[tokio::test]
async fn table_refreshed_25_hours_ago_is_due() {
    let h = harness(sample_warehouse().await, FULL_WITH_ROLLUP).await;
    let last = Utc::now() - ChronoDuration::hours(25);
    h.store
        .set_schedule(&reports(), Some(last), Some(last + ChronoDuration::hours(24)))
        .await
        .unwrap();
    let recent = Utc::now() - ChronoDuration::hours(1);
    h.store
        .set_schedule(&rollup(), Some(recent), Some(recent + ChronoDuration::hours(24)))
        .await
        .unwrap();

    let due = h.scheduler.due_configs(Utc::now()).await.unwrap();
    let tables: Vec<TableId> = due.into_iter().map(|c| c.table).collect();
    assert_eq!(tables, vec![reports()]);
}

#[tokio::test]
async fn concurrent_cycles_never_start_a_second_run_for_a_table() {
    let warehouse = Arc::new(GatedWarehouse::new(sample_rows().await));
    let h = harness(warehouse.clone(), INCREMENTAL).await;

    let first = tokio::spawn({
        let scheduler = h.scheduler.clone();
        async move { scheduler.run_cycle().await }
    });

    let mut started = false;
    for _ in 0..200 {
        if h.store.running_run(&reports()).await.unwrap().is_some() {
            started = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(started, "first cycle never started its run");

    let second = h.scheduler.run_cycle().await.expect("second cycle");
    assert_eq!(second.outcomes[0].status, TableStatus::AlreadyRunning);

    warehouse.open();
    let first = first.await.expect("join").expect("first cycle");
    assert_eq!(first.outcomes[0].status, TableStatus::Success);
    assert_eq!(h.store.run_history(10, 0).await.unwrap().len(), 1);
}

#[tokio::test]
async fn slow_tables_time_out_and_stay_due() {
    let store = Arc::new(MemoryStore::default());
    apply_registry(
        store.as_ref(),
        &RefreshRegistry::from_yaml(INCREMENTAL).unwrap(),
        false,
    )
    .await
    .unwrap();
    let h = harness_with(
        Arc::new(GatedWarehouse::new(sample_rows().await)),
        store.clone(),
        store,
        SchedulerConfig {
            table_timeout: Duration::from_millis(50),
            ..SchedulerConfig::default()
        },
    );

    let report = h.scheduler.run_cycle().await.expect("cycle");
    let outcome = &report.outcomes[0];
    assert_eq!(outcome.status, TableStatus::Failed);
    assert!(outcome.error.as_deref().unwrap().contains("timed out"));

    let errors = h.tracker.errors().await;
    assert_eq!(errors[0].category, ErrorCategory::Network);
    assert!(errors[0].retryable);

    let config = h.store.get_config(&reports()).await.unwrap().unwrap();
    assert_eq!(config.next_refresh_at, None);
    let state = h
        .store
        .load_extraction_state("public.search_query_reports")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.status, PipelineStatus::Failed);
    assert_eq!(state.last_watermark, None);
}

#[tokio::test]
async fn dependency_cycles_abort_before_any_table_runs() {
    let h = harness(sample_warehouse().await, FULL_WITH_ROLLUP).await;
    h.store
        .add_dependency(&RefreshDependency {
            parent: rollup(),
            dependent: reports(),
            kind: Default::default(),
        })
        .await
        .unwrap();

    let err = h.scheduler.run_cycle().await.unwrap_err();
    assert!(matches!(err, SchedulerError::Configuration(_)));
    assert!(h.store.run_history(10, 0).await.unwrap().is_empty());

    let critical = h.tracker.unresolved_critical().await;
    assert_eq!(critical.len(), 1);
    assert_eq!(critical[0].category, ErrorCategory::Configuration);
}

#[tokio::test]
async fn incremental_tables_without_a_page_policy_abort_the_cycle() {
    let h = harness(sample_warehouse().await, FULL_WITH_ROLLUP).await;
    h.store
        .upsert_config(&NewRefreshConfig {
            table: TableId::new("public", "search_terms"),
            enabled: true,
            frequency_hours: 24,
            priority: 0,
            custom_parameters: json!({ "mode": "incremental" }),
        })
        .await
        .unwrap();

    let err = h.scheduler.run_cycle().await.unwrap_err();
    match err {
        SchedulerError::Parameters { table, message } => {
            assert_eq!(table, TableId::new("public", "search_terms"));
            assert!(message.contains("on_page_error"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(h.store.run_history(10, 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn shipped_registry_applies_and_runs_against_the_sample() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../refresh.yaml");
    let registry = RefreshRegistry::load(&path).await.expect("refresh.yaml");
    let store = Arc::new(MemoryStore::default());
    let setup = apply_registry(store.as_ref(), &registry, false)
        .await
        .expect("apply");
    assert_eq!(setup.configs_upserted, 4);
    assert_eq!(setup.dependencies_added, 2);

    let h = harness_with(
        sample_warehouse().await,
        store.clone(),
        store,
        SchedulerConfig::default(),
    );
    let report = h.scheduler.run_cycle().await.expect("cycle");
    let summary = report.summary();
    assert_eq!(summary.due, 3);
    assert_eq!(summary.succeeded, 3);
    assert_eq!(
        h.store.children(&DestinationTarget::default()).await.len(),
        16
    );
}
