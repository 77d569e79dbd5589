//! In-process implementation of both store traits.
//!
//! Used for fixture-driven local runs and throughout the test suites. Every
//! operation takes the single state lock, so the running-run guard in
//! [`RefreshStore::begin_run`] is atomic.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqp_core::{
    ChildRecord, ChildUpsert, DestinationTarget, ExtractionState, NewRefreshConfig, ParentKey,
    ParentRecord, ParentUpsert, RefreshConfig, RefreshDependency, RunCompletion, RunStatus,
    SyncRun, TableId,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{DestinationStore, RefreshStore, StoreError, StoreResult};

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_config_id: i64,
    configs: BTreeMap<TableId, RefreshConfig>,
    dependencies: Vec<RefreshDependency>,
    next_run_id: i64,
    runs: Vec<SyncRun>,
    extraction: HashMap<String, ExtractionState>,
    destinations: HashMap<DestinationTarget, DestinationTables>,
    derived_refreshes: BTreeMap<TableId, u64>,
}

impl MemoryState {
    fn running_mut(&mut self, run_id: i64) -> StoreResult<&mut SyncRun> {
        self.runs
            .iter_mut()
            .find(|r| r.id == run_id && r.status == RunStatus::Running)
            .ok_or_else(|| StoreError::NotFound(format!("running sync run {run_id}")))
    }
}

fn apply_completion(run: &mut SyncRun, completion: &RunCompletion) {
    run.status = completion.status;
    run.completed_at = Some(completion.completed_at);
    run.rows_processed = completion.rows_processed;
    run.warnings = completion.warnings;
    run.error_message = completion.error_message.clone();
    run.duration_ms = Some((completion.completed_at - run.started_at).num_milliseconds().max(0));
}

#[derive(Debug, Default)]
struct DestinationTables {
    next_parent_id: i64,
    parents: BTreeMap<ParentKey, ParentRecord>,
    next_child_id: i64,
    children: BTreeMap<(i64, String), ChildRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn parents(&self, target: &DestinationTarget) -> Vec<ParentRecord> {
        let state = self.state.lock().await;
        state
            .destinations
            .get(target)
            .map(|t| t.parents.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn children(&self, target: &DestinationTarget) -> Vec<ChildRecord> {
        let state = self.state.lock().await;
        state
            .destinations
            .get(target)
            .map(|t| t.children.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn derived_refresh_count(&self, table: &TableId) -> u64 {
        let state = self.state.lock().await;
        state.derived_refreshes.get(table).copied().unwrap_or(0)
    }

    /// Overwrite schedule timestamps directly (fixtures and tests).
    pub async fn set_schedule(
        &self,
        table: &TableId,
        last_refresh_at: Option<DateTime<Utc>>,
        next_refresh_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let config = state
            .configs
            .get_mut(table)
            .ok_or_else(|| StoreError::NotFound(format!("refresh config {table}")))?;
        config.last_refresh_at = last_refresh_at;
        config.next_refresh_at = next_refresh_at;
        Ok(())
    }
}

#[async_trait]
impl RefreshStore for MemoryStore {
    async fn upsert_config(&self, config: &NewRefreshConfig) -> StoreResult<RefreshConfig> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.configs.get_mut(&config.table) {
            existing.enabled = config.enabled;
            existing.frequency_hours = config.frequency_hours;
            existing.priority = config.priority;
            existing.custom_parameters = config.custom_parameters.clone();
            return Ok(existing.clone());
        }
        state.next_config_id += 1;
        let created = RefreshConfig {
            id: state.next_config_id,
            table: config.table.clone(),
            enabled: config.enabled,
            frequency_hours: config.frequency_hours,
            priority: config.priority,
            last_refresh_at: None,
            next_refresh_at: None,
            custom_parameters: config.custom_parameters.clone(),
        };
        state.configs.insert(config.table.clone(), created.clone());
        Ok(created)
    }

    async fn list_configs(&self) -> StoreResult<Vec<RefreshConfig>> {
        let state = self.state.lock().await;
        Ok(state.configs.values().cloned().collect())
    }

    async fn get_config(&self, table: &TableId) -> StoreResult<Option<RefreshConfig>> {
        let state = self.state.lock().await;
        Ok(state.configs.get(table).cloned())
    }

    async fn delete_config(&self, table: &TableId) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let removed = state.configs.remove(table).is_some();
        state
            .dependencies
            .retain(|d| &d.parent != table && &d.dependent != table);
        Ok(removed)
    }

    async fn add_dependency(&self, dependency: &RefreshDependency) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        for table in [&dependency.parent, &dependency.dependent] {
            if !state.configs.contains_key(table) {
                return Err(StoreError::NotFound(format!("refresh config {table}")));
            }
        }
        if dependency.parent == dependency.dependent {
            return Err(StoreError::Invalid(format!(
                "{} cannot depend on itself",
                dependency.parent
            )));
        }
        state
            .dependencies
            .retain(|d| !(d.parent == dependency.parent && d.dependent == dependency.dependent));
        state.dependencies.push(dependency.clone());
        Ok(())
    }

    async fn remove_dependency(&self, parent: &TableId, dependent: &TableId) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let before = state.dependencies.len();
        state
            .dependencies
            .retain(|d| !(&d.parent == parent && &d.dependent == dependent));
        Ok(state.dependencies.len() != before)
    }

    async fn list_dependencies(&self) -> StoreResult<Vec<RefreshDependency>> {
        let state = self.state.lock().await;
        Ok(state.dependencies.clone())
    }

    async fn record_refresh(
        &self,
        table: &TableId,
        last_refresh_at: DateTime<Utc>,
        next_refresh_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.set_schedule(table, Some(last_refresh_at), Some(next_refresh_at))
            .await
    }

    async fn begin_run(
        &self,
        table: &TableId,
        cycle_id: Option<Uuid>,
        started_at: DateTime<Utc>,
    ) -> StoreResult<Option<SyncRun>> {
        let mut state = self.state.lock().await;
        if state
            .runs
            .iter()
            .any(|r| &r.table == table && r.status == RunStatus::Running)
        {
            return Ok(None);
        }
        state.next_run_id += 1;
        let run = SyncRun {
            id: state.next_run_id,
            table: table.clone(),
            cycle_id,
            status: RunStatus::Running,
            started_at,
            completed_at: None,
            rows_processed: 0,
            duration_ms: None,
            warnings: 0,
            error_message: None,
        };
        state.runs.push(run.clone());
        Ok(Some(run))
    }

    async fn finish_run(&self, run_id: i64, completion: &RunCompletion) -> StoreResult<SyncRun> {
        let mut state = self.state.lock().await;
        let run = state.running_mut(run_id)?;
        apply_completion(run, completion);
        Ok(run.clone())
    }

    async fn complete_run(
        &self,
        run_id: i64,
        completion: &RunCompletion,
        next_refresh_at: DateTime<Utc>,
    ) -> StoreResult<SyncRun> {
        let mut state = self.state.lock().await;
        let table = state.running_mut(run_id)?.table.clone();
        if !state.configs.contains_key(&table) {
            return Err(StoreError::NotFound(format!("refresh config {table}")));
        }
        let run = state.running_mut(run_id)?;
        apply_completion(run, completion);
        let run = run.clone();
        if let Some(config) = state.configs.get_mut(&table) {
            config.last_refresh_at = Some(completion.completed_at);
            config.next_refresh_at = Some(next_refresh_at);
        }
        Ok(run)
    }

    async fn running_run(&self, table: &TableId) -> StoreResult<Option<SyncRun>> {
        let state = self.state.lock().await;
        Ok(state
            .runs
            .iter()
            .find(|r| &r.table == table && r.status == RunStatus::Running)
            .cloned())
    }

    async fn runs_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<SyncRun>> {
        let state = self.state.lock().await;
        Ok(state
            .runs
            .iter()
            .filter(|r| r.started_at >= since)
            .cloned()
            .collect())
    }

    async fn run_history(&self, limit: usize, offset: usize) -> StoreResult<Vec<SyncRun>> {
        let state = self.state.lock().await;
        let mut runs = state.runs.clone();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        Ok(runs.into_iter().skip(offset).take(limit).collect())
    }

    async fn latest_run_per_table(&self) -> StoreResult<Vec<SyncRun>> {
        let state = self.state.lock().await;
        let mut latest: BTreeMap<TableId, SyncRun> = BTreeMap::new();
        for run in &state.runs {
            let newer = latest.get(&run.table).map_or(true, |cur| {
                (run.started_at, run.id) > (cur.started_at, cur.id)
            });
            if newer {
                latest.insert(run.table.clone(), run.clone());
            }
        }
        Ok(latest.into_values().collect())
    }

    async fn purge_runs_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut state = self.state.lock().await;
        let before = state.runs.len();
        state
            .runs
            .retain(|r| !(r.status.is_terminal() && r.started_at < cutoff));
        Ok((before - state.runs.len()) as u64)
    }

    async fn fail_stale_runs(
        &self,
        started_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut state = self.state.lock().await;
        let mut failed = 0u64;
        for run in state
            .runs
            .iter_mut()
            .filter(|r| r.status == RunStatus::Running && r.started_at < started_before)
        {
            run.status = RunStatus::Failed;
            run.completed_at = Some(now);
            run.duration_ms = Some((now - run.started_at).num_milliseconds().max(0));
            run.error_message = Some("run abandoned: still running past the stale-run limit".into());
            failed += 1;
        }
        Ok(failed)
    }

    async fn load_extraction_state(
        &self,
        pipeline_id: &str,
    ) -> StoreResult<Option<ExtractionState>> {
        let state = self.state.lock().await;
        Ok(state.extraction.get(pipeline_id).cloned())
    }

    async fn save_extraction_state(&self, extraction: &ExtractionState) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state
            .extraction
            .insert(extraction.pipeline_id.clone(), extraction.clone());
        Ok(())
    }
}

#[async_trait]
impl DestinationStore for MemoryStore {
    async fn upsert_parents(
        &self,
        target: &DestinationTarget,
        parents: &[ParentUpsert],
    ) -> StoreResult<u64> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let tables = state.destinations.entry(target.clone()).or_default();
        for parent in parents {
            if let Some(existing) = tables.parents.get_mut(&parent.key) {
                if parent.entity_name.is_some() {
                    existing.entity_name = parent.entity_name.clone();
                }
                existing.updated_at = now;
                continue;
            }
            tables.next_parent_id += 1;
            let record = ParentRecord {
                id: tables.next_parent_id,
                entity_id: parent.key.entity_id.clone(),
                entity_name: parent.entity_name.clone(),
                period_start: parent.key.period_start,
                period_end: parent.key.period_end,
                created_at: now,
                updated_at: now,
            };
            tables.parents.insert(parent.key.clone(), record);
        }
        Ok(parents.len() as u64)
    }

    async fn parent_ids(
        &self,
        target: &DestinationTarget,
        keys: &[ParentKey],
    ) -> StoreResult<HashMap<ParentKey, i64>> {
        let state = self.state.lock().await;
        let Some(tables) = state.destinations.get(target) else {
            return Ok(HashMap::new());
        };
        Ok(keys
            .iter()
            .filter_map(|k| tables.parents.get(k).map(|p| (k.clone(), p.id)))
            .collect())
    }

    async fn upsert_children(
        &self,
        target: &DestinationTarget,
        children: &[ChildUpsert],
    ) -> StoreResult<u64> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let tables = state.destinations.entry(target.clone()).or_default();
        for child in children {
            if !tables.parents.values().any(|p| p.id == child.parent_id) {
                return Err(StoreError::Invalid(format!(
                    "foreign key violation: parent {} does not exist",
                    child.parent_id
                )));
            }
        }
        for child in children {
            let key = (child.parent_id, child.detail_key.clone());
            if let Some(existing) = tables.children.get_mut(&key) {
                existing.metrics = child.metrics;
                existing.updated_at = now;
                continue;
            }
            tables.next_child_id += 1;
            let record = ChildRecord {
                id: tables.next_child_id,
                parent_id: child.parent_id,
                detail_key: child.detail_key.clone(),
                metrics: child.metrics,
                created_at: now,
                updated_at: now,
            };
            tables.children.insert(key, record);
        }
        Ok(children.len() as u64)
    }

    async fn refresh_derived(&self, table: &TableId) -> StoreResult<u64> {
        let mut state = self.state.lock().await;
        *state.derived_refreshes.entry(table.clone()).or_default() += 1;
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate, TimeZone};
    use sqp_core::QueryMetrics;

    fn ts(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, 0, 0).single().unwrap()
    }

    fn table(name: &str) -> TableId {
        TableId::new("public", name)
    }

    fn new_config(name: &str) -> NewRefreshConfig {
        NewRefreshConfig {
            table: table(name),
            enabled: true,
            frequency_hours: 24,
            priority: 50,
            custom_parameters: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn begin_run_refuses_second_running_row() {
        let store = MemoryStore::new();
        let first = store.begin_run(&table("a"), None, ts(1)).await.unwrap();
        assert!(first.is_some());
        let second = store.begin_run(&table("a"), None, ts(2)).await.unwrap();
        assert!(second.is_none());

        let other = store.begin_run(&table("b"), None, ts(2)).await.unwrap();
        assert!(other.is_some());
    }

    #[tokio::test]
    async fn complete_run_changes_nothing_when_the_config_is_gone() {
        let store = MemoryStore::new();
        store.upsert_config(&new_config("a")).await.unwrap();
        let kept = store.begin_run(&table("a"), None, ts(1)).await.unwrap().unwrap();
        let orphan = store.begin_run(&table("gone"), None, ts(1)).await.unwrap().unwrap();
        let completion = RunCompletion {
            status: RunStatus::Success,
            completed_at: ts(2),
            rows_processed: 3,
            warnings: 0,
            error_message: None,
        };
        let next = ts(2) + Duration::hours(24);

        assert!(store.complete_run(orphan.id, &completion, next).await.is_err());
        assert!(store.running_run(&table("gone")).await.unwrap().is_some());

        let done = store.complete_run(kept.id, &completion, next).await.unwrap();
        assert_eq!(done.status, RunStatus::Success);
        let config = store.get_config(&table("a")).await.unwrap().unwrap();
        assert_eq!(config.last_refresh_at, Some(ts(2)));
        assert_eq!(config.next_refresh_at, Some(next));
    }

    #[tokio::test]
    async fn finish_run_applies_single_completion_update() {
        let store = MemoryStore::new();
        let run = store.begin_run(&table("a"), None, ts(1)).await.unwrap().unwrap();
        let completion = RunCompletion {
            status: RunStatus::Success,
            completed_at: ts(1) + Duration::seconds(90),
            rows_processed: 12,
            warnings: 0,
            error_message: None,
        };
        let done = store.finish_run(run.id, &completion).await.unwrap();
        assert_eq!(done.duration_ms, Some(90_000));
        assert!(store.finish_run(run.id, &completion).await.is_err());
        assert!(store.running_run(&table("a")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_config_preserves_schedule() {
        let store = MemoryStore::new();
        store.upsert_config(&new_config("a")).await.unwrap();
        store.record_refresh(&table("a"), ts(1), ts(2)).await.unwrap();
        let mut changed = new_config("a");
        changed.priority = 90;
        let updated = store.upsert_config(&changed).await.unwrap();
        assert_eq!(updated.priority, 90);
        assert_eq!(updated.last_refresh_at, Some(ts(1)));
        assert_eq!(updated.next_refresh_at, Some(ts(2)));
    }

    #[tokio::test]
    async fn delete_config_drops_touching_edges() {
        let store = MemoryStore::new();
        store.upsert_config(&new_config("a")).await.unwrap();
        store.upsert_config(&new_config("b")).await.unwrap();
        store
            .add_dependency(&RefreshDependency {
                parent: table("a"),
                dependent: table("b"),
                kind: sqp_core::DependencyKind::Hard,
            })
            .await
            .unwrap();
        assert!(store.delete_config(&table("a")).await.unwrap());
        assert!(store.list_dependencies().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn child_upsert_requires_existing_parent() {
        let store = MemoryStore::new();
        let target = DestinationTarget::default();
        let child = ChildUpsert {
            parent_id: 99,
            detail_key: "shoes".into(),
            metrics: QueryMetrics::default(),
        };
        assert!(store.upsert_children(&target, &[child]).await.is_err());
    }

    #[tokio::test]
    async fn parent_upsert_is_keyed_on_natural_key() {
        let store = MemoryStore::new();
        let target = DestinationTarget::default();
        let day = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let parent = ParentUpsert {
            key: ParentKey {
                entity_id: "acct-1".into(),
                period_start: day,
                period_end: day,
            },
            entity_name: Some("Account".into()),
        };
        store.upsert_parents(&target, &[parent.clone()]).await.unwrap();
        store.upsert_parents(&target, &[parent.clone()]).await.unwrap();
        let parents = store.parents(&target).await;
        assert_eq!(parents.len(), 1);
        let ids = store.parent_ids(&target, &[parent.key]).await.unwrap();
        assert_eq!(ids.values().copied().collect::<Vec<_>>(), vec![parents[0].id]);
    }

    #[tokio::test]
    async fn stale_running_runs_are_failed() {
        let store = MemoryStore::new();
        store.begin_run(&table("a"), None, ts(1)).await.unwrap();
        store.begin_run(&table("b"), None, ts(10)).await.unwrap();
        assert_eq!(store.fail_stale_runs(ts(5), ts(11)).await.unwrap(), 1);
        assert!(store.running_run(&table("a")).await.unwrap().is_none());
        assert!(store.running_run(&table("b")).await.unwrap().is_some());
    }
}
