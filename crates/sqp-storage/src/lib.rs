//! Persistence contracts for the refresh schedule, run audit log, extraction
//! watermarks and the parent/child destination tables, plus the warehouse
//! HTTP client.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqp_core::{
    ChildUpsert, DestinationTarget, ExtractionState, NewRefreshConfig, ParentKey, ParentUpsert,
    RefreshConfig, RefreshDependency, RunCompletion, SyncRun, TableId,
};
use thiserror::Error;
use uuid::Uuid;

pub mod http;
pub mod memory;
pub mod postgres;

pub use http::{
    BackoffPolicy, FetchError, HttpClientConfig, RetryDisposition, WarehouseHttpClient,
};
pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "sqp-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid data: {0}")]
    Invalid(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Refresh schedule, dependency edges, run audit log and extraction state.
#[async_trait]
pub trait RefreshStore: Send + Sync {
    /// Insert or replace the settings of a config. Schedule timestamps of an
    /// existing row are preserved.
    async fn upsert_config(&self, config: &NewRefreshConfig) -> StoreResult<RefreshConfig>;

    async fn list_configs(&self) -> StoreResult<Vec<RefreshConfig>>;

    async fn get_config(&self, table: &TableId) -> StoreResult<Option<RefreshConfig>>;

    /// Remove a config and every edge touching it.
    async fn delete_config(&self, table: &TableId) -> StoreResult<bool>;

    async fn add_dependency(&self, dependency: &RefreshDependency) -> StoreResult<()>;

    async fn remove_dependency(&self, parent: &TableId, dependent: &TableId) -> StoreResult<bool>;

    async fn list_dependencies(&self) -> StoreResult<Vec<RefreshDependency>>;

    async fn record_refresh(
        &self,
        table: &TableId,
        last_refresh_at: DateTime<Utc>,
        next_refresh_at: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Append a `running` run. Returns `None` when the table already has one.
    async fn begin_run(
        &self,
        table: &TableId,
        cycle_id: Option<Uuid>,
        started_at: DateTime<Utc>,
    ) -> StoreResult<Option<SyncRun>>;

    /// Apply the completion update to a running run.
    async fn finish_run(&self, run_id: i64, completion: &RunCompletion) -> StoreResult<SyncRun>;

    /// Close a running run and advance its table's schedule to
    /// `last_refresh_at = completed_at`, `next_refresh_at`. Either both land
    /// or neither does.
    async fn complete_run(
        &self,
        run_id: i64,
        completion: &RunCompletion,
        next_refresh_at: DateTime<Utc>,
    ) -> StoreResult<SyncRun>;

    async fn running_run(&self, table: &TableId) -> StoreResult<Option<SyncRun>>;

    async fn runs_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<SyncRun>>;

    /// Newest first.
    async fn run_history(&self, limit: usize, offset: usize) -> StoreResult<Vec<SyncRun>>;

    async fn latest_run_per_table(&self) -> StoreResult<Vec<SyncRun>>;

    /// Delete finished runs started before `cutoff`.
    async fn purge_runs_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;

    /// Fail `running` runs started before `started_before`.
    async fn fail_stale_runs(
        &self,
        started_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<u64>;

    async fn load_extraction_state(&self, pipeline_id: &str)
        -> StoreResult<Option<ExtractionState>>;

    async fn save_extraction_state(&self, state: &ExtractionState) -> StoreResult<()>;
}

/// Destination tables written by the loader.
#[async_trait]
pub trait DestinationStore: Send + Sync {
    /// Insert-or-merge parents on their natural key. Returns rows touched.
    async fn upsert_parents(
        &self,
        target: &DestinationTarget,
        parents: &[ParentUpsert],
    ) -> StoreResult<u64>;

    /// Surrogate ids of committed parents. Missing keys are absent from the map.
    async fn parent_ids(
        &self,
        target: &DestinationTarget,
        keys: &[ParentKey],
    ) -> StoreResult<HashMap<ParentKey, i64>>;

    /// Insert-or-merge children on `(parent_id, detail_key)`. Returns rows touched.
    async fn upsert_children(
        &self,
        target: &DestinationTarget,
        children: &[ChildUpsert],
    ) -> StoreResult<u64>;

    /// Store-side refresh of a derived table (materialized view or rollup).
    async fn refresh_derived(&self, table: &TableId) -> StoreResult<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traits_are_object_safe() {
        fn _refresh(_: &dyn RefreshStore) {}
        fn _destination(_: &dyn DestinationStore) {}
    }

    #[test]
    fn not_found_displays_context() {
        let err = StoreError::NotFound("sync run 7".into());
        assert_eq!(err.to_string(), "not found: sync run 7");
    }
}
