//! `PostgreSQL` implementation of both store traits on a shared `PgPool`.
//!
//! Schema lives in `migrations/`. Destination table names come from
//! [`DestinationTarget`] and are validated as plain identifiers before being
//! quoted into SQL.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use sqp_core::{
    is_plain_identifier, ChildUpsert, DependencyKind, DestinationTarget, ExtractionState,
    NewRefreshConfig, ParentKey, ParentUpsert, PipelineStatus, RefreshConfig, RefreshDependency,
    RunCompletion, RunStatus, SyncRun, TableId,
};
use tracing::debug;
use uuid::Uuid;

use crate::{DestinationStore, RefreshStore, StoreError, StoreResult};

const CONFIG_COLUMNS: &str = "id, schema_name, table_name, is_enabled, refresh_frequency_hours, \
     priority, last_refresh_at, next_refresh_at, custom_parameters";

const RUN_COLUMNS: &str = "id, schema_name, table_name, cycle_id, status, started_at, \
     completed_at, rows_processed, duration_ms, warnings, error_message";

/// Postgres caps one statement at this many bind parameters.
const MAX_BINDS: usize = 65_535;
const PARENT_BINDS: usize = 6;
const CHILD_BINDS: usize = 11;

/// Rows per multi-row `INSERT` that stay under the bind limit.
fn rows_per_statement(binds_per_row: usize) -> usize {
    (MAX_BINDS / binds_per_row.max(1)).max(1)
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn quote_ident(ident: &str) -> StoreResult<String> {
    if is_plain_identifier(ident) {
        Ok(format!("\"{ident}\""))
    } else {
        Err(StoreError::Invalid(format!("unsafe identifier `{ident}`")))
    }
}

fn qualified(schema: &str, table: &str) -> StoreResult<String> {
    Ok(format!("{}.{}", quote_ident(schema)?, quote_ident(table)?))
}

fn config_from_row(row: &PgRow) -> StoreResult<RefreshConfig> {
    Ok(RefreshConfig {
        id: row.try_get("id")?,
        table: TableId::new(
            row.try_get::<String, _>("schema_name")?,
            row.try_get::<String, _>("table_name")?,
        ),
        enabled: row.try_get("is_enabled")?,
        frequency_hours: row.try_get("refresh_frequency_hours")?,
        priority: row.try_get("priority")?,
        last_refresh_at: row.try_get("last_refresh_at")?,
        next_refresh_at: row.try_get("next_refresh_at")?,
        custom_parameters: row.try_get::<JsonValue, _>("custom_parameters")?,
    })
}

async fn close_run<'e, E>(
    executor: E,
    run_id: i64,
    completion: &RunCompletion,
) -> StoreResult<SyncRun>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let sql = format!(
        r#"
        UPDATE sync_runs
           SET status = $2,
               completed_at = $3,
               rows_processed = $4,
               warnings = $5,
               error_message = $6,
               duration_ms = GREATEST(0, (EXTRACT(EPOCH FROM ($3 - started_at)) * 1000)::BIGINT)
         WHERE id = $1 AND status = 'running'
        RETURNING {RUN_COLUMNS}
        "#
    );
    let row = sqlx::query(&sql)
        .bind(run_id)
        .bind(completion.status.as_str())
        .bind(completion.completed_at)
        .bind(completion.rows_processed)
        .bind(completion.warnings)
        .bind(&completion.error_message)
        .fetch_optional(executor)
        .await?;
    match row {
        Some(row) => run_from_row(&row),
        None => Err(StoreError::NotFound(format!("running sync run {run_id}"))),
    }
}

async fn set_refreshed<'e, E>(
    executor: E,
    table: &TableId,
    last_refresh_at: DateTime<Utc>,
    next_refresh_at: DateTime<Utc>,
) -> StoreResult<()>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        r#"
        UPDATE refresh_configs
           SET last_refresh_at = $3,
               next_refresh_at = $4,
               updated_at = NOW()
         WHERE schema_name = $1 AND table_name = $2
        "#,
    )
    .bind(&table.schema)
    .bind(&table.table)
    .bind(last_refresh_at)
    .bind(next_refresh_at)
    .execute(executor)
    .await?;
    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound(format!("refresh config {table}")));
    }
    Ok(())
}

fn run_from_row(row: &PgRow) -> StoreResult<SyncRun> {
    let status: String = row.try_get("status")?;
    Ok(SyncRun {
        id: row.try_get("id")?,
        table: TableId::new(
            row.try_get::<String, _>("schema_name")?,
            row.try_get::<String, _>("table_name")?,
        ),
        cycle_id: row.try_get::<Option<Uuid>, _>("cycle_id")?,
        status: status
            .parse::<RunStatus>()
            .map_err(|e| StoreError::Invalid(e.to_string()))?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        rows_processed: row.try_get("rows_processed")?,
        duration_ms: row.try_get("duration_ms")?,
        warnings: row.try_get("warnings")?,
        error_message: row.try_get("error_message")?,
    })
}

#[async_trait]
impl RefreshStore for PgStore {
    async fn upsert_config(&self, config: &NewRefreshConfig) -> StoreResult<RefreshConfig> {
        let sql = format!(
            r#"
            INSERT INTO refresh_configs (
                schema_name, table_name, is_enabled, refresh_frequency_hours,
                priority, custom_parameters
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (schema_name, table_name)
            DO UPDATE SET is_enabled = EXCLUDED.is_enabled,
                          refresh_frequency_hours = EXCLUDED.refresh_frequency_hours,
                          priority = EXCLUDED.priority,
                          custom_parameters = EXCLUDED.custom_parameters,
                          updated_at = NOW()
            RETURNING {CONFIG_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(&config.table.schema)
            .bind(&config.table.table)
            .bind(config.enabled)
            .bind(config.frequency_hours)
            .bind(config.priority)
            .bind(&config.custom_parameters)
            .fetch_one(&self.pool)
            .await?;
        config_from_row(&row)
    }

    async fn list_configs(&self) -> StoreResult<Vec<RefreshConfig>> {
        let sql = format!(
            "SELECT {CONFIG_COLUMNS} FROM refresh_configs ORDER BY schema_name, table_name"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(config_from_row).collect()
    }

    async fn get_config(&self, table: &TableId) -> StoreResult<Option<RefreshConfig>> {
        let sql = format!(
            "SELECT {CONFIG_COLUMNS} FROM refresh_configs WHERE schema_name = $1 AND table_name = $2"
        );
        let row = sqlx::query(&sql)
            .bind(&table.schema)
            .bind(&table.table)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(config_from_row).transpose()
    }

    async fn delete_config(&self, table: &TableId) -> StoreResult<bool> {
        // Edges go with the config through ON DELETE CASCADE.
        let result =
            sqlx::query("DELETE FROM refresh_configs WHERE schema_name = $1 AND table_name = $2")
                .bind(&table.schema)
                .bind(&table.table)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn add_dependency(&self, dependency: &RefreshDependency) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO refresh_dependencies (parent_config_id, dependent_config_id, dependency_type)
            SELECT p.id, d.id, $5
              FROM refresh_configs p, refresh_configs d
             WHERE p.schema_name = $1 AND p.table_name = $2
               AND d.schema_name = $3 AND d.table_name = $4
            ON CONFLICT (parent_config_id, dependent_config_id)
            DO UPDATE SET dependency_type = EXCLUDED.dependency_type
            "#,
        )
        .bind(&dependency.parent.schema)
        .bind(&dependency.parent.table)
        .bind(&dependency.dependent.schema)
        .bind(&dependency.dependent.table)
        .bind(dependency.kind.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!(
                "refresh configs for edge {} -> {}",
                dependency.parent, dependency.dependent
            )));
        }
        Ok(())
    }

    async fn remove_dependency(&self, parent: &TableId, dependent: &TableId) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM refresh_dependencies rd
             USING refresh_configs p, refresh_configs d
             WHERE rd.parent_config_id = p.id AND rd.dependent_config_id = d.id
               AND p.schema_name = $1 AND p.table_name = $2
               AND d.schema_name = $3 AND d.table_name = $4
            "#,
        )
        .bind(&parent.schema)
        .bind(&parent.table)
        .bind(&dependent.schema)
        .bind(&dependent.table)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_dependencies(&self) -> StoreResult<Vec<RefreshDependency>> {
        let rows = sqlx::query(
            r#"
            SELECT p.schema_name AS parent_schema, p.table_name AS parent_table,
                   d.schema_name AS dependent_schema, d.table_name AS dependent_table,
                   rd.dependency_type
              FROM refresh_dependencies rd
              JOIN refresh_configs p ON p.id = rd.parent_config_id
              JOIN refresh_configs d ON d.id = rd.dependent_config_id
             ORDER BY p.schema_name, p.table_name, d.schema_name, d.table_name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let kind: String = row.try_get("dependency_type")?;
            out.push(RefreshDependency {
                parent: TableId::new(
                    row.try_get::<String, _>("parent_schema")?,
                    row.try_get::<String, _>("parent_table")?,
                ),
                dependent: TableId::new(
                    row.try_get::<String, _>("dependent_schema")?,
                    row.try_get::<String, _>("dependent_table")?,
                ),
                kind: kind
                    .parse::<DependencyKind>()
                    .map_err(|e| StoreError::Invalid(e.to_string()))?,
            });
        }
        Ok(out)
    }

    async fn record_refresh(
        &self,
        table: &TableId,
        last_refresh_at: DateTime<Utc>,
        next_refresh_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        set_refreshed(&self.pool, table, last_refresh_at, next_refresh_at).await
    }

    async fn begin_run(
        &self,
        table: &TableId,
        cycle_id: Option<Uuid>,
        started_at: DateTime<Utc>,
    ) -> StoreResult<Option<SyncRun>> {
        // The partial unique index on running rows makes this the atomic guard.
        let sql = format!(
            r#"
            INSERT INTO sync_runs (schema_name, table_name, cycle_id, status, started_at)
            VALUES ($1, $2, $3, 'running', $4)
            ON CONFLICT (schema_name, table_name) WHERE status = 'running' DO NOTHING
            RETURNING {RUN_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(&table.schema)
            .bind(&table.table)
            .bind(cycle_id)
            .bind(started_at)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn finish_run(&self, run_id: i64, completion: &RunCompletion) -> StoreResult<SyncRun> {
        close_run(&self.pool, run_id, completion).await
    }

    async fn complete_run(
        &self,
        run_id: i64,
        completion: &RunCompletion,
        next_refresh_at: DateTime<Utc>,
    ) -> StoreResult<SyncRun> {
        let mut tx = self.pool.begin().await?;
        let run = close_run(&mut *tx, run_id, completion).await?;
        set_refreshed(&mut *tx, &run.table, completion.completed_at, next_refresh_at).await?;
        tx.commit().await?;
        Ok(run)
    }

    async fn running_run(&self, table: &TableId) -> StoreResult<Option<SyncRun>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM sync_runs \
             WHERE schema_name = $1 AND table_name = $2 AND status = 'running'"
        );
        let row = sqlx::query(&sql)
            .bind(&table.schema)
            .bind(&table.table)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn runs_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<SyncRun>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM sync_runs WHERE started_at >= $1 ORDER BY started_at, id"
        );
        let rows = sqlx::query(&sql).bind(since).fetch_all(&self.pool).await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn run_history(&self, limit: usize, offset: usize) -> StoreResult<Vec<SyncRun>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM sync_runs ORDER BY started_at DESC, id DESC LIMIT $1 OFFSET $2"
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn latest_run_per_table(&self) -> StoreResult<Vec<SyncRun>> {
        let sql = format!(
            r#"
            SELECT DISTINCT ON (schema_name, table_name) {RUN_COLUMNS}
              FROM sync_runs
             ORDER BY schema_name, table_name, started_at DESC, id DESC
            "#
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn purge_runs_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM sync_runs
             WHERE started_at < $1
               AND status IN ('success', 'partial_success', 'failed')
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn fail_stale_runs(
        &self,
        started_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE sync_runs
               SET status = 'failed',
                   completed_at = $2,
                   duration_ms = GREATEST(0, (EXTRACT(EPOCH FROM ($2 - started_at)) * 1000)::BIGINT),
                   error_message = 'run abandoned: still running past the stale-run limit'
             WHERE status = 'running' AND started_at < $1
            "#,
        )
        .bind(started_before)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn load_extraction_state(
        &self,
        pipeline_id: &str,
    ) -> StoreResult<Option<ExtractionState>> {
        let row = sqlx::query(
            r#"
            SELECT pipeline_id, last_watermark, status, rows_processed, updated_at
              FROM extraction_state
             WHERE pipeline_id = $1
            "#,
        )
        .bind(pipeline_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let status: String = row.try_get("status")?;
        Ok(Some(ExtractionState {
            pipeline_id: row.try_get("pipeline_id")?,
            last_watermark: row.try_get("last_watermark")?,
            status: status
                .parse::<PipelineStatus>()
                .map_err(|e| StoreError::Invalid(e.to_string()))?,
            rows_processed: row.try_get("rows_processed")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    async fn save_extraction_state(&self, state: &ExtractionState) -> StoreResult<()> {
        // GREATEST keeps the stored watermark monotonic even under a stale writer.
        sqlx::query(
            r#"
            INSERT INTO extraction_state (pipeline_id, last_watermark, status, rows_processed, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (pipeline_id)
            DO UPDATE SET last_watermark = GREATEST(extraction_state.last_watermark, EXCLUDED.last_watermark),
                          status = EXCLUDED.status,
                          rows_processed = EXCLUDED.rows_processed,
                          updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&state.pipeline_id)
        .bind(state.last_watermark)
        .bind(state.status.as_str())
        .bind(state.rows_processed)
        .bind(state.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl DestinationStore for PgStore {
    async fn upsert_parents(
        &self,
        target: &DestinationTarget,
        parents: &[ParentUpsert],
    ) -> StoreResult<u64> {
        if parents.is_empty() {
            return Ok(0);
        }
        let table = qualified(&target.schema, &target.parent_table)?;
        let now = Utc::now();
        let mut touched = 0;
        for chunk in parents.chunks(rows_per_statement(PARENT_BINDS)) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {table} AS t (entity_id, entity_name, period_start, period_end, created_at, updated_at) "
            ));
            builder.push_values(chunk, |mut b, parent| {
                b.push_bind(&parent.key.entity_id)
                    .push_bind(&parent.entity_name)
                    .push_bind(parent.key.period_start)
                    .push_bind(parent.key.period_end)
                    .push_bind(now)
                    .push_bind(now);
            });
            builder.push(
                r#"
                ON CONFLICT (entity_id, period_start, period_end)
                DO UPDATE SET entity_name = COALESCE(EXCLUDED.entity_name, t.entity_name),
                              updated_at = EXCLUDED.updated_at
                "#,
            );
            touched += builder.build().execute(&self.pool).await?.rows_affected();
        }
        debug!(table = %table, rows = touched, "upserted parents");
        Ok(touched)
    }

    async fn parent_ids(
        &self,
        target: &DestinationTarget,
        keys: &[ParentKey],
    ) -> StoreResult<HashMap<ParentKey, i64>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let table = qualified(&target.schema, &target.parent_table)?;
        let entity_ids: Vec<String> = keys.iter().map(|k| k.entity_id.clone()).collect();
        let starts: Vec<NaiveDate> = keys.iter().map(|k| k.period_start).collect();
        let ends: Vec<NaiveDate> = keys.iter().map(|k| k.period_end).collect();

        let sql = format!(
            r#"
            SELECT p.id, p.entity_id, p.period_start, p.period_end
              FROM {table} p
              JOIN UNNEST($1::text[], $2::date[], $3::date[]) AS k(entity_id, period_start, period_end)
                ON p.entity_id = k.entity_id
               AND p.period_start = k.period_start
               AND p.period_end = k.period_end
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(&entity_ids)
            .bind(&starts)
            .bind(&ends)
            .fetch_all(&self.pool)
            .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let key = ParentKey {
                entity_id: row.try_get("entity_id")?,
                period_start: row.try_get("period_start")?,
                period_end: row.try_get("period_end")?,
            };
            out.insert(key, row.try_get::<i64, _>("id")?);
        }
        Ok(out)
    }

    async fn upsert_children(
        &self,
        target: &DestinationTarget,
        children: &[ChildUpsert],
    ) -> StoreResult<u64> {
        if children.is_empty() {
            return Ok(0);
        }
        let table = qualified(&target.schema, &target.child_table)?;
        let now = Utc::now();
        let mut touched = 0;
        for chunk in children.chunks(rows_per_statement(CHILD_BINDS)) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                r#"
                INSERT INTO {table} (
                    report_id, search_term, impressions, clicks, conversions,
                    cost, ctr, conversion_rate, cost_per_conversion, created_at, updated_at
                )
                "#
            ));
            builder.push_values(chunk, |mut b, child| {
                b.push_bind(child.parent_id)
                    .push_bind(&child.detail_key)
                    .push_bind(child.metrics.impressions)
                    .push_bind(child.metrics.clicks)
                    .push_bind(child.metrics.conversions)
                    .push_bind(child.metrics.cost)
                    .push_bind(child.metrics.ctr)
                    .push_bind(child.metrics.conversion_rate)
                    .push_bind(child.metrics.cost_per_conversion)
                    .push_bind(now)
                    .push_bind(now);
            });
            builder.push(
                r#"
                ON CONFLICT (report_id, search_term)
                DO UPDATE SET impressions = EXCLUDED.impressions,
                              clicks = EXCLUDED.clicks,
                              conversions = EXCLUDED.conversions,
                              cost = EXCLUDED.cost,
                              ctr = EXCLUDED.ctr,
                              conversion_rate = EXCLUDED.conversion_rate,
                              cost_per_conversion = EXCLUDED.cost_per_conversion,
                              updated_at = EXCLUDED.updated_at
                "#,
            );
            touched += builder.build().execute(&self.pool).await?.rows_affected();
        }
        debug!(table = %table, rows = touched, "upserted children");
        Ok(touched)
    }

    async fn refresh_derived(&self, table: &TableId) -> StoreResult<u64> {
        let name = qualified(&table.schema, &table.table)?;
        let result = sqlx::query(&format!("REFRESH MATERIALIZED VIEW {name}"))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_quoted_only_when_plain() {
        assert_eq!(quote_ident("search_query_reports").unwrap(), "\"search_query_reports\"");
        assert!(quote_ident("reports\"; DROP TABLE x; --").is_err());
        assert_eq!(
            qualified("analytics", "daily").unwrap(),
            "\"analytics\".\"daily\""
        );
    }

    #[test]
    fn multi_row_inserts_stay_under_the_bind_limit() {
        let children = rows_per_statement(CHILD_BINDS);
        assert_eq!(children, 5_957);
        assert!(children * CHILD_BINDS <= MAX_BINDS);
        assert!((children + 1) * CHILD_BINDS > MAX_BINDS);
        assert_eq!(rows_per_statement(PARENT_BINDS), 10_922);
        assert_eq!(rows_per_statement(0), MAX_BINDS);
    }
}
