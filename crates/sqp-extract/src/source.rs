//! Warehouse access contract and its fixture and HTTP implementations.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqp_core::{sort_rows, ExtractFilter, SourceRow};
use sqp_storage::{HttpClientConfig, WarehouseHttpClient};
use tokio::sync::RwLock;

use crate::ExtractError;

/// Paged, filtered read access to the analytical warehouse.
///
/// Pages are returned in the stable order of `filter.order_by` so that offset
/// pagination never skips or repeats rows while the source is unchanged.
#[async_trait]
pub trait WarehouseSource: Send + Sync {
    fn name(&self) -> &str;

    /// Total matching rows, when the warehouse can tell cheaply.
    async fn count(&self, filter: &ExtractFilter) -> Result<Option<u64>, ExtractError>;

    async fn fetch_page(
        &self,
        filter: &ExtractFilter,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<SourceRow>, ExtractError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarehouseSnapshot {
    pub source: String,
    pub captured_at: DateTime<Utc>,
    pub rows: Vec<SourceRow>,
}

pub async fn load_snapshot(path: impl AsRef<Path>) -> Result<WarehouseSnapshot, ExtractError> {
    let path = path.as_ref();
    let data = tokio::fs::read_to_string(path)
        .await
        .map_err(|err| ExtractError::Fixture {
            path: path.display().to_string(),
            message: err.to_string(),
        })?;
    serde_json::from_str(&data).map_err(|err| ExtractError::Fixture {
        path: path.display().to_string(),
        message: err.to_string(),
    })
}

/// In-process warehouse backed by a JSON snapshot.
#[derive(Debug)]
pub struct FixtureWarehouse {
    name: String,
    rows: RwLock<Vec<SourceRow>>,
}

impl FixtureWarehouse {
    pub fn from_rows(name: impl Into<String>, rows: Vec<SourceRow>) -> Self {
        Self {
            name: name.into(),
            rows: RwLock::new(rows),
        }
    }

    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, ExtractError> {
        let path = path.into();
        let snapshot = load_snapshot(&path).await?;
        Ok(Self::from_rows(snapshot.source, snapshot.rows))
    }

    /// Append rows as if they had just landed in the warehouse.
    pub async fn push_rows(&self, rows: impl IntoIterator<Item = SourceRow>) {
        self.rows.write().await.extend(rows);
    }

    async fn matching(&self, filter: &ExtractFilter) -> Vec<SourceRow> {
        let rows = self.rows.read().await;
        let mut out: Vec<SourceRow> = rows.iter().filter(|r| filter.matches(r)).cloned().collect();
        sort_rows(&mut out, filter.order_by);
        out
    }
}

#[async_trait]
impl WarehouseSource for FixtureWarehouse {
    fn name(&self) -> &str {
        &self.name
    }

    async fn count(&self, filter: &ExtractFilter) -> Result<Option<u64>, ExtractError> {
        Ok(Some(self.matching(filter).await.len() as u64))
    }

    async fn fetch_page(
        &self,
        filter: &ExtractFilter,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<SourceRow>, ExtractError> {
        Ok(self
            .matching(filter)
            .await
            .into_iter()
            .skip(offset as usize)
            .take(limit)
            .collect())
    }
}

#[derive(Debug, Serialize)]
struct QueryRequest<'a> {
    filter: &'a ExtractFilter,
    offset: u64,
    limit: usize,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    rows: Vec<SourceRow>,
}

#[derive(Debug, Serialize)]
struct CountRequest<'a> {
    filter: &'a ExtractFilter,
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    total: Option<u64>,
}

/// Warehouse reached through its JSON query facade (`POST /query`, `POST /count`).
#[derive(Debug, Clone)]
pub struct HttpWarehouse {
    name: String,
    client: Arc<WarehouseHttpClient>,
}

impl HttpWarehouse {
    pub fn new(name: impl Into<String>, client: Arc<WarehouseHttpClient>) -> Self {
        Self {
            name: name.into(),
            client,
        }
    }

    pub fn connect(name: impl Into<String>, config: HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self::new(name, Arc::new(WarehouseHttpClient::new(config)?)))
    }
}

#[async_trait]
impl WarehouseSource for HttpWarehouse {
    fn name(&self) -> &str {
        &self.name
    }

    async fn count(&self, filter: &ExtractFilter) -> Result<Option<u64>, ExtractError> {
        let resp: CountResponse = self
            .client
            .post_json("count", &CountRequest { filter })
            .await?;
        Ok(resp.total)
    }

    async fn fetch_page(
        &self,
        filter: &ExtractFilter,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<SourceRow>, ExtractError> {
        let resp: QueryResponse = self
            .client
            .post_json(
                "query",
                &QueryRequest {
                    filter,
                    offset,
                    limit,
                },
            )
            .await?;
        Ok(resp.rows)
    }
}
