//! Parent-then-child load into the destination tables.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use sqp_core::{ChildUpsert, DestinationTarget, ParentKey, ParentUpsert, QueryMetrics, SourceRow};
use sqp_storage::{DestinationStore, StoreError};
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_CHILD_BATCH_SIZE: usize = 1_000;
pub const DEFAULT_PARENT_BATCH_SIZE: usize = 500;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("destination {0:?} has unsafe table names")]
    InvalidTarget(DestinationTarget),
    #[error("upserting parents into {table}: {source}")]
    Parents {
        table: String,
        #[source]
        source: StoreError,
    },
    #[error("resolving parent ids in {table}: {source}")]
    Lookup {
        table: String,
        #[source]
        source: StoreError,
    },
    #[error("upserting children into {table}: {source}")]
    Children {
        table: String,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct LoaderConfig {
    pub parent_batch_size: usize,
    pub child_batch_size: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            parent_batch_size: DEFAULT_PARENT_BATCH_SIZE,
            child_batch_size: DEFAULT_CHILD_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    InvalidParent,
    MissingDetailKey,
    UnresolvedChild,
    DuplicateChild,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataQualityWarning {
    pub kind: WarningKind,
    pub parent: ParentKey,
    pub detail_key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoadReport {
    pub source_rows: usize,
    pub parents_upserted: u64,
    pub children_upserted: u64,
    pub invalid_rows: usize,
    pub unresolved: usize,
    pub duplicate_rows: usize,
    pub coerced_fields: usize,
    pub warnings: Vec<DataQualityWarning>,
}

impl LoadReport {
    /// Source rows that did not make it into the child table.
    pub fn dropped_rows(&self) -> usize {
        self.invalid_rows + self.unresolved
    }

    pub fn warning_count(&self) -> usize {
        self.warnings.len()
    }

    pub fn merge(&mut self, other: LoadReport) {
        self.source_rows += other.source_rows;
        self.parents_upserted += other.parents_upserted;
        self.children_upserted += other.children_upserted;
        self.invalid_rows += other.invalid_rows;
        self.unresolved += other.unresolved;
        self.duplicate_rows += other.duplicate_rows;
        self.coerced_fields += other.coerced_fields;
        self.warnings.extend(other.warnings);
    }
}

#[derive(Clone)]
pub struct Loader {
    store: Arc<dyn DestinationStore>,
    config: LoaderConfig,
}

impl Loader {
    pub fn new(store: Arc<dyn DestinationStore>, config: LoaderConfig) -> Self {
        Self {
            store,
            config: LoaderConfig {
                parent_batch_size: config.parent_batch_size.max(1),
                child_batch_size: config.child_batch_size.max(1),
            },
        }
    }

    pub fn config(&self) -> LoaderConfig {
        self.config
    }

    /// Upsert parents, read back their ids, then upsert the children that
    /// resolve. Children without a committed parent are dropped with a
    /// warning; they never fail the load.
    pub async fn load_parent_then_child(
        &self,
        target: &DestinationTarget,
        rows: &[SourceRow],
    ) -> Result<LoadReport, LoadError> {
        if !target.is_valid() {
            return Err(LoadError::InvalidTarget(target.clone()));
        }

        let mut report = LoadReport {
            source_rows: rows.len(),
            ..LoadReport::default()
        };
        let mut parents: BTreeMap<ParentKey, Option<String>> = BTreeMap::new();
        let mut children: BTreeMap<(ParentKey, String), QueryMetrics> = BTreeMap::new();

        for row in rows {
            let key = row.parent_key();
            if !key.is_valid() {
                report.invalid_rows += 1;
                report.warnings.push(DataQualityWarning {
                    kind: WarningKind::InvalidParent,
                    parent: key,
                    detail_key: Some(row.detail_key.clone()),
                });
                continue;
            }
            let detail_key = row.detail_key.trim();
            if detail_key.is_empty() {
                report.invalid_rows += 1;
                report.warnings.push(DataQualityWarning {
                    kind: WarningKind::MissingDetailKey,
                    parent: key,
                    detail_key: None,
                });
                continue;
            }

            let name = parents.entry(key.clone()).or_default();
            if row.entity_name.is_some() {
                name.clone_from(&row.entity_name);
            }

            let (metrics, coerced) = QueryMetrics::from_raw(&row.metrics);
            report.coerced_fields += coerced;
            if children
                .insert((key.clone(), detail_key.to_string()), metrics)
                .is_some()
            {
                report.duplicate_rows += 1;
                report.warnings.push(DataQualityWarning {
                    kind: WarningKind::DuplicateChild,
                    parent: key,
                    detail_key: Some(detail_key.to_string()),
                });
            }
        }

        let parent_rows: Vec<ParentUpsert> = parents
            .into_iter()
            .map(|(key, entity_name)| ParentUpsert { key, entity_name })
            .collect();
        for chunk in parent_rows.chunks(self.config.parent_batch_size) {
            report.parents_upserted += self
                .store
                .upsert_parents(target, chunk)
                .await
                .map_err(|source| LoadError::Parents {
                    table: target.parent_table.clone(),
                    source,
                })?;
        }

        let mut lookup = std::collections::HashMap::with_capacity(parent_rows.len());
        let keys: Vec<ParentKey> = parent_rows.into_iter().map(|p| p.key).collect();
        for chunk in keys.chunks(self.config.parent_batch_size) {
            let ids = self
                .store
                .parent_ids(target, chunk)
                .await
                .map_err(|source| LoadError::Lookup {
                    table: target.parent_table.clone(),
                    source,
                })?;
            lookup.extend(ids);
        }

        let mut resolved = Vec::with_capacity(children.len());
        for ((parent, detail_key), metrics) in children {
            match lookup.get(&parent) {
                Some(&parent_id) => resolved.push(ChildUpsert {
                    parent_id,
                    detail_key,
                    metrics,
                }),
                None => {
                    report.unresolved += 1;
                    report.warnings.push(DataQualityWarning {
                        kind: WarningKind::UnresolvedChild,
                        parent,
                        detail_key: Some(detail_key),
                    });
                }
            }
        }
        if report.unresolved > 0 {
            warn!(
                table = %target.child_table,
                unresolved = report.unresolved,
                "dropped child rows without a committed parent"
            );
        }

        for chunk in resolved.chunks(self.config.child_batch_size) {
            report.children_upserted += self
                .store
                .upsert_children(target, chunk)
                .await
                .map_err(|source| LoadError::Children {
                    table: target.child_table.clone(),
                    source,
                })?;
        }

        debug!(
            parents = report.parents_upserted,
            children = report.children_upserted,
            dropped = report.dropped_rows(),
            "load finished"
        );
        Ok(report)
    }
}
