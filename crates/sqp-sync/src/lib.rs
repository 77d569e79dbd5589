//! Refresh orchestration: table registry, dependency-ordered cycles, the
//! parent/child loader, error tracking and pipeline monitoring.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use sqp_core::{RefreshConfig, RefreshDependency, TableId};
use sqp_storage::RefreshStore;
use tracing::info;

pub mod config;
pub mod errors;
pub mod graph;
pub mod loader;
pub mod monitor;
pub mod scheduler;

pub use config::{RefreshMode, RefreshParams, RefreshRegistry, SyncConfig};
pub use errors::{
    classify, Classification, ErrorSummary, ErrorThreshold, ErrorTracker, HandlerMatch, NewError,
    Outcome, RetryPolicy, ThresholdBreach, TrackerError,
};
pub use graph::{DependencyGraph, GraphError};
pub use loader::{LoadError, LoadReport, Loader, LoaderConfig};
pub use monitor::{
    Alert, AlertKind, CleanupReport, HealthReport, HealthStatus, HealthThresholds,
    MetricsSnapshot, Monitor, PipelineState,
};
pub use scheduler::{
    CycleHandle, CycleReport, CycleState, RefreshScheduler, SchedulerConfig, SchedulerError,
    TableOutcome, TableStatus,
};

pub const CRATE_NAME: &str = "sqp-sync";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SetupReport {
    pub configs_upserted: usize,
    pub configs_removed: Vec<TableId>,
    pub dependencies_added: usize,
    pub dependencies_removed: usize,
}

/// Seed configs and edges from the registry. The resulting graph is
/// validated before anything is written. With `prune`, configs missing from
/// the registry are deleted together with their edges; edges the registry no
/// longer lists are always dropped.
pub async fn apply_registry(
    store: &dyn RefreshStore,
    registry: &RefreshRegistry,
    prune: bool,
) -> Result<SetupReport> {
    let wanted = registry.configs()?;
    let wanted_edges = registry.dependencies()?;
    let wanted_tables: BTreeSet<&TableId> = wanted.iter().map(|c| &c.table).collect();

    let existing = store.list_configs().await.context("listing refresh configs")?;
    let removed: Vec<TableId> = if prune {
        existing
            .iter()
            .filter(|c| !wanted_tables.contains(&c.table))
            .map(|c| c.table.clone())
            .collect()
    } else {
        Vec::new()
    };

    // Validate the graph the store will hold once the registry is applied.
    let now = Utc::now();
    let mut planned: Vec<RefreshConfig> = existing
        .iter()
        .filter(|c| !wanted_tables.contains(&c.table) && !removed.contains(&c.table))
        .cloned()
        .collect();
    planned.extend(wanted.iter().map(|c| RefreshConfig {
        id: 0,
        table: c.table.clone(),
        enabled: c.enabled,
        frequency_hours: c.frequency_hours,
        priority: c.priority,
        last_refresh_at: None,
        next_refresh_at: Some(now),
        custom_parameters: c.custom_parameters.clone(),
    }));
    DependencyGraph::build(&planned, &wanted_edges)?;

    let mut report = SetupReport::default();
    for table in &removed {
        store
            .delete_config(table)
            .await
            .with_context(|| format!("deleting config {table}"))?;
    }
    report.configs_removed = removed;

    for config in &wanted {
        store
            .upsert_config(config)
            .await
            .with_context(|| format!("upserting config {}", config.table))?;
        report.configs_upserted += 1;
    }

    let existing_edges = store
        .list_dependencies()
        .await
        .context("listing dependencies")?;
    for edge in &existing_edges {
        if !wanted_edges.iter().any(|w| same_edge(w, edge)) {
            store
                .remove_dependency(&edge.parent, &edge.dependent)
                .await
                .with_context(|| format!("removing edge {} -> {}", edge.parent, edge.dependent))?;
            report.dependencies_removed += 1;
        }
    }
    for edge in &wanted_edges {
        store
            .add_dependency(edge)
            .await
            .with_context(|| format!("adding edge {} -> {}", edge.parent, edge.dependent))?;
        if !existing_edges.iter().any(|e| e == edge) {
            report.dependencies_added += 1;
        }
    }

    info!(
        configs = report.configs_upserted,
        removed = report.configs_removed.len(),
        edges_added = report.dependencies_added,
        edges_removed = report.dependencies_removed,
        "refresh registry applied"
    );
    Ok(report)
}

fn same_edge(a: &RefreshDependency, b: &RefreshDependency) -> bool {
    a.parent == b.parent && a.dependent == b.dependent
}
