//! JSON operational API over the refresh scheduler and monitor.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use sqp_storage::StoreError;
use sqp_sync::{
    ErrorTracker, HealthStatus, Monitor, RefreshScheduler, SchedulerError, TrackerError,
};
use tokio::net::TcpListener;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "sqp-web";

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 500;
const DEFAULT_DAYS_TO_KEEP: u32 = 30;

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<RefreshScheduler>,
    pub monitor: Arc<Monitor>,
    pub tracker: Arc<ErrorTracker>,
}

impl AppState {
    pub fn new(scheduler: Arc<RefreshScheduler>, monitor: Arc<Monitor>) -> Self {
        Self {
            tracker: scheduler.tracker(),
            scheduler,
            monitor,
        }
    }
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct CleanupQuery {
    days: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ResolveBody {
    resolution: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/state", get(state_handler))
        .route("/history", get(history_handler))
        .route("/alerts", get(alerts_handler))
        .route("/metrics", get(metrics_handler))
        .route("/errors", get(errors_handler))
        .route("/errors/{id}/resolve", post(resolve_error_handler))
        .route("/cycle", post(cycle_handler))
        .route("/cleanup", post(cleanup_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving operational API");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.monitor.health().await {
        Ok(report) => {
            let status = if report.status == HealthStatus::Unhealthy {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::OK
            };
            (status, Json(report)).into_response()
        }
        Err(err) => store_error(err),
    }
}

async fn state_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.monitor.state().await {
        Ok(pipeline) => Json(pipeline).into_response(),
        Err(err) => store_error(err),
    }
}

async fn history_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    match state.monitor.history(limit, query.offset.unwrap_or(0)).await {
        Ok(runs) => Json(runs).into_response(),
        Err(err) => store_error(err),
    }
}

async fn alerts_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.monitor.check_alerts().await {
        Ok(alerts) => Json(alerts).into_response(),
        Err(err) => store_error(err),
    }
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.monitor.export_metrics().await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(err) => store_error(err),
    }
}

async fn errors_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.tracker.export().await).into_response()
}

async fn resolve_error_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<Uuid>,
    Json(body): Json<ResolveBody>,
) -> Response {
    match state.tracker.resolve_error(id, body.resolution).await {
        Ok(record) => Json(record).into_response(),
        Err(err @ TrackerError::NotFound(_)) => error_json(StatusCode::NOT_FOUND, err),
        Err(err) => error_json(StatusCode::CONFLICT, err),
    }
}

async fn cycle_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.scheduler.run_cycle().await {
        Ok(report) => Json(json!({
            "summary": report.summary(),
            "report": report,
        }))
        .into_response(),
        Err(err @ (SchedulerError::Configuration(_) | SchedulerError::Parameters { .. })) => {
            error_json(StatusCode::UNPROCESSABLE_ENTITY, err)
        }
        Err(err) => error_json(StatusCode::INTERNAL_SERVER_ERROR, err),
    }
}

async fn cleanup_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CleanupQuery>,
) -> Response {
    let days = query.days.unwrap_or(DEFAULT_DAYS_TO_KEEP);
    match state.monitor.cleanup_old_data(days).await {
        Ok(report) => Json(report).into_response(),
        Err(err) => store_error(err),
    }
}

fn store_error(err: StoreError) -> Response {
    error_json(StatusCode::INTERNAL_SERVER_ERROR, err)
}

fn error_json(status: StatusCode, err: impl std::fmt::Display) -> Response {
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use serde_json::Value as JsonValue;
    use sqp_core::{NewRefreshConfig, SourceRow, TableId};
    use sqp_extract::{Extractor, FixtureWarehouse};
    use sqp_storage::{MemoryStore, RefreshStore};
    use sqp_sync::{HealthThresholds, SchedulerConfig};
    use tower::ServiceExt;

    async fn state() -> AppState {
        let store = Arc::new(MemoryStore::default());
        store
            .upsert_config(&NewRefreshConfig {
                table: TableId::new("public", "search_query_reports"),
                enabled: true,
                frequency_hours: 24,
                priority: 10,
                custom_parameters: JsonValue::Null,
            })
            .await
            .unwrap();
        let rows: Vec<SourceRow> = serde_json::from_value(json!([{
            "entity_id": "acct-1",
            "period_start": "2026-03-01",
            "period_end": "2026-03-07",
            "detail_key": "hiking boots",
            "observed_at": "2026-03-08T02:00:00Z",
            "metrics": { "impressions": 120, "clicks": 9 }
        }]))
        .unwrap();
        let tracker = Arc::new(ErrorTracker::default());
        let scheduler = Arc::new(RefreshScheduler::new(
            store.clone(),
            store.clone(),
            Extractor::new(Arc::new(FixtureWarehouse::from_rows("test", rows))),
            tracker.clone(),
            SchedulerConfig::default(),
        ));
        let monitor = Arc::new(Monitor::new(
            store,
            tracker,
            scheduler.cycle_handle(),
            HealthThresholds::default(),
        ));
        AppState::new(scheduler, monitor)
    }

    async fn call(app: Router, method: &str, uri: &str) -> (StatusCode, JsonValue) {
        let resp = app
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            "application/json"
        );
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn cycle_then_history_and_state() {
        let app = app(state().await);

        let (status, body) = call(app.clone(), "POST", "/cycle").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["summary"]["succeeded"], 1);

        let (status, runs) = call(app.clone(), "GET", "/history?limit=5").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(runs.as_array().unwrap().len(), 1);
        assert_eq!(runs[0]["status"], "success");

        let (_, pipeline) = call(app.clone(), "GET", "/state").await;
        assert_eq!(pipeline["cycle"]["status"], "completed");
        assert_eq!(pipeline["tables"][0]["due"], false);

        let (status, health) = call(app, "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(health["status"], "healthy");
    }

    #[tokio::test]
    async fn read_only_endpoints_answer_json() {
        let app = app(state().await);
        for uri in ["/alerts", "/metrics", "/errors"] {
            let (status, _) = call(app.clone(), "GET", uri).await;
            assert_eq!(status, StatusCode::OK, "{uri}");
        }
        let (status, report) = call(app.clone(), "POST", "/cleanup?days=7").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["runs_purged"], 0);
    }

    #[tokio::test]
    async fn cleanup_accepts_the_largest_retention() {
        let app = app(state().await);
        call(app.clone(), "POST", "/cycle").await;

        let (status, report) = call(app.clone(), "POST", "/cleanup?days=4294967295").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["runs_purged"], 0);

        let (_, runs) = call(app, "GET", "/history").await;
        assert_eq!(runs.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn resolving_an_unknown_error_is_not_found() {
        let app = app(state().await);
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/errors/{}/resolve", Uuid::new_v4()))
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"resolution":"rotated credentials"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
