//! Axum JSON read API plus manual reconcile/sweep triggers.

use std::sync::Arc;

use aqi_core::StoredStationRow;
use aqi_sync::{horizon_from_days, AirQualityService, SchedulerStatus, SyncError};
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "aqi-web";

const DEFAULT_PAGE_LIMIT: usize = 100;
const MAX_PAGE_LIMIT: usize = 1000;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<AirQualityService>,
}

impl AppState {
    pub fn new(service: Arc<AirQualityService>) -> Self {
        Self { service }
    }
}

#[derive(Debug, Deserialize, Default)]
struct StationsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct SweepQuery {
    days: Option<i64>,
}

#[derive(Debug, Serialize)]
struct StatusBody {
    row_count: u64,
    last_refresh: Option<DateTime<Utc>>,
    regions: Vec<String>,
    sources: Vec<String>,
    scheduler: SchedulerStatus,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stations", get(stations_handler))
        .route("/stations/region/{region}", get(region_stations_handler))
        .route("/stations/{station_id}", get(station_handler))
        .route("/status", get(status_handler))
        .route("/reconcile/{region}", post(reconcile_handler))
        .route("/sweep", post(sweep_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(service: Arc<AirQualityService>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "query api listening");
    axum::serve(listener, app(AppState::new(service)))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.service.store().count_rows().await {
        Ok(rows) => Json(json!({"status": "ok", "rows": rows})).into_response(),
        Err(err) => {
            warn!(error = %err, "health check could not reach storage");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"status": "degraded", "error": err.to_string()})),
            )
                .into_response()
        }
    }
}

async fn stations_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StationsQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT).min(MAX_PAGE_LIMIT);
    rows_response(state.service.store().latest_rows(Some(limit)).await)
}

async fn region_stations_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(region): AxumPath<String>,
) -> Response {
    let Some(region) = state.service.regions().get(&region) else {
        return not_found(format!("unknown region {region}"));
    };
    rows_response(state.service.store().rows_for_region(&region.name).await)
}

async fn station_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(station_id): AxumPath<i64>,
) -> Response {
    match state.service.store().row_for_station(station_id).await {
        Ok(Some(row)) => Json(row).into_response(),
        Ok(None) => not_found(format!("station {station_id} not found")),
        Err(err) => storage_error(err),
    }
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    let store = state.service.store();
    let (row_count, last_refresh) = match (store.count_rows().await, store.last_refresh().await) {
        (Ok(count), Ok(last)) => (count, last),
        (Err(err), _) | (_, Err(err)) => return storage_error(err),
    };
    Json(StatusBody {
        row_count,
        last_refresh,
        regions: state
            .service
            .regions()
            .regions
            .iter()
            .map(|r| r.name.clone())
            .collect(),
        sources: state.service.sources().source_ids(),
        scheduler: state.service.status().await,
    })
    .into_response()
}

async fn reconcile_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(region): AxumPath<String>,
) -> Response {
    match state.service.reconcile(&region).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => sync_error(err),
    }
}

async fn sweep_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SweepQuery>,
) -> Response {
    let horizon = match query.days.map(horizon_from_days).transpose() {
        Ok(days) => days.unwrap_or_else(|| state.service.retention()),
        Err(err) => return sync_error(err),
    };
    match state.service.sweep(horizon).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => sync_error(err),
    }
}

fn rows_response(result: Result<Vec<StoredStationRow>, aqi_storage::StoreError>) -> Response {
    match result {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => storage_error(err),
    }
}

fn error_body(status: StatusCode, message: String) -> Response {
    (status, Json(json!({"error": message}))).into_response()
}

fn not_found(message: String) -> Response {
    error_body(StatusCode::NOT_FOUND, message)
}

fn storage_error(err: aqi_storage::StoreError) -> Response {
    error!(error = %err, "storage read failed");
    error_body(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
}

fn sync_error(err: SyncError) -> Response {
    let status = match &err {
        SyncError::TransientFetch { .. } => StatusCode::BAD_GATEWAY,
        SyncError::Persistence { .. } | SyncError::Verification { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        SyncError::UnknownRegion(_) => StatusCode::NOT_FOUND,
        SyncError::Config(_) => StatusCode::BAD_REQUEST,
        SyncError::InvariantViolation(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!(error = %err, "manual trigger failed");
    }
    error_body(status, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use aqi_adapters::{FixtureSource, RawStationPayload, SourceRegistry};
    use aqi_core::{FixedClock, StationReading};
    use aqi_storage::MemoryStationStore;
    use aqi_sync::RegionRegistry;
    use axum::body::Body;
    use chrono::TimeZone;
    use http_body_util::BodyExt;
    use serde_json::Value as JsonValue;
    use tower::ServiceExt;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap()
    }

    fn state_with(store: Arc<MemoryStationStore>, sources: SourceRegistry) -> AppState {
        AppState::new(Arc::new(AirQualityService::new(
            store,
            sources,
            Arc::new(FixedClock::new(now())),
            RegionRegistry::default(),
        )))
    }

    fn fixture_sources() -> SourceRegistry {
        let payloads = vec![
            RawStationPayload::bounds_result(
                "waqi",
                json!({"uid": 6132, "lat": 52.51, "lon": 13.41, "aqi": "38", "station": {"name": "Mitte"}}),
            ),
            RawStationPayload::bounds_result(
                "waqi",
                json!({"uid": 6136, "lat": 52.48, "lon": 13.43, "aqi": "-"}),
            ),
        ];
        SourceRegistry::new().with_source(Arc::new(FixtureSource::new("waqi", payloads)))
    }

    async fn call(app: Router, method: &str, uri: &str) -> (StatusCode, JsonValue) {
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn health_reports_row_count() {
        let store = Arc::new(MemoryStationStore::new());
        store.seed_row(StationReading::bare(1, 52.5, 13.4), now());
        let (status, body) = call(app(state_with(store, SourceRegistry::new())), "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["rows"], 1);
    }

    #[tokio::test]
    async fn manual_reconcile_then_read_back() {
        let store = Arc::new(MemoryStationStore::new());
        let app = app(state_with(store, fixture_sources()));

        let (status, body) = call(app.clone(), "POST", "/reconcile/Berlin").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"updated": 0, "inserted": 2}));

        let (status, body) = call(app.clone(), "GET", "/stations/6132").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["station_id"], 6132);
        assert_eq!(body["aqi"], 38);
        assert_eq!(body["region"], "Berlin");

        let (_, body) = call(app.clone(), "GET", "/stations/6136").await;
        assert!(body["aqi"].is_null());

        let (_, body) = call(app.clone(), "GET", "/stations/region/berlin").await;
        assert_eq!(body.as_array().unwrap().len(), 2);

        let (_, body) = call(app.clone(), "GET", "/stations?limit=1").await;
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (_, body) = call(app, "GET", "/status").await;
        assert_eq!(body["row_count"], 2);
        assert_eq!(body["scheduler"]["cycles"]["Berlin"]["outcome"]["inserted"], 2);
    }

    #[tokio::test]
    async fn trigger_errors_map_to_status_codes() {
        let store = Arc::new(MemoryStationStore::new());
        let failing = SourceRegistry::new()
            .with_source(Arc::new(FixtureSource::failing("waqi", "connection reset")));
        let app = app(state_with(store.clone(), failing));

        let (status, body) = call(app.clone(), "POST", "/reconcile/Berlin").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body["error"].as_str().unwrap().contains("connection reset"));

        let (status, _) = call(app.clone(), "POST", "/reconcile/Atlantis").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let ok_app = super::app(state_with(store.clone(), fixture_sources()));
        store.fail_after_writes(1);
        let (status, _) = call(ok_app, "POST", "/reconcile/Berlin").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(store.snapshot().len(), 0);
    }

    #[tokio::test]
    async fn sweep_honours_days_parameter() {
        let store = Arc::new(MemoryStationStore::new());
        store.seed_row(StationReading::bare(1, 52.5, 13.4), now() - chrono::Duration::days(3));
        store.seed_row(StationReading::bare(2, 52.5, 13.4), now() - chrono::Duration::days(10));
        let app = app(state_with(store.clone(), SourceRegistry::new()));

        let (status, body) = call(app.clone(), "POST", "/sweep").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deleted"], 1);

        let (_, body) = call(app, "POST", "/sweep?days=2").await;
        assert_eq!(body["deleted"], 1);
        assert!(store.snapshot().is_empty());
    }

    #[tokio::test]
    async fn sweep_rejects_out_of_range_days_and_tolerates_huge_horizons() {
        let store = Arc::new(MemoryStationStore::new());
        store.seed_row(StationReading::bare(1, 52.5, 13.4), now() - chrono::Duration::days(30));
        let app = app(state_with(store.clone(), SourceRegistry::new()));

        let (status, body) = call(app.clone(), "POST", "/sweep?days=9223372036854775807").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("out of range"));

        let (status, body) = call(app, "POST", "/sweep?days=1000000000").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deleted"], 0);
        assert_eq!(store.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn missing_station_is_not_found() {
        let app = app(state_with(Arc::new(MemoryStationStore::new()), SourceRegistry::new()));
        let (status, body) = call(app, "GET", "/stations/404").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "station 404 not found");
    }
}
