// Family Planning Pipeline - Web Server
// REST API with Axum: trigger runs, poll status, query the cleaned summary

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use fp_pipeline::{
    db, logging, parse_period, spawn_run, CleanedSummary, Method, PipelineConfig, RunHandle,
    RunRecord, RunStatus, SummaryFilter,
};

const ADDR_ENV: &str = "FP_SERVER_ADDR";
const DEFAULT_ADDR: &str = "0.0.0.0:3000";

/// Shared application state
#[derive(Clone)]
struct AppState {
    config: Arc<PipelineConfig>,
    db: Arc<Mutex<Connection>>,
    /// Most recently triggered run
    current_run: Arc<Mutex<Option<RunHandle>>>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    let body: ApiResponse<()> = ApiResponse {
        success: false,
        data: None,
        error: Some(message.into()),
    };
    (status, Json(body)).into_response()
}

/// Summary row (period rendered as YYYY-MM)
#[derive(Serialize)]
struct SummaryResponse {
    analytic: String,
    method: Method,
    period: String,
    org_unit: String,
    value: f64,
}

impl From<CleanedSummary> for SummaryResponse {
    fn from(row: CleanedSummary) -> Self {
        Self {
            analytic: row.analytic,
            method: row.method,
            period: row.period.format("%Y-%m").to_string(),
            org_unit: row.org_unit,
            value: row.value,
        }
    }
}

#[derive(Serialize)]
struct TriggerResponse {
    run_id: String,
}

#[derive(Serialize)]
struct StatusResponse {
    run_id: String,
    #[serde(flatten)]
    status: RunStatus,
}

/// Raw query string; parsed into a SummaryFilter
#[derive(Debug, Default, Deserialize)]
struct SummaryQuery {
    analytic: Option<String>,
    method: Option<String>,
    org_unit: Option<String>,
    start: Option<String>,
    end: Option<String>,
}

impl SummaryQuery {
    fn into_filter(self) -> Result<SummaryFilter, String> {
        let method = match self.method.as_deref().filter(|m| !m.is_empty()) {
            Some(m) => Some(Method::parse(m).ok_or_else(|| format!("unknown method '{}'", m))?),
            None => None,
        };
        let period = |raw: Option<String>| -> Result<_, String> {
            match raw.filter(|p| !p.is_empty()) {
                Some(p) => parse_period(&p).map(Some).map_err(|e| e.to_string()),
                None => Ok(None),
            }
        };

        Ok(SummaryFilter {
            analytic: self.analytic.filter(|a| !a.is_empty()),
            method,
            org_unit: self.org_unit.filter(|o| !o.is_empty()),
            start: period(self.start)?,
            end: period(self.end)?,
        })
    }
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// POST /api/pipeline - Start a run in the background
async fn trigger_pipeline(State(state): State<AppState>) -> Response {
    let Ok(mut current) = state.current_run.lock() else {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "run registry unavailable");
    };

    if let Some(handle) = current.as_ref() {
        if !handle.is_finished() {
            return error_response(
                StatusCode::CONFLICT,
                format!("run {} is still in progress", handle.run_id()),
            );
        }
    }

    match spawn_run(state.config.as_ref().clone()) {
        Ok(handle) => {
            let run_id = handle.run_id().to_string();
            *current = Some(handle);
            (StatusCode::ACCEPTED, Json(ApiResponse::ok(TriggerResponse { run_id }))).into_response()
        }
        Err(e) => {
            error!("Error starting pipeline run: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// GET /api/pipeline/status - Status of the latest triggered run
async fn pipeline_status(State(state): State<AppState>) -> Response {
    let Ok(current) = state.current_run.lock() else {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "run registry unavailable");
    };

    match current.as_ref() {
        Some(handle) => {
            let response = StatusResponse {
                run_id: handle.run_id().to_string(),
                status: handle.status(),
            };
            (StatusCode::OK, Json(ApiResponse::ok(response))).into_response()
        }
        None => error_response(StatusCode::NOT_FOUND, "no run has been triggered"),
    }
}

fn query_rows(state: &AppState, filter: &SummaryFilter) -> Response {
    let Ok(conn) = state.db.lock() else {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "database unavailable");
    };

    match db::query_summary(&conn, &state.config.database.summary_table, filter) {
        Ok(rows) => {
            let response: Vec<SummaryResponse> = rows.into_iter().map(|row| row.into()).collect();
            (StatusCode::OK, Json(ApiResponse::ok(response))).into_response()
        }
        Err(e) => {
            error!("Error querying summary: {:#}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "summary query failed")
        }
    }
}

/// GET /api/summary?analytic=&method=&org_unit=&start=&end=
async fn get_summary(State(state): State<AppState>, Query(query): Query<SummaryQuery>) -> Response {
    match query.into_filter() {
        Ok(filter) => query_rows(&state, &filter),
        Err(message) => error_response(StatusCode::BAD_REQUEST, message),
    }
}

/// GET /api/summary/:org_unit - All rows for one county (or the national label)
async fn get_org_unit_summary(
    State(state): State<AppState>,
    Path(org_unit): Path<String>,
    Query(query): Query<SummaryQuery>,
) -> Response {
    // Decode URL-encoded county name
    let decoded = urlencoding::decode(&org_unit)
        .unwrap_or_else(|_| org_unit.clone().into())
        .into_owned();

    match query.into_filter() {
        Ok(mut filter) => {
            filter.org_unit = Some(decoded);
            query_rows(&state, &filter)
        }
        Err(message) => error_response(StatusCode::BAD_REQUEST, message),
    }
}

#[derive(Debug, Deserialize)]
struct RunsQuery {
    limit: Option<usize>,
}

/// GET /api/runs - Run history
async fn get_runs(State(state): State<AppState>, Query(query): Query<RunsQuery>) -> Response {
    let Ok(conn) = state.db.lock() else {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "database unavailable");
    };

    match db::list_runs(&conn, query.limit.unwrap_or(20)) {
        Ok(runs) => (StatusCode::OK, Json(ApiResponse::<Vec<RunRecord>>::ok(runs))).into_response(),
        Err(e) => {
            error!("Error listing runs: {:#}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "run history unavailable")
        }
    }
}

// ============================================================================
// Main Server
// ============================================================================

fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/pipeline", post(trigger_pipeline))
        .route("/pipeline/status", get(pipeline_status))
        .route("/summary", get(get_summary))
        .route("/summary/:org_unit", get(get_org_unit_summary))
        .route("/runs", get(get_runs))
        .with_state(state);

    Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive())
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_logging(false);

    let config = PipelineConfig::load(None).context("Failed to load config")?;
    let conn = fp_pipeline::open_database(&config)
        .with_context(|| format!("Failed to open database {}", config.database.path))?;
    info!(path = %config.database.path, "database opened");

    let state = AppState {
        config: Arc::new(config),
        db: Arc::new(Mutex::new(conn)),
        current_run: Arc::new(Mutex::new(None)),
    };

    let app = build_router(state);

    let addr = std::env::var(ADDR_ENV).unwrap_or_else(|_| DEFAULT_ADDR.to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("🚀 Server running on http://{}", addr);
    info!("   API: http://{}/api/summary", addr);

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
