//! JSON over HTTP for the browser front end.
//!
//! Routes and field names follow what the front end already calls:
//! `/api/buildings`, `/api/buildings/count`, `/api/scan`, `/api/scan/logs`.

use std::future::Future;
use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::ledger::{Applied, LedgerError, OccupancyLedger};
use crate::model::{Building, EntryExitEvent};

pub type SharedLedger = Arc<OccupancyLedger>;

pub fn router(ledger: SharedLedger) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/buildings", get(list_buildings))
        .route("/api/buildings/count", post(manual_count))
        .route("/api/buildings/{id}", get(get_building))
        .route("/api/scan", post(scan))
        .route("/api/scan/logs", get(list_logs))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(ledger)
}

/// Serve until `shutdown` resolves; in-flight requests finish first.
pub async fn serve(
    listener: TcpListener,
    ledger: SharedLedger,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(listener, router(ledger))
        .with_graceful_shutdown(shutdown)
        .await
}

impl IntoResponse for LedgerError {
    fn into_response(self) -> Response {
        let status = match &self {
            LedgerError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
            LedgerError::Conflict(_) => StatusCode::CONFLICT,
            LedgerError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

// ── Payloads ─────────────────────────────────────────────

/// Tags arrive as JSON numbers from the QR payload or as strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TagId {
    Text(String),
    Number(u64),
}

impl TagId {
    fn into_string(self) -> String {
        match self {
            TagId::Text(s) => s,
            TagId::Number(n) => n.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ScanRequest {
    pub building_id: Option<String>,
    pub direction: Option<String>,
    pub tag_id: Option<TagId>,
}

#[derive(Debug, Deserialize)]
pub struct CountRequest {
    pub building_id: Option<String>,
    pub direction: Option<String>,
    pub count: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct EventResponse {
    pub message: String,
    pub building: Building,
    pub log: EntryExitEvent,
}

fn required<T>(value: Option<T>, field: &str) -> Result<T, LedgerError> {
    value.ok_or_else(|| LedgerError::InvalidArgument(format!("{field} is required")))
}

fn bad_body(rejection: JsonRejection) -> LedgerError {
    LedgerError::InvalidArgument(rejection.body_text())
}

// ── Handlers ─────────────────────────────────────────────

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "OK", "message": "Server is running" }))
}

async fn list_buildings(State(ledger): State<SharedLedger>) -> Result<Json<Vec<Building>>, LedgerError> {
    Ok(Json(ledger.list_buildings().await?))
}

async fn get_building(
    State(ledger): State<SharedLedger>,
    Path(id): Path<String>,
) -> Result<Json<Building>, LedgerError> {
    Ok(Json(ledger.get_building(&id).await?))
}

async fn scan(
    State(ledger): State<SharedLedger>,
    payload: Result<Json<ScanRequest>, JsonRejection>,
) -> Result<Json<EventResponse>, LedgerError> {
    let Json(req) = payload.map_err(bad_body)?;
    let building_id = required(req.building_id, "building_id")?;
    let direction = required(req.direction, "direction")?;
    let tag_id = required(req.tag_id, "tag_id")?.into_string();

    let Applied { building, event } = ledger.scan(&building_id, &direction, tag_id.clone()).await?;
    Ok(Json(EventResponse {
        message: format!("Successfully processed {} scan for person {tag_id}", event.direction),
        building,
        log: event,
    }))
}

async fn manual_count(
    State(ledger): State<SharedLedger>,
    payload: Result<Json<CountRequest>, JsonRejection>,
) -> Result<Json<EventResponse>, LedgerError> {
    let Json(req) = payload.map_err(bad_body)?;
    let building_id = required(req.building_id, "building_id")?;
    let direction = required(req.direction, "direction")?;
    let count = required(req.count, "count")?;

    let Applied { building, event } = ledger.apply_event(&building_id, &direction, count, None).await?;
    Ok(Json(EventResponse {
        message: format!(
            "Successfully processed {} for {} people at {}",
            event.direction, event.count, building.id
        ),
        building,
        log: event,
    }))
}

async fn list_logs(
    State(ledger): State<SharedLedger>,
    query: Result<Query<LogsQuery>, QueryRejection>,
) -> Result<Json<Vec<EntryExitEvent>>, LedgerError> {
    let Query(q) = query.map_err(|r| LedgerError::InvalidArgument(r.body_text()))?;
    Ok(Json(ledger.list_events(q.limit).await?))
}
