//! Operator HTTP API.
//!
//! Ordinary JSON CRUD over the device registry plus the manual triggers
//! (sweep, single-device sync, convergence) and diagnostics (buffer
//! preview, protocol log, punch queries). Served on its own listener,
//! separate from the terminal-facing push endpoint.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::context::AppContext;
use crate::convergence;
use crate::storage::{DatabaseError, Device, GoldenUser, ProtocolLogEntry, Punch, PunchFilter};
use crate::sweep::{self, SweepCommand, SyncError};

/// API error mapped onto a status code and a JSON `{"error": ...}` body.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn unavailable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<DatabaseError> for ApiError {
    fn from(e: DatabaseError) -> Self {
        let status = match &e {
            DatabaseError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl From<SyncError> for ApiError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::Database(db) => db.into(),
            SyncError::Terminal(t) => Self {
                status: StatusCode::BAD_GATEWAY,
                message: t.to_string(),
            },
        }
    }
}

pub fn router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/api/devices", get(list_devices).post(create_device))
        .route(
            "/api/devices/:serial",
            get(get_device).put(update_device).delete(delete_device),
        )
        .route("/api/devices/:serial/enabled", post(set_enabled))
        .route("/api/devices/:serial/preview", get(preview_device))
        .route("/api/sync/run", post(sync_all))
        .route("/api/sync/devices/:serial", post(sync_device))
        .route("/api/convergence/run", post(run_convergence))
        .route("/api/punches", get(list_punches).delete(purge_punches))
        .route("/api/users", get(list_users))
        .route("/api/users/:user_id", delete(delete_user))
        .route("/api/protocol-log", get(protocol_log))
        .with_state(ctx)
}

// =============================================================================
// Devices
// =============================================================================

#[derive(Debug, Deserialize)]
struct CreateDevice {
    serial_number: String,
    name: String,
    #[serde(default)]
    address: String,
    port: Option<i64>,
    enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct UpdateDevice {
    name: Option<String>,
    address: Option<String>,
    port: Option<i64>,
    enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct SetEnabled {
    enabled: bool,
}

async fn list_devices(
    State(ctx): State<Arc<AppContext>>,
) -> Result<Json<Vec<Device>>, ApiError> {
    Ok(Json(ctx.db.list_devices().await?))
}

async fn create_device(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<CreateDevice>,
) -> Result<(StatusCode, Json<Device>), ApiError> {
    let device = ctx
        .db
        .create_device(
            &body.serial_number,
            &body.name,
            &body.address,
            body.port
                .unwrap_or(i64::from(timeclock_wire::frames::DEFAULT_CONTROL_PORT)),
            body.enabled.unwrap_or(true),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(device)))
}

async fn get_device(
    State(ctx): State<Arc<AppContext>>,
    Path(serial): Path<String>,
) -> Result<Json<Device>, ApiError> {
    Ok(Json(ctx.db.get_device(&serial).await?))
}

async fn update_device(
    State(ctx): State<Arc<AppContext>>,
    Path(serial): Path<String>,
    Json(body): Json<UpdateDevice>,
) -> Result<Json<Device>, ApiError> {
    // Ensure 404 for unknown serials rather than a silent no-op update.
    ctx.db.get_device(&serial).await?;
    let device = ctx
        .db
        .update_device(
            &serial,
            body.name.as_deref(),
            body.address.as_deref(),
            body.port,
            body.enabled,
        )
        .await?;
    Ok(Json(device))
}

async fn delete_device(
    State(ctx): State<Arc<AppContext>>,
    Path(serial): Path<String>,
) -> Result<StatusCode, ApiError> {
    ctx.db.delete_device(&serial).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_enabled(
    State(ctx): State<Arc<AppContext>>,
    Path(serial): Path<String>,
    Json(body): Json<SetEnabled>,
) -> Result<Json<Device>, ApiError> {
    ctx.db.get_device(&serial).await?;
    ctx.db.set_device_enabled(&serial, body.enabled).await?;
    Ok(Json(ctx.db.get_device(&serial).await?))
}

// =============================================================================
// Sync triggers & diagnostics
// =============================================================================

#[derive(Debug, Deserialize)]
struct PreviewQuery {
    limit: Option<usize>,
}

async fn preview_device(
    State(ctx): State<Arc<AppContext>>,
    Path(serial): Path<String>,
    Query(query): Query<PreviewQuery>,
) -> Result<Json<Vec<sweep::PreviewPunch>>, ApiError> {
    let sample = sweep::preview_device(&ctx, &serial, query.limit.unwrap_or(25)).await?;
    Ok(Json(sample))
}

async fn sync_all(State(ctx): State<Arc<AppContext>>) -> Result<Json<serde_json::Value>, ApiError> {
    ctx.sweep_tx
        .send(SweepCommand::All)
        .await
        .map_err(|_| ApiError::unavailable("sweep scheduler is not running"))?;
    Ok(Json(json!({ "queued": true })))
}

async fn sync_device(
    State(ctx): State<Arc<AppContext>>,
    Path(serial): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    ctx.db.get_device(&serial).await?;
    ctx.sweep_tx
        .send(SweepCommand::Device(serial))
        .await
        .map_err(|_| ApiError::unavailable("sweep scheduler is not running"))?;
    Ok(Json(json!({ "queued": true })))
}

async fn run_convergence(
    State(ctx): State<Arc<AppContext>>,
) -> Json<convergence::ConvergenceReport> {
    Json(convergence::run(&ctx).await)
}

// =============================================================================
// Punches
// =============================================================================

#[derive(Debug, Deserialize)]
struct PunchQuery {
    employee_id: Option<String>,
    device: Option<String>,
    from: Option<i64>,
    to: Option<i64>,
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct PurgeQuery {
    before: Option<i64>,
}

async fn list_punches(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<PunchQuery>,
) -> Result<Json<Vec<Punch>>, ApiError> {
    let filter = PunchFilter {
        employee_id: query.employee_id,
        device_serial: query.device,
        from: query.from,
        to: query.to,
        limit: query.limit.unwrap_or(0),
    };
    Ok(Json(ctx.db.query_punches(&filter).await?))
}

async fn purge_punches(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<PurgeQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let purged = ctx.db.purge_punches(query.before).await?;
    Ok(Json(json!({ "purged": purged })))
}

// =============================================================================
// Golden record & protocol log
// =============================================================================

#[derive(Debug, Deserialize)]
struct LogQuery {
    serial: Option<String>,
    limit: Option<u32>,
}

async fn list_users(
    State(ctx): State<Arc<AppContext>>,
) -> Result<Json<Vec<GoldenUser>>, ApiError> {
    Ok(Json(ctx.db.list_golden_users().await?))
}

async fn delete_user(
    State(ctx): State<Arc<AppContext>>,
    Path(user_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    ctx.db.delete_golden_user(&user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn protocol_log(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<LogQuery>,
) -> Result<Json<Vec<ProtocolLogEntry>>, ApiError> {
    let entries = ctx
        .db
        .list_protocol_log(query.serial.as_deref(), query.limit.unwrap_or(0))
        .await?;
    Ok(Json(entries))
}
