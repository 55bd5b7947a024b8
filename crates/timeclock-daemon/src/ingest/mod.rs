//! Push-protocol ingestion endpoint (`/iclock/*`).
//!
//! Terminals have no retry intelligence beyond "resend if not OK", so this
//! endpoint always answers within its own budget with one of a small fixed
//! set of tokens, never lets an unknown table or malformed body abort a
//! connection, and treats every call as independently idempotent. Registry
//! writes along the way are best-effort: punch ingestion must not be
//! blocked by registry unavailability.

use std::net::IpAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::{ConnectInfo, RawQuery, State};
use axum::routing::get;
use thiserror::Error;
use tracing::{error, info, warn};

use timeclock_core::db::unix_timestamp;
use timeclock_wire::push::{self, QueryParams};
use timeclock_wire::punch_kind_from_code;

use crate::context::AppContext;
use crate::storage::{DatabaseError, Device, HealthSnapshot, NewPunch};

/// Fixed acknowledgement token.
pub const TOKEN_OK: &str = "OK";
/// Fixed error token; the only failure shape terminals understand.
pub const TOKEN_ERROR: &str = "ERROR";

/// The punch-log table name in bulk uploads.
const PUNCH_TABLE: &str = "ATTLOG";

#[derive(Debug, Error)]
enum IngestError {
    #[error("bulk upload without a serial number")]
    MissingSerial,

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Terminal-facing router. Served on its own listener, network-isolated
/// from the operator API; the protocol itself carries no authentication.
pub fn router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/iclock/cdata", get(cdata_get).post(cdata_post))
        .route("/iclock/getrequest", get(getrequest_get))
        .with_state(ctx)
}

async fn cdata_get(
    State(ctx): State<Arc<AppContext>>,
    ConnectInfo(peer): ConnectInfo<std::net::SocketAddr>,
    RawQuery(query): RawQuery,
) -> String {
    handle_heartbeat(&ctx, query.as_deref().unwrap_or(""), Some(peer.ip())).await
}

async fn getrequest_get(
    State(ctx): State<Arc<AppContext>>,
    ConnectInfo(peer): ConnectInfo<std::net::SocketAddr>,
    RawQuery(query): RawQuery,
) -> String {
    handle_heartbeat(&ctx, query.as_deref().unwrap_or(""), Some(peer.ip())).await
}

async fn cdata_post(
    State(ctx): State<Arc<AppContext>>,
    ConnectInfo(peer): ConnectInfo<std::net::SocketAddr>,
    RawQuery(query): RawQuery,
    body: String,
) -> String {
    handle_upload(&ctx, query.as_deref().unwrap_or(""), Some(peer.ip()), &body).await
}

/// Heartbeat / capability handshake.
///
/// Always answers: `OK` for a plain heartbeat, the static options block
/// when the query requests capability negotiation.
pub async fn handle_heartbeat(ctx: &AppContext, raw_query: &str, peer: Option<IpAddr>) -> String {
    let query = QueryParams::parse(raw_query);
    let Some(serial) = query.serial() else {
        return TOKEN_OK.to_string();
    };
    let serial = serial.to_string();

    if let Err(e) = ctx.db.append_protocol_log(&serial, "heartbeat", raw_query).await {
        warn!(serial, error = %e, "failed to audit heartbeat");
    }

    // First contact from an unknown serial registers the device; a known
    // serial calling from a new address gets its address re-bound.
    let address = peer.map(|ip| ip.to_string()).unwrap_or_default();
    if let Err(e) = ctx.db.register_push_device(&serial, &address).await {
        warn!(serial, error = %e, "registry write failed during heartbeat");
    }

    if let Some(info) = query.get("INFO") {
        let snapshot = parse_info(info);
        if let Err(e) = ctx.db.update_health(&serial, &snapshot).await {
            warn!(serial, error = %e, "failed to store health snapshot");
        }
    }

    if query.wants_options() {
        return ctx.options.encode(&serial);
    }
    TOKEN_OK.to_string()
}

/// Bulk upload. Punch tables are parsed and ingested; every other table
/// is audited and acknowledged.
pub async fn handle_upload(
    ctx: &AppContext,
    raw_query: &str,
    peer: Option<IpAddr>,
    body: &str,
) -> String {
    match process_upload(ctx, raw_query, peer, body).await {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "bulk upload processing failed");
            TOKEN_ERROR.to_string()
        }
    }
}

async fn process_upload(
    ctx: &AppContext,
    raw_query: &str,
    peer: Option<IpAddr>,
    body: &str,
) -> Result<String, IngestError> {
    let query = QueryParams::parse(raw_query);
    let serial = query
        .serial()
        .ok_or(IngestError::MissingSerial)?
        .to_string();
    let table = query.get("table").unwrap_or("").to_string();

    if let Err(e) = ctx.db.append_protocol_log(&serial, &table, body).await {
        warn!(serial, table, error = %e, "failed to audit bulk upload");
    }

    if !table.eq_ignore_ascii_case(PUNCH_TABLE) {
        return Ok(TOKEN_OK.to_string());
    }

    let lines = push::parse_punch_lines(body);
    let parsed = lines.len();

    let address = peer.map(|ip| ip.to_string()).unwrap_or_default();
    let device = match ctx.db.register_push_device(&serial, &address).await {
        Ok(device) => device,
        Err(e) => {
            // Ingestion continues against an in-memory placeholder; the
            // punch store is the durable source of truth.
            warn!(serial, error = %e, "registry unavailable, using placeholder device");
            placeholder_device(&serial, &address)
        }
    };

    let punches: Vec<NewPunch> = lines
        .iter()
        .map(|line| NewPunch {
            employee_id: line.employee_id.clone(),
            punched_at: line.timestamp.and_utc().timestamp(),
            kind: punch_kind_from_code(line.mode_code),
            device_serial: device.serial_number.clone(),
            device_name: device.name.clone(),
            payload: line.raw.clone(),
        })
        .collect();
    let newest = punches.iter().map(|p| p.punched_at).max();

    let stats = ctx.db.insert_punches_if_absent(punches).await?;
    info!(
        serial,
        parsed,
        inserted = stats.inserted,
        duplicates = stats.duplicates,
        "processed punch upload"
    );

    if let Some(newest) = newest
        && let Err(e) = ctx.db.advance_cursor(&serial, newest).await
    {
        warn!(serial, error = %e, "failed to advance punch cursor");
    }

    ctx.forwarder.spawn_forward(&stats.accepted);

    Ok(format!("{TOKEN_OK}: {parsed}"))
}

/// Health fields from a heartbeat `INFO` string:
/// `firmware,users,fingers,punches,ip,...`.
fn parse_info(info: &str) -> HealthSnapshot {
    let fields: Vec<&str> = info.split(',').map(str::trim).collect();
    HealthSnapshot {
        user_count: fields.get(1).and_then(|f| f.parse().ok()),
        finger_count: fields.get(2).and_then(|f| f.parse().ok()),
        face_count: None,
        firmware: fields
            .first()
            .filter(|f| !f.is_empty())
            .map(ToString::to_string),
        platform: None,
        status_raw: Some(info.to_string()),
    }
}

/// Stand-in device when the registry cannot be read or written. Punches
/// still carry the reporting serial number for later attribution.
fn placeholder_device(serial: &str, address: &str) -> Device {
    let now = unix_timestamp();
    Device {
        serial_number: serial.to_string(),
        name: serial.to_string(),
        address: address.to_string(),
        port: i64::from(timeclock_wire::frames::DEFAULT_CONTROL_PORT),
        enabled: 1,
        auto_registered: 1,
        last_sync_at: None,
        last_sync_status: "pending".to_string(),
        last_punch_at: None,
        user_count: 0,
        finger_count: 0,
        face_count: 0,
        firmware: String::new(),
        platform: String::new(),
        status_raw: String::new(),
        created_at: now,
        updated_at: now,
    }
}
