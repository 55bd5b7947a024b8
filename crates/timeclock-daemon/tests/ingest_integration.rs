#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! Integration tests for the push-protocol ingestion endpoint: heartbeats,
//! capability handshakes, bulk uploads, auto-registration, and the
//! idempotence guarantees terminals rely on.

mod support;

use std::net::{IpAddr, Ipv4Addr};

use timeclock_daemon::ingest::{handle_heartbeat, handle_upload};
use timeclock_daemon::storage::PunchFilter;

const PEER_A: Option<IpAddr> = Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)));
const PEER_B: Option<IpAddr> = Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 77)));

/// 2024-01-10 09:00:00 as seconds since the epoch.
const T0900: i64 = 1_704_877_200;

// =========================================================================
// Bulk upload
// =========================================================================

#[tokio::test]
async fn attlog_upload_end_to_end() {
    let (ctx, _rx) = support::test_context().await;

    let body = "E001\t2024-01-10 09:00:00\t0\t0\nE002\t2024-01-10 09:05:00\t1\t0";
    let response = handle_upload(&ctx, "SN=T100&table=ATTLOG", PEER_A, body).await;
    assert_eq!(response, "OK: 2");

    let punches = ctx.db.query_punches(&PunchFilter::default()).await.unwrap();
    assert_eq!(punches.len(), 2);
    // Newest first.
    assert_eq!(punches[0].employee_id, "E002");
    assert_eq!(punches[0].kind, "check-out");
    assert_eq!(punches[1].employee_id, "E001");
    assert_eq!(punches[1].kind, "check-in");
    assert_eq!(punches[1].punched_at, T0900);
    assert_eq!(punches[1].device_serial, "T100");

    // The unseen serial was auto-registered before the batch.
    let device = ctx.db.get_device("T100").await.unwrap();
    assert_eq!(device.name, "Auto-ADMS-0");
    assert_eq!(device.address, "10.0.0.9");
}

#[tokio::test]
async fn resubmitting_a_batch_is_idempotent() {
    let (ctx, _rx) = support::test_context().await;
    let body = "E001\t2024-01-10 09:00:00\t0\t0\nE002\t2024-01-10 09:05:00\t1\t0";

    let first = handle_upload(&ctx, "SN=T100&table=ATTLOG", PEER_A, body).await;
    let second = handle_upload(&ctx, "SN=T100&table=ATTLOG", PEER_A, body).await;

    // The response reports lines parsed, not rows inserted.
    assert_eq!(first, "OK: 2");
    assert_eq!(second, "OK: 2");
    assert_eq!(ctx.db.count_punches().await.unwrap(), 2);
}

#[tokio::test]
async fn second_upload_does_not_duplicate_the_device() {
    let (ctx, _rx) = support::test_context().await;
    let body = "E001\t2024-01-10 09:00:00\t0";

    handle_upload(&ctx, "SN=NEW1&table=ATTLOG", PEER_A, body).await;
    handle_upload(&ctx, "SN=NEW1&table=ATTLOG", PEER_A, body).await;

    let devices = ctx.db.list_devices().await.unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].name, "Auto-ADMS-0");
}

#[tokio::test]
async fn upload_from_new_address_rebinds_only_the_address() {
    let (ctx, _rx) = support::test_context().await;
    ctx.db
        .create_device("T100", "Lobby", "10.0.0.9", 4370, true)
        .await
        .unwrap();
    ctx.db.advance_cursor("T100", 12_345).await.unwrap();

    handle_upload(
        &ctx,
        "SN=T100&table=ATTLOG",
        PEER_B,
        "E009\t2024-01-10 10:00:00\t0",
    )
    .await;

    let device = ctx.db.get_device("T100").await.unwrap();
    assert_eq!(device.address, "10.0.0.77");
    assert_eq!(device.name, "Lobby");
    assert_eq!(device.auto_registered, 0);
    assert!(device.cursor() >= 12_345);
}

#[tokio::test]
async fn push_upload_advances_the_cursor() {
    let (ctx, _rx) = support::test_context().await;

    handle_upload(
        &ctx,
        "SN=T100&table=ATTLOG",
        PEER_A,
        "E001\t2024-01-10 09:00:00\t0\nE002\t2024-01-10 09:05:00\t1",
    )
    .await;

    let device = ctx.db.get_device("T100").await.unwrap();
    assert_eq!(device.cursor(), T0900 + 300);
}

#[tokio::test]
async fn non_punch_tables_are_audited_and_acknowledged() {
    let (ctx, _rx) = support::test_context().await;

    let body = "USER PIN=1\tName=Ana";
    let response = handle_upload(&ctx, "SN=T100&table=OPERLOG", PEER_A, body).await;
    assert_eq!(response, "OK");
    assert_eq!(ctx.db.count_punches().await.unwrap(), 0);

    let log = ctx.db.list_protocol_log(Some("T100"), 10).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].category, "OPERLOG");
    assert_eq!(log[0].body, body);
}

#[tokio::test]
async fn malformed_lines_are_dropped_not_fatal() {
    let (ctx, _rx) = support::test_context().await;

    let body = "garbage line\nE001\tnot-a-date\t0\nE002\t2024-01-10 09:00:00\t1\t0\n";
    let response = handle_upload(&ctx, "SN=T100&table=ATTLOG", PEER_A, body).await;

    assert_eq!(response, "OK: 1");
    assert_eq!(ctx.db.count_punches().await.unwrap(), 1);
}

#[tokio::test]
async fn upload_without_serial_is_an_error_token() {
    let (ctx, _rx) = support::test_context().await;
    let response = handle_upload(&ctx, "table=ATTLOG", PEER_A, "E001\t2024-01-10 09:00:00\t0").await;
    assert_eq!(response, "ERROR");
    assert_eq!(ctx.db.count_punches().await.unwrap(), 0);
}

#[tokio::test]
async fn unknown_mode_codes_default_to_check_in() {
    let (ctx, _rx) = support::test_context().await;

    handle_upload(
        &ctx,
        "SN=T100&table=ATTLOG",
        PEER_A,
        "E001\t2024-01-10 09:00:00\t42\nE002\t2024-01-10 09:01:00\t255",
    )
    .await;

    let punches = ctx.db.query_punches(&PunchFilter::default()).await.unwrap();
    assert!(punches.iter().all(|p| p.kind == "check-in"));
}

// =========================================================================
// Heartbeats & handshake
// =========================================================================

#[tokio::test]
async fn plain_heartbeat_answers_ok_and_registers() {
    let (ctx, _rx) = support::test_context().await;

    let response = handle_heartbeat(&ctx, "SN=T100", PEER_A).await;
    assert_eq!(response, "OK");

    let device = ctx.db.get_device("T100").await.unwrap();
    assert_eq!(device.auto_registered, 1);
}

#[tokio::test]
async fn capability_request_gets_the_options_block() {
    let (ctx, _rx) = support::test_context().await;

    let response = handle_heartbeat(&ctx, "SN=T100&options=all&pushver=2.4.1", PEER_A).await;
    assert!(response.starts_with("GET OPTION FROM: T100\n"));
    assert!(response.contains("Realtime=1"));
    assert!(response.contains("Encrypt=None"));
    assert!(response.ends_with("Encrypt=None"));
}

#[tokio::test]
async fn heartbeat_info_updates_the_health_snapshot() {
    let (ctx, _rx) = support::test_context().await;

    handle_heartbeat(&ctx, "SN=T100&INFO=Ver+8.0.4,25,48,1290,10.0.0.9", PEER_A).await;

    let device = ctx.db.get_device("T100").await.unwrap();
    assert_eq!(device.firmware, "Ver 8.0.4");
    assert_eq!(device.user_count, 25);
    assert_eq!(device.finger_count, 48);
}

#[tokio::test]
async fn heartbeat_without_serial_is_still_ok() {
    let (ctx, _rx) = support::test_context().await;
    assert_eq!(handle_heartbeat(&ctx, "", None).await, "OK");
}
