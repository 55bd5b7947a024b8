#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! Integration tests for the template convergence engine: harvest every
//! terminal into the golden record, distribute the union back out, isolate
//! per-device failures.

mod support;

use support::{MockState, MockTerminal, dead_port, mock_user};
use timeclock_daemon::convergence::{self, ConvergencePhase};
use timeclock_daemon::storage::HarvestedUser;

async fn register(ctx: &timeclock_daemon::AppContext, serial: &str, terminal: &MockTerminal) {
    ctx.db
        .create_device(
            serial,
            serial,
            &terminal.address(),
            i64::from(terminal.port()),
            true,
        )
        .await
        .unwrap();
}

// =========================================================================
// Harvest + distribute
// =========================================================================

#[tokio::test]
async fn two_devices_converge_on_the_union() {
    let (ctx, _rx) = support::test_context().await;

    // Device A knows E001 (with two templates), device B knows E002.
    let a = MockTerminal::start(MockState {
        users: vec![mock_user(1, "E001", "Ana")],
        templates: [((1, 0), b"left-thumb".to_vec()), ((1, 9), b"right-little".to_vec())]
            .into_iter()
            .collect(),
        ..MockState::default()
    })
    .await;
    let b = MockTerminal::start(MockState {
        users: vec![mock_user(1, "E002", "Bo")],
        ..MockState::default()
    })
    .await;
    register(&ctx, "A", &a).await;
    register(&ctx, "B", &b).await;

    let report = convergence::run(&ctx).await;
    assert!(report.errors.is_empty(), "errors: {:?}", report.errors);

    // Harvest saw each device's own records.
    assert_eq!(report.harvested.len(), 2);
    let harvest_a = report.harvested.iter().find(|h| h.serial == "A").unwrap();
    assert_eq!(harvest_a.users, 1);
    assert_eq!(harvest_a.templates, 2);

    // The golden record accumulated the union.
    let golden = ctx.db.list_golden_users().await.unwrap();
    assert_eq!(golden.len(), 2);
    assert_eq!(ctx.db.list_fingerprints("E001").await.unwrap().len(), 2);

    // Each terminal now holds both users and E001's templates.
    assert_eq!(report.distributed.len(), 2);
    for terminal in [&a, &b] {
        let users = terminal.users();
        assert_eq!(users.len(), 2);
        let mut ids: Vec<String> = users.iter().map(|u| u.user_id.clone()).collect();
        ids.sort();
        assert_eq!(ids, ["E001", "E002"]);
    }
    // Templates landed on B under B's uid for E001.
    let b_templates = b.templates();
    assert_eq!(b_templates.len(), 2);
    assert!(b_templates.values().any(|t| t == b"left-thumb"));
}

#[tokio::test]
async fn existing_users_are_overwritten_in_place() {
    let (ctx, _rx) = support::test_context().await;

    // Both devices know E001 under different internal uids.
    let a = MockTerminal::start(MockState {
        users: vec![mock_user(7, "E001", "Ana Gomez")],
        ..MockState::default()
    })
    .await;
    let b = MockTerminal::start(MockState {
        users: vec![mock_user(3, "E001", "")],
        ..MockState::default()
    })
    .await;
    register(&ctx, "A", &a).await;
    register(&ctx, "B", &b).await;

    let report = convergence::run(&ctx).await;
    assert!(report.errors.is_empty());

    // One golden user; the empty name did not erase the real one.
    let golden = ctx.db.list_golden_users().await.unwrap();
    assert_eq!(golden.len(), 1);
    assert_eq!(golden[0].name, "Ana Gomez");

    // Distribute reused each device's own uid, so no duplicate rows.
    let a_users = a.users();
    assert_eq!(a_users.len(), 1);
    assert_eq!(a_users[0].uid, 7);
    assert_eq!(a_users[0].name, "Ana Gomez");

    let b_users = b.users();
    assert_eq!(b_users.len(), 1);
    assert_eq!(b_users[0].uid, 3);
    assert_eq!(b_users[0].name, "Ana Gomez");
}

#[tokio::test]
async fn convergence_is_idempotent() {
    let (ctx, _rx) = support::test_context().await;
    let a = MockTerminal::start(MockState {
        users: vec![mock_user(1, "E001", "Ana")],
        templates: [((1, 2), b"index".to_vec())].into_iter().collect(),
        ..MockState::default()
    })
    .await;
    register(&ctx, "A", &a).await;

    let first = convergence::run(&ctx).await;
    assert!(first.errors.is_empty());
    let golden_after_first = ctx.db.list_golden_users().await.unwrap();

    let second = convergence::run(&ctx).await;
    assert!(second.errors.is_empty());

    // Identical golden record, identical re-send.
    let golden_after_second = ctx.db.list_golden_users().await.unwrap();
    assert_eq!(golden_after_first.len(), golden_after_second.len());
    assert_eq!(golden_after_second[0].name, "Ana");
    assert_eq!(second.distributed[0].users_pushed, 1);
    assert_eq!(second.distributed[0].templates_pushed, 1);
    assert_eq!(second.distributed[0].user_failures, 0);

    assert_eq!(a.users().len(), 1);
    assert_eq!(a.templates().len(), 1);
}

// =========================================================================
// Failure isolation
// =========================================================================

#[tokio::test]
async fn unreachable_device_is_isolated() {
    let (ctx, _rx) = support::test_context().await;

    let a = MockTerminal::start(MockState {
        users: vec![mock_user(1, "E001", "Ana")],
        ..MockState::default()
    })
    .await;
    let c = MockTerminal::start(MockState {
        users: vec![mock_user(1, "E003", "Cy")],
        ..MockState::default()
    })
    .await;
    register(&ctx, "A", &a).await;

    let dead = dead_port().await;
    ctx.db
        .create_device("B", "B", "127.0.0.1", i64::from(dead), true)
        .await
        .unwrap();

    register(&ctx, "C", &c).await;

    // B contributed a user in an earlier run; unreachability now must not
    // drop it from what A and C receive.
    ctx.db
        .upsert_golden_user(
            &HarvestedUser {
                user_id: "E002".to_string(),
                name: "Bo".to_string(),
                ..HarvestedUser::default()
            },
            "B",
        )
        .await
        .unwrap();

    let report = convergence::run(&ctx).await;

    // Errors name B in both phases, and only B.
    assert_eq!(report.errors.len(), 2);
    assert!(report.errors.iter().all(|e| e.serial == "B"));
    assert!(report
        .errors
        .iter()
        .any(|e| e.phase == ConvergencePhase::Harvest));
    assert!(report
        .errors
        .iter()
        .any(|e| e.phase == ConvergencePhase::Distribute));

    assert_eq!(report.harvested.len(), 2);
    assert_eq!(report.distributed.len(), 2);

    // A and C each hold the full accumulated record: their own users plus
    // B's earlier contribution.
    for terminal in [&a, &c] {
        let mut ids: Vec<String> = terminal.users().iter().map(|u| u.user_id.clone()).collect();
        ids.sort();
        assert_eq!(ids, ["E001", "E002", "E003"]);
    }
}

#[tokio::test]
async fn empty_finger_slots_are_not_errors() {
    let (ctx, _rx) = support::test_context().await;
    // A user with no templates at all: all ten probes answer ACK_ERROR.
    let a = MockTerminal::start(MockState {
        users: vec![mock_user(1, "E001", "Ana")],
        ..MockState::default()
    })
    .await;
    register(&ctx, "A", &a).await;

    let report = convergence::run(&ctx).await;
    assert!(report.errors.is_empty());
    assert_eq!(report.harvested[0].users, 1);
    assert_eq!(report.harvested[0].templates, 0);
}

#[tokio::test]
async fn numeric_fallback_when_terminal_has_no_string_id() {
    let (ctx, _rx) = support::test_context().await;
    let a = MockTerminal::start(MockState {
        users: vec![mock_user(42, "", "NoBadge")],
        ..MockState::default()
    })
    .await;
    register(&ctx, "A", &a).await;

    let report = convergence::run(&ctx).await;
    assert!(report.errors.is_empty());

    let golden = ctx.db.list_golden_users().await.unwrap();
    assert_eq!(golden.len(), 1);
    assert_eq!(golden[0].user_id, "42");
}
