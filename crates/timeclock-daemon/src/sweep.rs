//! Pull-sync sweep: walk every enabled terminal, fetch its buffered
//! punches over the control channel, and ingest them incrementally.
//!
//! Devices are processed strictly sequentially. Embedded terminal firmware
//! degrades under concurrent control sessions, so one slow device delays
//! only its own turn; a failing device is recorded and skipped, never
//! allowed to stop the sweep.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use timeclock_wire::{PunchKind, punch_kind_from_code};

use crate::context::AppContext;
use crate::storage::{DatabaseError, Device, HealthSnapshot, NewPunch, SyncStatus};
use crate::terminal::{TerminalError, with_session};

/// Manual sync requests routed through the scheduler task, so that sweeps
/// never overlap and the one-session-per-terminal discipline holds.
#[derive(Debug, Clone)]
pub enum SweepCommand {
    /// Sweep all enabled devices now.
    All,
    /// Sync one device by serial number.
    Device(String),
}

/// Per-device outcome of one sweep.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSweep {
    pub serial: String,
    pub name: String,
    pub outcome: String,
    pub fetched: usize,
    pub inserted: u64,
    pub duplicates: u64,
    pub error: Option<String>,
}

/// Structured result of one full sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub devices: Vec<DeviceSweep>,
}

/// A bounded diagnostic sample of a device's buffer (no writes).
#[derive(Debug, Clone, Serialize)]
pub struct PreviewPunch {
    pub employee_id: String,
    pub timestamp: String,
    pub kind: PunchKind,
    pub mode_code: u8,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Terminal(#[from] TerminalError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Sweep all enabled devices sequentially. Never fails as a whole: a
/// registry outage yields an empty report, a failing device a failed entry.
pub async fn run_sweep(ctx: &AppContext) -> SweepReport {
    let devices = match ctx.db.get_enabled_devices().await {
        Ok(devices) => devices,
        Err(e) => {
            error!(error = %e, "cannot list devices for sweep");
            return SweepReport::default();
        }
    };

    let mut report = SweepReport::default();
    for device in &devices {
        report.devices.push(sweep_one(ctx, device).await);
    }

    let failed = report.devices.iter().filter(|d| d.error.is_some()).count();
    info!(
        devices = report.devices.len(),
        failed, "pull-sync sweep complete"
    );
    report
}

/// Sync one device, recording the outcome against its registry row on
/// both paths.
pub async fn sweep_one(ctx: &AppContext, device: &Device) -> DeviceSweep {
    let serial = device.serial_number.clone();
    match sync_device(ctx, device).await {
        Ok((fetched, inserted, duplicates)) => DeviceSweep {
            serial,
            name: device.name.clone(),
            outcome: SyncStatus::Success.to_string(),
            fetched,
            inserted,
            duplicates,
            error: None,
        },
        Err(e) => {
            warn!(serial, error = %e, "device sync failed");
            if let Err(db_err) = ctx
                .db
                .update_sync_result(&serial, SyncStatus::Failed, None)
                .await
            {
                warn!(serial, error = %db_err, "failed to record sync failure");
            }
            DeviceSweep {
                serial,
                name: device.name.clone(),
                outcome: SyncStatus::Failed.to_string(),
                fetched: 0,
                inserted: 0,
                duplicates: 0,
                error: Some(e.to_string()),
            }
        }
    }
}

/// The incremental pull: fetch the buffer, skip everything at or before
/// the stored cursor, insert the remainder idempotently, and advance the
/// cursor to the batch maximum.
async fn sync_device(ctx: &AppContext, device: &Device) -> Result<(usize, u64, u64), SyncError> {
    let (mut records, sizes, firmware, platform) = with_session(
        &device.address,
        device.control_port(),
        ctx.terminal_timeout,
        async |session| {
            let records = session.read_attendance().await?;
            // Health reads are advisory; their failure must not fail the sync.
            let sizes = session.free_sizes().await.ok();
            let firmware = session.firmware_version().await.ok();
            let platform = session.get_option("~Platform").await.ok();
            Ok((records, sizes, firmware, platform))
        },
    )
    .await?;

    let fetched = records.len();
    let cursor = device.cursor();

    // Newest first; stop at the first record at or before the cursor.
    // Everything older has already been accepted, which bounds per-sync
    // work to "events since the last successful sync".
    records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    let batch_max = records
        .first()
        .map(|r| r.timestamp.and_utc().timestamp());

    let mut fresh = Vec::new();
    for record in &records {
        let punched_at = record.timestamp.and_utc().timestamp();
        if punched_at <= cursor {
            break;
        }
        fresh.push(NewPunch {
            employee_id: record.user_id.trim().to_uppercase(),
            punched_at,
            kind: punch_kind_from_code(u16::from(record.punch_code)),
            device_serial: device.serial_number.clone(),
            device_name: device.name.clone(),
            payload: format!("uid={} verify={}", record.uid, record.verify),
        });
    }
    // Oldest first for insertion, so a mid-batch failure leaves a
    // contiguous prefix behind the cursor.
    fresh.reverse();

    let stats = ctx.db.insert_punches_if_absent(fresh).await?;
    ctx.forwarder.spawn_forward(&stats.accepted);

    ctx.db
        .update_sync_result(&device.serial_number, SyncStatus::Success, batch_max)
        .await?;

    if sizes.is_some() || firmware.is_some() || platform.is_some() {
        let snapshot = HealthSnapshot {
            user_count: sizes.map(|s| i64::from(s.users)),
            finger_count: sizes.map(|s| i64::from(s.fingers)),
            face_count: sizes.map(|s| i64::from(s.faces)),
            firmware,
            platform,
            status_raw: sizes.map(|s| format!("punches={}", s.punches)),
        };
        if let Err(e) = ctx.db.update_health(&device.serial_number, &snapshot).await {
            warn!(serial = device.serial_number, error = %e, "failed to store health snapshot");
        }
    }

    Ok((fetched, stats.inserted, stats.duplicates))
}

/// Diagnostic raw fetch: open a session, sample the buffer, write nothing.
pub async fn preview_device(
    ctx: &AppContext,
    serial: &str,
    limit: usize,
) -> Result<Vec<PreviewPunch>, SyncError> {
    let device = ctx.db.get_device(serial).await?;

    let records = with_session(
        &device.address,
        device.control_port(),
        ctx.terminal_timeout,
        async |session| session.read_attendance().await,
    )
    .await?;

    Ok(records
        .iter()
        .take(limit)
        .map(|record| PreviewPunch {
            employee_id: record.user_id.trim().to_uppercase(),
            timestamp: record
                .timestamp
                .format(timeclock_wire::push::PUNCH_TIME_FORMAT)
                .to_string(),
            kind: punch_kind_from_code(u16::from(record.punch_code)),
            mode_code: record.punch_code,
        })
        .collect())
}

/// Spawn the sweep scheduler: a fixed interval plus manual triggers, all
/// funneled through one task so sweeps never run concurrently.
pub fn spawn_scheduler(
    ctx: Arc<AppContext>,
    interval: Duration,
    mut commands: mpsc::Receiver<SweepCommand>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; consume it so startup does
        // not trigger a sweep before terminals have settled.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    run_sweep(&ctx).await;
                }
                Some(command) = commands.recv() => match command {
                    SweepCommand::All => {
                        run_sweep(&ctx).await;
                    }
                    SweepCommand::Device(serial) => match ctx.db.get_device(&serial).await {
                        Ok(device) => {
                            sweep_one(&ctx, &device).await;
                        }
                        Err(e) => warn!(serial, error = %e, "manual sync for unknown device"),
                    },
                },
                _ = shutdown.changed() => {
                    info!("sweep scheduler stopping");
                    break;
                }
            }
        }
    })
}
