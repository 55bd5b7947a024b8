//! Template convergence engine: two-phase harvest/distribute.
//!
//! N terminals, none aware of the others, converge on one shared set of
//! users and fingerprint templates. Phase 1 harvests every enabled device
//! into the persistent golden record (union semantics: present beats
//! absent). Phase 2 re-reads the golden set once and pushes it back to
//! every enabled device. Per-device and per-user failures are recorded in
//! the report and never abort the remaining work; the engine does not
//! retry within a run.
//!
//! The protocol is deliberately not transactional: two devices issuing the
//! same identifier to different people is a data-hygiene problem surfaced
//! to operators through the golden record, not resolved here.

use std::collections::HashMap;

use serde::Serialize;
use tracing::{error, info, warn};

use timeclock_wire::frames::MAX_FINGER_SLOTS;
use timeclock_wire::{TemplateFrame, UserRecord};

use crate::context::AppContext;
use crate::storage::{Device, Fingerprint, GoldenUser, HarvestedUser};
use crate::sweep::SyncError;
use crate::terminal::{TerminalError, with_session};

/// Which phase an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConvergencePhase {
    Harvest,
    Distribute,
}

/// Per-device harvest outcome.
#[derive(Debug, Clone, Serialize)]
pub struct HarvestStats {
    pub serial: String,
    pub users: usize,
    pub templates: usize,
}

/// Per-device distribute outcome.
#[derive(Debug, Clone, Serialize)]
pub struct DistributeStats {
    pub serial: String,
    pub users_pushed: usize,
    pub templates_pushed: usize,
    /// Users or templates the terminal refused; the push continued past
    /// each one.
    pub user_failures: usize,
}

/// One recorded failure.
#[derive(Debug, Clone, Serialize)]
pub struct ConvergenceError {
    pub serial: String,
    pub phase: ConvergencePhase,
    pub message: String,
}

/// Structured report returned to the calling operator tooling.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConvergenceReport {
    pub harvested: Vec<HarvestStats>,
    pub distributed: Vec<DistributeStats>,
    pub errors: Vec<ConvergenceError>,
}

/// Run one full harvest+distribute cycle over all enabled devices,
/// strictly one device session at a time.
pub async fn run(ctx: &AppContext) -> ConvergenceReport {
    let mut report = ConvergenceReport::default();

    let devices = match ctx.db.get_enabled_devices().await {
        Ok(devices) => devices,
        Err(e) => {
            error!(error = %e, "cannot list devices for convergence");
            report.errors.push(ConvergenceError {
                serial: "registry".to_string(),
                phase: ConvergencePhase::Harvest,
                message: e.to_string(),
            });
            return report;
        }
    };

    // Phase 1, harvest. Each device's terminal-internal uid map is kept
    // for the distribute phase so existing users are overwritten in place.
    let mut uid_maps: HashMap<String, HashMap<String, u16>> = HashMap::new();
    for device in &devices {
        match harvest_device(ctx, device).await {
            Ok((stats, uid_map)) => {
                info!(
                    serial = device.serial_number,
                    users = stats.users,
                    templates = stats.templates,
                    "harvested device"
                );
                uid_maps.insert(device.serial_number.clone(), uid_map);
                report.harvested.push(stats);
            }
            Err(e) => {
                warn!(serial = device.serial_number, error = %e, "harvest failed");
                report.errors.push(ConvergenceError {
                    serial: device.serial_number.clone(),
                    phase: ConvergencePhase::Harvest,
                    message: e.to_string(),
                });
            }
        }
    }

    // Phase 2, distribute. One read of the full golden set, including
    // contributions persisted by earlier runs from devices that failed
    // harvest this time.
    let (users, templates_by_user) = match read_golden(ctx).await {
        Ok(golden) => golden,
        Err(e) => {
            error!(error = %e, "cannot read golden record");
            report.errors.push(ConvergenceError {
                serial: "registry".to_string(),
                phase: ConvergencePhase::Distribute,
                message: e.to_string(),
            });
            return report;
        }
    };

    for device in &devices {
        match distribute_device(
            ctx,
            device,
            &users,
            &templates_by_user,
            uid_maps.get(&device.serial_number),
        )
        .await
        {
            Ok(stats) => {
                info!(
                    serial = device.serial_number,
                    users = stats.users_pushed,
                    templates = stats.templates_pushed,
                    failures = stats.user_failures,
                    "distributed golden record"
                );
                report.distributed.push(stats);
            }
            Err(e) => {
                warn!(serial = device.serial_number, error = %e, "distribute failed");
                report.errors.push(ConvergenceError {
                    serial: device.serial_number.clone(),
                    phase: ConvergencePhase::Distribute,
                    message: e.to_string(),
                });
            }
        }
    }

    report
}

/// Normalize a terminal user row to the shared employee identifier.
/// Terminals without a string id fall back to the numeric handle.
fn golden_user_id(user: &UserRecord) -> String {
    let trimmed = user.user_id.trim();
    if trimmed.is_empty() {
        user.uid.to_string()
    } else {
        trimmed.to_uppercase()
    }
}

/// Harvest one device: list users, probe every finger slot, upsert into
/// the golden record. Returns the device's user-id → uid map.
async fn harvest_device(
    ctx: &AppContext,
    device: &Device,
) -> Result<(HarvestStats, HashMap<String, u16>), SyncError> {
    let harvested = with_session(
        &device.address,
        device.control_port(),
        ctx.terminal_timeout,
        async |session| {
            let users = session.list_users().await?;
            let mut out = Vec::with_capacity(users.len());
            for user in users {
                let mut templates = Vec::new();
                for finger in 0..MAX_FINGER_SLOTS {
                    if let Some(template) = session.get_template(user.uid, finger).await? {
                        templates.push((finger, template));
                    }
                }
                out.push((user, templates));
            }
            Ok(out)
        },
    )
    .await?;

    let serial = device.serial_number.as_str();
    let mut stats = HarvestStats {
        serial: serial.to_string(),
        users: 0,
        templates: 0,
    };
    let mut uid_map = HashMap::new();

    for (user, templates) in &harvested {
        let user_id = golden_user_id(user);
        uid_map.insert(user_id.clone(), user.uid);

        ctx.db
            .upsert_golden_user(
                &HarvestedUser {
                    user_id: user_id.clone(),
                    name: user.name.clone(),
                    card: i64::from(user.card),
                    privilege: i64::from(user.privilege),
                    password: user.password.clone(),
                },
                serial,
            )
            .await?;
        stats.users += 1;

        for (finger, template) in templates {
            ctx.db
                .upsert_fingerprint(&user_id, i64::from(*finger), template, serial)
                .await?;
            stats.templates += 1;
        }
    }

    Ok((stats, uid_map))
}

/// Read the full golden set once for the distribute phase.
async fn read_golden(
    ctx: &AppContext,
) -> Result<(Vec<GoldenUser>, HashMap<String, Vec<Fingerprint>>), SyncError> {
    let users = ctx.db.list_golden_users().await?;
    let mut templates_by_user: HashMap<String, Vec<Fingerprint>> = HashMap::new();
    for print in ctx.db.list_all_fingerprints().await? {
        templates_by_user
            .entry(print.user_id.clone())
            .or_default()
            .push(print);
    }
    Ok((users, templates_by_user))
}

/// Push the golden set to one device. A refusal of one user or template
/// is counted and skipped; a transport failure aborts this device only.
async fn distribute_device(
    ctx: &AppContext,
    device: &Device,
    users: &[GoldenUser],
    templates_by_user: &HashMap<String, Vec<Fingerprint>>,
    uid_map: Option<&HashMap<String, u16>>,
) -> Result<DistributeStats, TerminalError> {
    let serial = device.serial_number.clone();

    with_session(
        &device.address,
        device.control_port(),
        ctx.terminal_timeout,
        async |session| {
            // Without a harvest-time uid map (the device was unreachable in
            // phase 1 but is back now), list its users so existing entries
            // are overwritten instead of duplicated.
            let mut uid_map = match uid_map {
                Some(map) => map.clone(),
                None => session
                    .list_users()
                    .await?
                    .iter()
                    .map(|user| (golden_user_id(user), user.uid))
                    .collect(),
            };
            let mut next_uid = uid_map.values().copied().max().unwrap_or(0);

            let mut stats = DistributeStats {
                serial: serial.clone(),
                users_pushed: 0,
                templates_pushed: 0,
                user_failures: 0,
            };

            for user in users {
                let uid = *uid_map.entry(user.user_id.clone()).or_insert_with(|| {
                    next_uid = next_uid.wrapping_add(1);
                    next_uid
                });

                let record = UserRecord {
                    uid,
                    privilege: u8::try_from(user.privilege).unwrap_or(0),
                    password: user.password.clone(),
                    name: user.name.clone(),
                    card: u32::try_from(user.card).unwrap_or(0),
                    group: 1,
                    user_id: user.user_id.clone(),
                };

                match session.set_user(&record).await {
                    Ok(()) => stats.users_pushed += 1,
                    Err(TerminalError::Refused { .. }) => {
                        warn!(serial, user = user.user_id, "terminal refused user record");
                        stats.user_failures += 1;
                        continue;
                    }
                    Err(e) => return Err(e),
                }

                for print in templates_by_user
                    .get(&user.user_id)
                    .map_or(&[][..], Vec::as_slice)
                {
                    let frame = TemplateFrame {
                        uid,
                        finger: u8::try_from(print.finger_index).unwrap_or(0),
                        valid: 1,
                        template: print.template.clone(),
                    };
                    match session.set_template(&frame).await {
                        Ok(()) => stats.templates_pushed += 1,
                        Err(TerminalError::Refused { .. }) => {
                            warn!(
                                serial,
                                user = user.user_id,
                                finger = print.finger_index,
                                "terminal refused template"
                            );
                            stats.user_failures += 1;
                        }
                        Err(e) => return Err(e),
                    }
                }
            }

            Ok(stats)
        },
    )
    .await
}
