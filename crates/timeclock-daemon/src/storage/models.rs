//! Database models for the timeclock daemon.

use serde::{Deserialize, Serialize};

/// Device record from the database. One per physical terminal.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Device {
    pub serial_number: String,
    pub name: String,
    pub address: String,
    pub port: i64,
    pub enabled: i64,
    pub auto_registered: i64,
    pub last_sync_at: Option<i64>,
    pub last_sync_status: String,
    pub last_punch_at: Option<i64>,
    pub user_count: i64,
    pub finger_count: i64,
    pub face_count: i64,
    pub firmware: String,
    pub platform: String,
    pub status_raw: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Device {
    pub const fn is_enabled(&self) -> bool {
        self.enabled != 0
    }

    /// Control-channel port as a socket port.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub const fn control_port(&self) -> u16 {
        self.port as u16
    }

    /// Incremental cursor: newest punch timestamp this device has
    /// contributed, zero when it has contributed nothing yet.
    pub fn cursor(&self) -> i64 {
        self.last_punch_at.unwrap_or(0)
    }
}

/// Punch event record from the database. Immutable once inserted.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Punch {
    pub id: i64,
    pub employee_id: String,
    pub punched_at: i64,
    pub kind: String,
    pub device_serial: String,
    pub device_name: String,
    pub payload: String,
    pub created_at: i64,
}

/// A punch event ready for insertion.
#[derive(Debug, Clone)]
pub struct NewPunch {
    pub employee_id: String,
    pub punched_at: i64,
    pub kind: timeclock_wire::PunchKind,
    pub device_serial: String,
    pub device_name: String,
    pub payload: String,
}

/// Outcome of a bulk idempotent insert.
#[derive(Debug, Clone, Default)]
pub struct PunchInsertStats {
    pub inserted: u64,
    pub duplicates: u64,
    /// The punches that were actually new, for forwarding.
    pub accepted: Vec<NewPunch>,
}

/// Golden-record user row, spanning all devices.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct GoldenUser {
    pub user_id: String,
    pub name: String,
    pub card: i64,
    pub privilege: i64,
    pub password: String,
    pub last_seen_at: i64,
    pub source_serial: String,
}

/// Fingerprint template row; payload is opaque vendor bytes.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Fingerprint {
    pub user_id: String,
    pub finger_index: i64,
    pub template: Vec<u8>,
    pub updated_at: i64,
    pub source_serial: String,
}

/// Raw protocol audit entry.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProtocolLogEntry {
    pub id: i64,
    pub serial_number: String,
    pub category: String,
    pub body: String,
    pub received_at: i64,
}

/// Advisory health counters reported by a terminal. `None` fields leave
/// the stored value untouched; heartbeats and pull syncs each report a
/// different subset.
#[derive(Debug, Clone, Default)]
pub struct HealthSnapshot {
    pub user_count: Option<i64>,
    pub finger_count: Option<i64>,
    pub face_count: Option<i64>,
    pub firmware: Option<String>,
    pub platform: Option<String>,
    pub status_raw: Option<String>,
}

/// Device sync outcome enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Pending,
    Success,
    Failed,
}

impl SyncStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
