//! Database queries: device registry, punch log, protocol audit log.

use timeclock_core::db::unix_timestamp;
use timeclock_wire::frames::DEFAULT_CONTROL_PORT;

use super::db::{Database, DatabaseError};
use super::models::{Device, NewPunch, ProtocolLogEntry, Punch, PunchInsertStats, SyncStatus};

/// Filters for punch queries on the operator surface.
#[derive(Debug, Clone, Default)]
pub struct PunchFilter {
    pub employee_id: Option<String>,
    pub device_serial: Option<String>,
    pub from: Option<i64>,
    pub to: Option<i64>,
    pub limit: u32,
}

impl Database {
    // =========================================================================
    // Device registry
    // =========================================================================

    /// Create a device explicitly (operator action).
    pub async fn create_device(
        &self,
        serial: &str,
        name: &str,
        address: &str,
        port: i64,
        enabled: bool,
    ) -> Result<Device, DatabaseError> {
        let now = unix_timestamp();

        sqlx::query(
            r"
            INSERT INTO devices (serial_number, name, address, port, enabled, auto_registered, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 0, ?, ?)
            ",
        )
        .bind(serial)
        .bind(name)
        .bind(address)
        .bind(port)
        .bind(i64::from(enabled))
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_device(serial).await
    }

    /// Get a device by serial number.
    pub async fn get_device(&self, serial: &str) -> Result<Device, DatabaseError> {
        self.find_device(serial)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Device {serial}")))
    }

    /// Get a device by serial number, `None` when unknown.
    pub async fn find_device(&self, serial: &str) -> Result<Option<Device>, DatabaseError> {
        Ok(
            sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE serial_number = ?")
                .bind(serial)
                .fetch_optional(self.pool())
                .await?,
        )
    }

    /// List all devices, most recently updated first.
    pub async fn list_devices(&self) -> Result<Vec<Device>, DatabaseError> {
        Ok(
            sqlx::query_as::<_, Device>("SELECT * FROM devices ORDER BY updated_at DESC")
                .fetch_all(self.pool())
                .await?,
        )
    }

    /// List enabled devices in stable registration order; the sweep and
    /// the convergence engine walk this list sequentially.
    pub async fn get_enabled_devices(&self) -> Result<Vec<Device>, DatabaseError> {
        Ok(sqlx::query_as::<_, Device>(
            "SELECT * FROM devices WHERE enabled != 0 ORDER BY created_at ASC, serial_number ASC",
        )
        .fetch_all(self.pool())
        .await?)
    }

    /// Update mutable device fields (operator action). `None` leaves the
    /// stored value untouched.
    pub async fn update_device(
        &self,
        serial: &str,
        name: Option<&str>,
        address: Option<&str>,
        port: Option<i64>,
        enabled: Option<bool>,
    ) -> Result<Device, DatabaseError> {
        let now = unix_timestamp();

        sqlx::query(
            r"
            UPDATE devices
            SET name = COALESCE(?, name),
                address = COALESCE(?, address),
                port = COALESCE(?, port),
                enabled = COALESCE(?, enabled),
                updated_at = ?
            WHERE serial_number = ?
            ",
        )
        .bind(name)
        .bind(address)
        .bind(port)
        .bind(enabled.map(i64::from))
        .bind(now)
        .bind(serial)
        .execute(self.pool())
        .await?;

        self.get_device(serial).await
    }

    /// Delete a device record (operator action; never automatic).
    pub async fn delete_device(&self, serial: &str) -> Result<(), DatabaseError> {
        let result = sqlx::query("DELETE FROM devices WHERE serial_number = ?")
            .bind(serial)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Device {serial}")));
        }
        Ok(())
    }

    /// Enable or disable a device.
    pub async fn set_device_enabled(&self, serial: &str, enabled: bool) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE devices SET enabled = ?, updated_at = ? WHERE serial_number = ?")
            .bind(i64::from(enabled))
            .bind(unix_timestamp())
            .bind(serial)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Resolve the device behind a push-protocol call: return the known
    /// record (re-binding its address on mismatch: terminals move between
    /// DHCP leases, and the serial number uniquely names the hardware), or
    /// auto-register an unknown serial before the batch is processed.
    pub async fn register_push_device(
        &self,
        serial: &str,
        address: &str,
    ) -> Result<Device, DatabaseError> {
        if let Some(device) = self.find_device(serial).await? {
            if !address.is_empty() && device.address != address {
                self.rebind_address(serial, address).await?;
                return self.get_device(serial).await;
            }
            return Ok(device);
        }

        let auto_count = self.count_auto_registered().await?;
        let name = format!("Auto-ADMS-{auto_count}");
        let now = unix_timestamp();

        // OR IGNORE: a concurrent upload from the same serial may have
        // registered it between the lookup above and this insert.
        sqlx::query(
            r"
            INSERT OR IGNORE INTO devices (serial_number, name, address, port, enabled, auto_registered, created_at, updated_at)
            VALUES (?, ?, ?, ?, 1, 1, ?, ?)
            ",
        )
        .bind(serial)
        .bind(&name)
        .bind(address)
        .bind(i64::from(DEFAULT_CONTROL_PORT))
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_device(serial).await
    }

    /// Overwrite the stored network address. Last-writer-wins on purpose:
    /// the serial number identifies the hardware, the address does not.
    pub async fn rebind_address(&self, serial: &str, address: &str) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE devices SET address = ?, updated_at = ? WHERE serial_number = ? AND address != ?",
        )
        .bind(address)
        .bind(unix_timestamp())
        .bind(serial)
        .bind(address)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn count_auto_registered(&self) -> Result<i64, DatabaseError> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM devices WHERE auto_registered != 0")
                .fetch_one(self.pool())
                .await?,
        )
    }

    /// Record the outcome of a sync attempt, optionally advancing the
    /// punch cursor.
    pub async fn update_sync_result(
        &self,
        serial: &str,
        status: SyncStatus,
        cursor: Option<i64>,
    ) -> Result<(), DatabaseError> {
        let now = unix_timestamp();

        sqlx::query(
            "UPDATE devices SET last_sync_at = ?, last_sync_status = ?, updated_at = ? WHERE serial_number = ?",
        )
        .bind(now)
        .bind(status.as_str())
        .bind(now)
        .bind(serial)
        .execute(self.pool())
        .await?;

        if let Some(ts) = cursor {
            self.advance_cursor(serial, ts).await?;
        }
        Ok(())
    }

    /// Advance the device's punch cursor to `timestamp` if it is newer than
    /// the stored value. The cursor never moves backward.
    pub async fn advance_cursor(&self, serial: &str, timestamp: i64) -> Result<(), DatabaseError> {
        sqlx::query(
            r"
            UPDATE devices
            SET last_punch_at = MAX(COALESCE(last_punch_at, 0), ?), updated_at = ?
            WHERE serial_number = ?
            ",
        )
        .bind(timestamp)
        .bind(unix_timestamp())
        .bind(serial)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Store the advisory health snapshot a terminal reported.
    pub async fn update_health(
        &self,
        serial: &str,
        snapshot: &super::models::HealthSnapshot,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r"
            UPDATE devices
            SET user_count = COALESCE(?, user_count),
                finger_count = COALESCE(?, finger_count),
                face_count = COALESCE(?, face_count),
                firmware = COALESCE(?, firmware),
                platform = COALESCE(?, platform),
                status_raw = COALESCE(?, status_raw),
                updated_at = ?
            WHERE serial_number = ?
            ",
        )
        .bind(snapshot.user_count)
        .bind(snapshot.finger_count)
        .bind(snapshot.face_count)
        .bind(snapshot.firmware.as_deref())
        .bind(snapshot.platform.as_deref())
        .bind(snapshot.status_raw.as_deref())
        .bind(unix_timestamp())
        .bind(serial)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    // =========================================================================
    // Punch log
    // =========================================================================

    /// Insert one punch unless (employee, timestamp) already exists.
    /// Returns `true` when the row is new.
    pub async fn insert_punch_if_absent(&self, punch: &NewPunch) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            r"
            INSERT OR IGNORE INTO punches (employee_id, punched_at, kind, device_serial, device_name, payload, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&punch.employee_id)
        .bind(punch.punched_at)
        .bind(punch.kind.as_str())
        .bind(&punch.device_serial)
        .bind(&punch.device_name)
        .bind(&punch.payload)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Idempotent bulk insert. Duplicates are counted, never errors;
    /// protocol redelivery and overlapping resyncs are expected.
    pub async fn insert_punches_if_absent(
        &self,
        punches: Vec<NewPunch>,
    ) -> Result<PunchInsertStats, DatabaseError> {
        let mut stats = PunchInsertStats::default();
        for punch in punches {
            if self.insert_punch_if_absent(&punch).await? {
                stats.inserted += 1;
                stats.accepted.push(punch);
            } else {
                stats.duplicates += 1;
            }
        }
        Ok(stats)
    }

    /// Query punches with optional filters, newest first.
    pub async fn query_punches(&self, filter: &PunchFilter) -> Result<Vec<Punch>, DatabaseError> {
        let mut qb = sqlx::QueryBuilder::new("SELECT * FROM punches WHERE 1=1");
        if let Some(employee_id) = &filter.employee_id {
            qb.push(" AND employee_id = ").push_bind(employee_id);
        }
        if let Some(serial) = &filter.device_serial {
            qb.push(" AND device_serial = ").push_bind(serial);
        }
        if let Some(from) = filter.from {
            qb.push(" AND punched_at >= ").push_bind(from);
        }
        if let Some(to) = filter.to {
            qb.push(" AND punched_at <= ").push_bind(to);
        }
        let limit = if filter.limit == 0 { 200 } else { filter.limit };
        qb.push(" ORDER BY punched_at DESC LIMIT ").push_bind(i64::from(limit));

        Ok(qb
            .build_query_as::<Punch>()
            .fetch_all(self.pool())
            .await?)
    }

    /// Total punches stored.
    pub async fn count_punches(&self) -> Result<i64, DatabaseError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM punches")
            .fetch_one(self.pool())
            .await?)
    }

    /// Administrative purge: delete punches older than `before` (all
    /// punches when `None`). The only path that ever deletes punch rows.
    pub async fn purge_punches(&self, before: Option<i64>) -> Result<u64, DatabaseError> {
        let result = if let Some(before) = before {
            sqlx::query("DELETE FROM punches WHERE punched_at < ?")
                .bind(before)
                .execute(self.pool())
                .await?
        } else {
            sqlx::query("DELETE FROM punches").execute(self.pool()).await?
        };
        Ok(result.rows_affected())
    }

    // =========================================================================
    // Protocol audit log
    // =========================================================================

    /// Append one raw protocol contact. Write-only from the daemon's side.
    pub async fn append_protocol_log(
        &self,
        serial: &str,
        category: &str,
        body: &str,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO protocol_log (serial_number, category, body, received_at) VALUES (?, ?, ?, ?)",
        )
        .bind(serial)
        .bind(category)
        .bind(body)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Read back protocol log entries for diagnostics, newest first.
    pub async fn list_protocol_log(
        &self,
        serial: Option<&str>,
        limit: u32,
    ) -> Result<Vec<ProtocolLogEntry>, DatabaseError> {
        let limit = i64::from(if limit == 0 { 100 } else { limit });
        let entries = if let Some(serial) = serial {
            sqlx::query_as::<_, ProtocolLogEntry>(
                "SELECT * FROM protocol_log WHERE serial_number = ? ORDER BY id DESC LIMIT ?",
            )
            .bind(serial)
            .bind(limit)
            .fetch_all(self.pool())
            .await?
        } else {
            sqlx::query_as::<_, ProtocolLogEntry>(
                "SELECT * FROM protocol_log ORDER BY id DESC LIMIT ?",
            )
            .bind(limit)
            .fetch_all(self.pool())
            .await?
        };
        Ok(entries)
    }
}
