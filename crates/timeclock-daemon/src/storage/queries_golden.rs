//! Golden-record queries: users and fingerprint templates spanning all
//! terminals.
//!
//! Upsert semantics are "present beats absent": any device that reports a
//! user contributes, and non-empty fields overwrite stored ones while empty
//! fields never erase. Nothing here deletes automatically; removal is an
//! explicit operator action.

use timeclock_core::db::unix_timestamp;

use super::db::{Database, DatabaseError};
use super::models::{Fingerprint, GoldenUser};

/// Fields of a harvested user, as reported by one terminal.
#[derive(Debug, Clone, Default)]
pub struct HarvestedUser {
    pub user_id: String,
    pub name: String,
    pub card: i64,
    pub privilege: i64,
    pub password: String,
}

impl Database {
    // =========================================================================
    // Golden users
    // =========================================================================

    /// Upsert one harvested user into the golden record.
    pub async fn upsert_golden_user(
        &self,
        user: &HarvestedUser,
        source_serial: &str,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r"
            INSERT INTO device_users (user_id, name, card, privilege, password, last_seen_at, source_serial)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                name = CASE WHEN excluded.name != '' THEN excluded.name ELSE device_users.name END,
                card = CASE WHEN excluded.card != 0 THEN excluded.card ELSE device_users.card END,
                privilege = CASE WHEN excluded.privilege != 0 THEN excluded.privilege ELSE device_users.privilege END,
                password = CASE WHEN excluded.password != '' THEN excluded.password ELSE device_users.password END,
                last_seen_at = excluded.last_seen_at,
                source_serial = excluded.source_serial
            ",
        )
        .bind(&user.user_id)
        .bind(&user.name)
        .bind(user.card)
        .bind(user.privilege)
        .bind(&user.password)
        .bind(unix_timestamp())
        .bind(source_serial)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// The full golden user set, in stable identifier order.
    pub async fn list_golden_users(&self) -> Result<Vec<GoldenUser>, DatabaseError> {
        Ok(
            sqlx::query_as::<_, GoldenUser>("SELECT * FROM device_users ORDER BY user_id ASC")
                .fetch_all(self.pool())
                .await?,
        )
    }

    /// Get one golden user.
    pub async fn get_golden_user(&self, user_id: &str) -> Result<GoldenUser, DatabaseError> {
        sqlx::query_as::<_, GoldenUser>("SELECT * FROM device_users WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("User {user_id}")))
    }

    /// Remove a user and their templates from the golden record
    /// (operator action only).
    pub async fn delete_golden_user(&self, user_id: &str) -> Result<(), DatabaseError> {
        sqlx::query("DELETE FROM fingerprints WHERE user_id = ?")
            .bind(user_id)
            .execute(self.pool())
            .await?;
        let result = sqlx::query("DELETE FROM device_users WHERE user_id = ?")
            .bind(user_id)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("User {user_id}")));
        }
        Ok(())
    }

    // =========================================================================
    // Fingerprint templates
    // =========================================================================

    /// Upsert a template for one finger slot. The payload is opaque and
    /// replaces any stored payload for the same slot.
    pub async fn upsert_fingerprint(
        &self,
        user_id: &str,
        finger_index: i64,
        template: &[u8],
        source_serial: &str,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r"
            INSERT INTO fingerprints (user_id, finger_index, template, updated_at, source_serial)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(user_id, finger_index) DO UPDATE SET
                template = excluded.template,
                updated_at = excluded.updated_at,
                source_serial = excluded.source_serial
            ",
        )
        .bind(user_id)
        .bind(finger_index)
        .bind(template)
        .bind(unix_timestamp())
        .bind(source_serial)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// All templates for one user, ordered by finger slot.
    pub async fn list_fingerprints(&self, user_id: &str) -> Result<Vec<Fingerprint>, DatabaseError> {
        Ok(sqlx::query_as::<_, Fingerprint>(
            "SELECT * FROM fingerprints WHERE user_id = ? ORDER BY finger_index ASC",
        )
        .bind(user_id)
        .fetch_all(self.pool())
        .await?)
    }

    /// The full template set, for the distribute phase's single read.
    pub async fn list_all_fingerprints(&self) -> Result<Vec<Fingerprint>, DatabaseError> {
        Ok(sqlx::query_as::<_, Fingerprint>(
            "SELECT * FROM fingerprints ORDER BY user_id ASC, finger_index ASC",
        )
        .fetch_all(self.pool())
        .await?)
    }
}
