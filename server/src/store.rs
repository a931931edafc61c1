use crate::config::StoreConfig;
use crate::errors::Result;
use crate::model::{Device, DeviceProfile, DeviceStatus, RegisterOutcome};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

const DEVICE_COLUMNS: &str = "id, name, device_type, description, location, firmware_version, \
     hardware_version, api_key, status, created_at, updated_at, last_seen";

/// Wraps the relational engine: device CRUD, unique-name enforcement,
/// api-key lookup. All writes are transactional at this boundary.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
    api_key_length: usize,
}

impl Store {
    pub async fn connect(cfg: &StoreConfig, api_key_length: usize) -> Result<Self> {
        info!("connecting to device store");
        let pool = PgPoolOptions::new()
            .max_connections(cfg.pool_size)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&cfg.url)
            .await?;

        info!("running device store migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self {
            pool,
            api_key_length,
        })
    }

    /// Issues a fresh api_key: 192+ bits from the OS random source, base64
    /// URL-safe without padding, truncated to the configured length.
    pub fn generate_api_key(&self) -> String {
        let byte_len = (self.api_key_length * 3).div_ceil(4);
        let mut raw = vec![0u8; byte_len];
        OsRng.fill_bytes(&mut raw);
        let mut key = URL_SAFE_NO_PAD.encode(raw);
        key.truncate(self.api_key_length);
        key
    }

    /// Registers a device, atomically with the name-uniqueness check. On a
    /// name collision the existing id is returned; the existing key is not.
    pub async fn register_device(&self, profile: &DeviceProfile) -> Result<RegisterOutcome> {
        let api_key = self.generate_api_key();
        let mut tx = self.pool.begin().await?;

        let inserted: Option<Device> = sqlx::query_as(&format!(
            "INSERT INTO devices (name, device_type, description, location, firmware_version, hardware_version, api_key) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (name) DO NOTHING \
             RETURNING {DEVICE_COLUMNS}"
        ))
        .bind(&profile.name)
        .bind(&profile.device_type)
        .bind(&profile.description)
        .bind(&profile.location)
        .bind(&profile.firmware_version)
        .bind(&profile.hardware_version)
        .bind(&api_key)
        .fetch_optional(&mut *tx)
        .await?;

        match inserted {
            Some(device) => {
                sqlx::query("INSERT INTO device_credentials (device_id, api_key) VALUES ($1, $2)")
                    .bind(device.id)
                    .bind(&device.api_key)
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                info!("registered device {} (id {})", device.name, device.id);
                Ok(RegisterOutcome::Registered(device))
            }
            None => {
                let (existing_id,): (i64,) =
                    sqlx::query_as("SELECT id FROM devices WHERE name = $1")
                        .bind(&profile.name)
                        .fetch_one(&mut *tx)
                        .await?;
                tx.rollback().await?;
                Ok(RegisterOutcome::NameTaken { existing_id })
            }
        }
    }

    pub async fn get_by_api_key(&self, api_key: &str) -> Result<Option<Device>> {
        let device = sqlx::query_as(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE api_key = $1"
        ))
        .bind(api_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(device)
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<Device>> {
        let device = sqlx::query_as(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(device)
    }

    /// Applies a partial config update; absent fields keep their value.
    pub async fn update_config(&self, id: i64, patch: &ConfigPatch) -> Result<Option<Device>> {
        let device = sqlx::query_as(&format!(
            "UPDATE devices SET \
                 description = COALESCE($2, description), \
                 location = COALESCE($3, location), \
                 firmware_version = COALESCE($4, firmware_version), \
                 hardware_version = COALESCE($5, hardware_version), \
                 device_type = COALESCE($6, device_type), \
                 updated_at = now() \
             WHERE id = $1 \
             RETURNING {DEVICE_COLUMNS}"
        ))
        .bind(id)
        .bind(&patch.description)
        .bind(&patch.location)
        .bind(&patch.firmware_version)
        .bind(&patch.hardware_version)
        .bind(&patch.device_type)
        .fetch_optional(&self.pool)
        .await?;
        Ok(device)
    }

    pub async fn update_status(&self, id: i64, status: DeviceStatus) -> Result<Option<Device>> {
        let device = sqlx::query_as(&format!(
            "UPDATE devices SET status = $2, updated_at = now() WHERE id = $1 \
             RETURNING {DEVICE_COLUMNS}"
        ))
        .bind(id)
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(device)
    }

    /// Replaces the device's api_key. The old key stops authenticating as
    /// soon as the auth cache entry for its prefix expires or is cleared.
    pub async fn rotate_key(&self, id: i64) -> Result<Option<Device>> {
        let api_key = self.generate_api_key();
        let mut tx = self.pool.begin().await?;

        let device: Option<Device> = sqlx::query_as(&format!(
            "UPDATE devices SET api_key = $2, updated_at = now() WHERE id = $1 \
             RETURNING {DEVICE_COLUMNS}"
        ))
        .bind(id)
        .bind(&api_key)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(device) = &device {
            sqlx::query("INSERT INTO device_credentials (device_id, api_key) VALUES ($1, $2)")
                .bind(device.id)
                .bind(&device.api_key)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(device)
    }

    pub async fn touch_last_seen(&self, id: i64, seen_at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE devices SET last_seen = $2 WHERE id = $1 AND (last_seen IS NULL OR last_seen < $2)")
            .bind(id)
            .bind(seen_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Deletes the device; credential rows go with it via the FK cascade.
    pub async fn delete(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM devices WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list(&self, filter: &ListFilter) -> Result<Vec<Device>> {
        let limit = filter.limit.unwrap_or(100).min(1000);
        let offset = filter.offset.unwrap_or(0);

        let mut conditions = Vec::new();
        if filter.status.is_some() {
            conditions.push(format!("status = ${}", conditions.len() + 1));
        }
        if filter.device_type.is_some() {
            conditions.push(format!("device_type = ${}", conditions.len() + 1));
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let query = format!(
            "SELECT {DEVICE_COLUMNS} FROM devices {where_clause} \
             ORDER BY id LIMIT {limit} OFFSET {offset}"
        );

        let mut query_builder = sqlx::query_as::<_, Device>(&query);
        if let Some(status) = filter.status {
            query_builder = query_builder.bind(status.as_str());
        }
        if let Some(device_type) = &filter.device_type {
            query_builder = query_builder.bind(device_type);
        }

        let devices = query_builder.fetch_all(&self.pool).await?;
        Ok(devices)
    }

    pub async fn count_by_status(&self) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, count(*) FROM devices GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    pub async fn count_all(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT count(*) FROM devices")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Partial device configuration update.
#[derive(Debug, Default, Clone, serde::Deserialize)]
pub struct ConfigPatch {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub firmware_version: Option<String>,
    #[serde(default)]
    pub hardware_version: Option<String>,
    #[serde(default)]
    pub device_type: Option<String>,
}

#[derive(Debug, Default, Clone, serde::Deserialize)]
pub struct ListFilter {
    #[serde(default)]
    pub status: Option<DeviceStatus>,
    #[serde(default)]
    pub device_type: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_key_charset_ok(key: &str) -> bool {
        key.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    }

    fn key_of_len(len: usize) -> String {
        let byte_len = (len * 3).div_ceil(4);
        let mut raw = vec![0u8; byte_len];
        OsRng.fill_bytes(&mut raw);
        let mut key = URL_SAFE_NO_PAD.encode(raw);
        key.truncate(len);
        key
    }

    #[test]
    fn test_api_key_length_and_charset() {
        for len in [16, 32, 48] {
            let key = key_of_len(len);
            assert_eq!(key.len(), len);
            assert!(api_key_charset_ok(&key), "bad charset: {key}");
        }
    }

    #[test]
    fn test_api_keys_do_not_repeat() {
        let a = key_of_len(32);
        let b = key_of_len(32);
        assert_ne!(a, b);
    }

    #[test]
    fn test_unpadded_encoding_of_24_bytes_is_32_chars() {
        let raw = [0u8; 24];
        assert_eq!(URL_SAFE_NO_PAD.encode(raw).len(), 32);
    }
}
