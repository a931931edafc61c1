use crate::config::{CacheConfig, RateRule, RateScope};
use crate::errors::{Error, Result};
use crate::metrics::RATE_LIMITED_TOTAL;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, ErrorKind, RedisError};
use std::time::Duration;
use tracing::{debug, info, warn};

const STATUS_PREFIX: &str = "device:status:";
const LASTSEEN_PREFIX: &str = "device:lastseen:";
const RATELIMIT_PREFIX: &str = "ratelimit:";
const AUTH_PREFIX: &str = "auth:key:";

// Last-seen entries outlive the heartbeat window so the status endpoint can
// answer "offline since when" without a store round-trip.
const LASTSEEN_TTL: Duration = Duration::from_secs(60 * 60 * 24);

/// Rate-limit verdict for one request.
#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

/// Cache-side liveness snapshot; `None` means a miss.
#[derive(Debug, Clone)]
pub struct CachedStatus {
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub status_count: usize,
    pub lastseen_count: usize,
    pub memory_used: Option<String>,
    pub uptime_seconds: Option<u64>,
}

/// Wraps the in-memory cache daemon. The connection is optional: when the
/// daemon is unreachable the cache degrades instead of failing requests, and
/// the rate limiter always answers `allowed`.
#[derive(Clone)]
pub struct Cache {
    conn: Option<ConnectionManager>,
    pub heartbeat_ttl: Duration,
    pub auth_cache_ttl: Duration,
}

impl Cache {
    pub async fn connect(cfg: &CacheConfig) -> Self {
        let conn = match Self::open(&cfg.url).await {
            Ok(conn) => {
                info!("cache connection established");
                Some(conn)
            }
            Err(e) => {
                warn!("cache connection failed, running degraded: {e}");
                None
            }
        };
        Self {
            conn,
            heartbeat_ttl: cfg.heartbeat_ttl,
            auth_cache_ttl: cfg.auth_cache_ttl,
        }
    }

    async fn open(url: &str) -> std::result::Result<ConnectionManager, RedisError> {
        let client = Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        let mut conn = manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(manager)
    }

    pub fn available(&self) -> bool {
        self.conn.is_some()
    }

    fn handle(&self) -> Result<ConnectionManager> {
        self.conn.clone().ok_or_else(|| {
            Error::Cache(RedisError::from((ErrorKind::IoError, "cache unavailable")))
        })
    }

    /// Marks the device online: status with the heartbeat TTL, last-seen with
    /// the long TTL.
    pub async fn set_online(
        &self,
        device_id: i64,
        seen_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<()> {
        let mut conn = self.handle()?;
        redis::pipe()
            .set_ex(
                format!("{STATUS_PREFIX}{device_id}"),
                "online",
                ttl.as_secs(),
            )
            .ignore()
            .set_ex(
                format!("{LASTSEEN_PREFIX}{device_id}"),
                seen_at.to_rfc3339(),
                LASTSEEN_TTL.as_secs(),
            )
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(Error::Cache)?;
        debug!("device {device_id} marked online until +{}s", ttl.as_secs());
        Ok(())
    }

    pub async fn set_offline(&self, device_id: i64) -> Result<()> {
        let mut conn = self.handle()?;
        conn.set_ex::<_, _, ()>(
            format!("{STATUS_PREFIX}{device_id}"),
            "offline",
            LASTSEEN_TTL.as_secs(),
        )
        .await
        .map_err(Error::Cache)?;
        Ok(())
    }

    /// Cache-side status lookup. `None` means the caller should fall back to
    /// the store and then [`hydrate`](Self::hydrate).
    pub async fn get_status(&self, device_id: i64) -> Result<Option<CachedStatus>> {
        let mut conn = self.handle()?;
        let (status, last_seen): (Option<String>, Option<String>) = redis::pipe()
            .get(format!("{STATUS_PREFIX}{device_id}"))
            .get(format!("{LASTSEEN_PREFIX}{device_id}"))
            .query_async(&mut conn)
            .await
            .map_err(Error::Cache)?;

        if status.is_none() && last_seen.is_none() {
            return Ok(None);
        }
        let last_seen = last_seen
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc));
        Ok(Some(CachedStatus {
            online: status.as_deref() == Some("online"),
            last_seen,
        }))
    }

    /// Refills the cache after a store fallback.
    pub async fn hydrate(&self, device_id: i64, last_seen: Option<DateTime<Utc>>) -> Result<()> {
        let Some(last_seen) = last_seen else {
            return Ok(());
        };
        let elapsed = Utc::now().signed_duration_since(last_seen);
        let ttl = self.heartbeat_ttl.saturating_sub(elapsed.to_std().unwrap_or_default());
        if ttl.is_zero() {
            let mut conn = self.handle()?;
            conn.set_ex::<_, _, ()>(
                format!("{LASTSEEN_PREFIX}{device_id}"),
                last_seen.to_rfc3339(),
                LASTSEEN_TTL.as_secs(),
            )
            .await
            .map_err(Error::Cache)?;
            Ok(())
        } else {
            self.set_online(device_id, last_seen, ttl).await
        }
    }

    pub async fn clear_status(&self, device_id: i64) -> Result<()> {
        let mut conn = self.handle()?;
        redis::pipe()
            .del(format!("{STATUS_PREFIX}{device_id}"))
            .ignore()
            .del(format!("{LASTSEEN_PREFIX}{device_id}"))
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(Error::Cache)?;
        info!("cleared cached status for device {device_id}");
        Ok(())
    }

    pub async fn clear_all(&self) -> Result<usize> {
        let status = self.delete_matching(&format!("{STATUS_PREFIX}*")).await?;
        let lastseen = self.delete_matching(&format!("{LASTSEEN_PREFIX}*")).await?;
        info!("cleared all device caches ({status} status, {lastseen} last seen)");
        Ok(status + lastseen)
    }

    async fn delete_matching(&self, pattern: &str) -> Result<usize> {
        let keys = self.keys_matching(pattern).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.handle()?;
        conn.del::<_, ()>(&keys).await.map_err(Error::Cache)?;
        Ok(keys.len())
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.handle()?;
        let mut keys = Vec::new();
        let mut iter = conn
            .scan_match::<_, String>(pattern)
            .await
            .map_err(Error::Cache)?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }

    /// Fixed-window counter. The first hit in a window sets the counter and
    /// its expiry atomically; exhaustion answers with the window reset time.
    /// Any cache failure fails open.
    pub async fn rate_limit(&self, scope: RateScope, key: &str, rule: RateRule) -> RateDecision {
        let open = RateDecision {
            allowed: true,
            limit: rule.limit,
            remaining: rule.limit.saturating_sub(1),
            reset_at: Utc::now() + rule.window,
        };

        let mut conn = match self.handle() {
            Ok(conn) => conn,
            Err(_) => {
                warn!("rate limiter degraded: cache unavailable, allowing request");
                return open;
            }
        };

        let bucket = format!("{RATELIMIT_PREFIX}{}:{key}", scope.as_str());
        let result: std::result::Result<(u64, i64), RedisError> = async {
            let (count,): (u64,) = redis::pipe()
                .atomic()
                .incr(&bucket, 1u64)
                .cmd("EXPIRE")
                .arg(&bucket)
                .arg(rule.window.as_secs())
                .arg("NX")
                .ignore()
                .query_async(&mut conn)
                .await?;
            let ttl: i64 = conn.ttl(&bucket).await?;
            Ok((count, ttl))
        }
        .await;

        match result {
            Ok((count, ttl)) => {
                let reset_at = Utc::now() + Duration::from_secs(ttl.max(0) as u64);
                let allowed = count <= rule.limit as u64;
                if !allowed {
                    RATE_LIMITED_TOTAL.inc();
                }
                RateDecision {
                    allowed,
                    limit: rule.limit,
                    remaining: (rule.limit as u64).saturating_sub(count) as u32,
                    reset_at,
                }
            }
            Err(e) => {
                warn!("rate limiter degraded ({e}), allowing request");
                open
            }
        }
    }

    /// Short-lived authentication cache entry, keyed by api-key prefix.
    pub async fn set_auth_entry(&self, prefix: &str, entry: &str) -> Result<()> {
        let mut conn = self.handle()?;
        conn.set_ex::<_, _, ()>(
            format!("{AUTH_PREFIX}{prefix}"),
            entry,
            self.auth_cache_ttl.as_secs(),
        )
        .await
        .map_err(Error::Cache)?;
        Ok(())
    }

    pub async fn get_auth_entry(&self, prefix: &str) -> Result<Option<String>> {
        let mut conn = self.handle()?;
        let entry: Option<String> = conn
            .get(format!("{AUTH_PREFIX}{prefix}"))
            .await
            .map_err(Error::Cache)?;
        Ok(entry)
    }

    pub async fn invalidate_auth(&self, prefix: &str) -> Result<()> {
        let mut conn = self.handle()?;
        conn.del::<_, ()>(format!("{AUTH_PREFIX}{prefix}"))
            .await
            .map_err(Error::Cache)?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        let status_count = self.keys_matching(&format!("{STATUS_PREFIX}*")).await?.len();
        let lastseen_count = self
            .keys_matching(&format!("{LASTSEEN_PREFIX}*"))
            .await?
            .len();

        let mut conn = self.handle()?;
        let info: String = redis::cmd("INFO")
            .query_async(&mut conn)
            .await
            .map_err(Error::Cache)?;

        Ok(CacheStats {
            status_count,
            lastseen_count,
            memory_used: info_field(&info, "used_memory_human"),
            uptime_seconds: info_field(&info, "uptime_in_seconds").and_then(|v| v.parse().ok()),
        })
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.handle()?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(Error::Cache)?;
        Ok(())
    }
}

fn info_field(info: &str, field: &str) -> Option<String> {
    info.lines()
        .find_map(|line| line.strip_prefix(&format!("{field}:")))
        .map(|v| v.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_field_parsing() {
        let blob = "# Memory\r\nused_memory:1024\r\nused_memory_human:1.00K\r\n# Server\r\nuptime_in_seconds:42\r\n";
        assert_eq!(info_field(blob, "used_memory_human").as_deref(), Some("1.00K"));
        assert_eq!(info_field(blob, "uptime_in_seconds").as_deref(), Some("42"));
        assert_eq!(info_field(blob, "missing"), None);
    }

    #[test]
    fn test_degraded_cache_reports_unavailable() {
        let cache = Cache {
            conn: None,
            heartbeat_ttl: Duration::from_secs(120),
            auth_cache_ttl: Duration::from_secs(30),
        };
        assert!(!cache.available());
        assert!(cache.handle().is_err());
    }

    #[test]
    fn test_degraded_rate_limiter_fails_open() {
        let cache = Cache {
            conn: None,
            heartbeat_ttl: Duration::from_secs(120),
            auth_cache_ttl: Duration::from_secs(30),
        };
        let rule = RateRule {
            limit: 10,
            window: Duration::from_secs(60),
        };
        let decision =
            tokio_test::block_on(cache.rate_limit(RateScope::Telemetry, "dev-1", rule));
        assert!(decision.allowed);
        assert_eq!(decision.limit, 10);
    }
}
