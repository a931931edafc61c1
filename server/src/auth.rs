use crate::cache::{Cache, RateDecision};
use crate::config::{RateLimits, RateScope};
use crate::errors::ApiError;
use crate::metrics::AUTH_FAILURES_TOTAL;
use crate::model::{DeviceProfile, DeviceStatus, RegisterOutcome};
use crate::store::Store;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const MAX_NAME_LEN: usize = 100;
const MAX_TYPE_LEN: usize = 50;

/// What an authenticated caller is trying to do. The device state machine
/// gates each scope differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScope {
    Telemetry,
    Heartbeat,
    ConfigRead,
    ConfigWrite,
    Status,
}

/// The authenticated device, as much of it as the hot path needs.
#[derive(Debug, Clone, Copy)]
pub struct AuthContext {
    pub device_id: i64,
    pub status: DeviceStatus,
}

#[derive(Debug, Serialize, Deserialize)]
struct AuthCacheEntry {
    device_id: i64,
    api_key: String,
    status: DeviceStatus,
}

/// First 8 chars of an api key; used for log lines, auth-cache keys, and
/// pre-auth rate-limit buckets (keys and devices are 1:1).
pub fn key_prefix(api_key: &str) -> &str {
    api_key.get(..8).unwrap_or(api_key)
}

fn scope_allows(status: DeviceStatus, scope: AuthScope) -> bool {
    match status {
        DeviceStatus::Active => true,
        DeviceStatus::Maintenance => matches!(
            scope,
            AuthScope::Heartbeat | AuthScope::ConfigRead | AuthScope::Status
        ),
        DeviceStatus::Inactive => false,
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Registration, per-request authentication, admin authorization, and the
/// pre-auth rate-limit gate, shared by both ingresses.
#[derive(Clone)]
pub struct Identity {
    store: Store,
    cache: Cache,
    admin_token: String,
    rate_limits: RateLimits,
}

impl Identity {
    pub fn new(store: Store, cache: Cache, admin_token: String, rate_limits: RateLimits) -> Self {
        Self {
            store,
            cache,
            admin_token,
            rate_limits,
        }
    }

    /// Registers a device. A taken name yields the existing id and nothing
    /// else; the existing key is write-once.
    pub async fn register(&self, profile: &DeviceProfile) -> Result<RegisterOutcome, ApiError> {
        if profile.name.is_empty() || profile.name.len() > MAX_NAME_LEN {
            return Err(ApiError::Validation(format!(
                "name must be 1..={MAX_NAME_LEN} characters"
            )));
        }
        if profile.device_type.is_empty() || profile.device_type.len() > MAX_TYPE_LEN {
            return Err(ApiError::Validation(format!(
                "device_type must be 1..={MAX_TYPE_LEN} characters"
            )));
        }
        Ok(self.store.register_device(profile).await?)
    }

    /// Resolves an api key to a device and checks the scope against the
    /// device state machine. Lookups are amortized through a short-lived
    /// cache entry keyed by key prefix.
    pub async fn authenticate(&self, api_key: &str, scope: AuthScope) -> Result<AuthContext, ApiError> {
        if api_key.is_empty() {
            return Err(ApiError::AuthRequired("API key required".to_string()));
        }

        let prefix = key_prefix(api_key);
        let ctx = match self.cached_lookup(prefix, api_key).await {
            Some(ctx) => ctx,
            None => {
                let device = self
                    .store
                    .get_by_api_key(api_key)
                    .await?
                    .ok_or_else(|| {
                        AUTH_FAILURES_TOTAL.inc();
                        warn!("invalid API key attempt: {prefix}...");
                        ApiError::AuthFailed("the provided API key is not valid".to_string())
                    })?;
                let entry = AuthCacheEntry {
                    device_id: device.id,
                    api_key: device.api_key.clone(),
                    status: device.status,
                };
                if let Ok(json) = serde_json::to_string(&entry) {
                    if let Err(e) = self.cache.set_auth_entry(prefix, &json).await {
                        debug!("auth cache write skipped: {e}");
                    }
                }
                AuthContext {
                    device_id: device.id,
                    status: device.status,
                }
            }
        };

        if !scope_allows(ctx.status, scope) {
            AUTH_FAILURES_TOTAL.inc();
            return Err(ApiError::AuthFailed(format!(
                "device is currently {}",
                ctx.status
            )));
        }

        // Every authenticated contact advances last_seen in the store so the
        // cache can rehydrate from it after a miss.
        if let Err(e) = self.store.touch_last_seen(ctx.device_id, Utc::now()).await {
            warn!("failed to update last_seen for device {}: {e}", ctx.device_id);
        }

        Ok(ctx)
    }

    async fn cached_lookup(&self, prefix: &str, api_key: &str) -> Option<AuthContext> {
        let json = self.cache.get_auth_entry(prefix).await.ok()??;
        let entry: AuthCacheEntry = serde_json::from_str(&json).ok()?;
        // Prefixes are not unique by construction; the full key must match.
        if entry.api_key != api_key {
            return None;
        }
        Some(AuthContext {
            device_id: entry.device_id,
            status: entry.status,
        })
    }

    /// Drops the cached auth entry for a key; called by admin mutations.
    pub async fn invalidate(&self, api_key: &str) {
        if let Err(e) = self.cache.invalidate_auth(key_prefix(api_key)).await {
            debug!("auth cache invalidation skipped: {e}");
        }
    }

    /// Admin authorization: `Authorization: admin <token>`.
    pub fn authorize_admin(&self, header: Option<&str>) -> Result<(), ApiError> {
        let value = header
            .ok_or_else(|| ApiError::AuthRequired("admin token required".to_string()))?;
        let token = value
            .strip_prefix("admin ")
            .ok_or_else(|| ApiError::AuthRequired("admin token required".to_string()))?;
        if constant_time_eq(token, &self.admin_token) {
            Ok(())
        } else {
            AUTH_FAILURES_TOTAL.inc();
            Err(ApiError::AuthFailed("invalid admin token".to_string()))
        }
    }

    /// Fixed-window gate; runs before authentication so a brute-force attack
    /// is not amplified through auth cost. Fails open on cache trouble.
    pub async fn check_rate(&self, scope: RateScope, key: &str) -> Result<RateDecision, ApiError> {
        let rule = self.rate_limits.for_scope(scope);
        let decision = self.cache.rate_limit(scope, key, rule).await;
        if decision.allowed {
            debug!(
                "rate {} key={key}: {} of {} left",
                scope.as_str(),
                decision.remaining,
                decision.limit
            );
            Ok(decision)
        } else {
            Err(ApiError::RateLimited {
                limit: decision.limit,
                reset_at: decision.reset_at,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_prefix_is_bounded() {
        assert_eq!(key_prefix("abcdefghij"), "abcdefgh");
        assert_eq!(key_prefix("abc"), "abc");
        assert_eq!(key_prefix(""), "");
    }

    #[test]
    fn test_scope_rules_follow_the_state_machine() {
        use AuthScope::*;
        for scope in [Telemetry, Heartbeat, ConfigRead, ConfigWrite, Status] {
            assert!(scope_allows(DeviceStatus::Active, scope));
            assert!(!scope_allows(DeviceStatus::Inactive, scope));
        }
        assert!(scope_allows(DeviceStatus::Maintenance, Heartbeat));
        assert!(scope_allows(DeviceStatus::Maintenance, ConfigRead));
        assert!(scope_allows(DeviceStatus::Maintenance, Status));
        assert!(!scope_allows(DeviceStatus::Maintenance, Telemetry));
        assert!(!scope_allows(DeviceStatus::Maintenance, ConfigWrite));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("secret", "secret"));
        assert!(!constant_time_eq("secret", "secreT"));
        assert!(!constant_time_eq("secret", "secrets"));
        assert!(!constant_time_eq("", "x"));
    }
}
