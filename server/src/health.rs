use crate::cache::Cache;
use crate::mqtt::MqttHandle;
use crate::store::Store;
use crate::tsdb::TimeSeries;
use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::Instant;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Serialize)]
pub struct Check {
    pub healthy: bool,
    pub response_time_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Checks {
    pub store: Check,
    pub ts: Check,
    pub cache: Check,
    pub mqtt: Check,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub checks: Checks,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Composite health. The process is `down` only when the credential store is
/// unreachable; every other failure degrades it.
pub async fn report(
    store: &Store,
    tsdb: &TimeSeries,
    cache: &Cache,
    mqtt: &MqttHandle,
    started_at: Instant,
    detailed: bool,
) -> HealthReport {
    let store_check = probe(store.ping()).await;
    let ts_check = probe(tsdb.ping()).await;
    let cache_check = probe(cache.ping()).await;
    let mqtt_check = Check {
        healthy: mqtt.is_connected(),
        response_time_ms: 0.0,
        note: (!mqtt.is_connected()).then(|| "broker session down, reconnecting".to_string()),
    };

    let status = if !store_check.healthy {
        "down"
    } else if !ts_check.healthy || !cache_check.healthy || !mqtt_check.healthy {
        "degraded"
    } else {
        "healthy"
    };

    let details = if detailed {
        Some(gather_details(store, tsdb, cache, mqtt, started_at).await)
    } else {
        None
    };

    HealthReport {
        status,
        checks: Checks {
            store: store_check,
            ts: ts_check,
            cache: cache_check,
            mqtt: mqtt_check,
        },
        details,
    }
}

async fn probe<F>(fut: F) -> Check
where
    F: std::future::Future<Output = crate::errors::Result<()>>,
{
    let start = Instant::now();
    match tokio::time::timeout(PROBE_TIMEOUT, fut).await {
        Ok(Ok(())) => Check {
            healthy: true,
            response_time_ms: elapsed_ms(start),
            note: None,
        },
        Ok(Err(e)) => Check {
            healthy: false,
            response_time_ms: elapsed_ms(start),
            note: Some(e.to_string()),
        },
        Err(_) => Check {
            healthy: false,
            response_time_ms: elapsed_ms(start),
            note: Some("probe timed out".to_string()),
        },
    }
}

fn elapsed_ms(start: Instant) -> f64 {
    (start.elapsed().as_secs_f64() * 1000.0 * 100.0).round() / 100.0
}

async fn gather_details(
    store: &Store,
    tsdb: &TimeSeries,
    cache: &Cache,
    mqtt: &MqttHandle,
    started_at: Instant,
) -> Value {
    let device_counts = store.count_by_status().await.unwrap_or_default();
    let total_devices = store.count_all().await.unwrap_or(0);
    let points_last_hour = tsdb
        .count_points_since(Utc::now() - ChronoDuration::hours(1))
        .await
        .unwrap_or(0);
    let cache_stats = cache.stats().await.ok();

    let by_status: Value = device_counts
        .into_iter()
        .map(|(status, count)| (status, json!(count)))
        .collect::<serde_json::Map<String, Value>>()
        .into();

    json!({
        "devices": { "total": total_devices, "by_status": by_status },
        "telemetry": { "points_last_hour": points_last_hour },
        "cache": cache_stats,
        "mqtt_queue_depth": mqtt.queue.depth(),
        "uptime_seconds": started_at.elapsed().as_secs(),
    })
}
