use crate::auth::{key_prefix, AuthScope};
use crate::config::RateScope;
use crate::errors::ApiError;
use crate::routes::{admin_header, api_key_header, AppState};
use crate::tsdb::AggregateFn;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

/// Read access to a device's telemetry: the admin token, or the device's own
/// key. Rate-limited before the key is resolved.
async fn authorize_read(
    state: &AppState,
    headers: &HeaderMap,
    device_id: i64,
) -> Result<(), ApiError> {
    if let Some(header) = admin_header(headers) {
        return state.identity.authorize_admin(Some(header));
    }

    let key = api_key_header(headers)?;
    state
        .identity
        .check_rate(RateScope::Default, key_prefix(key))
        .await?;
    let ctx = state
        .identity
        .authenticate(key, AuthScope::ConfigRead)
        .await?;
    if ctx.device_id != device_id {
        return Err(ApiError::AuthFailed(
            "API key does not belong to this device".to_string(),
        ));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct RangeParams {
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub measurement: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// GET /api/v1/telemetry/{id}
pub async fn range(
    State(state): State<AppState>,
    Path(device_id): Path<i64>,
    headers: HeaderMap,
    Query(params): Query<RangeParams>,
) -> Result<Json<Value>, ApiError> {
    authorize_read(&state, &headers, device_id).await?;

    let to = params.to.unwrap_or_else(Utc::now);
    let from = params.from.unwrap_or(to - ChronoDuration::hours(24));
    let limit = params.limit.unwrap_or(100);

    let points = state
        .tsdb
        .query_range(device_id, from, to, params.measurement.as_deref(), limit)
        .await?;

    Ok(Json(json!({
        "device_id": device_id,
        "from": from,
        "to": to,
        "count": points.len(),
        "points": points,
    })))
}

#[derive(Debug, Deserialize)]
pub struct LatestParams {
    #[serde(default)]
    pub measurement: Option<String>,
}

/// GET /api/v1/telemetry/{id}/latest
pub async fn latest(
    State(state): State<AppState>,
    Path(device_id): Path<i64>,
    headers: HeaderMap,
    Query(params): Query<LatestParams>,
) -> Result<Json<Value>, ApiError> {
    authorize_read(&state, &headers, device_id).await?;

    let points = state
        .tsdb
        .query_latest(device_id, params.measurement.as_deref())
        .await?;
    if points.is_empty() {
        return Err(ApiError::NotFound(
            "no telemetry recorded for this device".to_string(),
        ));
    }

    Ok(Json(json!({
        "device_id": device_id,
        "points": points,
    })))
}

#[derive(Debug, Deserialize)]
pub struct AggregateParams {
    pub measurement: String,
    #[serde(default)]
    pub window: Option<String>,
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
    #[serde(default, rename = "fn")]
    pub function: Option<String>,
}

/// GET /api/v1/telemetry/{id}/aggregated?measurement=&window=&from=&to=&fn=
pub async fn aggregated(
    State(state): State<AppState>,
    Path(device_id): Path<i64>,
    headers: HeaderMap,
    Query(params): Query<AggregateParams>,
) -> Result<Json<Value>, ApiError> {
    authorize_read(&state, &headers, device_id).await?;

    let window = parse_window(params.window.as_deref().unwrap_or("1h"))
        .map_err(ApiError::Validation)?;
    let function: AggregateFn = params
        .function
        .as_deref()
        .unwrap_or("mean")
        .parse()
        .map_err(ApiError::Validation)?;
    let to = params.to.unwrap_or_else(Utc::now);
    let from = params.from.unwrap_or(to - ChronoDuration::hours(24));

    let buckets = state
        .tsdb
        .query_aggregate(device_id, &params.measurement, from, to, window, function)
        .await?;

    Ok(Json(json!({
        "device_id": device_id,
        "measurement": params.measurement,
        "window": params.window.as_deref().unwrap_or("1h"),
        "fn": params.function.as_deref().unwrap_or("mean"),
        "count": buckets.len(),
        "data": buckets,
    })))
}

/// Parses compact window notation: `30s`, `5m`, `1h`, `7d`.
pub fn parse_window(raw: &str) -> Result<Duration, String> {
    if raw.len() < 2 {
        return Err(format!("invalid window: {raw}"));
    }
    let (number, unit) = raw.split_at(raw.len() - 1);
    let number: u64 = number
        .parse()
        .map_err(|_| format!("invalid window: {raw}"))?;
    if number == 0 {
        return Err(format!("window must be positive: {raw}"));
    }
    let seconds = match unit {
        "s" => number,
        "m" => number * 60,
        "h" => number * 3_600,
        "d" => number * 86_400,
        _ => return Err(format!("invalid window unit: {raw}")),
    };
    Ok(Duration::from_secs(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_window_units() {
        assert_eq!(parse_window("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_window("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_window("1h").unwrap(), Duration::from_secs(3_600));
        assert_eq!(parse_window("2d").unwrap(), Duration::from_secs(172_800));
    }

    #[test]
    fn test_parse_window_rejects_garbage() {
        for bad in ["", "h", "1x", "-5m", "0h", "1.5h"] {
            assert!(parse_window(bad).is_err(), "should reject: {bad}");
        }
    }
}
