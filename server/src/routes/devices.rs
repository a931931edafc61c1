use crate::auth::{key_prefix, AuthScope};
use crate::config::RateScope;
use crate::errors::ApiError;
use crate::metrics::DEVICES_REGISTERED_TOTAL;
use crate::model::{DeviceProfile, RegisterOutcome, TelemetrySubmission};
use crate::pipeline::{IngestOutcome, Submission};
use crate::routes::{api_key_header, liveness_for, AppJson, AppState};
use crate::sanitize::{check_map_shape, sanitize_map, sanitize_optional, sanitize_text};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use tracing::{info, warn};

/// POST /api/v1/devices/register. Rate limited per client IP, no auth.
pub async fn register(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    AppJson(mut profile): AppJson<DeviceProfile>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .identity
        .check_rate(RateScope::Registration, &addr.ip().to_string())
        .await?;

    profile.name = sanitize_text("name", &profile.name)?;
    profile.device_type = sanitize_text("device_type", &profile.device_type)?;
    sanitize_optional("description", &mut profile.description)?;
    sanitize_optional("location", &mut profile.location)?;
    sanitize_optional("firmware_version", &mut profile.firmware_version)?;
    sanitize_optional("hardware_version", &mut profile.hardware_version)?;

    match state.identity.register(&profile).await? {
        RegisterOutcome::Registered(device) => {
            DEVICES_REGISTERED_TOTAL.inc();
            Ok((
                StatusCode::CREATED,
                Json(json!({
                    "message": "device registered successfully",
                    "device": {
                        "id": device.id,
                        "name": device.name,
                        "device_type": device.device_type,
                        "api_key": device.api_key,
                        "status": device.status,
                        "created_at": device.created_at,
                    },
                })),
            ))
        }
        RegisterOutcome::NameTaken { existing_id } => Err(ApiError::Conflict {
            message: "device name already exists".to_string(),
            existing_id,
        }),
    }
}

/// GET /api/v1/devices/status. The device's own view of its liveness.
pub async fn status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let key = api_key_header(&headers)?;
    state
        .identity
        .check_rate(RateScope::Default, key_prefix(key))
        .await?;
    let ctx = state.identity.authenticate(key, AuthScope::Status).await?;

    let device = state
        .store
        .get_by_id(ctx.device_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("device not found".to_string()))?;
    let liveness = liveness_for(&state, &device).await;

    Ok(Json(json!({
        "id": device.id,
        "name": device.name,
        "status": device.status,
        "is_online": liveness.online,
        "last_seen": liveness.last_seen,
        "status_source": liveness.source,
    })))
}

/// POST /api/v1/devices/heartbeat. Cheapest way to stay online.
pub async fn heartbeat(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let key = api_key_header(&headers)?;
    state
        .identity
        .check_rate(RateScope::Heartbeat, key_prefix(key))
        .await?;
    let ctx = state
        .identity
        .authenticate(key, AuthScope::Heartbeat)
        .await?;

    let now = Utc::now();
    if let Err(e) = state
        .cache
        .set_online(ctx.device_id, now, state.cache.heartbeat_ttl)
        .await
    {
        warn!("heartbeat liveness update skipped: {e}");
    }

    Ok(Json(json!({ "ok": true, "last_seen": now })))
}

/// Fields a device may change about itself. Status changes are admin-only.
#[derive(Debug, Deserialize)]
pub struct DeviceConfigUpdate {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub firmware_version: Option<String>,
}

/// GET /api/v1/devices/config
pub async fn get_config(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let key = api_key_header(&headers)?;
    state
        .identity
        .check_rate(RateScope::Default, key_prefix(key))
        .await?;
    let ctx = state
        .identity
        .authenticate(key, AuthScope::ConfigRead)
        .await?;

    let device = state
        .store
        .get_by_id(ctx.device_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("device not found".to_string()))?;
    Ok(Json(json!({ "device": device })))
}

/// PUT /api/v1/devices/config
pub async fn update_config(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppJson(mut update): AppJson<DeviceConfigUpdate>,
) -> Result<Json<Value>, ApiError> {
    let key = api_key_header(&headers)?;
    state
        .identity
        .check_rate(RateScope::Default, key_prefix(key))
        .await?;
    let ctx = state
        .identity
        .authenticate(key, AuthScope::ConfigWrite)
        .await?;

    sanitize_optional("description", &mut update.description)?;
    sanitize_optional("location", &mut update.location)?;
    sanitize_optional("firmware_version", &mut update.firmware_version)?;

    let patch = crate::store::ConfigPatch {
        description: update.description,
        location: update.location,
        firmware_version: update.firmware_version,
        ..Default::default()
    };
    let device = state
        .store
        .update_config(ctx.device_id, &patch)
        .await?
        .ok_or_else(|| ApiError::NotFound("device not found".to_string()))?;

    info!("device {} updated its configuration", device.id);
    Ok(Json(json!({
        "message": "device configuration updated",
        "device": device,
    })))
}

/// GET /api/v1/devices/mqtt-credentials. Broker coordinates for this
/// device; the broker password is the device api key.
pub async fn mqtt_credentials(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let key = api_key_header(&headers)?;
    state
        .identity
        .check_rate(RateScope::Default, key_prefix(key))
        .await?;
    let ctx = state
        .identity
        .authenticate(key, AuthScope::ConfigRead)
        .await?;

    let device = state
        .store
        .get_by_id(ctx.device_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("device not found".to_string()))?;

    Ok(Json(json!({
        "broker_host": state.config.mqtt.host,
        "broker_port": state.config.mqtt.port,
        "username": device.name,
        "password": key,
    })))
}

/// POST /api/v1/devices/telemetry. The synchronous ingestion path.
pub async fn submit_telemetry(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppJson(mut submission): AppJson<TelemetrySubmission>,
) -> Result<impl IntoResponse, ApiError> {
    let key = api_key_header(&headers)?;
    state
        .identity
        .check_rate(RateScope::Telemetry, key_prefix(key))
        .await?;
    let ctx = state
        .identity
        .authenticate(key, AuthScope::Telemetry)
        .await?;

    // Shape limits first, then the string scrub, over the whole body.
    check_map_shape(&submission.data)?;
    sanitize_map(&mut submission.data)?;
    if let Some(metadata) = &mut submission.metadata {
        check_map_shape(metadata)?;
        sanitize_map(metadata)?;
    }

    let outcome = state
        .pipeline
        .ingest(
            ctx.device_id,
            Submission {
                data: submission.data,
                metadata: submission.metadata,
                timestamp: submission.timestamp,
            },
        )
        .await?;

    match outcome {
        IngestOutcome::Accepted { written, timestamp } => Ok((
            StatusCode::ACCEPTED,
            Json(json!({
                "message": "telemetry accepted",
                "points_written": written,
                "timestamp": timestamp,
            })),
        )),
        IngestOutcome::Partial {
            written,
            rejected,
            timestamp,
        } => Ok((
            StatusCode::MULTI_STATUS,
            Json(json!({
                "error": "PartialWrite",
                "partial": true,
                "points_written": written,
                "rejected": rejected,
                "timestamp": timestamp,
            })),
        )),
    }
}
