use crate::errors::ApiError;
use crate::model::{DeviceCommand, DeviceStatus};
use crate::routes::{admin_header, liveness_for, AppJson, AppState};
use crate::sanitize::sanitize_optional;
use crate::store::{ConfigPatch, ListFilter};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{delete, get, patch, post};
use axum::Json;
use chrono::{Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/devices", get(list_devices))
        .route(
            "/devices/:id",
            get(get_device).put(update_device).delete(delete_device),
        )
        .route("/devices/:id/status", patch(set_status))
        .route("/devices/:id/rotate-key", post(rotate_key))
        .route("/devices/:id/command", post(send_command))
        .route("/stats", get(stats))
        .route("/cache/:id", get(cache_entry).delete(clear_cache_entry))
        .route("/cache", delete(flush_cache))
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    state.identity.authorize_admin(admin_header(headers))
}

async fn fetch_device(state: &AppState, id: i64) -> Result<crate::model::Device, ApiError> {
    state
        .store
        .get_by_id(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("device {id} not found")))
}

/// GET /api/v1/admin/devices
async fn list_devices(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(filter): Query<ListFilter>,
) -> Result<Json<Value>, ApiError> {
    authorize(&state, &headers)?;
    let devices = state.store.list(&filter).await?;
    let total = state.store.count_all().await?;
    Ok(Json(json!({
        "devices": devices,
        "count": devices.len(),
        "total": total,
    })))
}

/// GET /api/v1/admin/devices/{id}
async fn get_device(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    authorize(&state, &headers)?;
    let device = fetch_device(&state, id).await?;
    let liveness = liveness_for(&state, &device).await;
    Ok(Json(json!({
        "device": device,
        "is_online": liveness.online,
        "last_seen": liveness.last_seen,
        "status_source": liveness.source,
    })))
}

/// PUT /api/v1/admin/devices/{id}
async fn update_device(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    AppJson(mut patch): AppJson<ConfigPatch>,
) -> Result<Json<Value>, ApiError> {
    authorize(&state, &headers)?;
    sanitize_optional("description", &mut patch.description)?;
    sanitize_optional("location", &mut patch.location)?;
    sanitize_optional("firmware_version", &mut patch.firmware_version)?;
    sanitize_optional("hardware_version", &mut patch.hardware_version)?;
    sanitize_optional("device_type", &mut patch.device_type)?;

    let device = state
        .store
        .update_config(id, &patch)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("device {id} not found")))?;
    info!("admin updated device {id}");
    Ok(Json(json!({ "message": "device updated", "device": device })))
}

/// DELETE /api/v1/admin/devices/{id}. Cascades credentials, queues a
/// best-effort retention delete, clears caches.
async fn delete_device(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    authorize(&state, &headers)?;
    let device = fetch_device(&state, id).await?;

    if !state.store.delete(id).await? {
        return Err(ApiError::NotFound(format!("device {id} not found")));
    }
    state.identity.invalidate(&device.api_key).await;
    if let Err(e) = state.cache.clear_status(id).await {
        warn!("cache cleanup after delete skipped: {e}");
    }
    match state.tsdb.delete_device(id).await {
        Ok(points) => info!("deleted device {id} and {points} stored points"),
        Err(e) => warn!("retention delete for device {id} failed: {e}"),
    }

    Ok(Json(json!({ "message": "device deleted", "id": id })))
}

#[derive(Debug, Deserialize)]
struct StatusPatch {
    status: DeviceStatus,
}

/// PATCH /api/v1/admin/devices/{id}/status. The only way a device changes
/// administrative state.
async fn set_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    AppJson(patch): AppJson<StatusPatch>,
) -> Result<Json<Value>, ApiError> {
    authorize(&state, &headers)?;
    let device = state
        .store
        .update_status(id, patch.status)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("device {id} not found")))?;
    state.identity.invalidate(&device.api_key).await;
    info!("admin set device {id} to {}", patch.status);
    Ok(Json(json!({
        "message": "device status updated",
        "device": device,
    })))
}

/// POST /api/v1/admin/devices/{id}/rotate-key. Issues a fresh credential;
/// the old key stops working once its cache entry is gone.
async fn rotate_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    authorize(&state, &headers)?;
    let old = fetch_device(&state, id).await?;
    let device = state
        .store
        .rotate_key(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("device {id} not found")))?;
    state.identity.invalidate(&old.api_key).await;
    info!("admin rotated api key for device {id}");
    Ok(Json(json!({
        "message": "api key rotated",
        "device_id": device.id,
        "api_key": device.api_key,
    })))
}

#[derive(Debug, Deserialize)]
struct CommandRequest {
    command: String,
    #[serde(default)]
    parameters: Option<Value>,
}

/// POST /api/v1/admin/devices/{id}/command. Publishes to the device's
/// control topic, QoS 1.
async fn send_command(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    AppJson(request): AppJson<CommandRequest>,
) -> Result<Json<Value>, ApiError> {
    authorize(&state, &headers)?;
    if request.command.is_empty() {
        return Err(ApiError::Validation("command must not be empty".to_string()));
    }
    fetch_device(&state, id).await?;

    let command = DeviceCommand {
        command: request.command,
        parameters: request.parameters,
        command_id: Uuid::new_v4().to_string(),
    };
    state
        .mqtt
        .publish_command(id, &command)
        .await
        .map_err(|e| {
            warn!("command publish failed: {e}");
            ApiError::StoreUnavailable("broker unreachable, command not published".to_string())
        })?;
    info!("admin sent command {} to device {id}", command.command_id);
    Ok(Json(json!({
        "message": "command published",
        "command_id": command.command_id,
        "topic": crate::topics::command_topic(id),
    })))
}

/// GET /api/v1/admin/stats. Fleet and ingestion overview.
async fn stats(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<Value>, ApiError> {
    authorize(&state, &headers)?;
    let total = state.store.count_all().await?;
    let by_status = state.store.count_by_status().await?;
    let points_last_hour = state
        .tsdb
        .count_points_since(Utc::now() - ChronoDuration::hours(1))
        .await
        .unwrap_or(0);
    let cache_stats = state.cache.stats().await.ok();

    let by_status: Value = by_status
        .into_iter()
        .map(|(status, count)| (status, json!(count)))
        .collect::<serde_json::Map<String, Value>>()
        .into();

    Ok(Json(json!({
        "devices": { "total": total, "by_status": by_status },
        "telemetry": { "points_last_hour": points_last_hour },
        "cache": { "available": state.cache.available(), "stats": cache_stats },
        "mqtt": {
            "connected": state.mqtt.is_connected(),
            "queue_depth": state.mqtt.queue.depth(),
        },
    })))
}

/// GET /api/v1/admin/cache/{id}
async fn cache_entry(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    authorize(&state, &headers)?;
    match state.cache.get_status(id).await {
        Ok(Some(cached)) => Ok(Json(json!({
            "device_id": id,
            "online": cached.online,
            "last_seen": cached.last_seen,
        }))),
        Ok(None) => Err(ApiError::NotFound(format!(
            "no cached status for device {id}"
        ))),
        Err(e) => Err(ApiError::StoreUnavailable(e.to_string())),
    }
}

/// DELETE /api/v1/admin/cache/{id}
async fn clear_cache_entry(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    authorize(&state, &headers)?;
    state
        .cache
        .clear_status(id)
        .await
        .map_err(|e| ApiError::StoreUnavailable(e.to_string()))?;
    Ok(Json(json!({ "message": "cache cleared", "device_id": id })))
}

/// DELETE /api/v1/admin/cache
async fn flush_cache(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    authorize(&state, &headers)?;
    let cleared = state
        .cache
        .clear_all()
        .await
        .map_err(|e| ApiError::StoreUnavailable(e.to_string()))?;
    Ok(Json(json!({ "message": "cache flushed", "entries_cleared": cleared })))
}
