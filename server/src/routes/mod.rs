pub mod admin;
pub mod devices;
pub mod telemetry;

use crate::auth::Identity;
use crate::cache::Cache;
use crate::config::Config;
use crate::errors::ApiError;
use crate::health;
use crate::metrics::gather_metrics;
use crate::middleware::{request_context, security_headers, track_metrics};
use crate::model::{Device, LivenessRecord, StatusSource};
use crate::mqtt::MqttHandle;
use crate::pipeline::Pipeline;
use crate::store::Store;
use crate::tsdb::TimeSeries;
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Query, Request, State};
use axum::http::HeaderMap;
use axum::middleware::from_fn;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

const MAX_BODY_BYTES: usize = 256 * 1024;

/// Shared handler state: the three adapter handles plus the services built
/// on them. Constructed once by the assembler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Store,
    pub tsdb: TimeSeries,
    pub cache: Cache,
    pub identity: Identity,
    pub pipeline: Pipeline,
    pub mqtt: MqttHandle,
    pub started_at: tokio::time::Instant,
}

/// The middleware chain is data: composed here, in one fixed order, at
/// startup. Outermost first: security headers, request id, timeout, body
/// limit, metrics; rate limiting and auth run per-route inside handlers.
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/devices/register", post(devices::register))
        .route("/devices/status", get(devices::status))
        .route("/devices/heartbeat", post(devices::heartbeat))
        .route(
            "/devices/config",
            get(devices::get_config).put(devices::update_config),
        )
        .route("/devices/mqtt-credentials", get(devices::mqtt_credentials))
        .route("/devices/telemetry", post(devices::submit_telemetry))
        .route("/telemetry/:id", get(telemetry::range))
        .route("/telemetry/:id/latest", get(telemetry::latest))
        .route("/telemetry/:id/aggregated", get(telemetry::aggregated))
        .nest("/admin", admin::router());

    let timeout = TimeoutLayer::new(state.config.http.request_timeout);

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .nest("/api/v1", api)
        .fallback(fallback_handler)
        .layer(from_fn(track_metrics))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(timeout)
        .layer(from_fn(request_context))
        .layer(from_fn(security_headers))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct HealthParams {
    #[serde(default)]
    detailed: bool,
}

async fn health_handler(
    State(state): State<AppState>,
    Query(params): Query<HealthParams>,
) -> Json<health::HealthReport> {
    let report = health::report(
        &state.store,
        &state.tsdb,
        &state.cache,
        &state.mqtt,
        state.started_at,
        params.detailed,
    )
    .await;
    Json(report)
}

async fn metrics_handler() -> String {
    gather_metrics()
}

async fn fallback_handler() -> ApiError {
    ApiError::NotFound("the requested resource was not found".to_string())
}

/// JSON extractor that renders rejections through the error taxonomy instead
/// of axum's plain-text defaults.
pub struct AppJson<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for AppJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(AppJson(value)),
            Err(rejection) => Err(ApiError::Validation(rejection.body_text())),
        }
    }
}

/// Pulls the device api key out of the X-API-Key header.
pub fn api_key_header(headers: &HeaderMap) -> Result<&str, ApiError> {
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            ApiError::AuthRequired("provide an API key in the X-API-Key header".to_string())
        })
}

pub fn admin_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
}

/// Answers the liveness question, preferring the cache and falling back to
/// the store (rehydrating the cache on the way out).
pub async fn liveness_for(state: &AppState, device: &Device) -> LivenessRecord {
    if let Ok(Some(cached)) = state.cache.get_status(device.id).await {
        return LivenessRecord {
            online: cached.online,
            last_seen: cached.last_seen.or(device.last_seen),
            source: StatusSource::Cache,
        };
    }

    let online = device.last_seen.is_some_and(|last_seen| {
        match Utc::now().signed_duration_since(last_seen).to_std() {
            Ok(elapsed) => elapsed <= state.cache.heartbeat_ttl,
            // A last_seen in the future means the contact just happened.
            Err(_) => true,
        }
    });
    if let Err(e) = state.cache.hydrate(device.id, device.last_seen).await {
        tracing::debug!("cache rehydration skipped for device {}: {e}", device.id);
    }
    LivenessRecord {
        online,
        last_seen: device.last_seen,
        source: StatusSource::Store,
    }
}
