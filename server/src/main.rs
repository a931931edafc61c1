mod app;
mod auth;
mod cache;
mod config;
mod errors;
mod health;
mod metrics;
mod middleware;
mod model;
mod mqtt;
mod pipeline;
mod routes;
mod sanitize;
mod store;
mod tsdb;
mod topics;

use crate::app::App;
use crate::config::Config;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

// Exit codes: 0 graceful shutdown, 1 fatal startup, 2 configuration error.

#[tokio::main]
async fn main() {
    let log_level =
        std::env::var("IOTFLOW_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {e}");
            std::process::exit(2);
        }
    };

    info!("starting IoTFlow connectivity layer");
    info!(
        "MQTT broker: {}:{}, HTTP: {}",
        config.mqtt.host,
        config.mqtt.port,
        config.http.address()
    );

    metrics::init_metrics();

    let app = match App::init(config).await {
        Ok(app) => app,
        Err(e) => {
            error!("fatal startup error: {e:#}");
            std::process::exit(1);
        }
    };

    if let Err(e) = app.serve().await {
        error!("server error: {e:#}");
        std::process::exit(1);
    }
}
