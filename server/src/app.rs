use crate::auth::Identity;
use crate::cache::Cache;
use crate::config::Config;
use crate::mqtt;
use crate::pipeline::Pipeline;
use crate::routes::{build_router, AppState};
use crate::store::Store;
use crate::tsdb::TimeSeries;
use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// The assembled server: adapters first, then services, then ingresses.
/// Components hold only the narrow handles they consume; teardown runs in
/// reverse construction order.
pub struct App {
    pub state: AppState,
    supervisor: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

impl App {
    pub async fn init(config: Config) -> anyhow::Result<Self> {
        let config = Arc::new(config);

        let store = Store::connect(&config.store, config.auth.api_key_length)
            .await
            .context("device store unreachable")?;
        let tsdb = TimeSeries::connect(&config.tsdb)
            .await
            .context("time-series store unreachable")?;
        let cache = Cache::connect(&config.cache).await;

        let identity = Identity::new(
            store.clone(),
            cache.clone(),
            config.auth.admin_token.clone(),
            config.rate_limits.clone(),
        );
        let pipeline = Pipeline::new(
            tsdb.clone(),
            cache.clone(),
            config.cache.heartbeat_ttl,
            config.pipeline.max_skew,
        );

        let (mqtt, supervisor, dispatcher) = mqtt::start(
            &config.mqtt,
            &config.tsdb,
            identity.clone(),
            pipeline.clone(),
            cache.clone(),
        );

        let state = AppState {
            config,
            store,
            tsdb,
            cache,
            identity,
            pipeline,
            mqtt,
            started_at: tokio::time::Instant::now(),
        };

        Ok(Self {
            state,
            supervisor,
            dispatcher,
        })
    }

    /// Serves HTTP until a task dies or ctrl-c arrives, then tears down.
    pub async fn serve(mut self) -> anyhow::Result<()> {
        let addr = self.state.config.http.address();
        let router = build_router(self.state.clone());
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        info!("HTTP server listening on {addr}");

        let server = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        );

        tokio::select! {
            result = server => {
                result.context("HTTP server failed")?;
            }
            _ = &mut self.supervisor => {
                error!("MQTT supervisor terminated");
            }
            _ = &mut self.dispatcher => {
                error!("telemetry dispatcher terminated");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal");
            }
        }

        self.shutdown().await;
        Ok(())
    }

    async fn shutdown(self) {
        info!("shutting down");
        self.state.mqtt.disconnect().await;
        self.supervisor.abort();
        self.dispatcher.abort();
        self.state.tsdb.close().await;
        self.state.store.close().await;
        info!("shutdown complete");
    }
}
