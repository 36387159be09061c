//! Sluice Server: HTTP surface and process lifecycle.
//!
//! Serves health, Prometheus metrics, and a small JSON API over the
//! orchestrator:
//! - `GET /api/v1/status`: scheduler, monitor and cache snapshots.
//! - `GET /api/v1/discover/{source_id}[?refresh=true]`: schema discovery.
use anyhow::Context;
use async_trait::async_trait;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::json;
use sluice_common::config::AppConfig;
use sluice_common::telemetry::{init_tracing, shutdown_telemetry};
use sluice_engine::backend::PoolSettings;
use sluice_engine::scheduler::UsageSampler;
use sluice_engine::{
    Backend, BackendExecutor, Orchestrator, Priority, QueryExecutor, QueryParams, ResultSet,
};
use sluice_error::{ErrorCode, SluiceError};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub mod api;
pub mod metrics;

pub use api::{create_api_router, ApiError, AppState};
pub use metrics::{ServerMetrics, METRICS_REFRESH_INTERVAL};

pub struct SluiceServer {
    config_path: String,
    sampler: Option<Arc<dyn UsageSampler>>,
}

impl Default for SluiceServer {
    fn default() -> Self {
        Self {
            config_path: "config/sluice.yaml".to_string(),
            sampler: None,
        }
    }
}

impl SluiceServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config_path: &str) -> Self {
        self.config_path = config_path.to_string();
        self
    }

    /// Replace the host CPU/memory sampler used for admission control.
    pub fn with_usage_sampler(mut self, sampler: Arc<dyn UsageSampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let config = AppConfig::from_file(&self.config_path)?;
        init_tracing(&config.telemetry)?;

        let executor = build_executor(&config)?;
        let orchestrator = Arc::new(match self.sampler {
            Some(sampler) => Orchestrator::with_sampler(&config, executor, sampler),
            None => Orchestrator::new(&config, executor),
        });
        orchestrator.start();

        let state = AppState {
            orchestrator: Arc::clone(&orchestrator),
            metrics: Arc::new(ServerMetrics::new()?),
        };
        let refresh = spawn_metrics_refresh(state.clone());
        let app = build_router(state);

        let addr: SocketAddr = config
            .server
            .listen_addr
            .parse()
            .with_context(|| format!("Invalid listen address: {}", config.server.listen_addr))?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;
        info!("{} listening on {}", config.server.name, addr);

        let served = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await;

        refresh.abort();
        orchestrator.stop().await;
        shutdown_telemetry();
        served.context("HTTP server error")
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state.clone())
        .nest("/api/v1", create_api_router(state))
}

/// Executor for scheduled queries: `server.default_source`, else the only
/// configured source.
pub fn build_executor(config: &AppConfig) -> anyhow::Result<Arc<dyn QueryExecutor>> {
    let source = match &config.server.default_source {
        Some(id) => Some(
            config
                .source(id)
                .with_context(|| format!("default_source '{}' is not configured", id))?,
        ),
        None if config.sources.len() == 1 => config.sources.first(),
        None => None,
    };

    let Some(source) = source else {
        warn!(
            sources = config.sources.len(),
            "No default source selected; scheduled queries will be rejected"
        );
        return Ok(Arc::new(UnroutedExecutor));
    };

    let pool = PoolSettings {
        max_size: config.scheduler.max_concurrent_queries,
        ..PoolSettings::default()
    };
    let backend = Backend::connect(source, pool)
        .with_context(|| format!("Failed to set up source '{}'", source.id))?;
    info!(source_id = %source.id, dialect = %source.dialect, "Scheduled queries run against source");
    Ok(Arc::new(BackendExecutor::new(Arc::new(backend))))
}

struct UnroutedExecutor;

#[async_trait]
impl QueryExecutor for UnroutedExecutor {
    async fn execute_query(
        &self,
        _query: &str,
        _params: &QueryParams,
        _priority: Priority,
    ) -> sluice_error::Result<ResultSet> {
        Err(
            SluiceError::new(ErrorCode::SourceNotFound, "No source is configured for queries")
                .with_hint("Set server.default_source in the configuration file"),
        )
    }
}

fn spawn_metrics_refresh(state: AppState) -> JoinHandle<()> {
    let started = std::time::Instant::now();
    tokio::spawn(async move {
        use sysinfo::{Pid, ProcessesToUpdate, System};
        let mut sys = System::new();
        let pid = Pid::from_u32(std::process::id());

        loop {
            tokio::time::sleep(METRICS_REFRESH_INTERVAL).await;
            sys.refresh_memory();
            sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);

            let status = state.orchestrator.status();
            state.metrics.observe(&status);

            let (process_memory_mb, process_cpu_percent) = sys
                .process(pid)
                .map(|p| (p.memory() / 1024 / 1024, p.cpu_usage()))
                .unwrap_or((0, 0.0));

            info!(
                target: "metrics",
                queued = status.queued_total,
                active_queries = status.active_queries,
                active_batches = status.active_batches,
                executed = status.throughput.executed,
                deduplicated = status.throughput.deduplicated,
                queries_per_sec = status.throughput.queries_per_sec,
                resource_level = %state.orchestrator.monitor().resource_level(),
                uptime_seconds = started.elapsed().as_secs(),
                process_memory_mb,
                process_cpu_percent,
                available_memory_mb = sys.available_memory() / 1024 / 1024,
            );
        }
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("Shutdown signal received, draining scheduler");
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.observe(&state.orchestrator.status());
    match state.metrics.encode() {
        Ok((content_type, body)) => {
            (StatusCode::OK, [(header::CONTENT_TYPE, content_type)], body).into_response()
        }
        Err(e) => {
            error!(target: "errors", "Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
