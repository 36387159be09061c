use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sluice_engine::monitor::MonitorSnapshot;
use sluice_engine::{CacheStats, DiscoveryResult, Orchestrator, SchedulerStatus};
use sluice_error::{ErrorCategory, ErrorCode, SluiceError};
use std::sync::Arc;

use crate::metrics::ServerMetrics;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub metrics: Arc<ServerMetrics>,
}

pub fn create_api_router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/discover/{source_id}", get(discover))
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub scheduler: SchedulerStatus,
    pub monitor: MonitorSnapshot,
    pub cache: CacheStats,
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let scheduler = state.orchestrator.status();
    state.metrics.observe(&scheduler);
    Json(StatusResponse {
        scheduler,
        monitor: state.orchestrator.monitor().snapshot(),
        cache: state.orchestrator.cache().stats(),
    })
}

#[derive(Debug, Default, Deserialize)]
pub struct DiscoverParams {
    /// Drop the cached result for this source before running.
    #[serde(default)]
    pub refresh: bool,
}

async fn discover(
    State(state): State<AppState>,
    Path(source_id): Path<String>,
    Query(params): Query<DiscoverParams>,
) -> Result<Json<DiscoveryResult>, ApiError> {
    if params.refresh {
        state.orchestrator.discovery().invalidate(Some(source_id.as_str()));
    }
    let result = state.orchestrator.discover_schemas(&source_id).await;
    state.metrics.record_discovery(result.is_ok());
    Ok(Json(result?))
}

/// Engine error rendered as a JSON body with a matching status code.
#[derive(Debug)]
pub struct ApiError(pub SluiceError);

impl From<SluiceError> for ApiError {
    fn from(err: SluiceError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!(
                target: "errors",
                code = %self.0.code,
                source_id = self.0.source_id().unwrap_or("-"),
                "{}",
                self.0.message
            );
        }
        (status, Json(self.0)).into_response()
    }
}

fn status_for(err: &SluiceError) -> StatusCode {
    match err.code {
        ErrorCode::SourceNotFound => StatusCode::NOT_FOUND,
        ErrorCode::DiscoveryAborted => StatusCode::CONFLICT,
        ErrorCode::QueryTimeout => StatusCode::GATEWAY_TIMEOUT,
        _ if err.is_transient() || err.code.category() == ErrorCategory::Connection => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ if err.code.category() == ErrorCategory::Config => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let status = |code| status_for(&SluiceError::new(code, "x"));
        assert_eq!(status(ErrorCode::SourceNotFound), StatusCode::NOT_FOUND);
        assert_eq!(status(ErrorCode::ConnectionFailed), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status(ErrorCode::PoolExhausted), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status(ErrorCode::UnsupportedSourceType), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status(ErrorCode::InvalidConnectionString), StatusCode::BAD_REQUEST);
        assert_eq!(status(ErrorCode::DiscoveryAborted), StatusCode::CONFLICT);
        assert_eq!(status(ErrorCode::InternalPanic), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
