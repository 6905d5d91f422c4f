use std::sync::Arc;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tone_bus::{Admission, PipelineError, PipelineSettings};

use crate::{config::TubeConfig, manager::SessionManager};

pub mod download;
pub mod system;

pub type ApiResult<T> = Result<T, ApiError>;

/// Shared by every handler. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<PipelineSettings>,
    pub admission: Admission,
    pub sessions: Arc<SessionManager>,
    /// Parent of every session token; cancelled on shutdown.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: &TubeConfig, shutdown: CancellationToken) -> Self {
        Self {
            settings: Arc::new(config.pipeline.clone()),
            admission: config.admission(),
            sessions: Arc::new(SessionManager::default()),
            shutdown,
        }
    }
}

pub struct ApiError(anyhow::Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        log::error!("ApiError: {:?}", self.0);
        error_response(StatusCode::INTERNAL_SERVER_ERROR, self.0.to_string())
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

pub(crate) fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// Status for a pipeline error that happened before any byte was sent.
pub(crate) fn pipeline_status(err: &PipelineError) -> StatusCode {
    match err {
        e if e.is_client_error() => StatusCode::BAD_REQUEST,
        PipelineError::Busy => StatusCode::SERVICE_UNAVAILABLE,
        // nobody is listening any more, the status only shows up in logs
        PipelineError::ClientAborted | PipelineError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub(crate) fn pipeline_error_response(err: &PipelineError) -> Response {
    error_response(pipeline_status(err), err.to_string())
}
