use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use axum::{
    Json, Router,
    body::Body,
    extract::{Query, State, rejection::QueryRejection},
    http::{StatusCode, header},
    response::Response,
    routing::get,
};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tone_bus::{
    OutputFormat, PipelineError, PipelineRequest, PipelineResult, PipelineSession,
    source::SourceProvider,
};

use crate::{
    handler::{ApiResult, AppState, error_response, pipeline_error_response},
    manager::{SessionInfo, SessionManager},
    media::disposition::content_disposition,
};

/// How long a ready first chunk waits for a still-running title lookup.
const TITLE_GRACE: Duration = Duration::from_millis(300);

pub fn download_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(download))
        .route("/active", get(list_active))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct DownloadQuery {
    id: Option<String>,
    #[serde(alias = "bitrate")]
    quality: Option<String>,
}

async fn download(
    State(state): State<AppState>,
    query: Result<Query<DownloadQuery>, QueryRejection>,
) -> ApiResult<Response> {
    let query = match query {
        Ok(Query(query)) => query,
        Err(rejection) => {
            log::info!("download: rejected query: {}", rejection.body_text());
            return Ok(error_response(
                StatusCode::BAD_REQUEST,
                format!("invalid request: {}", rejection.body_text()),
            ));
        }
    };
    let request = match PipelineRequest::parse(query.id.as_deref(), query.quality.as_deref()) {
        Ok(request) => request,
        Err(e) => {
            log::info!("download: rejected {:?}: {}", query, e);
            return Ok(pipeline_error_response(&e));
        }
    };

    let permit = match state.admission.admit().await {
        Ok(permit) => permit,
        Err(e) => {
            log::warn!(
                "download: {} turned away, {} of {} slots busy",
                request.video_id,
                state.admission.in_use(),
                state.admission.capacity()
            );
            return Ok(pipeline_error_response(&e));
        }
    };

    let provider = SourceProvider::new(state.settings.source.clone());
    let video_id = request.video_id.clone();
    let mut session =
        match PipelineSession::start(request, &state.settings, Some(permit), &state.shutdown) {
            Ok(session) => session,
            Err(e) => {
                log::error!("download: {} could not start: {}", video_id, e);
                return Ok(pipeline_error_response(&e));
            }
        };
    let registration = Registration::new(&state.sessions, &session);

    // headers wait for the first chunk so early failures still get a status;
    // the title lookup runs meanwhile but never holds up either outcome
    let title_lookup = provider.fetch_title(&video_id);
    tokio::pin!(title_lookup);
    let mut title = None;
    let mut title_done = false;
    let first = loop {
        tokio::select! {
            item = session.next() => break item,
            found = &mut title_lookup, if !title_done => {
                title = found;
                title_done = true;
            }
        }
    };
    let first = match first {
        Some(Ok(chunk)) => chunk,
        Some(Err(e)) => {
            session.close().await;
            log::warn!("download: {} failed before streaming: {}", video_id, e);
            return Ok(pipeline_error_response(&e));
        }
        None => {
            session.close().await;
            let e = if state.shutdown.is_cancelled() {
                PipelineError::Cancelled
            } else {
                PipelineError::TranscodeFailed {
                    diagnostic: "pipeline ended without output".to_string(),
                }
            };
            log::warn!("download: {} failed before streaming: {}", video_id, e);
            return Ok(pipeline_error_response(&e));
        }
    };

    if !title_done {
        match tokio::time::timeout(TITLE_GRACE, &mut title_lookup).await {
            Ok(found) => title = found,
            Err(_) => log::debug!("download: no title for {} yet, naming file by id", video_id),
        }
    }

    log::info!(
        "download: session {} streaming {} at {}",
        session.id(),
        video_id,
        session.request().bitrate
    );
    let disposition = content_disposition(title.as_deref(), &video_id);
    let body = DownloadBody {
        first: Some(first),
        session,
        _registration: registration,
    };

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, OutputFormat::CONTENT_TYPE)
        .header(header::CONTENT_DISPOSITION, disposition)
        .header(header::CACHE_CONTROL, "no-store")
        .body(Body::from_stream(body))?;
    Ok(response)
}

async fn list_active(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.sessions.list())
}

/// Keeps a session listed for exactly as long as its response lives.
struct Registration {
    id: String,
    sessions: Arc<SessionManager>,
}

impl Registration {
    fn new(sessions: &Arc<SessionManager>, session: &PipelineSession) -> Self {
        sessions.register(session);
        Self {
            id: session.id().to_string(),
            sessions: Arc::clone(sessions),
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.sessions.deregister(&self.id);
    }
}

/// Response body: the chunk that unlocked the headers, then the rest of the
/// session. An `Err` item makes hyper abort the connection, so a client never
/// sees a truncated file as complete. Dropping the body (client gone) drops
/// the session, which kills both tools.
struct DownloadBody {
    first: Option<Bytes>,
    session: PipelineSession,
    _registration: Registration,
}

impl Stream for DownloadBody {
    type Item = PipelineResult<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(first) = self.first.take() {
            return Poll::Ready(Some(Ok(first)));
        }
        match self.session.poll_next_unpin(cx) {
            Poll::Ready(Some(Err(e))) => {
                log::error!(
                    "download: session {} aborted after {} bytes: {}",
                    self.session.id(),
                    self.session.stats().output_bytes(),
                    e
                );
                Poll::Ready(Some(Err(e)))
            }
            other => other,
        }
    }
}

#[cfg(test)]
#[path = "download_test.rs"]
mod download_test;
