use std::time::Duration;

use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;
use tone_bus::process::probe_version;

use crate::handler::AppState;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub fn system_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/tools", get(tools))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct ToolStatus {
    program: String,
    available: bool,
    version: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct SessionSummary {
    active: usize,
    slots_in_use: usize,
    capacity: usize,
    started_total: u64,
}

#[derive(Debug, Serialize)]
struct ToolsReport {
    source: ToolStatus,
    transcoder: ToolStatus,
    sessions: SessionSummary,
}

async fn index() -> &'static str {
    "system route!"
}

async fn probe(program: &str, arg: &str) -> ToolStatus {
    match probe_version(program, arg, PROBE_TIMEOUT).await {
        Ok(version) => ToolStatus {
            program: program.to_string(),
            available: true,
            version: Some(version),
            error: None,
        },
        Err(e) => {
            log::warn!("system: {} {} failed: {}", program, arg, e);
            ToolStatus {
                program: program.to_string(),
                available: false,
                version: None,
                error: Some(e.to_string()),
            }
        }
    }
}

async fn tools(State(state): State<AppState>) -> Json<ToolsReport> {
    let (source, transcoder) = tokio::join!(
        probe(&state.settings.source.program, "--version"),
        probe(&state.settings.transcoder.program, "-version")
    );
    Json(ToolsReport {
        source,
        transcoder,
        sessions: SessionSummary {
            active: state.sessions.active(),
            slots_in_use: state.admission.in_use(),
            capacity: state.admission.capacity(),
            started_total: state.sessions.started_total(),
        },
    })
}
