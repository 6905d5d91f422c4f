use axum::{Router, routing::get};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    config::TubeConfig,
    handler::{AppState, download::download_router, system::system_router},
};

pub(crate) fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .nest("/download", download_router(state.clone()))
        .nest("/system", system_router(state))
}

/// Serve until `cancel` fires. A bind failure cancels the token so the
/// process exits instead of idling without a listener.
pub(crate) fn start_api_server(config: &TubeConfig, cancel: CancellationToken) -> JoinHandle<()> {
    let listen = config.listen.clone();
    let state = AppState::new(config, cancel.clone());
    tokio::spawn(async move {
        let app = app_router(state);

        let listener = match TcpListener::bind(&listen).await {
            Ok(listener) => listener,
            Err(e) => {
                log::error!("API server could not bind {}: {}", listen, e);
                cancel.cancel();
                return;
            }
        };
        log::info!("API server listening on {}", listen);
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(cancel))
            .await
        {
            log::error!("API server failed: {}", e);
        }
    })
}

async fn shutdown_signal(cancel: CancellationToken) {
    cancel.cancelled().await;
    log::info!("Shutting down API server...");
}

async fn index() -> &'static str {
    "tubetone is running"
}
