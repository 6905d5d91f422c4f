use tokio_util::sync::CancellationToken;

mod api;
mod config;
mod handler;
mod manager;
mod media;

fn init_logging() {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .filter_module("tubetone", log::LevelFilter::Info)
        .filter_module("tone_bus", log::LevelFilter::Info)
        .parse_default_env()
        .init();
}

#[tokio::main]
async fn main() -> ! {
    init_logging();
    let config = config::init_config().unwrap_or_else(|e| {
        eprintln!("Error loading config: {:#}", e);
        std::process::exit(1);
    });
    log::info!(
        "source {:?}, transcoder {:?}, {} concurrent sessions",
        config.pipeline.source.program,
        config.pipeline.transcoder.program,
        config.max_concurrent_sessions
    );

    let cancel = CancellationToken::new();

    let server = api::start_api_server(config, cancel.clone());

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            },
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
            },
        }
    }

    // running sessions are children of `cancel` and are torn down with it
    if let Err(e) = server.await {
        log::error!("API server task failed: {}", e);
    }
    std::process::exit(0);
}
