//! Benchmark dispatch server
//!
//! Accepts runner connections on `/runner/ws`, hands queued benchmark tasks to
//! idle runners and records the results they send back.

mod config;
mod dispatcher;
mod routes;
mod runner;
mod state;

use anyhow::Context;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::ServerConfig;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bench_server=debug,bench_core=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env().context("Invalid configuration")?;
    tracing::info!("Using data directory: {:?}", config.data_dir);
    tracing::info!("Serving archives from: {:?}", config.archive_dir);

    let app_state = AppState::new(&config)
        .await
        .context("Failed to initialize application state")?;

    let dispatcher = app_state.dispatcher();
    let _assigner = dispatcher.spawn_assigner();
    let _event_log = dispatcher.spawn_event_log();
    // Recovered tasks wait for the first runner; nothing is idle yet
    dispatcher.notify_idle();

    let app = routes::app(app_state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    tracing::info!("Listening on {}", config.bind_addr);

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
