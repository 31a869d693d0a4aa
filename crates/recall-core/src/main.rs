//! Recall - durable conversation log with semantic retrieval.
//!
//! Context engine for conversational agents: every exchange lands in
//! an append-only per-tenant log and, best effort, in a vector index
//! used to assemble similarity-ranked context under a budget.

use std::net::SocketAddr;

use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use recall_core::{api, AppState, Config, Error, Result};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "recall=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    tracing::info!(
        "Starting recall server on {}:{}",
        config.server.host,
        config.server.port
    );

    let state = AppState::new(&config).await?;
    tracing::info!("Application state initialized");

    let app = Router::new()
        .merge(api::routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|_| {
            Error::Configuration(format!(
                "Invalid listen address {}:{}",
                config.server.host, config.server.port
            ))
        })?;

    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
