//! Demo tool server behind the session relay.
//!
//! Run with: REDIS_URL=redis://127.0.0.1:6379 cargo run -p mcp-server-demo
//!
//! `REDIS_URL=memory://` runs without Redis; sessions are then only
//! reachable through this process. Exercise it with the `test-client`
//! demo.

mod engine;

use std::sync::Arc;

use anyhow::Context;
use session_relay_core::{Broker, RelayConfig};
use session_relay_session::{MemoryBroker, RedisBroker, SessionRegistry};
use session_relay_transport::{RelayState, relay_router};
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = RelayConfig::from_env().context("Invalid configuration")?;
    let broker = connect_broker(&config.broker_url).await?;
    tracing::info!(
        max_session_secs = config.max_session_duration().as_secs(),
        response_timeout_secs = config.response_timeout.as_secs(),
        "Relay configured"
    );

    let state = RelayState::new(
        broker,
        Arc::new(SessionRegistry::new()),
        &config,
        engine::init(),
    );
    let app = relay_router(state).layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    tracing::info!("Server listening on http://{}", config.bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Pick the broker backend from the URL scheme.
async fn connect_broker(url: &str) -> anyhow::Result<Arc<dyn Broker>> {
    let scheme = url.split_once("://").map_or("", |(scheme, _)| scheme);
    match scheme {
        "memory" => {
            tracing::warn!("Using the in-process broker; follow-ups must reach this process");
            Ok(Arc::new(MemoryBroker::new()))
        }
        "redis" | "rediss" => {
            let broker = RedisBroker::connect(url)
                .await
                .context("Failed to connect to Redis")?;
            Ok(Arc::new(broker))
        }
        other => anyhow::bail!("Unsupported broker URL scheme: {other:?}"),
    }
}
