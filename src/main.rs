mod api;
mod clock;
mod config;
mod context;
mod error;
mod gateway;
mod middleware;
mod ratelimit;
mod store;

use std::{
    net::SocketAddr,
    sync::Arc,
};

use anyhow::Context;
use axum::{
    Router,
    body::Body,
    extract::{
        ConnectInfo,
        State,
    },
    http::Request,
    routing::any,
};
use gateway::Gateway;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use crate::config::{GatewayConfig, LogFormat};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = GatewayConfig::from_env().context("failed to build gateway config")?;
    init_tracing(&cfg);

    let bind_addr = cfg.bind_addr;
    tracing::info!(
        strategy = %cfg.rate_limit.strategy,
        window_seconds = cfg.rate_limit.window_seconds,
        backend = cfg.rate_limit.backend.name(),
        fallback_quota = cfg.rate_limit.fallback_quota,
        "rate limiter configured"
    );

    let gateway = Arc::new(Gateway::from_config(cfg).await?);

    let app = Router::new().fallback(any(handler)).with_state(gateway);

    let listener = TcpListener::bind(bind_addr)
        .await
        .context("failed to bind listener")?;

    tracing::info!(addr = %bind_addr, "rate limiting gateway listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .context("gateway server error")?;

    Ok(())
}

async fn handler(
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> axum::response::Response {
    gateway.handle_http(request, Some(addr.ip())).await
}

fn init_tracing(cfg: &GatewayConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},hyper=warn,redis=warn", cfg.log_level))
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match cfg.log_format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Json => builder
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .init(),
    }
}
