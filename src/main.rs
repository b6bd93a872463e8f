use anyhow::Context;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use ratelimitd::{
    api,
    config::ServiceConfig,
    limiter::{Limiter, factory},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cfg = ServiceConfig::from_env().context("failed to build service config")?;
    let bind_addr = cfg.bind_addr;

    let limiter = factory::build_limiter(&cfg).await?;
    tracing::info!(
        algorithm = %limiter.algorithm(),
        limit = cfg.engine.limit,
        window_seconds = cfg.engine.window_seconds,
        "admission engine ready"
    );

    let app = api::router(limiter);

    let listener = TcpListener::bind(bind_addr)
        .await
        .context("failed to bind listener")?;

    tracing::info!(addr = %bind_addr, "rate limit service listening");

    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
