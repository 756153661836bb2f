use std::sync::Arc;

use anyhow::Context;

use factorops_api::app::{build_app, services::build_services};
use factorops_api::config::ApiConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    factorops_observability::init();

    let config = ApiConfig::from_env().context("invalid configuration")?;
    let services = Arc::new(build_services(&config));
    let app = build_app(services);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
