use std::sync::Arc;

use anyhow::Result;
use llmgate_core::{bootstrap_config_from_env, router, AppState};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("llmgate=info,tower_http=info"));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let config = bootstrap_config_from_env()?;
    let bind = format!("{}:{}", config.host, config.port);
    let state = Arc::new(AppState::build(config)?);

    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(%bind, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
