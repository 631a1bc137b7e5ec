use anyhow::Context;

use flashsale_infra::config::AppConfig;
use flashsale_infra::context::Backends;
use flashsale_observability::LogConfig;
use flashsale_server::App;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_config = LogConfig::from_env().context("invalid logging configuration")?;
    let _log_guard = flashsale_observability::init(&log_config);

    let config = AppConfig::from_env().context("invalid configuration")?;
    let backends = Backends::connect(&config)
        .await
        .context("failed to connect to backing services")?;

    let app = App::start(config, backends).await.context("startup failed")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for the shutdown signal")?;
    tracing::info!("shutdown signal received");

    app.shutdown().await;
    Ok(())
}
