use std::sync::Arc;

use anyhow::Context;

const BIND_ENV: &str = "HERALD_BIND";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    herald_observability::init();

    let config = herald_infra::PipelineConfig::load().context("invalid pipeline configuration")?;
    let services = Arc::new(herald_api::app::services::build_services(config).await?);
    let app = herald_api::app::build_app(services.clone());

    let bind = std::env::var(BIND_ENV).unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for ctrl-c");
            }
        })
        .await?;

    let report = services.pipeline().shutdown().await?;
    tracing::info!(
        drained = report.drained,
        aborted_tasks = report.aborted_tasks,
        released = report.released,
        "shutdown complete"
    );
    Ok(())
}
