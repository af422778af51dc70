use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;
use tracing::{info, warn};

use herald_events::Lane;
use herald_infra::{
    DownstreamHandler, Pipeline, PipelineBuilder, PipelineConfig, PipelineHandle, PostgresDlqStore,
    PostgresStagingStore,
};

use crate::webhook::HttpBatchHandler;

pub const DATABASE_URL_ENV: &str = "DATABASE_URL";
pub const REDIS_URL_ENV: &str = "REDIS_URL";
pub const FAST_HANDLER_URL_ENV: &str = "HERALD_FAST_HANDLER_URL";
pub const STANDARD_HANDLER_URL_ENV: &str = "HERALD_STANDARD_HANDLER_URL";

/// Shared state behind every route.
#[derive(Debug)]
pub struct AppServices {
    pipeline: PipelineHandle,
}

impl AppServices {
    pub fn new(pipeline: PipelineHandle) -> Self {
        Self { pipeline }
    }

    pub fn pipeline(&self) -> &PipelineHandle {
        &self.pipeline
    }
}

/// Select stores and handlers from the environment and start the pipeline.
///
/// `DATABASE_URL` switches staging and the dead-letter queue to Postgres,
/// `REDIS_URL` (with the `redis` feature) switches idempotency to Redis.
/// Anything unset falls back to the in-memory adapter.
pub async fn build_services(config: PipelineConfig) -> anyhow::Result<AppServices> {
    let mut builder = Pipeline::builder(config);

    if let Ok(database_url) = std::env::var(DATABASE_URL_ENV) {
        let pool = PgPool::connect(&database_url)
            .await
            .context("failed to connect to Postgres")?;

        let staging = PostgresStagingStore::new(pool.clone());
        staging.ensure_schema().await.context("staging schema")?;
        let dlq = PostgresDlqStore::new(pool);
        dlq.ensure_schema().await.context("dead-letter schema")?;

        builder = builder.staging(Arc::new(staging)).dlq(Arc::new(dlq));
        info!("using Postgres staging and dead-letter stores");
    } else {
        warn!("{DATABASE_URL_ENV} not set; staged events live in memory only");
    }

    builder = with_idempotency(builder).await?;
    builder = with_handlers(builder)?;

    let pipeline = builder.start().context("failed to start pipeline")?;
    Ok(AppServices::new(pipeline))
}

#[cfg(feature = "redis")]
async fn with_idempotency(builder: PipelineBuilder) -> anyhow::Result<PipelineBuilder> {
    use herald_infra::RedisIdempotencyStore;

    match std::env::var(REDIS_URL_ENV) {
        Ok(url) => {
            let store = RedisIdempotencyStore::connect(&url)
                .await
                .context("failed to connect to Redis")?;
            info!("using Redis idempotency store");
            Ok(builder.idempotency(Arc::new(store)))
        }
        Err(_) => Ok(builder),
    }
}

#[cfg(not(feature = "redis"))]
async fn with_idempotency(builder: PipelineBuilder) -> anyhow::Result<PipelineBuilder> {
    if std::env::var(REDIS_URL_ENV).is_ok() {
        warn!("{REDIS_URL_ENV} is set but this build lacks the `redis` feature");
    }
    Ok(builder)
}

fn with_handlers(mut builder: PipelineBuilder) -> anyhow::Result<PipelineBuilder> {
    let mut configured = 0;
    for (lane, var) in [(Lane::Fast, FAST_HANDLER_URL_ENV), (Lane::Standard, STANDARD_HANDLER_URL_ENV)] {
        if let Ok(url) = std::env::var(var) {
            let handler: Arc<dyn DownstreamHandler> =
                Arc::new(HttpBatchHandler::new(url.clone()).context("failed to build HTTP client")?);
            info!(lane = %lane, url = %url, "downstream handler registered");
            builder = builder.handler(lane, handler);
            configured += 1;
        }
    }
    if configured == 0 {
        warn!("no downstream handler configured; every event will be dead-lettered as unknown_handler");
    }
    Ok(builder)
}
