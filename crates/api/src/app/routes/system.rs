use std::sync::Arc;

use axum::{
    Json,
    extract::Extension,
    response::{IntoResponse, Response},
};
use serde_json::json;

use herald_events::Lane;

use crate::app::errors;
use crate::app::services::AppServices;

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Lane configuration next to live queue gauges.
pub async fn lanes(Extension(services): Extension<Arc<AppServices>>) -> Response {
    let pipeline = services.pipeline();
    let stats = pipeline.stats();
    let lanes: Vec<_> = Lane::ALL
        .into_iter()
        .map(|lane| {
            json!({
                "lane": lane,
                "config": pipeline.config().lanes.get(lane),
                "gauges": stats.lanes.get(&lane),
            })
        })
        .collect();
    Json(json!({ "lanes": lanes })).into_response()
}

pub async fn budgets(Extension(services): Extension<Arc<AppServices>>) -> Response {
    let table = services.pipeline().budgets();
    Json(json!({
        "rules": table.rules(),
        "default": table.default_budget(),
    }))
    .into_response()
}

pub async fn stats(Extension(services): Extension<Arc<AppServices>>) -> Response {
    let pipeline = services.pipeline();
    let staging = match pipeline.staging().stats().await {
        Ok(s) => s,
        Err(e) => return errors::store_error_to_response(e),
    };
    Json(json!({
        "worker_id": pipeline.worker_id(),
        "pipeline": pipeline.stats(),
        "staging": staging,
    }))
    .into_response()
}
