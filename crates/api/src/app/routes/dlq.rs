use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;

use herald_core::EventId;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_records))
        .route("/stats", get(dlq_stats))
        .route("/:event_id", get(get_record).delete(delete_record))
        .route("/:event_id/replay", post(replay_record))
}

fn parse_event_id(raw: String) -> Result<EventId, Response> {
    EventId::new(raw).map_err(|e| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", e.to_string()))
}

pub async fn list_records(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::DlqQuery>,
) -> Response {
    let filter = match query.into_filter() {
        Ok(f) => f,
        Err(e) => return errors::core_error_to_response(e),
    };

    match services.pipeline().router().list(&filter).await {
        Ok(records) => {
            let items: Vec<_> = records.iter().map(dto::dlq_summary_to_json).collect();
            Json(json!({ "count": items.len(), "records": items })).into_response()
        }
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn dlq_stats(Extension(services): Extension<Arc<AppServices>>) -> Response {
    match services.pipeline().router().stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn get_record(
    Extension(services): Extension<Arc<AppServices>>,
    Path(event_id): Path<String>,
) -> Response {
    let event_id = match parse_event_id(event_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.pipeline().router().get(&event_id).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => errors::json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("dead-letter record {event_id}"),
        ),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn replay_record(
    Extension(services): Extension<Arc<AppServices>>,
    Path(event_id): Path<String>,
) -> Response {
    let event_id = match parse_event_id(event_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.pipeline().router().replay(&event_id).await {
        Ok(receipt) => (StatusCode::ACCEPTED, Json(receipt)).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn delete_record(
    Extension(services): Extension<Arc<AppServices>>,
    Path(event_id): Path<String>,
) -> Response {
    let event_id = match parse_event_id(event_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.pipeline().router().delete(&event_id).await {
        Ok(record) => Json(json!({
            "deleted": true,
            "event_id": record.event_id,
            "reason": record.reason,
        }))
        .into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}
