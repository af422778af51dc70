use std::sync::Arc;

use axum::{
    Json,
    extract::Extension,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

/// Stage an event for delivery. Responds once the event is durably staged,
/// not once it is delivered.
pub async fn publish_event(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::PublishEventRequest>,
) -> Response {
    let event = match body.into_event() {
        Ok(event) => event,
        Err(e) => return errors::core_error_to_response(e),
    };
    let event_id = event.id().clone();
    let lane = event.lane();

    match services.pipeline().publish(event).await {
        Ok(delivery_id) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "delivery_id": delivery_id,
                "event_id": event_id,
                "lane": lane,
            })),
        )
            .into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}
