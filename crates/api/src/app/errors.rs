use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use herald_core::CoreError;
use herald_infra::{PipelineError, StoreError};

pub fn store_error_to_response(err: StoreError) -> Response {
    match err {
        StoreError::NotFound(msg) => json_error(StatusCode::NOT_FOUND, "not_found", msg),
        StoreError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        StoreError::Unavailable(msg) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", msg)
        }
        StoreError::Serialization(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "serialization_error", msg)
        }
    }
}

pub fn pipeline_error_to_response(err: PipelineError) -> Response {
    match err {
        PipelineError::InvalidEvent(e) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "invalid_event", e.to_string())
        }
        PipelineError::Store(e) => store_error_to_response(e),
        PipelineError::Config(e) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "config_error", e.to_string())
        }
        PipelineError::Shutdown(msg) => json_error(StatusCode::SERVICE_UNAVAILABLE, "shutting_down", msg),
    }
}

pub fn core_error_to_response(err: CoreError) -> Response {
    json_error(StatusCode::BAD_REQUEST, "validation_error", err.to_string())
}

pub fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
