use axum::{
    Router,
    routing::{get, post},
};

pub mod dlq;
pub mod events;
pub mod system;

/// Router for every endpoint except `/health`.
pub fn router() -> Router {
    Router::new()
        .route("/events", post(events::publish_event))
        .route("/lanes", get(system::lanes))
        .route("/budgets", get(system::budgets))
        .route("/stats", get(system::stats))
        .nest("/dlq", dlq::router())
}
