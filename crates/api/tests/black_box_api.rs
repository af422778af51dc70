use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{Json, Router, routing::post};
use reqwest::StatusCode;
use serde_json::{Value, json};

use herald_api::HttpBatchHandler;
use herald_api::app::{AppServices, build_app};
use herald_core::{CorrelationId, EventId};
use herald_events::{Category, DeliveryResult, Event, EventName, FailureReason, Lane, Priority};
use herald_infra::pipeline::{BatchResults, DownstreamHandler, HandlerError};
use herald_infra::{BackoffConfig, Pipeline, PipelineConfig};

/// Rejects first-generation events whose payload carries `"reject": true`;
/// accepts everything else, including replays.
struct RejectingHandler;

#[async_trait::async_trait]
impl DownstreamHandler for RejectingHandler {
    async fn handle(&self, _lane: Lane, batch: &[Event]) -> Result<BatchResults, HandlerError> {
        Ok(batch
            .iter()
            .map(|event| {
                let reject = event.payload()["reject"].as_bool().unwrap_or(false) && event.replays() == 0;
                let result = if reject {
                    DeliveryResult::failure(FailureReason::permanent("rejected by test handler"))
                } else {
                    DeliveryResult::Success
                };
                (event.id().clone(), result)
            })
            .collect())
    }
}

fn config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.backoff = BackoffConfig {
        min_delay_ms: 10,
        max_delay_ms: 100,
        jitter_pct: 0.0,
    };
    config.producer.poll_interval_ms = 5;
    config.lanes.fast.batch_timeout_ms = 10;
    config.lanes.standard.batch_timeout_ms = 10;
    config
}

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        let pipeline = Pipeline::builder(config())
            .fallback_handler(Arc::new(RejectingHandler))
            .start()
            .expect("pipeline failed to start");
        let app = build_app(Arc::new(AppServices::new(pipeline)));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base_url, handle }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn get_json(client: &reqwest::Client, url: &str) -> (StatusCode, Value) {
    let res = client.get(url).send().await.unwrap();
    let status = res.status();
    (status, res.json().await.unwrap())
}

/// Delivery is asynchronous; poll until `check` accepts the response body.
async fn get_eventually(
    client: &reqwest::Client,
    url: &str,
    check: impl Fn(&Value) -> bool,
) -> Value {
    for _ in 0..200 {
        let (status, body) = get_json(client, url).await;
        if status == StatusCode::OK && check(&body) {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{url} did not reach the expected state in time");
}

#[tokio::test]
async fn health_is_public() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let (status, body) = get_json(&client, &server.url("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn published_event_is_delivered() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(server.url("/events"))
        .json(&json!({
            "id": "order-1",
            "name": "domain.order.created",
            "source": "shop",
            "category": "domain",
            "priority": "critical",
            "payload": {"total": 42},
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["event_id"], "order-1");
    assert_eq!(body["lane"], "fast");
    assert!(body["delivery_id"].is_string());

    let stats = get_eventually(&client, &server.url("/stats"), |s| s["pipeline"]["delivered"] == 1).await;
    assert_eq!(stats["pipeline"]["dead_lettered"], 0);
    assert_eq!(stats["staging"]["pending"], 0);
}

#[tokio::test]
async fn malformed_events_are_refused() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(server.url("/events"))
        .json(&json!({
            "name": "domain.order.created",
            "source": "",
            "category": "domain",
            "payload": {},
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_event");

    let res = client
        .post(server.url("/events"))
        .json(&json!({
            "name": "not a name",
            "source": "shop",
            "category": "domain",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_dead_letter_is_404() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let (status, body) = get_json(&client, &server.url("/dlq/missing")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");

    let res = client.post(server.url("/dlq/missing/replay")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let (status, body) = get_json(&client, &server.url("/dlq?reason=bogus")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");
}

#[tokio::test]
async fn rejected_event_can_be_inspected_replayed_and_deleted() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    for id in ["bad-1", "bad-2"] {
        let res = client
            .post(server.url("/events"))
            .json(&json!({
                "id": id,
                "name": "integration.crm.sync",
                "source": "crm",
                "category": "integration",
                "payload": {"reject": true},
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::ACCEPTED);
    }

    let listing = get_eventually(&client, &server.url("/dlq?reason=rejected"), |b| b["count"] == 2).await;
    assert_eq!(listing["records"][0]["reason"]["code"], "rejected");

    let (status, record) = get_json(&client, &server.url("/dlq/bad-1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(record["event"]["payload"]["reject"], true);
    assert_eq!(record["last_failure"]["kind"], "permanent");

    let (_, stats) = get_json(&client, &server.url("/dlq/stats")).await;
    assert_eq!(stats["total"], 2);

    // Replay publishes a fresh event, which the handler accepts.
    let res = client.post(server.url("/dlq/bad-1/replay")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let receipt: Value = res.json().await.unwrap();
    assert_eq!(receipt["original_event_id"], "bad-1");
    assert_ne!(receipt["new_event_id"], "bad-1");
    get_eventually(&client, &server.url("/stats"), |s| s["pipeline"]["delivered"] == 1).await;

    let res = client.delete(server.url("/dlq/bad-2")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let (status, _) = get_json(&client, &server.url("/dlq/bad-2")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, listing) = get_json(&client, &server.url("/dlq")).await;
    assert_eq!(listing["count"], 0);
}

#[tokio::test]
async fn lanes_and_budgets_expose_configuration() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let (status, body) = get_json(&client, &server.url("/lanes")).await;
    assert_eq!(status, StatusCode::OK);
    let lanes = body["lanes"].as_array().unwrap();
    assert_eq!(lanes.len(), 2);
    assert_eq!(lanes[0]["lane"], "fast");
    assert_eq!(lanes[0]["config"]["batch_timeout_ms"], 10);
    assert_eq!(lanes[1]["gauges"]["in_flight"], 0);

    let (status, body) = get_json(&client, &server.url("/budgets")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["default"]["max_attempts"], 3);
    assert!(body["rules"].is_array());
}

async fn spawn_downstream(router: Router) -> (String, tokio::task::JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/batch", listener.local_addr().unwrap());
    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (url, handle)
}

fn sample_batch() -> Vec<Event> {
    ["a", "b"]
        .into_iter()
        .map(|id| {
            Event::new(
                EventName::new("user.profile.updated").unwrap(),
                "web",
                Category::User,
                Priority::Normal,
                CorrelationId::new("corr").unwrap(),
                json!({"id": id}),
            )
            .with_id(EventId::new(id).unwrap())
        })
        .collect()
}

#[tokio::test]
async fn http_handler_parses_per_event_results() {
    let router = Router::new().route(
        "/batch",
        post(|Json(body): Json<Value>| async move {
            assert_eq!(body["lane"], "standard");
            let mut results = HashMap::new();
            for event in body["events"].as_array().unwrap() {
                let id = event["id"].as_str().unwrap().to_string();
                let result = if id == "a" {
                    json!({"status": "success"})
                } else {
                    json!({"status": "failure", "reason": {"kind": "transient", "detail": "busy"}})
                };
                results.insert(id, result);
            }
            Json(json!({ "results": results }))
        }),
    );
    let (url, server) = spawn_downstream(router).await;

    let handler = HttpBatchHandler::new(url).unwrap();
    let results = handler.handle(Lane::Standard, &sample_batch()).await.unwrap();
    assert_eq!(results[&EventId::new("a").unwrap()], DeliveryResult::Success);
    assert_eq!(
        results[&EventId::new("b").unwrap()],
        DeliveryResult::failure(FailureReason::transient("busy"))
    );

    server.abort();
}

#[tokio::test]
async fn http_handler_maps_error_status() {
    let router = Router::new().route(
        "/batch",
        post(|| async { (axum::http::StatusCode::SERVICE_UNAVAILABLE, "down for maintenance") }),
    );
    let (url, server) = spawn_downstream(router).await;

    let handler = HttpBatchHandler::new(url).unwrap();
    let err = handler.handle(Lane::Fast, &sample_batch()).await.unwrap_err();
    assert_eq!(
        err,
        HandlerError::Status {
            status: 503,
            body: "down for maintenance".to_string(),
        }
    );

    server.abort();
}
