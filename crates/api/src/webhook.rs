//! Downstream handler that POSTs each batch to an HTTP endpoint.
//!
//! Request body:
//!
//! ```json
//! {"lane": "fast", "events": [ { ...event... } ]}
//! ```
//!
//! Expected response (2xx):
//!
//! ```json
//! {"results": {"evt-1": {"status": "success"},
//!              "evt-2": {"status": "failure", "reason": {"kind": "transient", "detail": "busy"}}}}
//! ```
//!
//! Events missing from `results` are treated as missing results by the
//! pipeline. Transport errors and non-2xx statuses fail the whole batch.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use herald_events::{Event, Lane};
use herald_infra::pipeline::{BatchResults, DownstreamHandler, HandlerError};

/// Largest response body echoed into an error message.
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Serialize)]
struct BatchRequest<'a> {
    lane: Lane,
    events: &'a [Event],
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    results: BatchResults,
}

#[derive(Debug, Clone)]
pub struct HttpBatchHandler {
    client: reqwest::Client,
    url: String,
}

impl HttpBatchHandler {
    pub fn new(url: impl Into<String>) -> Result<Self, HandlerError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| HandlerError::Transport(e.to_string()))?;
        Ok(Self::with_client(client, url))
    }

    pub fn with_client(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait::async_trait]
impl DownstreamHandler for HttpBatchHandler {
    async fn handle(&self, lane: Lane, batch: &[Event]) -> Result<BatchResults, HandlerError> {
        debug!(url = %self.url, lane = %lane, count = batch.len(), "posting batch");
        let response = self
            .client
            .post(&self.url)
            .json(&BatchRequest { lane, events: batch })
            .send()
            .await
            .map_err(|e| HandlerError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(HandlerError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: BatchResponse = response
            .json()
            .await
            .map_err(|e| HandlerError::InvalidResponse(e.to_string()))?;
        Ok(parsed.results)
    }
}
