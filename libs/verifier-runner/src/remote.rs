//! Remote runner - forwards requests to an execution service speaking the
//! `/run_code` JSON protocol.

use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, warn};
use verifier_common::types::{RunRequest, RunResponse};

use crate::{check_request_size, CodeRunner, RunnerError};

pub const MAX_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(500);
/// Added on top of the execution timeouts for transport and queueing
const REQUEST_SLACK: Duration = Duration::from_secs(10);
const MAX_REQUEST_SECS: f64 = 86_400.0;

#[derive(Debug, Clone)]
pub struct RemoteRunner {
    client: reqwest::Client,
    url: String,
    max_attempts: u32,
}

impl RemoteRunner {
    /// `endpoint` is either the service base URL or the full `/run_code` URL.
    pub fn new(endpoint: &str) -> Result<Self, RunnerError> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            url: run_code_url(endpoint),
            max_attempts: MAX_ATTEMPTS,
        })
    }

    /// At least one attempt, never more than [`MAX_ATTEMPTS`].
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.clamp(1, MAX_ATTEMPTS);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn request_timeout(request: &RunRequest) -> Duration {
        let secs = (request.compile_timeout.max(0.0) + request.run_timeout.max(0.0)).min(MAX_REQUEST_SECS);
        Duration::from_secs_f64(secs) + REQUEST_SLACK
    }
}

fn run_code_url(endpoint: &str) -> String {
    let trimmed = endpoint.trim().trim_end_matches('/');
    if trimmed.ends_with("/run_code") {
        trimmed.to_string()
    } else {
        format!("{}/run_code", trimmed)
    }
}

#[async_trait]
impl CodeRunner for RemoteRunner {
    async fn execute(&self, request: &RunRequest) -> Result<RunResponse, RunnerError> {
        check_request_size(request)?;

        let timeout = Self::request_timeout(request);
        let mut last_error = String::new();

        for attempt in 1..=self.max_attempts {
            match self
                .client
                .post(&self.url)
                .timeout(timeout)
                .json(request)
                .send()
                .await
            {
                Ok(response) => {
                    let status = response.status();
                    if status == StatusCode::PAYLOAD_TOO_LARGE {
                        return Err(RunnerError::RequestTooLarge(format!(
                            "413 Request Entity Too Large from {}",
                            self.url
                        )));
                    }
                    if status.is_success() {
                        match response.json::<RunResponse>().await {
                            Ok(body) => {
                                debug!(attempt, status = %body.status, "Sandbox responded");
                                return Ok(body);
                            }
                            Err(e) => last_error = format!("invalid response body: {}", e),
                        }
                    } else if status.is_client_error() {
                        // the service will reject the same payload again
                        let body = response.text().await.unwrap_or_default();
                        return Ok(RunResponse::infra_error(format!(
                            "Sandbox rejected request ({}): {}",
                            status,
                            body.chars().take(500).collect::<String>()
                        )));
                    } else {
                        last_error = format!("sandbox returned {}", status);
                    }
                }
                Err(e) => last_error = e.to_string(),
            }

            warn!(
                attempt,
                max_attempts = self.max_attempts,
                error = %last_error,
                "Sandbox request failed"
            );
            if attempt < self.max_attempts {
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
            }
        }

        Ok(RunResponse::infra_error(format!(
            "Sandbox unavailable after {} attempts: {}",
            self.max_attempts, last_error
        )))
    }
}
