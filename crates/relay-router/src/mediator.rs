//! Mediator - one HTTP delivery attempt per call
//!
//! The processing pool drives retries through broker redelivery, so the
//! mediator itself never retries: every call resolves to exactly one
//! [`MediationOutcome`].

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use relay_common::{MediationOutcome, MediationType, MessagePointer};

/// Trait for executing one mediation attempt.
#[async_trait]
pub trait Mediator: Send + Sync {
    async fn process(&self, pointer: &MessagePointer) -> MediationOutcome;
}

/// Request body sent to the mediation target: `{"messageId":"<id>"}`.
#[derive(Debug, Serialize)]
struct MediationPayload<'a> {
    #[serde(rename = "messageId")]
    message_id: &'a str,
}

/// Optional structured reply from the target. A missing or unparseable body
/// counts as `ack: true`.
#[derive(Debug, Deserialize)]
struct MediationResponse {
    #[serde(default = "default_ack")]
    ack: bool,
    #[serde(default)]
    message: Option<String>,
}

fn default_ack() -> bool {
    true
}

#[derive(Debug, Clone)]
pub struct HttpMediatorConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for HttpMediatorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// HTTP mediator. The client is shared across all pool workers; HTTP/2 is
/// negotiated via ALPN on HTTPS targets.
pub struct HttpMediator {
    client: Client,
}

impl HttpMediator {
    pub fn new() -> Self {
        Self::with_config(HttpMediatorConfig::default())
    }

    pub fn with_config(config: HttpMediatorConfig) -> Self {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(10)
            .build()
            .expect("Failed to build HTTP client");

        info!(
            connect_timeout_secs = config.connect_timeout.as_secs(),
            request_timeout_secs = config.request_timeout.as_secs(),
            "HttpMediator initialized"
        );

        Self { client }
    }
}

impl Default for HttpMediator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Mediator for HttpMediator {
    async fn process(&self, pointer: &MessagePointer) -> MediationOutcome {
        if pointer.mediation_type != MediationType::HTTP {
            return MediationOutcome::error_server(
                None,
                format!("Unsupported mediation type: {:?}", pointer.mediation_type),
            );
        }

        let payload = MediationPayload {
            message_id: &pointer.id,
        };

        debug!(
            message_id = %pointer.id,
            target = %pointer.mediation_target,
            "Mediating message"
        );

        let mut request = self
            .client
            .post(&pointer.mediation_target)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .json(&payload);

        if let Some(token) = &pointer.auth_token {
            request = request.bearer_auth(token);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                let status_code = status.as_u16();

                if status_code == 200 {
                    // The target may report "accepted but not ready" in a
                    // 200 body; honor ack=false only on this exact status.
                    if let Ok(body) = response.text().await {
                        if let Ok(reply) = serde_json::from_str::<MediationResponse>(&body) {
                            if !reply.ack {
                                debug!(
                                    message_id = %pointer.id,
                                    reason = ?reply.message,
                                    "Target replied ack=false, deferring"
                                );
                                return MediationOutcome::not_ready(reply.message);
                            }
                        }
                    }

                    debug!(message_id = %pointer.id, "Message delivered");
                    MediationOutcome::success(status_code)
                } else if status.is_success() {
                    debug!(
                        message_id = %pointer.id,
                        status_code = status_code,
                        "Message delivered"
                    );
                    MediationOutcome::success(status_code)
                } else if status_code == 400 {
                    warn!(
                        message_id = %pointer.id,
                        status_code = status_code,
                        "Target rejected message, will redeliver"
                    );
                    MediationOutcome::error_process(status_code, "HTTP 400: Bad request")
                } else if status.is_server_error() {
                    warn!(
                        message_id = %pointer.id,
                        status_code = status_code,
                        "Server error, will redeliver"
                    );
                    MediationOutcome::error_server(
                        Some(status_code),
                        format!("HTTP {}: Server error", status_code),
                    )
                } else {
                    warn!(
                        message_id = %pointer.id,
                        status_code = status_code,
                        "Unexpected status, will redeliver"
                    );
                    MediationOutcome::error_server(
                        Some(status_code),
                        format!("HTTP {}: Unexpected status", status_code),
                    )
                }
            }
            Err(e) => {
                if e.is_timeout() {
                    warn!(message_id = %pointer.id, error = %e, "Request timeout");
                    MediationOutcome::error_connection("Request timeout")
                } else if e.is_connect() {
                    warn!(message_id = %pointer.id, error = %e, "Connection error");
                    MediationOutcome::error_connection(format!("Connection error: {}", e))
                } else {
                    warn!(
                        message_id = %pointer.id,
                        target = %pointer.mediation_target,
                        error = %e,
                        "Request failed"
                    );
                    MediationOutcome::error_server(None, format!("Request failed: {}", e))
                }
            }
        }
    }
}
