use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::Value;
use tracing::{info, warn};

use crate::breaker::{Admission, CircuitBreaker};
use crate::errors::Result;
use crate::metrics::{
    CIRCUIT_OPEN_TOTAL, FORWARD_FAILURE_TOTAL, FORWARD_SKIPPED_TOTAL, FORWARD_SUCCESS_TOTAL,
};

const USER_AGENT: &str = "ruuvi-api-proxy/0.1";
const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 2000;

/// Forwarding decision resolved from configuration once per ingest call.
#[derive(Debug, Clone)]
pub struct ForwardingPolicy {
    pub enabled: bool,
    pub endpoint: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub breaker_threshold: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    CircuitOpen,
    Timeout,
    Transport,
    UpstreamStatus,
    UpstreamBody,
}

#[derive(Debug)]
pub enum ForwardResult {
    /// Upstream accepted the batch; `body` is its response verbatim.
    Success {
        status: u16,
        body: Vec<u8>,
        json: Value,
    },
    /// Forwarding disabled by configuration, no network attempt made.
    Skipped,
    Failed {
        reason: FailureReason,
        message: String,
    },
}

enum Attempt {
    Ok {
        status: u16,
        body: Vec<u8>,
        json: Value,
    },
    Fatal {
        reason: FailureReason,
        message: String,
    },
    Retryable {
        reason: FailureReason,
        message: String,
    },
}

/// HTTP relay to the upstream cloud API, gated by the forwarding setting and
/// the circuit breaker, with bounded per-attempt timeouts and retry/backoff.
pub struct Forwarder {
    client: reqwest::Client,
    breaker: Arc<CircuitBreaker>,
}

impl Forwarder {
    pub fn new(breaker: Arc<CircuitBreaker>) -> Result<Self> {
        let client = reqwest::Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self { client, breaker })
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Relays one batch body to the upstream endpoint.
    ///
    /// The body is sent byte-for-byte as received from the gateway. Whatever
    /// happens here, the caller's local write has already been decided
    /// independently; the result only shapes the response and breaker state.
    pub async fn forward(&self, body: &[u8], policy: &ForwardingPolicy) -> ForwardResult {
        if !policy.enabled {
            FORWARD_SKIPPED_TOTAL.inc();
            return ForwardResult::Skipped;
        }

        match self.breaker.admit() {
            Admission::Rejected => {
                CIRCUIT_OPEN_TOTAL.inc();
                warn!("Circuit breaker open, skipping forward to {}", policy.endpoint);
                return ForwardResult::Failed {
                    reason: FailureReason::CircuitOpen,
                    message: "Upstream temporarily unavailable".to_string(),
                };
            }
            Admission::Allowed | Admission::Probe => {}
        }

        let max_attempts = policy.max_retries + 1;
        let mut backoff_ms = INITIAL_BACKOFF_MS;
        let mut attempt = 0;

        loop {
            attempt += 1;

            match self.attempt(body, policy).await {
                Attempt::Ok { status, body, json } => {
                    self.breaker.record_success();
                    FORWARD_SUCCESS_TOTAL.inc();
                    if attempt > 1 {
                        info!("Forward succeeded on attempt {}/{}", attempt, max_attempts);
                    }
                    return ForwardResult::Success { status, body, json };
                }
                Attempt::Fatal { reason, message } => {
                    self.breaker.record_failure(policy.breaker_threshold);
                    FORWARD_FAILURE_TOTAL.inc();
                    warn!("Forward failed without retry: {}", message);
                    return ForwardResult::Failed { reason, message };
                }
                Attempt::Retryable { reason, message } => {
                    if attempt >= max_attempts {
                        // Retry budget exhausted: counts as one failure
                        // against the breaker, not one per attempt.
                        self.breaker.record_failure(policy.breaker_threshold);
                        FORWARD_FAILURE_TOTAL.inc();
                        warn!(
                            "Forward failed after {} attempts: {}",
                            max_attempts, message
                        );
                        return ForwardResult::Failed { reason, message };
                    }

                    warn!(
                        "Forward attempt {}/{} failed: {}. Retrying in {}ms...",
                        attempt, max_attempts, message, backoff_ms
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
                }
            }
        }
    }

    async fn attempt(&self, body: &[u8], policy: &ForwardingPolicy) -> Attempt {
        let response = self
            .client
            .post(&policy.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_vec())
            .timeout(policy.timeout)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return Attempt::Retryable {
                    reason: FailureReason::Timeout,
                    message: format!("Request timeout after {:?}", policy.timeout),
                };
            }
            Err(e) => {
                return Attempt::Retryable {
                    reason: FailureReason::Transport,
                    message: format!("Request failed: {e}"),
                };
            }
        };

        let status = response.status();
        let bytes = match response.bytes().await {
            Ok(b) => b.to_vec(),
            Err(e) => {
                return Attempt::Retryable {
                    reason: FailureReason::Transport,
                    message: format!("Failed to read upstream response: {e}"),
                };
            }
        };

        if status == StatusCode::OK {
            match serde_json::from_slice::<Value>(&bytes) {
                Ok(json) => Attempt::Ok {
                    status: status.as_u16(),
                    body: bytes,
                    json,
                },
                Err(e) => Attempt::Fatal {
                    reason: FailureReason::UpstreamBody,
                    message: format!("Upstream returned invalid JSON: {e}"),
                },
            }
        } else if status.is_server_error() {
            Attempt::Retryable {
                reason: FailureReason::UpstreamStatus,
                message: format!("HTTP {status}"),
            }
        } else {
            Attempt::Fatal {
                reason: FailureReason::UpstreamStatus,
                message: format!("HTTP {status}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitState;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const BATCH: &[u8] =
        br#"{"data":{"timestamp":1,"gwmac":"AA:BB:CC:DD:EE:FF","tags":{}}}"#;

    fn forwarder() -> Forwarder {
        let breaker = Arc::new(CircuitBreaker::new("test", Duration::from_secs(30)));
        Forwarder::new(breaker).unwrap()
    }

    fn policy(endpoint: String, max_retries: u32) -> ForwardingPolicy {
        ForwardingPolicy {
            enabled: true,
            endpoint,
            timeout: Duration::from_secs(5),
            max_retries,
            breaker_threshold: 5,
        }
    }

    #[test]
    fn test_disabled_forwarding_skips_without_breaker() {
        let f = forwarder();
        let mut p = policy("http://127.0.0.1:1/record".to_string(), 3);
        p.enabled = false;

        let result = tokio_test::block_on(f.forward(BATCH, &p));
        assert!(matches!(result, ForwardResult::Skipped));
        // The breaker was never consulted, let alone tripped.
        assert_eq!(f.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_success_passes_body_through_verbatim() {
        let server = MockServer::start().await;
        let upstream_body = r#"{"result":"success","data":{"action":"inserted"}}"#;
        Mock::given(method("POST"))
            .and(path("/record"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(upstream_body, "application/json"))
            .expect(1)
            .mount(&server)
            .await;

        let f = forwarder();
        let p = policy(format!("{}/record", server.uri()), 3);

        match f.forward(BATCH, &p).await {
            ForwardResult::Success { status, body, json } => {
                assert_eq!(status, 200);
                assert_eq!(body, upstream_body.as_bytes());
                assert_eq!(json["result"], "success");
            }
            other => panic!("expected success, got {other:?}"),
        }
        assert_eq!(f.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_retries_server_errors_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(r#"{"result":"success"}"#, "application/json"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let f = forwarder();
        let p = policy(server.uri(), 3);

        let result = f.forward(BATCH, &p).await;
        assert!(matches!(result, ForwardResult::Success { .. }));
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
        assert_eq!(f.breaker().snapshot().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_exhaustion_counts_one_breaker_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let f = forwarder();
        let p = policy(server.uri(), 2);

        let result = f.forward(BATCH, &p).await;
        assert!(matches!(
            result,
            ForwardResult::Failed {
                reason: FailureReason::UpstreamStatus,
                ..
            }
        ));
        // max_retries = 2 means three attempts total, one recorded failure.
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
        assert_eq!(f.breaker().snapshot().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&server)
            .await;

        let f = forwarder();
        let p = policy(server.uri(), 5);

        let result = f.forward(BATCH, &p).await;
        assert!(matches!(result, ForwardResult::Failed { .. }));
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_upstream_json_is_a_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("<html>", "text/html"))
            .expect(1)
            .mount(&server)
            .await;

        let f = forwarder();
        let p = policy(server.uri(), 3);

        match f.forward(BATCH, &p).await {
            ForwardResult::Failed { reason, .. } => {
                assert_eq!(reason, FailureReason::UpstreamBody);
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_open_circuit_makes_no_network_calls() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let f = forwarder();
        // No retries so each forward records exactly one failure.
        let p = policy(server.uri(), 0);

        for _ in 0..5 {
            let result = f.forward(BATCH, &p).await;
            assert!(matches!(result, ForwardResult::Failed { .. }));
        }
        assert_eq!(f.breaker().state(), CircuitState::Open);
        assert_eq!(server.received_requests().await.unwrap().len(), 5);

        // Sixth call short-circuits: no additional request goes out.
        match f.forward(BATCH, &p).await {
            ForwardResult::Failed { reason, .. } => {
                assert_eq!(reason, FailureReason::CircuitOpen);
            }
            other => panic!("expected circuit-open failure, got {other:?}"),
        }
        assert_eq!(server.received_requests().await.unwrap().len(), 5);
    }
}
