//! HTTP client for the external delivery endpoint.
//!
//! Handles request construction, response capture, and error
//! categorisation for the retry logic and circuit breaker. The wire
//! contract is fixed: `POST {EMAIL_API_URL}` with a JSON body of
//! `{"email": ..., "message": ...}`; any 2xx is success, 4xx permanent,
//! 5xx or timeout retriable.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};
use uuid::Uuid;

use crate::error::{EngineError, Result};

/// Default endpoint for the external email service.
pub const DEFAULT_EMAIL_API_URL: &str = "https://email-service.digitalenvision.com.au/send-email";

/// Configuration for the delivery client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// URL of the external delivery endpoint.
    pub api_url: String,
    /// Hard timeout for each outbound request.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_EMAIL_API_URL.to_string(),
            timeout: Duration::from_millis(10_000),
            user_agent: "Tidings-Delivery/1.0".to_string(),
        }
    }
}

/// JSON body sent to the delivery endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailPayload {
    /// Destination address.
    pub email: String,
    /// Rendered message body.
    pub message: String,
}

/// Captured response from a delivery attempt.
///
/// Non-2xx responses are returned as `Ok` so the worker's classification
/// table stays the single place that decides retry behaviour; only
/// transport-level failures surface as `Err`.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    /// HTTP status code.
    pub status_code: u16,
    /// Response body, truncated for storage.
    pub body: String,
    /// Total duration of the request.
    pub duration: Duration,
    /// Whether the status was 2xx.
    pub is_success: bool,
}

/// HTTP client for birthday message delivery.
///
/// Uses connection pooling and a hard per-request timeout so a slow
/// endpoint cannot pin a worker past its budget.
#[derive(Debug, Clone)]
pub struct EmailClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl EmailClient {
    /// Creates a new client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Configuration` if the underlying HTTP
    /// client cannot be built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| EngineError::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    /// Creates a client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Posts one message to the delivery endpoint.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` when the request exceeds the configured budget
    /// and `Network` for connection-level failures. HTTP error statuses
    /// are returned as `Ok(SendOutcome)` for the worker to classify.
    pub async fn send(&self, email: &str, message: &str, trace_id: Uuid) -> Result<SendOutcome> {
        let start = std::time::Instant::now();
        let span = info_span!(
            "email_delivery",
            trace_id = %trace_id,
            url = %self.config.api_url,
        );

        async move {
            let payload =
                EmailPayload { email: email.to_string(), message: message.to_string() };

            let response = match self
                .client
                .post(&self.config.api_url)
                .header("content-type", "application/json")
                .json(&payload)
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    let duration = start.elapsed();
                    tracing::warn!(duration_ms = duration.as_millis(), "request failed: {e}");

                    if e.is_timeout() {
                        return Err(EngineError::timeout(
                            u64::try_from(self.config.timeout.as_millis()).unwrap_or(u64::MAX),
                        ));
                    }
                    if e.is_connect() {
                        return Err(EngineError::network(format!("connection failed: {e}")));
                    }
                    return Err(EngineError::network(e.to_string()));
                },
            };

            let duration = start.elapsed();
            let status_code = response.status().as_u16();
            let is_success = response.status().is_success();
            let body = read_body_truncated(response).await;

            match status_code {
                200..=299 => tracing::debug!(status = status_code, "message delivered"),
                400..=499 => tracing::warn!(status = status_code, "client error response"),
                _ => tracing::warn!(status = status_code, "server error response"),
            }

            Ok(SendOutcome { status_code, body, duration, is_success })
        }
        .instrument(span)
        .await
    }
}

/// Reads a response body, bounding what we keep for error messages.
async fn read_body_truncated(response: reqwest::Response) -> String {
    const MAX_BODY: usize = 1024;

    match response.bytes().await {
        Ok(bytes) => {
            if bytes.len() > MAX_BODY {
                let suffix = "... (truncated)";
                let kept = String::from_utf8_lossy(&bytes[..MAX_BODY - suffix.len()]);
                format!("{kept}{suffix}")
            } else {
                String::from_utf8_lossy(&bytes).into_owned()
            }
        },
        Err(e) => format!("[failed to read response body: {e}]"),
    }
}

#[cfg(test)]
mod tests {
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;

    fn client_for(server: &MockServer) -> EmailClient {
        EmailClient::new(ClientConfig {
            api_url: format!("{}/send-email", server.uri()),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn successful_send() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/send-email"))
            .and(matchers::header("content-type", "application/json"))
            .and(matchers::body_json(serde_json::json!({
                "email": "john@x",
                "message": "Hey, John Doe it's your birthday",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = client_for(&server)
            .send("john@x", "Hey, John Doe it's your birthday", Uuid::new_v4())
            .await
            .unwrap();

        assert_eq!(outcome.status_code, 200);
        assert!(outcome.is_success);
        assert_eq!(outcome.body, "OK");
    }

    #[tokio::test]
    async fn client_error_returned_for_classification() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(422).set_body_string("bad address"))
            .mount(&server)
            .await;

        let outcome =
            client_for(&server).send("nope", "hello", Uuid::new_v4()).await.unwrap();

        assert_eq!(outcome.status_code, 422);
        assert!(!outcome.is_success);
        assert_eq!(outcome.body, "bad address");
    }

    #[tokio::test]
    async fn server_error_returned_for_classification() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
            .mount(&server)
            .await;

        let outcome =
            client_for(&server).send("john@x", "hello", Uuid::new_v4()).await.unwrap();

        assert_eq!(outcome.status_code, 503);
        assert!(!outcome.is_success);
    }

    #[tokio::test]
    async fn connection_failure_is_network_error() {
        // Nothing listens on this port.
        let client = EmailClient::new(ClientConfig {
            api_url: "http://127.0.0.1:9/send-email".to_string(),
            timeout: Duration::from_secs(2),
            ..Default::default()
        })
        .unwrap();

        let result = client.send("john@x", "hello", Uuid::new_v4()).await;

        match result {
            Err(e) => assert!(e.is_retryable(), "transport failures must be retriable: {e}"),
            Ok(outcome) => panic!("expected transport failure, got HTTP {}", outcome.status_code),
        }
    }

    #[tokio::test]
    async fn timeout_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let client = EmailClient::new(ClientConfig {
            api_url: format!("{}/send-email", server.uri()),
            timeout: Duration::from_millis(50),
            ..Default::default()
        })
        .unwrap();

        let result = client.send("john@x", "hello", Uuid::new_v4()).await;

        match result {
            Err(e) => assert!(e.is_retryable()),
            Ok(outcome) => panic!("expected timeout, got HTTP {}", outcome.status_code),
        }
    }
}
