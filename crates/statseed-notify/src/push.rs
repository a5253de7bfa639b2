use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use statseed_storage::{HttpClient, HttpError};
use thiserror::Error;
use tracing::debug;

const PUSH_TARGET: &str = "push-gateway";
const UNREGISTERED_ERRORS: [&str; 2] = ["NotRegistered", "InvalidRegistration"];

#[derive(Debug, Error)]
pub enum PushError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("push gateway rejected the batch: {0}")]
    Rejected(String),
    #[error("decoding push gateway response: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    pub sent: usize,
    /// Tokens the gateway reported as no longer registered.
    pub invalid_tokens: Vec<String>,
}

#[async_trait]
pub trait PushGateway: Send + Sync {
    async fn send_multi(
        &self,
        tokens: &[String],
        title: &str,
        body: &str,
    ) -> Result<PushReport, PushError>;
}

#[derive(Debug, Serialize)]
struct MulticastRequest<'a> {
    registration_ids: &'a [String],
    notification: Notification<'a>,
}

#[derive(Debug, Serialize)]
struct Notification<'a> {
    title: &'a str,
    body: &'a str,
}

#[derive(Debug, Deserialize)]
struct MulticastResponse {
    #[serde(default)]
    success: usize,
    #[serde(default)]
    failure: usize,
    #[serde(default)]
    results: Vec<MulticastResult>,
}

#[derive(Debug, Deserialize)]
struct MulticastResult {
    #[serde(default)]
    error: Option<String>,
}

/// Multicast push over the shared HTTP client. Without an endpoint and server key every
/// send is a successful no-op.
#[derive(Debug, Clone)]
pub struct HttpPushGateway {
    http: Arc<HttpClient>,
    endpoint: Option<String>,
    server_key: Option<String>,
}

impl HttpPushGateway {
    pub fn new(
        http: Arc<HttpClient>,
        endpoint: Option<String>,
        server_key: Option<String>,
    ) -> Self {
        Self {
            http,
            endpoint,
            server_key,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.endpoint.is_some() && self.server_key.is_some()
    }
}

#[async_trait]
impl PushGateway for HttpPushGateway {
    async fn send_multi(
        &self,
        tokens: &[String],
        title: &str,
        body: &str,
    ) -> Result<PushReport, PushError> {
        let (Some(endpoint), Some(key)) = (&self.endpoint, &self.server_key) else {
            debug!(
                tokens = tokens.len(),
                "push gateway not configured; skipping send"
            );
            return Ok(PushReport {
                sent: tokens.len(),
                invalid_tokens: Vec::new(),
            });
        };
        if tokens.is_empty() {
            return Ok(PushReport::default());
        }

        let request = MulticastRequest {
            registration_ids: tokens,
            notification: Notification { title, body },
        };
        let response = self
            .http
            .post_json(PUSH_TARGET, endpoint, &request, Some(key))
            .await?;
        interpret_response(tokens, &response.body)
    }
}

fn interpret_response(tokens: &[String], body: &[u8]) -> Result<PushReport, PushError> {
    let parsed: MulticastResponse = serde_json::from_slice(body)?;
    let mut errors = Vec::new();
    let invalid_tokens = tokens
        .iter()
        .zip(&parsed.results)
        .filter_map(|(token, result)| {
            let error = result.error.as_deref()?;
            errors.push(error.to_string());
            UNREGISTERED_ERRORS.contains(&error).then(|| token.clone())
        })
        .collect::<Vec<_>>();

    if parsed.success == 0 && parsed.failure > 0 && invalid_tokens.is_empty() {
        errors.dedup();
        return Err(PushError::Rejected(errors.join(", ")));
    }
    Ok(PushReport {
        sent: parsed.success,
        invalid_tokens,
    })
}
