use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_target_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_target_concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("http client is shutting down")]
    Closed,
    #[error("gave up on {url} after {attempts} attempts")]
    RetriesExhausted { url: String, attempts: usize },
}

/// Shared outbound client for provider feeds and the push gateway.
///
/// Requests are bounded by a global semaphore and a per-target semaphore (a target is a
/// sport feed or the push gateway) and retried with capped exponential backoff.
#[derive(Debug)]
pub struct HttpClient {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_target_limit: usize,
    per_target: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> Result<Self, HttpError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_target_limit: config.per_target_concurrency.max(1),
            per_target: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_target_semaphore(&self, target: &str) -> Arc<Semaphore> {
        let mut map = self.per_target.lock().await;
        map.entry(target.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_target_limit)))
            .clone()
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        target: &str,
        url: &str,
        bearer: Option<&str>,
    ) -> Result<T, HttpError> {
        let response = self
            .send_with_retry(target, url, |client| {
                let request = client.get(url);
                match bearer {
                    Some(token) => request.bearer_auth(token),
                    None => request,
                }
            })
            .await?;
        serde_json::from_slice(&response.body).map_err(|source| HttpError::Decode {
            url: response.final_url,
            source,
        })
    }

    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        target: &str,
        url: &str,
        body: &B,
        bearer: Option<&str>,
    ) -> Result<FetchedResponse, HttpError> {
        self.send_with_retry(target, url, |client| {
            let request = client.post(url).json(body);
            match bearer {
                Some(token) => request.bearer_auth(token),
                None => request,
            }
        })
        .await
    }

    async fn send_with_retry<F>(
        &self,
        target: &str,
        url: &str,
        build: F,
    ) -> Result<FetchedResponse, HttpError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| HttpError::Closed)?;
        let per_target = self.per_target_semaphore(target).await;
        let _target = per_target.acquire().await.map_err(|_| HttpError::Closed)?;

        let span = info_span!("http_request", target, url);
        async {
            for attempt in 0..=self.backoff.max_retries {
                let is_last = attempt == self.backoff.max_retries;
                match build(&self.client).send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        let final_url = resp.url().to_string();

                        if status.is_success() {
                            let body = resp.bytes().await?.to_vec();
                            return Ok(FetchedResponse {
                                status,
                                final_url,
                                body,
                            });
                        }

                        if classify_status(status) == RetryDisposition::Retryable && !is_last {
                            debug!(
                                attempt,
                                status = status.as_u16(),
                                "retrying after http status"
                            );
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }

                        return Err(HttpError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable && !is_last {
                            debug!(attempt, error = %err, "retrying after request error");
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }
                        return Err(HttpError::Request(err));
                    }
                }
            }
            Err(HttpError::RetriesExhausted {
                url: url.to_string(),
                attempts: self.backoff.max_retries + 1,
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn throttling_and_server_errors_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    #[tokio::test]
    async fn refused_connections_surface_the_last_request_error() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = HttpClient::new(HttpClientConfig {
            backoff: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
            ..Default::default()
        })
        .unwrap();

        let err = client
            .get_json::<serde_json::Value>("nba", &format!("http://127.0.0.1:{port}/players"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::Request(_)), "{err}");
    }
}
