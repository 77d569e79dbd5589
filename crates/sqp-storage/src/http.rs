//! JSON-over-HTTP client for the remote warehouse query endpoint.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

impl RetryDisposition {
    /// Warehouse query timeouts, throttling and server errors are retried.
    pub fn of_status(status: StatusCode) -> Self {
        if status.is_server_error()
            || status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
        {
            Self::Retryable
        } else {
            Self::NonRetryable
        }
    }

    pub fn of_error(err: &reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Self::Retryable
        } else {
            Self::NonRetryable
        }
    }
}

/// Retry schedule for warehouse calls and tracked-error retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
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
    /// Doubling delay for the zero-based retry attempt, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = u32::try_from(attempt).unwrap_or(u32::MAX);
        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// A server-sent `Retry-After` wins over the computed delay. Both are
    /// capped at `max_delay`.
    pub fn delay(&self, attempt: usize, retry_after: Option<Duration>) -> Duration {
        retry_after
            .unwrap_or_else(|| self.delay_for_attempt(attempt))
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub base_url: String,
    pub bearer_token: Option<String>,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_in_flight: usize,
    pub backoff: BackoffPolicy,
}

impl HttpClientConfig {
    pub fn for_warehouse(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            bearer_token: None,
            timeout: Duration::from_secs(30),
            user_agent: Some(format!("sqp-sync/{}", env!("CARGO_PKG_VERSION"))),
            max_in_flight: 4,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_bearer_token(mut self, token: Option<String>) -> Self {
        self.bearer_token = token;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid warehouse response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("warehouse client is shut down")]
    Closed,
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Request(err) if err.is_timeout())
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Result of one request, before the retry decision.
enum Attempt<R> {
    Done(R),
    Retry {
        error: FetchError,
        retry_after: Option<Duration>,
    },
    Fail(FetchError),
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let seconds = headers.get(RETRY_AFTER)?.to_str().ok()?.trim().parse().ok()?;
    Some(Duration::from_secs(seconds))
}

#[derive(Debug)]
pub struct WarehouseHttpClient {
    client: reqwest::Client,
    base_url: String,
    bearer_token: Option<String>,
    in_flight: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl WarehouseHttpClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building warehouse http client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            bearer_token: config.bearer_token,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            backoff: config.backoff,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// POST `body` as JSON and decode the JSON response. Transient failures
    /// are retried up to `max_retries` times.
    pub async fn post_json<B, R>(&self, path: &str, body: &B) -> Result<R, FetchError>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;

        let url = self.url_for(path);
        let span = info_span!("warehouse_request", url = %url);

        async {
            let mut attempt = 0;
            loop {
                match self.send_once(&url, body).await {
                    Attempt::Done(value) => return Ok(value),
                    Attempt::Retry { error, retry_after } if attempt < self.backoff.max_retries => {
                        let delay = self.backoff.delay(attempt, retry_after);
                        warn!(attempt, ?delay, error = %error, "retrying warehouse request");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    Attempt::Retry { error, .. } | Attempt::Fail(error) => return Err(error),
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn send_once<B, R>(&self, url: &str, body: &B) -> Attempt<R>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let mut request = self.client.post(url).json(body);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let resp = match request.send().await {
            Ok(resp) => resp,
            Err(err) => {
                return match RetryDisposition::of_error(&err) {
                    RetryDisposition::Retryable => Attempt::Retry {
                        error: FetchError::Request(err),
                        retry_after: None,
                    },
                    RetryDisposition::NonRetryable => Attempt::Fail(FetchError::Request(err)),
                };
            }
        };

        let status = resp.status();
        if status.is_success() {
            debug!(status = status.as_u16(), "warehouse responded");
            return match resp.json::<R>().await {
                Ok(value) => Attempt::Done(value),
                Err(source) => Attempt::Fail(FetchError::Decode {
                    url: url.to_string(),
                    source,
                }),
            };
        }

        let retry_after = retry_after(resp.headers());
        let error = FetchError::HttpStatus {
            status: status.as_u16(),
            url: url.to_string(),
            body: resp.text().await.unwrap_or_default(),
        };
        match RetryDisposition::of_status(status) {
            RetryDisposition::Retryable => Attempt::Retry { error, retry_after },
            RetryDisposition::NonRetryable => Attempt::Fail(error),
        }
    }
}
