//! Outbound HTTP shared by the tariffs and spreadsheet clients.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, warn, Instrument};

/// Transient failures are retried up to `max_retries` times with doubling delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Pause before retry number `retry` (zero based).
    pub fn delay(&self, retry: usize) -> Duration {
        let doublings = u32::try_from(retry).unwrap_or(u32::MAX);
        self.initial_delay
            .saturating_mul(2u32.saturating_pow(doublings))
            .min(self.max_delay)
    }
}

/// Request rate limit: `burst` requests back to back, then one per `interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingConfig {
    pub burst: u32,
    pub interval: Duration,
}

impl PacingConfig {
    /// Stay under `requests` per minute, allowing about ten seconds' worth as a burst.
    pub fn per_minute(requests: u32) -> Self {
        let requests = requests.max(1);
        Self {
            burst: (requests / 6).max(1),
            interval: Duration::from_secs(60) / requests,
        }
    }
}

/// Hands out send slots according to a [`PacingConfig`].
///
/// Tracks the time the next request would be due if requests were perfectly
/// spaced; a caller only waits once that point runs more than a burst ahead.
#[derive(Debug)]
pub struct RequestPacer {
    interval: Duration,
    tolerance: Duration,
    next_due: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(config: PacingConfig) -> Self {
        Self {
            interval: config.interval,
            tolerance: config.interval.saturating_mul(config.burst.max(1) - 1),
            next_due: Mutex::new(None),
        }
    }

    pub async fn wait_turn(&self) {
        let wait = {
            let mut next_due = self.next_due.lock().await;
            self.reserve(&mut next_due, Instant::now())
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    /// Claim the next slot and return how long the caller must wait for it.
    fn reserve(&self, next_due: &mut Option<Instant>, now: Instant) -> Duration {
        let slot = next_due.map_or(now, |due| due.max(now));
        *next_due = Some(slot + self.interval);
        slot.saturating_duration_since(now + self.tolerance)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_in_flight: usize,
    pub retry: RetryPolicy,
    pub pacing: Option<PacingConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            max_in_flight: 8,
            retry: RetryPolicy::default(),
            pacing: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String, body: String },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Request(err) => err.status().map(|s| s.as_u16()),
            Self::HttpStatus { status, .. } => Some(*status),
        }
    }

    /// Raw error body returned by the server, if any.
    pub fn body(&self) -> Option<&str> {
        match self {
            Self::Request(_) => None,
            Self::HttpStatus { body, .. } => Some(body.as_str()).filter(|b| !b.is_empty()),
        }
    }

    /// Throttling, server-side errors, timeouts and refused connections.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request(err) => err.is_timeout() || err.is_connect(),
            Self::HttpStatus { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS.as_u16()
                    || *status == StatusCode::REQUEST_TIMEOUT.as_u16()
                    || (500..600).contains(status)
            }
        }
    }
}

/// Shared reqwest client with an in-flight cap, optional pacing and retries.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Arc<Semaphore>,
    pacer: Option<RequestPacer>,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .gzip(true)
            .brotli(true);
        if let Some(user_agent) = config.user_agent {
            builder = builder.user_agent(user_agent);
        }

        Ok(Self {
            client: builder.build().context("building http client")?,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            pacer: config.pacing.map(RequestPacer::new),
            retry: config.retry,
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Send `request`, retrying transient failures per the configured policy.
    ///
    /// Requests whose body cannot be cloned are sent exactly once.
    pub async fn execute(
        &self,
        label: &str,
        request: RequestBuilder,
    ) -> Result<FetchedResponse, FetchError> {
        self.send_with_retries(label, request, self.retry.max_retries).await
    }

    /// Send `request` a single time; for calls that must not be repeated.
    pub async fn execute_once(
        &self,
        label: &str,
        request: RequestBuilder,
    ) -> Result<FetchedResponse, FetchError> {
        self.send_with_retries(label, request, 0).await
    }

    async fn send_with_retries(
        &self,
        label: &str,
        request: RequestBuilder,
        max_retries: usize,
    ) -> Result<FetchedResponse, FetchError> {
        let _permit = self.in_flight.acquire().await.expect("semaphore not closed");
        let span = info_span!("http_request", label);
        async move {
            let mut pending = request;
            let mut retry = 0;
            loop {
                if let Some(pacer) = &self.pacer {
                    pacer.wait_turn().await;
                }
                let spare = pending.try_clone();
                let err = match send(pending).await {
                    Ok(response) => return Ok(response),
                    Err(err) => err,
                };
                let Some(next) = spare.filter(|_| retry < max_retries && err.is_transient()) else {
                    return Err(err);
                };
                let delay = self.retry.delay(retry);
                warn!(retry = retry + 1, ?delay, error = %err, "transient http failure, retrying");
                tokio::time::sleep(delay).await;
                retry += 1;
                pending = next;
            }
        }
        .instrument(span)
        .await
    }
}

async fn send(request: RequestBuilder) -> Result<FetchedResponse, FetchError> {
    let response = request.send().await?;
    let status = response.status();
    let final_url = response.url().to_string();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(FetchError::HttpStatus {
            status: status.as_u16(),
            url: final_url,
            body,
        });
    }
    let body = response.bytes().await?.to_vec();
    Ok(FetchedResponse {
        status,
        final_url,
        body,
    })
}
