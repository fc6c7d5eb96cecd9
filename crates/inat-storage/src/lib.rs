//! Durable persistence (checkpoint, accretion table, job lock) and HTTP transport.

mod accretion;
mod checkpoint;
mod lock;

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::{RequestBuilder, StatusCode};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info_span, warn, Instrument};

pub use accretion::{
    AccretionStore, InsertOutcome, PageWriteStats, SqliteAccretionStore, StoreError, TableName,
};
pub use checkpoint::{CheckpointError, CheckpointStore, FileCheckpointStore};
pub use lock::{JobLock, LockError};

pub const CRATE_NAME: &str = "inat-storage";

/// Throttling and server faults are worth another attempt; auth and client errors are not.
fn retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn retryable_transport(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
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
            max_retries: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            token_bucket: Some(TokenBucketConfig::per_minute(60)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// Steady `requests` per minute with no burst allowance beyond one request.
    pub fn per_minute(requests: u32) -> Self {
        let requests = requests.clamp(1, 60_000);
        Self {
            capacity: 1,
            refill_every: Duration::from_millis(60_000 / u64::from(requests)),
        }
    }
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every.saturating_sub(elapsed);
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("authentication failed for {url}: {reason}; fix the configured iNaturalist credentials")]
    Auth { url: String, reason: String },
    #[error("rate limited by {url} after retries")]
    RateLimited { url: String },
    #[error("request failed after retries: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("server error {status} for {url}")]
    Server { status: u16, url: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed response from {url}: {message}")]
    Malformed { url: String, message: String },
}

impl FetchError {
    fn from_status(status: StatusCode, url: String) -> Self {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FetchError::Auth {
                url,
                reason: format!("http status {}", status.as_u16()),
            },
            StatusCode::TOO_MANY_REQUESTS => FetchError::RateLimited { url },
            s if s.is_server_error() => FetchError::Server {
                status: s.as_u16(),
                url,
            },
            s => FetchError::HttpStatus {
                status: s.as_u16(),
                url,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Session-holding HTTP client. Cookies persist across requests so a login
/// performed once authenticates every later page request.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .cookie_store(true)
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build()?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            token_bucket,
            backoff: config.backoff,
        })
    }

    pub async fn get(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        self.send_with_retry("GET", url, |client| client.get(url))
            .await
    }

    pub async fn post_form(
        &self,
        url: &str,
        form: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        self.send_with_retry("POST", url, |client| client.post(url).form(form))
            .await
    }

    async fn send_with_retry<F>(
        &self,
        method: &'static str,
        url: &str,
        build: F,
    ) -> Result<FetchedResponse, FetchError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let span = info_span!("http_fetch", method, url);
        async {
            let mut attempt = 0usize;
            loop {
                if let Some(bucket) = &self.token_bucket {
                    bucket.take().await;
                }

                let retry_left = attempt < self.backoff.max_retries;
                match build(&self.client).send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        if status.is_success() {
                            let body = resp.bytes().await?.to_vec();
                            return Ok(FetchedResponse { body });
                        }

                        if retryable_status(status) && retry_left {
                            let delay = self.backoff.delay_for_attempt(attempt);
                            warn!(status = status.as_u16(), attempt, ?delay, "retrying request");
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                            continue;
                        }

                        return Err(FetchError::from_status(status, resp.url().to_string()));
                    }
                    Err(err) => {
                        if retryable_transport(&err) && retry_left {
                            let delay = self.backoff.delay_for_attempt(attempt);
                            warn!(error = %err, attempt, ?delay, "retrying request");
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(FetchError::Transport(err));
                    }
                }
            }
        }
        .instrument(span)
        .await
    }
}
