//! Rate-limited HTTP client shared by the feed pollers.

use crate::pollers::json::decode_json;
use anyhow::Context;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::StatusCode;
use reqwest::header::RETRY_AFTER;
use serde::de::DeserializeOwned;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Errors from talking to an upstream feed.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("rate limited by upstream")]
    RateLimited { retry_after: Option<Duration> },
    #[error("upstream returned HTTP {status} for {url}")]
    Status { status: u16, url: String },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("failed to decode response: {0:#}")]
    Decode(anyhow::Error),
    #[error("upstream reported failure: {0}")]
    Upstream(String),
    #[error("missing credentials for {0}")]
    MissingCredentials(&'static str),
}

impl FeedError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// `reqwest` client with a per-feed request quota.
#[derive(Clone)]
pub struct FeedClient {
    name: &'static str,
    http: reqwest::Client,
    limiter: Arc<DirectLimiter>,
}

impl FeedClient {
    pub fn new(
        name: &'static str,
        timeout: Duration,
        requests_per_minute: u32,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("skyfeed/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        let per_minute = NonZeroU32::new(requests_per_minute).unwrap_or(NonZeroU32::MIN);
        let limiter = RateLimiter::direct(Quota::per_minute(per_minute));

        Ok(Self {
            name,
            http,
            limiter: Arc::new(limiter),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// GET `url` with query parameters and decode the JSON body.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, FeedError> {
        self.limiter.until_ready().await;
        trace!(feed = self.name, url, "Sending feed request");

        let response = self.http.get(url).query(query).send().await?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            debug!(feed = self.name, url, ?retry_after, "Feed rate limited");
            return Err(FeedError::RateLimited { retry_after });
        }
        if !status.is_success() {
            return Err(FeedError::Status {
                status: status.as_u16(),
                url: url.to_owned(),
            });
        }

        let body = response.text().await?;
        decode_json(&body).map_err(FeedError::Decode)
    }
}

impl std::fmt::Debug for FeedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedClient").field("name", &self.name).finish()
    }
}
