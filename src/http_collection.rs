//! HTTP [`CollectionFetcher`] for a catalog served as static files.
//!
//! The index document is fetched with `If-None-Match`; a `304` becomes
//! [`Fetched::NotModified`]. Status codes are classified through
//! [`EngineError::from_status`], so retries and the circuit breaker see the
//! same taxonomy as every other source. Retrying is left to the caller.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, ETAG, IF_NONE_MATCH, RETRY_AFTER};
use reqwest::StatusCode;
use std::time::Duration;

use crate::error::{EngineError, Result};
use crate::traits::{CollectionFetcher, Fetched, RateLimitInfo};

pub struct HttpCollectionFetcher {
    client: reqwest::Client,
    index_url: String,
    /// Element paths resolve against this base.
    base_url: String,
}

impl HttpCollectionFetcher {
    pub fn new(index_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let index_url = index_url.into();
        let base_url = match index_url.rsplit_once('/') {
            Some((base, _)) => base.to_string(),
            None => index_url.clone(),
        };
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("element-index/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| EngineError::Config(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            index_url,
            base_url,
        })
    }

    /// Resolve element paths against a different root than the index URL's directory.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn element_url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

fn transport_error(err: reqwest::Error) -> EngineError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        EngineError::Network(err.to_string())
    } else {
        EngineError::Io(err.to_string())
    }
}

/// `Retry-After` in delta-seconds form.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn rate_limit(headers: &HeaderMap) -> RateLimitInfo {
    let number = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
    };
    RateLimitInfo {
        remaining: number("x-ratelimit-remaining").and_then(|n| u32::try_from(n).ok()),
        reset_at: number("x-ratelimit-reset").and_then(|ts| chrono::DateTime::from_timestamp(ts, 0)),
        retry_after: retry_after(headers),
    }
}

#[async_trait]
impl CollectionFetcher for HttpCollectionFetcher {
    async fn fetch_index(&self, etag: Option<&str>) -> Result<Fetched<Vec<u8>>> {
        let mut request = self.client.get(&self.index_url);
        if let Some(etag) = etag {
            request = request.header(IF_NONE_MATCH, etag);
        }
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        let headers = response.headers().clone();
        let limits = rate_limit(&headers);

        if status == StatusCode::NOT_MODIFIED {
            tracing::debug!(url = %self.index_url, "collection index not modified");
            return Ok(Fetched::NotModified { rate_limit: limits });
        }
        if !status.is_success() {
            return Err(EngineError::from_status(
                status.as_u16(),
                limits.retry_after,
                &self.index_url,
            ));
        }

        let body = response.bytes().await.map_err(transport_error)?;
        Ok(Fetched::Modified {
            value: body.to_vec(),
            etag: headers
                .get(ETAG)
                .and_then(|v| v.to_str().ok())
                .map(String::from),
            rate_limit: limits,
        })
    }

    async fn fetch_element(&self, path: &str) -> Result<Vec<u8>> {
        let url = self.element_url(path);
        let response = self.client.get(&url).send().await.map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::from_status(
                status.as_u16(),
                retry_after(response.headers()),
                &url,
            ));
        }
        let body = response.bytes().await.map_err(transport_error)?;
        Ok(body.to_vec())
    }
}
