//! Rate-limited REST client, one instance per account (spec §4.C).
//!
//! Two limiters guard every request: a global token bucket (`governor`,
//! chosen the way `MystenLabs-sui` and `get-convex-convex-backend` reach for
//! it rather than hand-rolling one) and a per-bucket async mutex, where a
//! bucket is `(route, resource)` as defined in `archive_wire::rest`. Both
//! waits are cancellable through a `CancellationToken`, mirroring the abort
//! contract the rest of the ingestion pipeline uses.

mod downloader;

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use archive_wire::rest::Bucket;
use governor::{Quota, RateLimiter};
use parking_lot::Mutex as SyncMutex;
use reqwest::{Method, StatusCode};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

pub use downloader::ReqwestDownloader;

pub const DISCORD_API_BASE: &str = "https://discord.com/api/v9";

#[derive(Debug, thiserror::Error)]
pub enum RestError {
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("not found")]
    NotFound,
    #[error("server error: {0}")]
    Server(StatusCode),
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    #[error("aborted")]
    Aborted,
}

#[derive(Debug, Clone)]
pub struct RestResponse {
    pub status: StatusCode,
    pub body: serde_json::Value,
}

impl RestResponse {
    /// Classifies 401/403/404 into `RestError` for call sites that want to
    /// `?` rather than match on `status` themselves. 401 never actually
    /// reaches here — `request` surfaces it directly — kept for symmetry
    /// and for tests that construct a `RestResponse` directly.
    pub fn into_result(self) -> Result<RestResponse, RestError> {
        match self.status {
            StatusCode::UNAUTHORIZED => Err(RestError::Unauthorized),
            StatusCode::FORBIDDEN => Err(RestError::Forbidden),
            StatusCode::NOT_FOUND => Err(RestError::NotFound),
            _ => Ok(self),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct BucketState {
    remaining: Option<u64>,
    reset_after: Option<Duration>,
}

type GlobalLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Per-account REST client. Cheaply `Clone`-able; the limiter state and
/// bucket locks are shared across clones.
#[derive(Clone)]
pub struct RestClient {
    http: reqwest::Client,
    token: String,
    base_url: String,
    global_limiter: Arc<GlobalLimiter>,
    bucket_locks: Arc<SyncMutex<HashMap<Bucket, Arc<AsyncMutex<()>>>>>,
    bucket_state: Arc<SyncMutex<HashMap<Bucket, BucketState>>>,
}

static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

impl RestClient {
    pub fn new(token: impl Into<String>) -> Result<RestClient, reqwest::Error> {
        Self::with_base_url(token, DISCORD_API_BASE, 50)
    }

    pub fn with_base_url(
        token: impl Into<String>,
        base_url: impl Into<String>,
        global_requests_per_second: u32,
    ) -> Result<RestClient, reqwest::Error> {
        let http = reqwest::Client::builder().user_agent(APP_USER_AGENT).build()?;
        let quota = Quota::per_second(NonZeroU32::new(global_requests_per_second.max(1)).unwrap());
        Ok(RestClient {
            http,
            token: token.into(),
            base_url: base_url.into(),
            global_limiter: Arc::new(RateLimiter::direct(quota)),
            bucket_locks: Arc::new(SyncMutex::new(HashMap::new())),
            bucket_state: Arc::new(SyncMutex::new(HashMap::new())),
        })
    }

    fn bucket_lock(&self, bucket: Bucket) -> Arc<AsyncMutex<()>> {
        self.bucket_locks.lock().entry(bucket).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    /// `request(endpoint, fetch_opts, abort)` (spec §4.C). `path` is the
    /// fully-rendered request path (e.g. `/channels/123/messages`); `bucket`
    /// identifies which rate-limit bucket it belongs to.
    pub async fn request(
        &self,
        bucket: Bucket,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        abort: &CancellationToken,
    ) -> Result<RestResponse, RestError> {
        let bucket_lock = self.bucket_lock(bucket);
        let _bucket_guard = tokio::select! {
            guard = bucket_lock.lock() => guard,
            _ = abort.cancelled() => return Err(RestError::Aborted),
        };

        let mut attempt: u32 = 0;
        loop {
            self.wait_for_global_quota(abort).await?;
            self.wait_for_bucket_reset(bucket, abort).await?;

            let url = format!("{}{}", self.base_url, path);
            let req = self
                .http
                .request(method.clone(), &url)
                .header("Authorization", &self.token)
                .query(query);

            let resp = tokio::select! {
                resp = req.send() => resp,
                _ = abort.cancelled() => return Err(RestError::Aborted),
            };

            let resp = match resp {
                Ok(resp) => resp,
                Err(e) => {
                    tracing::warn!(error = %e, %attempt, "rest transport error, retrying");
                    self.backoff(attempt, abort).await?;
                    attempt += 1;
                    continue;
                }
            };

            self.record_rate_limit_headers(bucket, resp.headers());

            if resp.status() == StatusCode::TOO_MANY_REQUESTS {
                let retry_after = parse_retry_after(resp.headers()).unwrap_or(Duration::from_secs(1));
                let scope = resp
                    .headers()
                    .get("X-RateLimit-Scope")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("user");
                if scope != "shared" {
                    tracing::warn!(%scope, ?retry_after, "rate limited on a non-shared bucket");
                }
                self.sleep_or_abort(retry_after, abort).await?;
                attempt += 1;
                continue;
            }

            if resp.status().is_server_error() {
                tracing::warn!(status = %resp.status(), %attempt, "rest server error, retrying");
                self.backoff(attempt, abort).await?;
                attempt += 1;
                continue;
            }

            if resp.status() == StatusCode::UNAUTHORIZED {
                return Err(RestError::Unauthorized);
            }

            let status = resp.status();
            let body = resp.json::<serde_json::Value>().await.unwrap_or(serde_json::Value::Null);
            return Ok(RestResponse { status, body });
        }
    }

    async fn wait_for_global_quota(&self, abort: &CancellationToken) -> Result<(), RestError> {
        tokio::select! {
            _ = self.global_limiter.until_ready() => Ok(()),
            _ = abort.cancelled() => Err(RestError::Aborted),
        }
    }

    async fn wait_for_bucket_reset(&self, bucket: Bucket, abort: &CancellationToken) -> Result<(), RestError> {
        let wait = {
            let mut state = self.bucket_state.lock();
            let entry = state.entry(bucket).or_default();
            match (entry.remaining, entry.reset_after) {
                (Some(0), Some(reset_after)) => Some(reset_after),
                _ => None,
            }
        };
        if let Some(wait) = wait {
            self.sleep_or_abort(wait, abort).await?;
            let mut state = self.bucket_state.lock();
            if let Some(entry) = state.get_mut(&bucket) {
                entry.remaining = None;
                entry.reset_after = None;
            }
        }
        Ok(())
    }

    async fn sleep_or_abort(&self, d: Duration, abort: &CancellationToken) -> Result<(), RestError> {
        tokio::select! {
            _ = tokio::time::sleep(d) => Ok(()),
            _ = abort.cancelled() => Err(RestError::Aborted),
        }
    }

    async fn backoff(&self, attempt: u32, abort: &CancellationToken) -> Result<(), RestError> {
        let secs = (2 * (attempt + 1)).min(60);
        self.sleep_or_abort(Duration::from_secs(secs as u64), abort).await
    }

    fn record_rate_limit_headers(&self, bucket: Bucket, headers: &reqwest::header::HeaderMap) {
        let remaining = headers
            .get("X-RateLimit-Remaining")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let reset_after = headers
            .get("X-RateLimit-Reset-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<f64>().ok())
            .map(Duration::from_secs_f64);
        if remaining.is_none() && reset_after.is_none() {
            return;
        }
        let mut state = self.bucket_state.lock();
        let entry = state.entry(bucket).or_default();
        if let Some(remaining) = remaining {
            entry.remaining = Some(remaining);
        }
        if let Some(reset_after) = reset_after {
            entry.reset_after = Some(reset_after);
        }
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get("Retry-After")
        .or_else(|| headers.get("X-RateLimit-Reset-After"))
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<f64>().ok())
        .map(Duration::from_secs_f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_header_parses_fractional_seconds() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("Retry-After", "1.5".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs_f64(1.5)));
    }

    #[test]
    fn rest_response_classifies_client_errors() {
        let forbidden = RestResponse {
            status: StatusCode::FORBIDDEN,
            body: serde_json::Value::Null,
        };
        assert!(matches!(forbidden.into_result(), Err(RestError::Forbidden)));

        let ok = RestResponse {
            status: StatusCode::OK,
            body: serde_json::Value::Null,
        };
        assert!(ok.into_result().is_ok());
    }
}
