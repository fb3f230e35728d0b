//! Bilibili `x/web-interface/view` client.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use catalogsync_shared::{CatalogSyncError, CoverSettings, Result};

use crate::{CoverLookup, LookupOutcome};

/// User-Agent string for lookup requests.
const USER_AGENT: &str = concat!("catalogsync/", env!("CARGO_PKG_VERSION"));

/// Video does not exist or was deleted.
const CODE_VIDEO_MISSING: i64 = 62002;
/// Generic "not found".
const CODE_NOT_FOUND: i64 = -404;
/// Request rate too high.
const CODE_RATE_LIMITED: i64 = -509;
/// Request intercepted by risk control.
const CODE_INTERCEPTED: i64 = -412;
/// Request frequency too high (newer code).
const CODE_TOO_FREQUENT: i64 = -799;

#[derive(Debug, Deserialize)]
struct ViewResponse {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<ViewData>,
}

#[derive(Debug, Deserialize)]
struct ViewData {
    #[serde(default)]
    pic: Option<String>,
}

/// Client for video metadata on `api.bilibili.com`.
pub struct BilibiliClient {
    client: Client,
    view_url: Url,
}

impl BilibiliClient {
    /// Build a client whose every call is bounded by `settings.timeout`.
    pub fn new(settings: &CoverSettings) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(settings.timeout)
            .build()
            .map_err(|e| CatalogSyncError::Network(format!("failed to build HTTP client: {e}")))?;

        let view_url = settings
            .base_url
            .join("x/web-interface/view")
            .map_err(|e| CatalogSyncError::config(format!("invalid covers.base_url: {e}")))?;

        Ok(Self { client, view_url })
    }
}

#[async_trait]
impl CoverLookup for BilibiliClient {
    async fn lookup(&self, source_ref: &str) -> LookupOutcome {
        let response = match self
            .client
            .get(self.view_url.clone())
            .query(&[("bvid", source_ref)])
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_timeout() => return LookupOutcome::Timeout,
            Err(e) => return LookupOutcome::Retryable(format!("request failed: {e}")),
        };

        let status = response.status();
        if let Some(outcome) = classify_status(status) {
            debug!(source_ref, %status, "cover lookup rejected");
            return outcome;
        }

        match response.json::<ViewResponse>().await {
            Ok(body) => classify_body(body),
            Err(e) if e.is_timeout() => LookupOutcome::Timeout,
            Err(e) => LookupOutcome::Retryable(format!("malformed response: {e}")),
        }
    }
}

/// HTTP-level classification. `None` means the body should be inspected.
fn classify_status(status: StatusCode) -> Option<LookupOutcome> {
    if status.is_success() {
        return None;
    }
    let outcome = match status {
        StatusCode::NOT_FOUND => LookupOutcome::Terminal(format!("HTTP {status}")),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::PRECONDITION_FAILED => {
            LookupOutcome::Retryable(format!("rate limited (HTTP {status})"))
        }
        s if s.is_server_error() => LookupOutcome::Retryable(format!("HTTP {status}")),
        _ => LookupOutcome::Retryable(format!("unexpected HTTP {status}")),
    };
    Some(outcome)
}

fn classify_body(body: ViewResponse) -> LookupOutcome {
    match body.code {
        0 => match body.data.and_then(|d| d.pic).filter(|p| !p.is_empty()) {
            Some(pic) => LookupOutcome::Success(pic),
            None => LookupOutcome::Terminal("video has no cover".into()),
        },
        CODE_VIDEO_MISSING | CODE_NOT_FOUND => {
            LookupOutcome::Terminal(format!("{}: {}", body.code, body.message))
        }
        CODE_RATE_LIMITED | CODE_INTERCEPTED | CODE_TOO_FREQUENT => {
            LookupOutcome::Retryable(format!("rate limited ({})", body.code))
        }
        code => LookupOutcome::Retryable(format!("api error {code}: {}", body.message)),
    }
}
