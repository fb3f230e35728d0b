//! Notion database query client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use catalogsync_shared::{CatalogSyncError, NotionSettings, Result};

use crate::properties::RawPage;

/// User-Agent string for upstream requests.
const USER_AGENT: &str = concat!("catalogsync/", env!("CARGO_PKG_VERSION"));

/// One page of a paginated upstream query.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourcePage {
    #[serde(default)]
    pub results: Vec<RawPage>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// Paginated access to an upstream record source.
#[async_trait]
pub trait SourceApi: Send + Sync {
    /// Fetch one page of `source_id`, continuing from `cursor` if given.
    async fn query_page(&self, source_id: &str, cursor: Option<&str>) -> Result<SourcePage>;
}

/// Client for `POST /databases/{id}/query`.
pub struct NotionClient {
    client: Client,
    base_url: Url,
    api_key: String,
    notion_version: String,
    page_size: u32,
}

impl NotionClient {
    pub fn new(settings: &NotionSettings) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| CatalogSyncError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: settings.base_url.clone(),
            api_key: settings.api_key.clone(),
            notion_version: settings.notion_version.clone(),
            page_size: settings.page_size,
        })
    }
}

#[async_trait]
impl SourceApi for NotionClient {
    async fn query_page(&self, source_id: &str, cursor: Option<&str>) -> Result<SourcePage> {
        let url = self
            .base_url
            .join(&format!("databases/{source_id}/query"))
            .map_err(|e| CatalogSyncError::config(format!("invalid database id {source_id}: {e}")))?;

        let mut body = serde_json::json!({ "page_size": self.page_size });
        if let Some(cursor) = cursor {
            body["start_cursor"] = serde_json::Value::from(cursor);
        }

        debug!(%url, ?cursor, "querying notion database");

        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .header("Notion-Version", &self.notion_version)
            .json(&body)
            .send()
            .await
            .map_err(|e| CatalogSyncError::Network(format!("notion query {source_id}: {e}")))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(CatalogSyncError::Unauthorized(format!(
                "notion rejected the API key for database {source_id} (HTTP {status})"
            )));
        }
        if !status.is_success() {
            return Err(CatalogSyncError::Network(format!(
                "notion query {source_id}: HTTP {status}"
            )));
        }

        response
            .json::<SourcePage>()
            .await
            .map_err(|e| CatalogSyncError::parse(format!("notion query {source_id}: {e}")))
    }
}
