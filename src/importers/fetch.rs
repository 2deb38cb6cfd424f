use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tracing::debug;

use crate::errors::ImportError;

const USER_AGENT: &str = concat!("crowdtask/", env!("CARGO_PKG_VERSION"));

/// What the importers need to know about an HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedResponse {
    pub status: u16,
    /// Raw `Content-Type` header, empty when absent.
    pub content_type: String,
    pub body: String,
}

impl FetchedResponse {
    pub fn content_type_contains(&self, needle: &str) -> bool {
        self.content_type.to_ascii_lowercase().contains(needle)
    }
}

/// GET access to remote task sources.
///
/// Non-2xx statuses are returned as responses, not errors: each importer
/// decides what a 403 or 404 means for its source. Only transport failures
/// are errors.
#[async_trait]
pub trait RemoteFetcher: Send + Sync {
    async fn get(&self, url: &str, query: &[(&str, String)]) -> Result<FetchedResponse, ImportError>;
}

/// `RemoteFetcher` over a shared reqwest client.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RemoteFetcher for HttpFetcher {
    async fn get(&self, url: &str, query: &[(&str, String)]) -> Result<FetchedResponse, ImportError> {
        let fetch_error = |e: reqwest::Error| ImportError::Fetch {
            url: url.to_string(),
            reason: e.to_string(),
        };

        let resp = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(fetch_error)?;

        let status = resp.status().as_u16();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = resp.text().await.map_err(fetch_error)?;
        debug!(url, status, content_type = %content_type, bytes = body.len(), "Fetched remote source");

        Ok(FetchedResponse {
            status,
            content_type,
            body,
        })
    }
}
