//! Upstream registry HTTP client.
//!
//! Thin wrapper over a shared [`reqwest::Client`] for the two upstream
//! surfaces the background pipelines talk to: per-package metadata
//! documents and the changes feed.  The proxy's request path uses the
//! shared client directly because it forwards arbitrary requests.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;

use crate::config::UpstreamConfig;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// A fetched full metadata document together with its wire size, which
/// feeds the raw-size memory.
#[derive(Debug)]
pub struct MetadataDoc {
    pub raw_len: u64,
    pub doc: Value,
}

/// One page of the changes feed.
#[derive(Debug, Deserialize)]
pub struct ChangesPage {
    #[serde(default)]
    pub results: Vec<Change>,
    pub last_seq: Value,
}

/// A single entry in the changes feed.  `seq` may be an integer or an
/// opaque string depending on the upstream.
#[derive(Debug, Deserialize)]
pub struct Change {
    pub seq: Value,
    pub id: String,
    #[serde(default)]
    pub deleted: bool,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    registry_url: String,
    changes_url: String,
    metadata_timeout: Duration,
}

impl UpstreamClient {
    pub fn new(client: reqwest::Client, config: &UpstreamConfig) -> Self {
        Self {
            client,
            registry_url: config.registry_url.trim_end_matches('/').to_string(),
            changes_url: config.changes_url.clone(),
            metadata_timeout: Duration::from_secs(config.metadata_timeout_secs),
        }
    }

    /// Fetch and parse the full metadata document for `name`.
    ///
    /// No `accept-encoding` is sent, so the body arrives as identity and
    /// can be parsed directly.
    pub async fn fetch_metadata(&self, name: &str) -> Result<MetadataDoc> {
        let url = format!("{}/{}", self.registry_url, name);
        let resp = self
            .client
            .get(&url)
            .header("accept", "application/json")
            .timeout(self.metadata_timeout)
            .send()
            .await
            .with_context(|| format!("metadata request for {name} failed"))?;

        if !resp.status().is_success() {
            bail!("upstream returned {} for {name}", resp.status());
        }

        let bytes = resp
            .bytes()
            .await
            .with_context(|| format!("failed to read metadata body for {name}"))?;
        let doc: Value = serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to parse metadata for {name}"))?;

        Ok(MetadataDoc {
            raw_len: bytes.len() as u64,
            doc,
        })
    }

    /// Request one page of the changes feed.  The response is returned
    /// unparsed so the caller can react to the status (429 drives the
    /// backoff) before committing to a body read.
    pub async fn changes(&self, since: &str, limit: usize) -> Result<reqwest::Response> {
        let limit = limit.to_string();
        let resp = self
            .client
            .get(&self.changes_url)
            .query(&[("since", since), ("limit", limit.as_str())])
            .header("accept", "application/json")
            .timeout(self.metadata_timeout)
            .send()
            .await
            .context("changes feed request failed")?;
        Ok(resp)
    }
}
