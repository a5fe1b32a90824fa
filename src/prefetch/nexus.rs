//! Nexus assets-API listing dialect.
//!
//! Pages through `GET <base>` / `GET <base>&continuationToken=<token>` where
//! each page is a JSON [`NexusAssetsResponse`]. Only the `path` of each item
//! feeds the shared fetch-if-absent action; the other fields are carried for
//! completeness of the wire model.

use std::collections::HashMap;

use serde::Deserialize;
use tracing::warn;

use super::Prefetcher;
use crate::config::Repo;

// ---------------------------------------------------------------------------
// Wire model
// ---------------------------------------------------------------------------

/// One asset record from the Nexus listing API. Only `path` drives the
/// prefetcher; the remaining fields mirror the wire format.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(dead_code)]
pub struct NexusItem {
    #[serde(default)]
    pub download_url: String,
    pub path: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub checksum: HashMap<String, String>,
}

/// One page of the assets listing. An empty or absent continuation token
/// marks the last page.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NexusAssetsResponse {
    #[serde(default)]
    pub items: Vec<NexusItem>,
    #[serde(default)]
    pub continuation_token: Option<String>,
}

// ---------------------------------------------------------------------------
// Pass
// ---------------------------------------------------------------------------

/// Enumerate one repo through the assets API. Any transport, status, or
/// decode error ends this pass; the next tick starts a fresh one.
pub(super) async fn run_pass(p: &Prefetcher, name: &str, repo: &Repo, base: &str) {
    let metrics = &p.state.metrics.metrics;
    let mut continuation: Option<String> = None;

    loop {
        let url = match &continuation {
            Some(token) => format!("{base}&continuationToken={token}"),
            None => base.to_string(),
        };

        metrics.prefetch_list_request_count.inc();
        let resp = match p.client.get(&url).send().await {
            Ok(resp) => resp,
            Err(err) => {
                metrics.prefetch_list_error_count.inc();
                warn!(repo = %name, error = %err, "prefetcher: listing request failed");
                return;
            }
        };
        if resp.status() != reqwest::StatusCode::OK {
            metrics.prefetch_list_error_count.inc();
            warn!(repo = %name, status = %resp.status(), "prefetcher: listing returned error status");
            return;
        }

        let page: NexusAssetsResponse = match resp.json().await {
            Ok(page) => page,
            Err(err) => {
                metrics.prefetch_list_error_count.inc();
                warn!(repo = %name, error = %err, "prefetcher: failed to decode assets response");
                return;
            }
        };

        for item in &page.items {
            if let Err(err) = p.process(name, repo, &item.path).await {
                metrics.prefetch_download_error_count.inc();
                warn!(
                    repo = %name,
                    path = %item.path,
                    error = %err,
                    "prefetcher: failed to process listed item"
                );
            }
        }

        match page.continuation_token {
            Some(token) if !token.is_empty() => continuation = Some(token),
            _ => return,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
