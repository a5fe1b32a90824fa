//! Generic HTML index-crawl listing dialect.
//!
//! Walks Apache/nginx style directory listings starting at the configured
//! base URL. Anchor hrefs are harvested line by line, filtered, and matched;
//! relative subdirectories (trailing `/`) are crawled further. The crawl
//! only enumerates: files are fetched on demand by the request path.

use std::sync::LazyLock;
use std::time::Duration;

use futures::StreamExt;
use regex::Regex;
use tracing::{debug, error, warn};

use super::Prefetcher;
use crate::config::Repo;

/// Upper bound on page fetches per enumeration pass, across all recursion.
const FETCH_LIMIT: usize = 10_000;
/// Pause between index fetches so the crawl does not hammer the upstream.
const INTER_REQUEST_SLEEP: Duration = Duration::from_millis(10);
/// Per-page body cap; index pages beyond this are truncated, not buffered.
const MAX_INDEX_BODY: usize = 10 * 1024 * 1024;

static ANCHOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<[Aa] +(?:href|HREF)="([^"]+)"( |>)"#).expect("anchor regex"));
static SCHEME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z]+://").expect("scheme regex"));

// ---------------------------------------------------------------------------
// Pass
// ---------------------------------------------------------------------------

/// Crawl one repo's index pages. Worklist-driven depth-first walk with a
/// global fetch cap; per-page failures are logged and the crawl moves on.
pub(super) async fn run_pass(p: &Prefetcher, name: &str, repo: &Repo, base: &str) {
    let metrics = &p.state.metrics.metrics;

    let mut worklist: Vec<(String, usize)> = vec![(base.to_string(), 0)];
    let mut total_fetches = 0usize;
    let mut discovered = 0u64;
    let mut skipped_files = 0u64;
    let mut skipped_dirs = 0u64;

    while let Some((url, depth)) = worklist.pop() {
        if total_fetches >= FETCH_LIMIT {
            error!(
                repo = %name,
                limit = FETCH_LIMIT,
                "prefetcher: fetch limit reached, aborting enumeration"
            );
            break;
        }
        total_fetches += 1;

        tokio::time::sleep(INTER_REQUEST_SLEEP).await;

        let resp = match p.client.get(&url).send().await {
            Ok(resp) => resp,
            Err(err) => {
                metrics.prefetch_list_error_count.inc();
                warn!(repo = %name, %url, error = %err, "prefetcher: index request failed");
                continue;
            }
        };
        if resp.status() != reqwest::StatusCode::OK {
            metrics.prefetch_list_error_count.inc();
            warn!(repo = %name, %url, status = %resp.status(), "prefetcher: index returned error status");
            continue;
        }

        let body = match read_index_body(resp).await {
            Ok(body) => body,
            Err(err) => {
                metrics.prefetch_list_error_count.inc();
                warn!(repo = %name, %url, error = %err, "prefetcher: failed to read index body");
                continue;
            }
        };

        for line in body.split(|&b| b == b'\n') {
            let Ok(line) = std::str::from_utf8(line) else {
                continue;
            };
            let Some(href) = extract_href(line) else {
                continue;
            };
            if !href_is_candidate(href) {
                continue;
            }
            if !p.matches(repo, href) {
                if href.ends_with('/') {
                    skipped_dirs += 1;
                } else {
                    skipped_files += 1;
                }
                continue;
            }

            discovered += 1;
            debug!(repo = %name, depth, url = %format!("{url}{href}"), "prefetcher: matched");

            if href.ends_with('/') && total_fetches < FETCH_LIMIT {
                worklist.push((format!("{url}{href}"), depth + 1));
            }
        }
    }

    debug!(
        repo = %name,
        pages = total_fetches,
        discovered,
        skipped_files,
        skipped_dirs,
        "prefetcher: crawl finished"
    );
}

/// Read an index page body up to [`MAX_INDEX_BODY`] bytes; oversized pages
/// are truncated with a warning rather than buffered without bound.
async fn read_index_body(resp: reqwest::Response) -> reqwest::Result<Vec<u8>> {
    let mut stream = resp.bytes_stream();
    let mut buf = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if buf.len() + chunk.len() > MAX_INDEX_BODY {
            buf.extend_from_slice(&chunk[..MAX_INDEX_BODY - buf.len()]);
            warn!(limit = MAX_INDEX_BODY, "prefetcher: index page truncated");
            break;
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

// ---------------------------------------------------------------------------
// Line parsing
// ---------------------------------------------------------------------------

/// First anchor href on the line, if any.
fn extract_href(line: &str) -> Option<&str> {
    Some(ANCHOR_RE.captures(line)?.get(1)?.as_str())
}

/// Only same-directory relative hrefs qualify: absolute URLs, parent or
/// root references, and sort-order query links are navigation, not content.
fn href_is_candidate(href: &str) -> bool {
    if SCHEME_RE.is_match(href) {
        return false;
    }
    if href.starts_with("../") || href.starts_with('/') || href.starts_with('?') {
        return false;
    }
    !href.contains('&')
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use axum::http::{StatusCode, Uri};
    use axum::response::IntoResponse;
    use axum::Router;

    use super::*;
    use crate::cache::CacheLayout;
    use crate::config::{Prefetch, PrefetchMode};
    use crate::metrics::MetricsRegistry;
    use crate::AppState;

    #[test]
    fn extract_href_from_apache_listing() {
        let line = r#"<tr><td valign="top"><img src="/icons/hand.right.gif" alt="[   ]"></td><td><a href="README">README</a></td><td align="right">2022-07-09 08:24  </td></tr>"#;
        assert_eq!(extract_href(line), Some("README"));
    }

    #[test]
    fn extract_href_from_nginx_listing() {
        let line = r#"<tr><td class="link"><a href="edge/" title="edge">edge/</a></td><td class="size">-</td></tr>"#;
        assert_eq!(extract_href(line), Some("edge/"));
    }

    #[test]
    fn extract_href_uppercase_anchor() {
        assert_eq!(extract_href(r#"<A HREF="PKGS.txt">PKGS.txt</A>"#), Some("PKGS.txt"));
    }

    #[test]
    fn extract_href_none_without_anchor() {
        assert_eq!(extract_href("<tr><td>plain cell</td></tr>"), None);
        assert_eq!(extract_href(""), None);
    }

    #[test]
    fn candidate_rules() {
        assert!(href_is_candidate("README"));
        assert!(href_is_candidate("dists/"));
        assert!(href_is_candidate("a/b.txt"));

        // Navigation and external links.
        assert!(!href_is_candidate("http://mirror.example.com/"));
        assert!(!href_is_candidate("https://mirror.example.com/x"));
        assert!(!href_is_candidate("../"));
        assert!(!href_is_candidate("/cdimage/ports/"));
        assert!(!href_is_candidate("?C=N;O=D"));
        assert!(!href_is_candidate("?C=N&amp;O=A"));
        assert!(!href_is_candidate("a&amp;b"));
    }

    /// Mock index server: `/` links a file, a subdirectory, and navigation
    /// noise; `/sub/` links one more file.
    async fn mock_index(page_hits: Arc<AtomicUsize>) -> String {
        let handler = move |uri: Uri| {
            let page_hits = page_hits.clone();
            async move {
                page_hits.fetch_add(1, Ordering::SeqCst);
                let body = match uri.path() {
                    "/" => concat!(
                        r#"<tr><td><a href="../">Parent Directory</a></td></tr>"#,
                        "\n",
                        r#"<tr><td><a href="?C=N;O=D">Name</a></td></tr>"#,
                        "\n",
                        r#"<tr><td><a href="http://elsewhere.example.com/">mirror</a></td></tr>"#,
                        "\n",
                        r#"<tr><td><a href="file.txt">file.txt</a></td></tr>"#,
                        "\n",
                        r#"<tr><td><a href="sub/">sub/</a></td></tr>"#,
                        "\n",
                    ),
                    "/sub/" => r#"<tr><td><a href="deep.txt">deep.txt</a></td></tr>"#,
                    _ => return StatusCode::NOT_FOUND.into_response(),
                };
                (StatusCode::OK, body.to_string()).into_response()
            }
        };
        let app = Router::new().fallback(handler);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn test_state(base: &str, cache_root: &std::path::Path, exclude: &[&str]) -> Arc<AppState> {
        let repo = crate::config::Repo {
            name: "mirror".to_string(),
            upstream_base: format!("{base}/"),
            gc_max_age: Duration::ZERO,
            prefetch: Some(Prefetch {
                mode: PrefetchMode::Generic,
                base: format!("{base}/"),
            }),
            include: Vec::new(),
            exclude: exclude
                .iter()
                .map(|p| regex::Regex::new(p).unwrap())
                .collect(),
        };
        let mut repos = HashMap::new();
        repos.insert("mirror".to_string(), repo);
        Arc::new(AppState {
            repos,
            metrics: MetricsRegistry::new(),
            http_client: reqwest::Client::new(),
            cache: CacheLayout::new(cache_root),
        })
    }

    #[tokio::test]
    async fn crawl_recurses_into_matching_subdirectories() {
        let page_hits = Arc::new(AtomicUsize::new(0));
        let base = mock_index(page_hits.clone()).await;
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(&base, tmp.path(), &[]);

        let prefetcher = Prefetcher::new(Arc::clone(&state)).unwrap();
        let repo = &state.repos["mirror"];
        run_pass(&prefetcher, "mirror", repo, &format!("{base}/")).await;

        // Root page plus the one subdirectory; navigation links skipped.
        assert_eq!(page_hits.load(Ordering::SeqCst), 2);
        // Enumeration only: nothing lands in the cache.
        assert!(!state.cache.final_path("mirror", "file.txt").exists());
    }

    #[tokio::test]
    async fn crawl_respects_excludes_for_directories() {
        let page_hits = Arc::new(AtomicUsize::new(0));
        let base = mock_index(page_hits.clone()).await;
        let tmp = tempfile::tempdir().unwrap();
        let state = test_state(&base, tmp.path(), &["^sub"]);

        let prefetcher = Prefetcher::new(Arc::clone(&state)).unwrap();
        let repo = &state.repos["mirror"];
        run_pass(&prefetcher, "mirror", repo, &format!("{base}/")).await;

        assert_eq!(page_hits.load(Ordering::SeqCst), 1);
        assert_eq!(state.metrics.metrics.prefetch_ignore_count.get(), 1);
    }
}
