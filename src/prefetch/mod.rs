//! Upstream prefetching.
//!
//! One background task enumerates each repo's upstream on a fixed interval
//! and downloads listed files that are missing from the cache. Two listing
//! dialects exist: the Nexus assets REST API ([`nexus`]) and a recursive
//! HTML index crawl ([`generic`]). Both feed candidate paths through the
//! same include/exclude matcher and the shared fetch-if-absent [`process`]
//! action.
//!
//! [`process`]: Prefetcher::process

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use futures::StreamExt;
use regex::Regex;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::cache::tempfile::TempFile;
use crate::cache::is_unsafe_filename;
use crate::config::{PrefetchMode, Repo};
use crate::disk::update_free_disk_space;

pub mod generic;
pub mod nexus;

const PREFETCH_INTERVAL: Duration = Duration::from_secs(60);
/// Overall per-request timeout for listing and prefetch downloads.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub const USER_AGENT: &str = concat!("artifactcache/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// Prefetcher
// ---------------------------------------------------------------------------

/// Per-process prefetcher over all configured repos.
///
/// Passes are strictly sequential: one repo at a time, one download in
/// flight, and the next tick only starts after the previous pass returned.
pub struct Prefetcher {
    state: Arc<crate::AppState>,
    client: reqwest::Client,
}

impl Prefetcher {
    pub fn new(state: Arc<crate::AppState>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build prefetch HTTP client")?;
        Ok(Self { state, client })
    }

    /// Run one synchronous pass over all repos, then tick every 60 seconds
    /// until `stop` fires.
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        info!("prefetcher: initial pass started");
        self.pass().await;
        info!("prefetcher: initial pass finished");

        let mut ticker = tokio::time::interval(PREFETCH_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // the first tick completes immediately

        loop {
            tokio::select! {
                _ = ticker.tick() => self.pass().await,
                _ = stop.changed() => {
                    info!("prefetcher: stop signal received");
                    return;
                }
            }
        }
    }

    async fn pass(&self) {
        for (name, repo) in &self.state.repos {
            self.update_repo(name, repo).await;
        }
    }

    /// One enumeration pass over a single repo.
    async fn update_repo(&self, name: &str, repo: &Repo) {
        let Some(prefetch) = &repo.prefetch else {
            debug!(repo = %name, "prefetcher: skipped, no prefetch configured");
            return;
        };
        if prefetch.base.is_empty() {
            debug!(repo = %name, "prefetcher: skipped, empty listing base");
            return;
        }

        let metrics = &self.state.metrics.metrics;
        info!(repo = %name, "prefetcher: pass started");
        let t1 = Instant::now();
        update_free_disk_space(metrics, &self.state.cache.root);
        metrics.prefetch_in_progress.set(1);

        match prefetch.mode {
            PrefetchMode::Nexus => nexus::run_pass(self, name, repo, &prefetch.base).await,
            PrefetchMode::Generic => generic::run_pass(self, name, repo, &prefetch.base).await,
        }

        update_free_disk_space(metrics, &self.state.cache.root);
        metrics
            .prefetch_loop_seconds
            .observe(t1.elapsed().as_secs_f64());
        metrics
            .prefetch_last_loop_seconds
            .set(t1.elapsed().as_secs_f64());
        metrics.prefetch_in_progress.set(0);
        info!(repo = %name, elapsed = ?t1.elapsed(), "prefetcher: pass finished");
    }

    /// Admission test for a listed name; non-passing names increment the
    /// ignored counter.
    fn matches(&self, repo: &Repo, filename: &str) -> bool {
        let passed = filter_matches(&repo.include, &repo.exclude, filename);
        if !passed {
            self.state.metrics.metrics.prefetch_ignore_count.inc();
        }
        passed
    }

    /// Fetch a listed file into the cache unless it is already present.
    ///
    /// Download bytes are counted even for partial transfers; a failed copy
    /// leaves no trace (the temp file cleans itself up on drop).
    async fn process(&self, name: &str, repo: &Repo, item_path: &str) -> Result<()> {
        let metrics = &self.state.metrics.metrics;

        if !self.matches(repo, item_path) {
            return Ok(());
        }
        // Listings are upstream-controlled input; hold them to the same
        // path rules as client requests.
        if is_unsafe_filename(item_path) {
            bail!("listed path {item_path:?} contains a prohibited byte sequence");
        }

        let final_path = self.state.cache.final_path(name, item_path);
        match tokio::fs::metadata(&final_path).await {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            // Present, or unreadable: either way not worth downloading.
            _ => {
                metrics.prefetch_skip_count.inc();
                return Ok(());
            }
        }

        info!(repo = %name, path = %item_path, "prefetcher: fetching missing file");

        let url = format!("{}{}", repo.upstream_base, item_path);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("upstream request for {url} failed"))?;
        if resp.status() != reqwest::StatusCode::OK {
            bail!("upstream returned status {} for {url}", resp.status());
        }

        let temp_dir = self.state.cache.temp_dir(name);
        let mut temp = TempFile::create(&temp_dir, item_path, final_path)?;

        let mut stream = resp.bytes_stream();
        let mut copied: u64 = 0;
        let mut copy_err: Option<anyhow::Error> = None;
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => {
                    if let Err(err) = temp.file_mut().write_all(&chunk).await {
                        copy_err =
                            Some(anyhow::Error::new(err).context("write to temp file failed"));
                        break;
                    }
                    copied += chunk.len() as u64;
                }
                Err(err) => {
                    copy_err = Some(anyhow::Error::new(err).context("read from upstream failed"));
                    break;
                }
            }
        }
        metrics.prefetch_download_bytes.inc_by(copied);
        if let Some(err) = copy_err {
            return Err(err);
        }

        self.state.cache.ensure_final_parent(name, item_path).await?;
        temp.finalize().await?;
        metrics.prefetch_download_count.inc();
        update_free_disk_space(metrics, &self.state.cache.root);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Include/exclude matcher
// ---------------------------------------------------------------------------

/// A filename passes when the include list is empty or any include matches,
/// and no exclude matches. An explicit exclude beats an implicit
/// include-all.
fn filter_matches(include: &[Regex], exclude: &[Regex], filename: &str) -> bool {
    if !include.is_empty() && !include.iter().any(|re| re.is_match(filename)) {
        return false;
    }
    !exclude.iter().any(|re| re.is_match(filename))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
