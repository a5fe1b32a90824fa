//! Age-based cache garbage collection.
//!
//! One background task walks every repo's cache directory on a fixed
//! interval and unlinks regular files whose mtime, atime, **and** ctime are
//! all older than the repo's configured max age. Keeping the newest of the
//! three timestamps as the ageing signal means a file stays cached while any
//! of write, read, or metadata activity is recent.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::config::Repo;
use crate::disk::update_free_disk_space;
use crate::metrics::Metrics;
use crate::AppState;

const GC_INTERVAL: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

/// Per-process garbage collector over all configured repos.
pub struct GcScanner {
    state: Arc<AppState>,
}

impl GcScanner {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Run one synchronous pass over all repos, then tick every 60 seconds
    /// until `stop` fires. A tick only starts after the previous pass
    /// returned.
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        info!("gc: initial pass started");
        self.pass().await;
        info!("gc: initial pass finished");

        let mut ticker = tokio::time::interval(GC_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // the first tick completes immediately

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    update_free_disk_space(&self.state.metrics.metrics, &self.state.cache.root);
                    self.pass().await;
                }
                _ = stop.changed() => {
                    info!("gc: stop signal received");
                    return;
                }
            }
        }
    }

    async fn pass(&self) {
        for (name, repo) in &self.state.repos {
            self.scan_repo(name, repo).await;
        }
    }

    /// One GC pass over a single repo.
    async fn scan_repo(&self, name: &str, repo: &Repo) {
        if repo.gc_max_age.is_zero() {
            debug!(repo = %name, "gc: skipped, no max age configured");
            return;
        }

        let metrics = &self.state.metrics.metrics;
        info!(repo = %name, "gc: pass started");
        let t1 = Instant::now();
        metrics.gc_in_progress.set(1);

        let root = self.state.cache.repo_dir(name);
        let max_age = repo.gc_max_age;
        let scan_metrics = Arc::clone(&self.state.metrics.metrics);

        // The walk is synchronous; keep it off the runtime workers.
        let summary =
            tokio::task::spawn_blocking(move || scan_dir(&root, max_age, &scan_metrics)).await;

        match summary {
            Ok(s) => {
                metrics.gc_retained_bytes.set(s.retained_bytes as i64);
                metrics
                    .gc_retained_files
                    .set(s.files.saturating_sub(s.removed) as i64);
                metrics.disk_cache_size_bytes.set(s.retained_bytes as i64);
                info!(
                    repo = %name,
                    dirs = s.dirs,
                    files = s.files,
                    retained_bytes = s.retained_bytes,
                    removed = s.removed,
                    removed_bytes = s.removed_bytes,
                    elapsed = ?t1.elapsed(),
                    "gc: pass finished"
                );
            }
            Err(err) => {
                metrics.gc_error_count.inc();
                error!(repo = %name, error = %err, "gc: scan task failed");
            }
        }

        update_free_disk_space(metrics, &self.state.cache.root);
        metrics.gc_loop_seconds.observe(t1.elapsed().as_secs_f64());
        metrics
            .gc_last_loop_seconds
            .set(t1.elapsed().as_secs_f64());
        metrics.gc_in_progress.set(0);
    }
}

// ---------------------------------------------------------------------------
// Walk
// ---------------------------------------------------------------------------

#[derive(Debug, Default, PartialEq, Eq)]
struct ScanSummary {
    dirs: u64,
    files: u64,
    removed: u64,
    retained_bytes: u64,
    removed_bytes: u64,
}

/// Walk `root`, removing expired regular files. Concurrent writers may add
/// or remove entries mid-walk; vanished entries are ignored, and per-entry
/// failures never abort the walk.
fn scan_dir(root: &Path, max_age: Duration, metrics: &Metrics) -> ScanSummary {
    let mut s = ScanSummary::default();
    let now = SystemTime::now();

    for entry in WalkDir::new(root) {
        let entry = match entry {
            Ok(e) => e,
            Err(err) => {
                if err
                    .io_error()
                    .is_some_and(|e| e.kind() == std::io::ErrorKind::NotFound)
                {
                    continue;
                }
                metrics.gc_error_count.inc();
                warn!(error = %err, "gc: failed to read directory entry");
                continue;
            }
        };

        if entry.file_type().is_dir() {
            s.dirs += 1;
            continue;
        }
        if !entry.file_type().is_file() {
            continue;
        }

        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(err) => {
                if err
                    .io_error()
                    .is_some_and(|e| e.kind() == std::io::ErrorKind::NotFound)
                {
                    // Vanished between listing and stat.
                    continue;
                }
                // Unknown age: count the file but never delete it.
                s.files += 1;
                metrics.gc_error_count.inc();
                warn!(path = %entry.path().display(), error = %err, "gc: stat failed");
                continue;
            }
        };

        s.files += 1;

        if !expired(&meta, now, max_age) {
            s.retained_bytes += meta.len();
            continue;
        }

        debug!(path = %entry.path().display(), "gc: removing expired file");
        match std::fs::remove_file(entry.path()) {
            Ok(()) => {
                s.removed += 1;
                s.removed_bytes += meta.len();
            }
            Err(err) => {
                metrics.gc_error_count.inc();
                warn!(path = %entry.path().display(), error = %err, "gc: remove failed");
                // The file is still on disk, so it still counts as retained.
                s.retained_bytes += meta.len();
            }
        }
    }

    s
}

/// A file is deletable only when mtime, atime, and ctime are all strictly
/// older than `max_age`.
fn expired(meta: &std::fs::Metadata, now: SystemTime, max_age: Duration) -> bool {
    use std::os::unix::fs::MetadataExt;

    let Ok(now_since_epoch) = now.duration_since(UNIX_EPOCH) else {
        return false;
    };
    let now_ns = now_since_epoch.as_nanos() as i128;

    let stamps_ns = [
        meta.mtime() as i128 * 1_000_000_000 + meta.mtime_nsec() as i128,
        meta.atime() as i128 * 1_000_000_000 + meta.atime_nsec() as i128,
        meta.ctime() as i128 * 1_000_000_000 + meta.ctime_nsec() as i128,
    ];

    all_timestamps_older(now_ns, stamps_ns, max_age.as_nanos() as i128)
}

fn all_timestamps_older(now_ns: i128, stamps_ns: [i128; 3], max_age_ns: i128) -> bool {
    stamps_ns.into_iter().all(|ts| now_ns - ts > max_age_ns)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsRegistry;

    const HOUR_NS: i128 = 3_600 * 1_000_000_000;

    #[test]
    fn all_three_timestamps_must_be_old() {
        let now = 100 * HOUR_NS;
        let max_age = HOUR_NS;

        // (2h ago, 2h ago, 2h ago): deletable.
        assert!(all_timestamps_older(
            now,
            [now - 2 * HOUR_NS, now - 2 * HOUR_NS, now - 2 * HOUR_NS],
            max_age
        ));

        // (2h ago, 30m ago, 2h ago): one fresh timestamp keeps the file.
        assert!(!all_timestamps_older(
            now,
            [now - 2 * HOUR_NS, now - HOUR_NS / 2, now - 2 * HOUR_NS],
            max_age
        ));
    }

    #[test]
    fn exactly_max_age_is_not_older() {
        let now = 100 * HOUR_NS;
        assert!(!all_timestamps_older(
            now,
            [now - HOUR_NS, now - HOUR_NS, now - HOUR_NS],
            HOUR_NS
        ));
    }

    #[test]
    fn fresh_files_are_retained() {
        let reg = MetricsRegistry::new();
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("fresh.bin"), b"abcd").unwrap();

        let s = scan_dir(tmp.path(), Duration::from_secs(3600), &reg.metrics);
        assert_eq!(s.files, 1);
        assert_eq!(s.removed, 0);
        assert_eq!(s.retained_bytes, 4);
    }

    #[test]
    fn young_ctime_protects_despite_old_mtime_atime() {
        // set_times can age mtime and atime, but ctime is always "now":
        // exactly the case where the three-way rule must keep the file.
        let reg = MetricsRegistry::new();
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("old-content.bin");
        std::fs::write(&path, b"abcd").unwrap();

        let two_hours_ago = SystemTime::now() - Duration::from_secs(2 * 3600);
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_times(
            std::fs::FileTimes::new()
                .set_accessed(two_hours_ago)
                .set_modified(two_hours_ago),
        )
        .unwrap();
        drop(file);

        let s = scan_dir(tmp.path(), Duration::from_secs(3600), &reg.metrics);
        assert_eq!(s.removed, 0);
        assert_eq!(s.files, 1);
        assert!(path.exists());
    }

    #[test]
    fn missing_root_scans_empty() {
        let reg = MetricsRegistry::new();
        let tmp = tempfile::tempdir().unwrap();
        let s = scan_dir(
            &tmp.path().join("nonexistent"),
            Duration::from_secs(3600),
            &reg.metrics,
        );
        assert_eq!(s.files, 0);
    }
}
