//! Disk-space gauges for the cache filesystem.

use std::path::Path;

use nix::sys::statvfs::statvfs;
use tracing::warn;

use crate::metrics::Metrics;

/// Refresh the available/used/total space gauges from `statvfs` on the cache
/// root. Called after every write-producing step and on the GC timer; a probe
/// failure is logged and leaves the gauges at their previous values.
pub fn update_free_disk_space(metrics: &Metrics, cache_root: &Path) {
    match statvfs(cache_root) {
        Ok(stat) => {
            let frsize = stat.fragment_size() as u64;
            let available = stat.blocks_available() as u64 * frsize;
            let used = (stat.blocks() as u64 - stat.blocks_free() as u64) * frsize;
            let total = stat.blocks() as u64 * frsize;
            metrics.disk_cache_available_bytes.set(available as i64);
            metrics.disk_cache_used_bytes.set(used as i64);
            metrics.disk_cache_total_bytes.set(total as i64);
        }
        Err(err) => {
            warn!(path = %cache_root.display(), error = %err, "statvfs on cache root failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsRegistry;

    #[test]
    fn probe_sets_gauges() {
        let reg = MetricsRegistry::new();
        let tmp = tempfile::tempdir().unwrap();
        update_free_disk_space(&reg.metrics, tmp.path());
        assert!(reg.metrics.disk_cache_total_bytes.get() > 0);
    }
}
