//! On-disk cache layout.
//!
//! Every repo owns two directories under the cache root:
//! `<root>/<repo>/temp/` for in-flight downloads and `<root>/<repo>/final/`
//! as the canonical read surface. A path under `final/` either does not
//! exist or holds a complete object; partially written files only ever live
//! under `temp/`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub mod gc;
pub mod tempfile;

/// Reject filenames that could address anything outside a repo's `final/`
/// directory. The filename is the raw client- or listing-supplied suffix;
/// it never gets canonicalised, so every dangerous byte sequence must be
/// refused up front.
pub fn is_unsafe_filename(filename: &str) -> bool {
    filename.starts_with("../")
        || filename.starts_with('/')
        || filename.ends_with("/..")
        || filename.ends_with('/')
        || filename.contains("//")
        || filename.contains("/../")
        || filename.contains("/./")
        || filename.contains('\\')
}

// ---------------------------------------------------------------------------
// CacheLayout
// ---------------------------------------------------------------------------

/// Maps repo names to their on-disk cache directories.
#[derive(Debug, Clone)]
pub struct CacheLayout {
    /// Cache root, `cache/` relative to the working directory by default.
    pub root: PathBuf,
}

impl CacheLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `<root>/<repo>`
    pub fn repo_dir(&self, repo: &str) -> PathBuf {
        self.root.join(repo)
    }

    /// `<root>/<repo>/temp`
    pub fn temp_dir(&self, repo: &str) -> PathBuf {
        self.repo_dir(repo).join("temp")
    }

    /// `<root>/<repo>/final`
    pub fn final_dir(&self, repo: &str) -> PathBuf {
        self.repo_dir(repo).join("final")
    }

    /// Canonical cache location for a file of a repo.
    ///
    /// `filename` must already have passed [`is_unsafe_filename`].
    pub fn final_path(&self, repo: &str, filename: &str) -> PathBuf {
        self.final_dir(repo).join(filename)
    }

    /// Create the `temp/` and `final/` directories for a repo.
    pub async fn ensure_repo_dirs(&self, repo: &str) -> Result<()> {
        for dir in [self.temp_dir(repo), self.final_dir(repo)] {
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("failed to create cache directory {}", dir.display()))?;
        }
        Ok(())
    }

    /// Create the parent directory of a final path, if it has one below
    /// `final/`. Called just before a temp file is materialised.
    pub async fn ensure_final_parent(&self, repo: &str, filename: &str) -> Result<()> {
        if let Some(parent) = Path::new(filename).parent() {
            if !parent.as_os_str().is_empty() {
                let dir = self.final_dir(repo).join(parent);
                tokio::fs::create_dir_all(&dir).await.with_context(|| {
                    format!("failed to create final subdirectory {}", dir.display())
                })?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
