//! Atomic write-then-materialise temp files.
//!
//! A [`TempFile`] is a writable handle inside a repo's `temp/` directory that
//! becomes visible at its final cache path only through [`TempFile::finalize`].
//! Two backings exist:
//!
//! - **Anonymous**: an unnamed `O_TMPFILE` inode, reachable only through the
//!   open descriptor. Finalisation links the descriptor at the final path via
//!   `/proc/self/fd`. Readers can never observe a partial file, and an
//!   abandoned handle vanishes when the descriptor closes.
//! - **Named**: a uniquely named `YYYYMMDDhhmmss_<basename>.<random>` file,
//!   used when the kernel or filesystem rejects `O_TMPFILE` (EISDIR from old
//!   kernels, EOPNOTSUPP from e.g. overlayfs). Finalisation syncs and closes
//!   the file, then renames it into place.
//!
//! Dropping a handle without finalising is the cleanup path: the descriptor
//! closes and, for the named backing, the temp path unlinks itself. Because
//! `finalize` consumes the handle, a final path is created at most once per
//! handle and cleanup-after-finalise cannot happen at all.

use std::ffi::CString;
use std::os::fd::{FromRawFd, IntoRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::libc;
use nix::sys::stat::Mode;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

enum Backing {
    /// Unnamed inode; only reachable through the open descriptor.
    Anonymous,
    /// Named temp file; the `TempPath` unlinks it on drop unless persisted.
    Named { path: tempfile::TempPath },
}

/// A temp file destined for `final_path`.
pub struct TempFile {
    file: File,
    backing: Backing,
    final_path: PathBuf,
}

impl TempFile {
    /// Open a writable temp file in `dir`, targeting `final_path`.
    ///
    /// Tries the anonymous backing first and falls back to a named temp file
    /// on the two errnos that signal missing `O_TMPFILE` support.
    pub fn create(dir: &Path, filename: &str, final_path: PathBuf) -> Result<Self> {
        match nix::fcntl::open(
            dir,
            OFlag::O_TMPFILE | OFlag::O_RDWR | OFlag::O_CLOEXEC,
            Mode::from_bits_truncate(0o600),
        ) {
            Ok(fd) => {
                // Safety: the descriptor was just opened and is owned here.
                let std_file = unsafe { std::fs::File::from_raw_fd(fd) };
                Ok(Self {
                    file: File::from_std(std_file),
                    backing: Backing::Anonymous,
                    final_path,
                })
            }
            Err(Errno::EISDIR) | Err(Errno::EOPNOTSUPP) => {
                Self::create_named(dir, filename, final_path)
            }
            Err(err) => Err(err).with_context(|| {
                format!("failed to open unnamed temp file in {}", dir.display())
            }),
        }
    }

    /// Named fallback: `YYYYMMDDhhmmss_<basename>.<random>` in `dir`,
    /// created with `O_EXCL` so the name is guaranteed fresh.
    fn create_named(dir: &Path, filename: &str, final_path: PathBuf) -> Result<Self> {
        let basename = Path::new(filename)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        // Seconds resolution; uniqueness comes from the random suffix.
        let stamp = chrono::Local::now().format("%Y%m%d%H%M%S");
        let named = tempfile::Builder::new()
            .prefix(&format!("{stamp}_{basename}."))
            .tempfile_in(dir)
            .with_context(|| format!("failed to create named temp file in {}", dir.display()))?;
        let (std_file, path) = named.into_parts();
        Ok(Self {
            file: File::from_std(std_file),
            backing: Backing::Named { path },
            final_path,
        })
    }

    /// The append target for the download loop.
    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// Materialise the temp file at its final path.
    ///
    /// The final path's parent directory must already exist. For the
    /// anonymous backing an existing file at the final path makes the link
    /// fail and the written bytes are discarded with the inode; another
    /// writer got there first with a complete object.
    pub async fn finalize(self) -> Result<()> {
        let TempFile {
            mut file,
            backing,
            final_path,
        } = self;

        match backing {
            Backing::Anonymous => {
                // The descriptor must stay open until after the link.
                file.flush()
                    .await
                    .context("failed to flush temp file before linking")?;
                let fd = file.into_std().await.into_raw_fd();
                let link_res = link_fd_at(fd, &final_path);
                // Close always runs; a link failure takes precedence, but a
                // close failure after a successful link still surfaces (the
                // kernel may only report write-back errors at close).
                let close_res = nix::unistd::close(fd);
                link_res.with_context(|| {
                    format!("failed to link temp file at {}", final_path.display())
                })?;
                close_res.context("failed to close temp file")?;
                Ok(())
            }
            Backing::Named { path } => {
                // Sync and close first: rename could succeed while write-back
                // still fails (disk full, NFS), leaving a corrupt final file.
                file.sync_all()
                    .await
                    .context("failed to sync temp file before rename")?;
                drop(file);
                path.persist(&final_path).map_err(|e| {
                    // Dropping e.path unlinks the leftover temp file.
                    anyhow::Error::new(e.error).context(format!(
                        "failed to rename temp file to {}",
                        final_path.display()
                    ))
                })
            }
        }
    }

    #[cfg(test)]
    fn is_anonymous(&self) -> bool {
        matches!(self.backing, Backing::Anonymous)
    }
}

/// Link an open descriptor's inode at `final_path` through the magic
/// `/proc/self/fd` path. Plain `link(2)` would link the proc symlink itself,
/// so this must be `linkat(2)` with `AT_SYMLINK_FOLLOW`.
fn link_fd_at(fd: RawFd, final_path: &Path) -> std::io::Result<()> {
    let src = CString::new(format!("/proc/self/fd/{fd}"))?;
    let dst = CString::new(final_path.as_os_str().as_bytes())?;
    // Safety: both arguments are valid NUL-terminated paths.
    let rc = unsafe {
        libc::linkat(
            libc::AT_FDCWD,
            src.as_ptr(),
            libc::AT_FDCWD,
            dst.as_ptr(),
            libc::AT_SYMLINK_FOLLOW,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    struct Dirs {
        _root: tempfile::TempDir,
        temp: PathBuf,
        final_dir: PathBuf,
    }

    fn dirs() -> Dirs {
        let root = tempfile::tempdir().unwrap();
        let temp = root.path().join("temp");
        let final_dir = root.path().join("final");
        std::fs::create_dir_all(&temp).unwrap();
        std::fs::create_dir_all(&final_dir).unwrap();
        Dirs {
            _root: root,
            temp,
            final_dir,
        }
    }

    fn temp_entries(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[tokio::test]
    async fn finalize_materialises_exact_bytes() {
        let d = dirs();
        let final_path = d.final_dir.join("b.txt");

        let mut tf = TempFile::create(&d.temp, "b.txt", final_path.clone()).unwrap();
        tf.file_mut().write_all(b"hello").await.unwrap();
        tf.finalize().await.unwrap();

        assert_eq!(std::fs::read(&final_path).unwrap(), b"hello");
        assert_eq!(temp_entries(&d.temp), 0);
    }

    #[tokio::test]
    async fn nothing_visible_before_finalize() {
        let d = dirs();
        let final_path = d.final_dir.join("b.txt");

        let mut tf = TempFile::create(&d.temp, "b.txt", final_path.clone()).unwrap();
        tf.file_mut().write_all(b"partial").await.unwrap();
        tf.file_mut().flush().await.unwrap();

        assert!(!final_path.exists());
        assert!(std::fs::read_dir(&d.final_dir).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn drop_is_cleanup() {
        let d = dirs();
        let final_path = d.final_dir.join("b.txt");

        let mut tf = TempFile::create(&d.temp, "b.txt", final_path.clone()).unwrap();
        tf.file_mut().write_all(b"doomed").await.unwrap();
        drop(tf);

        assert!(!final_path.exists());
        assert_eq!(temp_entries(&d.temp), 0);
    }

    #[tokio::test]
    async fn named_backing_roundtrip() {
        let d = dirs();
        let final_path = d.final_dir.join("b.txt");

        let mut tf = TempFile::create_named(&d.temp, "a/b.txt", final_path.clone()).unwrap();
        // Only the basename lands in the temp file name.
        let entry = std::fs::read_dir(&d.temp).unwrap().next().unwrap().unwrap();
        let name = entry.file_name().to_string_lossy().into_owned();
        assert!(name.contains("_b.txt."), "unexpected temp name {name}");

        tf.file_mut().write_all(b"named").await.unwrap();
        tf.finalize().await.unwrap();

        assert_eq!(std::fs::read(&final_path).unwrap(), b"named");
        assert_eq!(temp_entries(&d.temp), 0);
    }

    #[tokio::test]
    async fn named_backing_drop_unlinks() {
        let d = dirs();
        let tf = TempFile::create_named(&d.temp, "b.txt", d.final_dir.join("b.txt")).unwrap();
        assert_eq!(temp_entries(&d.temp), 1);
        drop(tf);
        assert_eq!(temp_entries(&d.temp), 0);
    }

    #[tokio::test]
    async fn anonymous_link_loses_to_existing_final() {
        let d = dirs();
        let final_path = d.final_dir.join("b.txt");
        std::fs::write(&final_path, b"first").unwrap();

        let mut tf = TempFile::create(&d.temp, "b.txt", final_path.clone()).unwrap();
        if !tf.is_anonymous() {
            // Filesystem without O_TMPFILE support; the named backing is
            // covered separately.
            return;
        }
        tf.file_mut().write_all(b"second").await.unwrap();
        assert!(tf.finalize().await.is_err());

        // The earlier complete object stays untouched.
        assert_eq!(std::fs::read(&final_path).unwrap(), b"first");
    }
}
