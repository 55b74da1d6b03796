//! Crash-safe full-file writes and a transient-error retry wrapper.
//!
//! Writes go to a uniquely-named temp file in the same directory as the
//! target (rename is only atomic within one filesystem), then rename onto the
//! final path. Concurrent readers observe either the fully-old or fully-new
//! content, never a mix. Two writers racing on the same path each use their
//! own temp file; the last rename wins. Callers needing exclusivity must hold
//! a task lock first.

use std::io::{self, Write};
use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tempfile::Builder;
use tracing::{debug, warn};

/// Retry policy for [`safe_write`].
#[derive(Debug, Clone)]
pub struct WriteRetry {
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for WriteRetry {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
        }
    }
}

/// Atomically replace the contents of `path` with `content`.
///
/// On any failure the temp file is removed (best-effort, on drop) and the
/// original error propagates; a failed write never touches the target file.
pub fn atomic_write(path: &Path, content: &str) -> Result<()> {
    try_atomic_write(path, content).with_context(|| format!("atomic write {}", path.display()))
}

/// [`atomic_write`] with retries on classified-transient filesystem errors.
///
/// Each retry waits `retry_delay * attempt` (linear backoff). Non-transient
/// errors and retry exhaustion raise immediately.
pub fn safe_write(path: &Path, content: &str, retry: &WriteRetry) -> Result<()> {
    let mut attempt = 1u32;
    loop {
        let err = match try_atomic_write(path, content) {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        if !is_transient_io_error(&err) || attempt > retry.max_retries {
            return Err(err).with_context(|| {
                format!("write {} (attempt {attempt})", path.display())
            });
        }
        let delay = retry.retry_delay * attempt;
        warn!(
            path = %path.display(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            err = %err,
            "transient write failure, retrying"
        );
        thread::sleep(delay);
        attempt += 1;
    }
}

fn try_atomic_write(path: &Path, content: &str) -> io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "target path has no parent")
    })?;
    std::fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    // Pid plus tempfile's random token keeps concurrent writers collision-free.
    let mut tmp = Builder::new()
        .prefix(&format!(".{file_name}.{}-", std::process::id()))
        .suffix(".tmp")
        .tempfile_in(parent)?;
    tmp.write_all(content.as_bytes())?;

    debug!(path = %path.display(), bytes = content.len(), "renaming temp file into place");
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

/// Whether a filesystem error is worth retrying: resource-busy, try-again,
/// or too-many-open-files.
fn is_transient_io_error(err: &io::Error) -> bool {
    // EMFILE has no stable ErrorKind mapping.
    const EMFILE: i32 = 24;
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::ResourceBusy
    ) || err.raw_os_error() == Some(EMFILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    /// Write-then-read yields exactly the written bytes, for arbitrary UTF-8
    /// including embedded newlines and braces.
    #[test]
    fn round_trips_arbitrary_utf8() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.json");
        let content = "{\"name\": \"日本語\",\n \"lines\": [1,\n2]}\n";

        atomic_write(&path, content).expect("write");
        assert_eq!(fs::read_to_string(&path).expect("read"), content);
    }

    #[test]
    fn overwrites_existing_content_fully() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.json");
        atomic_write(&path, "first version, quite long").expect("write v1");
        atomic_write(&path, "v2").expect("write v2");
        assert_eq!(fs::read_to_string(&path).expect("read"), "v2");
    }

    #[test]
    fn leaves_no_temp_files_behind() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("out.json");
        atomic_write(&path, "data").expect("write");

        let entries: Vec<_> = fs::read_dir(temp.path())
            .expect("read dir")
            .map(|e| e.expect("entry").file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("out.json")]);
    }

    #[test]
    fn creates_missing_parent_directories() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("locks").join("7.lock");
        atomic_write(&path, "{}").expect("write");
        assert!(path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn failed_write_leaves_original_intact() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join("readonly");
        fs::create_dir_all(&dir).expect("mkdir");
        let path = dir.join("state.json");
        fs::write(&path, "original").expect("seed");

        let mut perms = fs::metadata(&dir).expect("meta").permissions();
        perms.set_mode(0o555);
        fs::set_permissions(&dir, perms).expect("chmod");

        atomic_write(&path, "replacement").expect_err("write into readonly dir");
        let mut perms = fs::metadata(&dir).expect("meta").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&dir, perms).expect("chmod back");

        assert_eq!(fs::read_to_string(&path).expect("read"), "original");
    }

    #[test]
    fn safe_write_raises_non_transient_errors_immediately() {
        let temp = tempfile::tempdir().expect("tempdir");
        // Parent is a file, so create_dir_all fails with a non-transient kind.
        let blocker = temp.path().join("blocker");
        fs::write(&blocker, "x").expect("seed");
        let path = blocker.join("state.json");

        let err = safe_write(&path, "data", &WriteRetry::default()).expect_err("must fail");
        assert!(err.to_string().contains("attempt 1"));
    }

    #[test]
    fn transient_classification_covers_busy_kinds() {
        assert!(is_transient_io_error(&io::Error::from(
            io::ErrorKind::WouldBlock
        )));
        assert!(is_transient_io_error(&io::Error::from(
            io::ErrorKind::ResourceBusy
        )));
        assert!(is_transient_io_error(&io::Error::from_raw_os_error(24)));
        assert!(!is_transient_io_error(&io::Error::from(
            io::ErrorKind::NotFound
        )));
        assert!(!is_transient_io_error(&io::Error::from(
            io::ErrorKind::PermissionDenied
        )));
    }
}
