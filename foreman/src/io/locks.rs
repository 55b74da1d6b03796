//! Cross-process task locks with heartbeat-based staleness.
//!
//! One lock file per task lives under the locks directory. Filesystem
//! create-if-absent claims a task, so exactly one acquirer wins any race;
//! periodic heartbeats prove the holder is still alive; staleness is computed
//! on read from heartbeat age, never stored. Acquisition is try-once: there
//! is no wait queue, and polling policy belongs to the caller.
//!
//! A late heartbeat from the legitimate holder can race a stale-cleanup
//! delete from another process. That bounded inconsistency window is an
//! accepted trade-off of the no-daemon design and is exercised in tests, not
//! papered over with a second coordination mechanism.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, warn};

use crate::core::records::{LockRecord, lock_record_schema};
use crate::core::schema::{parse_json, validate};
use crate::io::atomic::atomic_write;

pub const DEFAULT_TIMEOUT_MINUTES: u64 = 120;
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Options for [`acquire`].
#[derive(Debug, Clone)]
pub struct AcquireOptions {
    /// Heartbeat age beyond which an existing holder counts as stale.
    pub timeout_minutes: u64,
    /// Evict a stale holder and retry the create once.
    pub force: bool,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            timeout_minutes: DEFAULT_TIMEOUT_MINUTES,
            force: false,
        }
    }
}

/// Result of one try-once acquisition attempt.
#[derive(Debug, Clone)]
pub enum AcquireOutcome {
    /// This session now holds the lock.
    Acquired(LockRecord),
    /// Another session holds the lock. Not an error.
    Held { holder: LockRecord, stale: bool },
    /// A lock file exists but cannot be read or validated. Treated as a
    /// foreign lock with no holder detail rather than guessing.
    Unreadable,
}

/// One entry from [`list`].
#[derive(Debug, Clone)]
pub struct LockInfo {
    pub path: PathBuf,
    /// Parsed from the file name; present even for corrupt records.
    pub issue_number: Option<u64>,
    pub record: Option<LockRecord>,
    pub stale: bool,
    /// Best-effort pid probe; `None` where unsupported. Never overrides
    /// heartbeat age.
    pub pid_alive: Option<bool>,
    /// Set when the record failed to parse or validate.
    pub anomaly: Option<String>,
}

enum ReadLock {
    Record(LockRecord),
    Missing,
    Corrupt(String),
}

/// Attempt to claim the lock for `issue_number`.
///
/// Create-if-absent semantics: if the lock file already exists the holder is
/// read and reported, and the caller decides what to do next. With
/// `options.force`, a holder whose heartbeat age exceeds the timeout is
/// deleted and the create is retried once; a fresh holder is never evicted.
pub fn acquire(
    locks_dir: &Path,
    issue_number: u64,
    session_id: &str,
    options: &AcquireOptions,
) -> Result<AcquireOutcome> {
    fs::create_dir_all(locks_dir)
        .with_context(|| format!("create locks dir {}", locks_dir.display()))?;
    let path = lock_path(locks_dir, issue_number);

    match OpenOptions::new().write(true).create_new(true).open(&path) {
        Ok(_claimed) => {
            let now = Utc::now();
            let record = LockRecord {
                issue_number,
                session_id: session_id.to_string(),
                pid: std::process::id(),
                acquired_at: now,
                last_heartbeat: now,
            };
            write_record(&path, &record)?;
            debug!(issue_number, session_id, "lock acquired");
            Ok(AcquireOutcome::Acquired(record))
        }
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            let holder = match read_record(&path) {
                ReadLock::Record(record) => record,
                ReadLock::Missing => {
                    // Holder released between our create failing and the read.
                    // Acquisition is try-once; report the miss to the caller.
                    return Ok(AcquireOutcome::Unreadable);
                }
                ReadLock::Corrupt(reason) => {
                    warn!(issue_number, %reason, "unreadable foreign lock");
                    return Ok(AcquireOutcome::Unreadable);
                }
            };
            let stale = is_stale(&holder, options.timeout_minutes);
            if stale && options.force {
                warn!(
                    issue_number,
                    holder_session = %holder.session_id,
                    "evicting stale lock"
                );
                fs::remove_file(&path)
                    .with_context(|| format!("evict stale lock {}", path.display()))?;
                let retry = AcquireOptions {
                    force: false,
                    ..options.clone()
                };
                return acquire(locks_dir, issue_number, session_id, &retry);
            }
            Ok(AcquireOutcome::Held { holder, stale })
        }
        Err(err) => {
            Err(err).with_context(|| format!("create lock file {}", path.display()))
        }
    }
}

/// Heartbeat age is the authoritative staleness rule. A live pid does not
/// keep a lock fresh: a hung process must not block its task forever.
pub fn is_stale(record: &LockRecord, timeout_minutes: u64) -> bool {
    let age = Utc::now().signed_duration_since(record.last_heartbeat);
    age > chrono::Duration::minutes(timeout_minutes as i64)
}

/// Refresh `last_heartbeat` on a lock owned by `session_id`.
///
/// Returns false (never an error) when the lock is missing or owned by a
/// different session. Refusing foreign heartbeats keeps a process from
/// reviving a lock it no longer holds.
pub fn heartbeat(locks_dir: &Path, issue_number: u64, session_id: &str) -> Result<bool> {
    let path = lock_path(locks_dir, issue_number);
    let mut record = match read_record(&path) {
        ReadLock::Record(record) => record,
        ReadLock::Missing => return Ok(false),
        ReadLock::Corrupt(reason) => {
            warn!(issue_number, %reason, "refusing heartbeat on unreadable lock");
            return Ok(false);
        }
    };
    if record.session_id != session_id {
        return Ok(false);
    }
    record.last_heartbeat = Utc::now();
    write_record(&path, &record)?;
    debug!(issue_number, session_id, "heartbeat written");
    Ok(true)
}

/// Delete the lock only if `session_id` owns it.
pub fn release(locks_dir: &Path, issue_number: u64, session_id: &str) -> Result<bool> {
    let path = lock_path(locks_dir, issue_number);
    match read_record(&path) {
        ReadLock::Record(record) if record.session_id == session_id => {
            fs::remove_file(&path)
                .with_context(|| format!("release lock {}", path.display()))?;
            debug!(issue_number, session_id, "lock released");
            Ok(true)
        }
        // Foreign, missing, or unreadable: leave it alone.
        _ => Ok(false),
    }
}

/// Unconditional delete for administrative stale-cleanup; ignores ownership.
pub fn force_release(locks_dir: &Path, issue_number: u64) -> Result<bool> {
    let path = lock_path(locks_dir, issue_number);
    match fs::remove_file(&path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("force-release {}", path.display())),
    }
}

/// Enumerate all lock files, annotating each with computed staleness.
///
/// Corrupt entries are reported as anomalies, not silently hidden.
pub fn list(locks_dir: &Path, timeout_minutes: u64) -> Result<Vec<LockInfo>> {
    let entries = match fs::read_dir(locks_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("list locks in {}", locks_dir.display()));
        }
    };

    let mut infos = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("read dir entry in {}", locks_dir.display()))?;
        let path = entry.path();
        if path.extension().is_none_or(|ext| ext != "lock") {
            continue;
        }
        let issue_number = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.parse().ok());
        match read_record(&path) {
            ReadLock::Record(record) => {
                let stale = is_stale(&record, timeout_minutes);
                let pid_alive = process_alive(record.pid);
                infos.push(LockInfo {
                    path,
                    issue_number,
                    stale,
                    pid_alive,
                    anomaly: None,
                    record: Some(record),
                });
            }
            ReadLock::Missing => {}
            ReadLock::Corrupt(reason) => infos.push(LockInfo {
                path,
                issue_number,
                record: None,
                stale: false,
                pid_alive: None,
                anomaly: Some(reason),
            }),
        }
    }
    infos.sort_by_key(|info| info.issue_number);
    Ok(infos)
}

/// Periodic background heartbeat for the duration of one task.
///
/// The timer never stops itself: a failed heartbeat write is logged and the
/// loop keeps running, since a holder must know its lock may be evictable
/// rather than silently abandoning it. Call [`HeartbeatTimer::stop`] on task
/// completion or failure, then `release`; that is the only deterministic way
/// to relinquish ownership cleanly.
#[derive(Debug)]
pub struct HeartbeatTimer {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl HeartbeatTimer {
    pub fn start(
        locks_dir: &Path,
        issue_number: u64,
        session_id: &str,
        interval: Duration,
    ) -> Self {
        let dir = locks_dir.to_path_buf();
        let session = session_id.to_string();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let handle = std::thread::spawn(move || {
            loop {
                match stop_rx.recv_timeout(interval) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }
                match heartbeat(&dir, issue_number, &session) {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(issue_number, "heartbeat refused: lock missing or foreign");
                    }
                    Err(err) => {
                        warn!(issue_number, err = %err, "heartbeat write failed");
                    }
                }
            }
        });
        Self {
            stop_tx,
            handle: Some(handle),
        }
    }

    /// Stop the timer and wait for the background thread to exit.
    pub fn stop(mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn lock_path(locks_dir: &Path, issue_number: u64) -> PathBuf {
    locks_dir.join(format!("{issue_number}.lock"))
}

fn write_record(path: &Path, record: &LockRecord) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(record).context("serialize lock record")?;
    buf.push('\n');
    atomic_write(path, &buf)
}

/// Strict read: recovery is disabled because substituting defaults into a
/// lock record would violate the mutual-exclusion invariant.
fn read_record(path: &Path) -> ReadLock {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return ReadLock::Missing,
        Err(err) => return ReadLock::Corrupt(format!("read {}: {err}", path.display())),
    };
    let value = match parse_json(&contents) {
        Ok(value) => value,
        Err(issue) => {
            return ReadLock::Corrupt(format!("parse {}: {issue}", path.display()));
        }
    };
    let outcome = validate(&value, &lock_record_schema(), false);
    let Some(data) = outcome.data else {
        let detail = outcome
            .issues
            .first()
            .map(|issue| format!("{}: {}", issue.path, issue.message))
            .unwrap_or_else(|| "invalid record".to_string());
        return ReadLock::Corrupt(format!("validate {}: {detail}", path.display()));
    };
    match serde_json::from_value(data) {
        Ok(record) => ReadLock::Record(record),
        Err(err) => ReadLock::Corrupt(format!("decode {}: {err}", path.display())),
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> Option<bool> {
    Some(Path::new("/proc").join(pid.to_string()).exists())
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> Option<bool> {
    None
}
