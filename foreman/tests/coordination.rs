//! Cross-session coordination tests for the full lock/workflow lifecycle.
//!
//! These tests simulate several worker sessions sharing one coordination
//! directory: racing acquisitions, stale-lock eviction, sequential handoff,
//! and recovery from corrupt operational files. Lock files are also written
//! by hand in places: they are plain JSON, and any writer that respects the
//! atomic-write and ownership contracts must interoperate.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use anyhow::Result;
use chrono::Utc;
use serde_json::json;

use foreman::core::records::{LockRecord, TaskOutcome};
use foreman::io::agent::{AgentExecutor, AgentRequest};
use foreman::io::config::ForemanConfig;
use foreman::io::locks::{self, AcquireOptions, AcquireOutcome};
use foreman::io::paths::ForemanPaths;
use foreman::io::prompt::IssueContext;
use foreman::io::store;
use foreman::workflow::{Board, Session, WorkOutcome, WorkRequest, work_issue};

struct StaticBoard;

impl Board for StaticBoard {
    fn fetch_issue(&self, number: u64) -> Result<IssueContext> {
        Ok(IssueContext {
            number,
            title: format!("issue {number}"),
            body: "do the thing".to_string(),
            labels: Vec::new(),
            url: None,
        })
    }

    fn comment(&self, _number: u64, _body: &str) -> Result<()> {
        Ok(())
    }
}

struct CompletingAgent;

impl AgentExecutor for CompletingAgent {
    fn exec(&self, request: &AgentRequest) -> Result<()> {
        if let Some(parent) = request.output_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(
            &request.output_path,
            serde_json::to_string(&json!({
                "status": "completed",
                "summary": "done",
            }))?,
        )?;
        Ok(())
    }
}

/// Filesystem create-if-absent guarantees exactly one winner when many
/// sessions race to claim the same task.
#[test]
fn exactly_one_racing_acquire_wins() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = Arc::new(temp.path().join("locks"));

    let handles: Vec<_> = (0..8)
        .map(|worker| {
            let dir = Arc::clone(&dir);
            thread::spawn(move || {
                let outcome = locks::acquire(
                    &dir,
                    1,
                    &format!("session-{worker}"),
                    &AcquireOptions::default(),
                )
                .expect("acquire");
                matches!(outcome, AcquireOutcome::Acquired(_))
            })
        })
        .collect();

    let winners = handles
        .into_iter()
        .map(|handle| handle.join().expect("join"))
        .filter(|&won| won)
        .count();
    assert_eq!(winners, 1);
    assert!(dir.join("1.lock").exists());
}

/// A lock record written by a foreign process (plain JSON, heartbeat 181
/// minutes old) is listed as stale under the default 120-minute timeout and
/// is evictable with force.
#[test]
fn foreign_stale_lock_is_listed_and_evictable() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().join("locks");
    fs::create_dir_all(&dir).expect("mkdir");

    let now = Utc::now();
    let record = LockRecord {
        issue_number: 5,
        session_id: "crashed-worker".to_string(),
        pid: 999_999,
        acquired_at: now - chrono::Duration::minutes(200),
        last_heartbeat: now - chrono::Duration::minutes(181),
    };
    let payload = serde_json::to_string_pretty(&record).expect("serialize");
    fs::write(dir.join("5.lock"), payload).expect("write");

    let infos = locks::list(&dir, 120).expect("list");
    assert_eq!(infos.len(), 1);
    assert!(infos[0].stale);

    // Without force the holder is reported, not evicted.
    match locks::acquire(&dir, 5, "rescuer", &AcquireOptions::default()).expect("acquire") {
        AcquireOutcome::Held { holder, stale } => {
            assert!(stale);
            assert_eq!(holder.session_id, "crashed-worker");
        }
        other => panic!("expected held, got {other:?}"),
    }

    let force = AcquireOptions {
        force: true,
        ..AcquireOptions::default()
    };
    match locks::acquire(&dir, 5, "rescuer", &force).expect("acquire") {
        AcquireOutcome::Acquired(record) => assert_eq!(record.session_id, "rescuer"),
        other => panic!("expected acquired, got {other:?}"),
    }
}

/// A fresh holder (heartbeat 60 minutes old) is not stale and not evictable,
/// even with force.
#[test]
fn fresh_foreign_lock_survives_force() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().join("locks");
    fs::create_dir_all(&dir).expect("mkdir");

    let now = Utc::now();
    let record = LockRecord {
        issue_number: 6,
        session_id: "busy-worker".to_string(),
        pid: 999_999,
        acquired_at: now - chrono::Duration::minutes(90),
        last_heartbeat: now - chrono::Duration::minutes(60),
    };
    fs::write(
        dir.join("6.lock"),
        serde_json::to_string_pretty(&record).expect("serialize"),
    )
    .expect("write");

    let infos = locks::list(&dir, 120).expect("list");
    assert!(!infos[0].stale);

    let force = AcquireOptions {
        force: true,
        ..AcquireOptions::default()
    };
    match locks::acquire(&dir, 6, "rescuer", &force).expect("acquire") {
        AcquireOutcome::Held { stale, .. } => assert!(!stale),
        other => panic!("expected held, got {other:?}"),
    }
}

/// Two sessions hand a task off cleanly: the second only proceeds after the
/// first released, and both leave stats behind.
#[test]
fn sequential_sessions_hand_off_the_same_issue() {
    let temp = tempfile::tempdir().expect("tempdir");
    let workdir = temp.path();
    let cfg = ForemanConfig::default();
    let request = WorkRequest {
        issue_number: 3,
        force: false,
    };

    let first = Session::new();
    let outcome = work_issue(workdir, &first, &request, &cfg, &StaticBoard, &CompletingAgent)
        .expect("first work");
    assert!(matches!(outcome, WorkOutcome::Finished(_)));

    let second = Session::new();
    let outcome = work_issue(workdir, &second, &request, &cfg, &StaticBoard, &CompletingAgent)
        .expect("second work");
    assert!(matches!(outcome, WorkOutcome::Finished(_)));

    let paths = ForemanPaths::new(workdir);
    let stats = store::load_session_stats(&paths.stats_path()).expect("stats");
    assert_eq!(stats.len(), 2);
    assert!(stats.iter().all(|stat| stat.issues_completed == 1));

    let metrics = store::load_metrics(&paths.metrics_path(), Utc::now(), 30).expect("metrics");
    assert_eq!(metrics.tasks.len(), 2);
    assert!(
        metrics
            .tasks
            .iter()
            .all(|task| task.outcome == TaskOutcome::Completed)
    );
}

/// A corrupt record in the stats history must not block new work: the
/// workflow loads in recovery mode, drops it, and keeps going.
#[test]
fn corrupt_stats_entry_does_not_block_work() {
    let temp = tempfile::tempdir().expect("tempdir");
    let workdir = temp.path();
    let paths = ForemanPaths::new(workdir);

    fs::create_dir_all(paths.root()).expect("mkdir");
    seed_stats_with_corruption(&paths);

    let outcome = work_issue(
        workdir,
        &Session::new(),
        &WorkRequest {
            issue_number: 8,
            force: false,
        },
        &ForemanConfig::default(),
        &StaticBoard,
        &CompletingAgent,
    )
    .expect("work");
    assert!(matches!(outcome, WorkOutcome::Finished(_)));

    let stats = store::load_session_stats(&paths.stats_path()).expect("stats");
    // The corrupt entry is gone; the good seed and the new session remain.
    assert_eq!(stats.len(), 2);
    assert!(stats.iter().any(|stat| stat.session_id == "seeded"));
}

fn seed_stats_with_corruption(paths: &ForemanPaths) {
    let good = json!({
        "session_id": "seeded",
        "started_at": Utc::now().to_rfc3339(),
        "issues_completed": 4,
        "prs_opened": 2,
        "gigachad_merges": 1,
        "retries": 0,
    });
    let corrupt = json!({"session_id": 17, "started_at": []});
    write_file(
        &paths.stats_path(),
        &serde_json::to_string(&json!([good, corrupt])).expect("serialize"),
    );
}

fn write_file(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("mkdir");
    }
    fs::write(path, contents).expect("write");
}
