//! Orchestration for working a single issue end to end.
//!
//! Coordinates the pause gate, approval gate, task lock, heartbeat timer,
//! board access, agent invocation, and the operational store. Board access
//! sits behind the [`Board`] trait so tests can script issues without a
//! network or a `gh` binary.

use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::records::{
    ApprovalStatus, LockRecord, PauseMarker, Progress, SessionStat, TaskMetric, TaskOutcome,
};
use crate::io::agent::{AgentExecutor, AgentReport, AgentRequest, AgentStatus, execute_and_load};
use crate::io::board::BoardCli;
use crate::io::config::ForemanConfig;
use crate::io::locks::{self, AcquireOptions, AcquireOutcome, HeartbeatTimer};
use crate::io::paths::ForemanPaths;
use crate::io::prompt::{IssueContext, PromptEngine};
use crate::io::store;

/// Identity of this worker process. One id per process lifetime.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub started_at: DateTime<Utc>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Read access to the project board.
pub trait Board {
    fn fetch_issue(&self, number: u64) -> Result<IssueContext>;
    /// Post a status comment on the issue.
    fn comment(&self, number: u64, body: &str) -> Result<()>;
}

/// Board backed by a `gh`-like CLI, with retries from [`BoardCli`].
pub struct CliBoard {
    cli: BoardCli,
}

impl CliBoard {
    pub fn new(cli: BoardCli) -> Self {
        Self { cli }
    }
}

impl Board for CliBoard {
    fn fetch_issue(&self, number: u64) -> Result<IssueContext> {
        let value = self
            .cli
            .run_json_with_retry(&[
                "issue",
                "view",
                &number.to_string(),
                "--json",
                "number,title,body,labels,url",
            ])
            .map_err(|err| anyhow!("fetch issue #{number}: {err}"))?;
        let labels = value["labels"]
            .as_array()
            .map(|labels| {
                labels
                    .iter()
                    .filter_map(|label| label["name"].as_str())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(IssueContext {
            number,
            title: value["title"].as_str().unwrap_or_default().to_string(),
            body: value["body"].as_str().unwrap_or_default().to_string(),
            labels,
            url: value["url"].as_str().map(str::to_string),
        })
    }

    fn comment(&self, number: u64, body: &str) -> Result<()> {
        self.cli
            .run_with_retry(&["issue", "comment", &number.to_string(), "--body", body])
            .map_err(|err| anyhow!("comment on issue #{number}: {err}"))?;
        Ok(())
    }
}

/// Parameters for one `foreman work` invocation.
#[derive(Debug, Clone)]
pub struct WorkRequest {
    pub issue_number: u64,
    /// Evict a stale holder before acquiring.
    pub force: bool,
}

/// Result of attempting to work one issue.
#[derive(Debug)]
pub enum WorkOutcome {
    /// The agent ran to completion (its report carries the verdict).
    Finished(AgentReport),
    /// Another session holds the task lock. Not an error.
    LockHeld {
        holder: Option<LockRecord>,
        stale: bool,
    },
    /// A pause marker is present; no new work starts.
    Paused(PauseMarker),
    /// The issue requires an approval that is not granted yet.
    AwaitingApproval(ApprovalStatus),
}

const STEP_FETCH: u32 = 1;
const STEP_AGENT: u32 = 2;
const STEP_RECORD: u32 = 3;
const TOTAL_STEPS: u32 = 3;

/// Work one issue: acquire its lock, keep it heartbeating, run the agent,
/// record the outcome, release.
pub fn work_issue<B: Board, E: AgentExecutor>(
    workdir: &Path,
    session: &Session,
    request: &WorkRequest,
    cfg: &ForemanConfig,
    board: &B,
    executor: &E,
) -> Result<WorkOutcome> {
    let started = Instant::now();
    let started_at = Utc::now();
    let paths = ForemanPaths::new(workdir);
    let issue_number = request.issue_number;

    if let Some(marker) = store::read_pause(&paths.pause_path())? {
        info!(issue_number, "work is paused");
        return Ok(WorkOutcome::Paused(marker));
    }
    if let Some(approval) = store::read_approval(&paths.approval_path(issue_number))?
        && approval.status != ApprovalStatus::Approved
    {
        info!(issue_number, status = ?approval.status, "awaiting approval");
        return Ok(WorkOutcome::AwaitingApproval(approval.status));
    }

    let locks_dir = paths.locks_dir();
    let options = AcquireOptions {
        timeout_minutes: cfg.locks.timeout_minutes,
        force: request.force,
    };
    match locks::acquire(&locks_dir, issue_number, &session.id, &options)? {
        AcquireOutcome::Acquired(_) => {}
        AcquireOutcome::Held { holder, stale } => {
            return Ok(WorkOutcome::LockHeld {
                holder: Some(holder),
                stale,
            });
        }
        AcquireOutcome::Unreadable => {
            return Ok(WorkOutcome::LockHeld {
                holder: None,
                stale: false,
            });
        }
    }

    let timer = HeartbeatTimer::start(
        &locks_dir,
        issue_number,
        &session.id,
        cfg.heartbeat_interval(),
    );

    let attempt = (|| -> Result<AgentReport> {
        report_progress(&paths, issue_number, STEP_FETCH, "fetching issue")?;
        let issue = board.fetch_issue(issue_number)?;

        let run_dir = paths.run_dir(issue_number);
        let output_path = run_dir.join("report.json");
        let prompt = PromptEngine::new().render_task(&issue, None, &output_path)?;

        report_progress(&paths, issue_number, STEP_AGENT, "running agent")?;
        let agent_request = AgentRequest {
            workdir: workdir.to_path_buf(),
            prompt,
            output_path,
            log_path: run_dir.join("agent.log"),
            timeout: cfg.agent_timeout(),
            output_limit_bytes: cfg.agent.output_limit_bytes,
        };
        let report = execute_and_load(executor, &agent_request)?;

        report_progress(&paths, issue_number, STEP_RECORD, "recording outcome")?;
        record_outcome(&paths, session, cfg, issue_number, started_at, &report)
            .context("record outcome")?;

        // The comment is best-effort enrichment; the outcome is already
        // persisted locally.
        if let Err(err) = board.comment(issue_number, &comment_body(&report)) {
            warn!(issue_number, err = %err, "status comment failed");
        }
        Ok(report)
    })();

    timer.stop();
    if !locks::release(&locks_dir, issue_number, &session.id)? {
        warn!(issue_number, "lock was gone or foreign at release");
    }

    let report = match attempt {
        Ok(report) => report,
        Err(err) => {
            let metric = TaskMetric {
                issue_number,
                started_at,
                finished_at: Some(Utc::now()),
                outcome: TaskOutcome::Failed,
                duration_secs: Some(started.elapsed().as_secs()),
                attempts: 1,
            };
            if let Err(store_err) = store::record_task_metric(
                &paths.metrics_path(),
                metric,
                Utc::now(),
                cfg.metrics_retention_days,
            ) {
                warn!(issue_number, err = %store_err, "failed to record failure metric");
            }
            return Err(err);
        }
    };

    info!(issue_number, status = ?report.status, "issue finished");
    Ok(WorkOutcome::Finished(report))
}

fn record_outcome(
    paths: &ForemanPaths,
    session: &Session,
    cfg: &ForemanConfig,
    issue_number: u64,
    started_at: DateTime<Utc>,
    report: &AgentReport,
) -> Result<()> {
    let now = Utc::now();
    let outcome = match report.status {
        AgentStatus::Completed => TaskOutcome::Completed,
        AgentStatus::Failed => TaskOutcome::Failed,
        AgentStatus::Blocked => TaskOutcome::Skipped,
    };
    store::record_task_metric(
        &paths.metrics_path(),
        TaskMetric {
            issue_number,
            started_at,
            finished_at: Some(now),
            outcome,
            duration_secs: Some((now - started_at).num_seconds().max(0) as u64),
            attempts: 1,
        },
        now,
        cfg.metrics_retention_days,
    )?;

    let stats_path = paths.stats_path();
    let mut stat = store::load_session_stats(&stats_path)?
        .into_iter()
        .find(|stat| stat.session_id == session.id)
        .unwrap_or_else(|| SessionStat::new(&session.id, session.started_at));
    match report.status {
        AgentStatus::Completed => stat.issues_completed += 1,
        AgentStatus::Failed => stat.retries += 1,
        AgentStatus::Blocked => {}
    }
    if report.pr_number.is_some() {
        stat.prs_opened += 1;
    }
    if report.merged {
        stat.gigachad_merges += 1;
    }
    store::record_session_stat(&stats_path, &stat)
}

fn report_progress(
    paths: &ForemanPaths,
    issue_number: u64,
    step: u32,
    message: &str,
) -> Result<()> {
    store::write_progress(
        &paths.progress_path(),
        &Progress {
            issue_number,
            step,
            total_steps: TOTAL_STEPS,
            message: message.to_string(),
            updated_at: Utc::now(),
        },
    )
}

fn comment_body(report: &AgentReport) -> String {
    let verdict = match report.status {
        AgentStatus::Completed => "completed",
        AgentStatus::Failed => "failed",
        AgentStatus::Blocked => "blocked",
    };
    format!("foreman: task {verdict}. {}", report.summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::fs;

    struct FakeBoard {
        commented: Cell<bool>,
    }

    impl FakeBoard {
        fn new() -> Self {
            Self {
                commented: Cell::new(false),
            }
        }
    }

    impl Board for FakeBoard {
        fn fetch_issue(&self, number: u64) -> Result<IssueContext> {
            Ok(IssueContext {
                number,
                title: "add retry".to_string(),
                body: "flaky call".to_string(),
                labels: vec!["bug".to_string()],
                url: None,
            })
        }

        fn comment(&self, _number: u64, _body: &str) -> Result<()> {
            self.commented.set(true);
            Ok(())
        }
    }

    struct ScriptedAgent {
        report: serde_json::Value,
        invoked: Cell<bool>,
    }

    impl ScriptedAgent {
        fn completing() -> Self {
            Self {
                report: serde_json::json!({
                    "status": "completed",
                    "summary": "done",
                    "pr_number": 5,
                    "merged": true,
                }),
                invoked: Cell::new(false),
            }
        }
    }

    impl AgentExecutor for ScriptedAgent {
        fn exec(&self, request: &AgentRequest) -> Result<()> {
            self.invoked.set(true);
            if let Some(parent) = request.output_path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(
                &request.output_path,
                serde_json::to_string(&self.report)?,
            )?;
            Ok(())
        }
    }

    struct FailingAgent;

    impl AgentExecutor for FailingAgent {
        fn exec(&self, _request: &AgentRequest) -> Result<()> {
            Err(anyhow!("agent crashed"))
        }
    }

    fn request(issue: u64) -> WorkRequest {
        WorkRequest {
            issue_number: issue,
            force: false,
        }
    }

    /// Happy path: lock taken and released, metrics and stats recorded,
    /// status comment posted.
    #[test]
    fn completed_issue_records_outcome_and_releases_lock() {
        let temp = tempfile::tempdir().expect("tempdir");
        let session = Session::new();
        let cfg = ForemanConfig::default();
        let board = FakeBoard::new();
        let agent = ScriptedAgent::completing();

        let outcome = work_issue(temp.path(), &session, &request(7), &cfg, &board, &agent)
            .expect("work");
        let WorkOutcome::Finished(report) = outcome else {
            panic!("expected finished, got {outcome:?}");
        };
        assert_eq!(report.status, AgentStatus::Completed);
        assert!(board.commented.get());

        let paths = ForemanPaths::new(temp.path());
        assert!(!paths.locks_dir().join("7.lock").exists());

        let stats = store::load_session_stats(&paths.stats_path()).expect("stats");
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].issues_completed, 1);
        assert_eq!(stats[0].prs_opened, 1);
        assert_eq!(stats[0].gigachad_merges, 1);

        let metrics = store::load_metrics(&paths.metrics_path(), Utc::now(), 30).expect("metrics");
        assert_eq!(metrics.tasks.len(), 1);
        assert_eq!(metrics.tasks[0].outcome, TaskOutcome::Completed);
    }

    /// Contention: the agent must not run when another session holds the
    /// lock, and the holder's record is reported.
    #[test]
    fn held_lock_reports_holder_without_running_agent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = ForemanPaths::new(temp.path());
        let other = Session::new();
        locks::acquire(
            &paths.locks_dir(),
            7,
            &other.id,
            &AcquireOptions::default(),
        )
        .expect("pre-acquire");

        let session = Session::new();
        let cfg = ForemanConfig::default();
        let board = FakeBoard::new();
        let agent = ScriptedAgent::completing();

        let outcome = work_issue(temp.path(), &session, &request(7), &cfg, &board, &agent)
            .expect("work");
        let WorkOutcome::LockHeld { holder, stale } = outcome else {
            panic!("expected lock held, got {outcome:?}");
        };
        assert_eq!(holder.expect("holder").session_id, other.id);
        assert!(!stale);
        assert!(!agent.invoked.get());
    }

    #[test]
    fn pause_marker_blocks_new_work() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = ForemanPaths::new(temp.path());
        store::write_pause(
            &paths.pause_path(),
            &PauseMarker {
                paused_at: Utc::now(),
                reason: Some("freeze".to_string()),
                resume_at: None,
            },
        )
        .expect("pause");

        let outcome = work_issue(
            temp.path(),
            &Session::new(),
            &request(7),
            &ForemanConfig::default(),
            &FakeBoard::new(),
            &ScriptedAgent::completing(),
        )
        .expect("work");
        assert!(matches!(outcome, WorkOutcome::Paused(_)));
        assert!(!paths.locks_dir().join("7.lock").exists());
    }

    #[test]
    fn pending_approval_blocks_work_until_granted() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = ForemanPaths::new(temp.path());
        let now = Utc::now();
        store::request_approval(&paths.approval_path(7), 7, now).expect("request");

        let cfg = ForemanConfig::default();
        let outcome = work_issue(
            temp.path(),
            &Session::new(),
            &request(7),
            &cfg,
            &FakeBoard::new(),
            &ScriptedAgent::completing(),
        )
        .expect("work");
        assert!(matches!(
            outcome,
            WorkOutcome::AwaitingApproval(ApprovalStatus::Pending)
        ));

        store::decide_approval(&paths.approval_path(7), ApprovalStatus::Approved, now)
            .expect("approve");
        let outcome = work_issue(
            temp.path(),
            &Session::new(),
            &request(7),
            &cfg,
            &FakeBoard::new(),
            &ScriptedAgent::completing(),
        )
        .expect("work");
        assert!(matches!(outcome, WorkOutcome::Finished(_)));
    }

    /// Agent failure still releases the lock and records a failed metric.
    #[test]
    fn agent_error_releases_lock_and_records_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let session = Session::new();
        let cfg = ForemanConfig::default();

        let err = work_issue(
            temp.path(),
            &session,
            &request(9),
            &cfg,
            &FakeBoard::new(),
            &FailingAgent,
        )
        .expect_err("agent crash surfaces");
        assert!(err.to_string().contains("agent crashed"));

        let paths = ForemanPaths::new(temp.path());
        assert!(!paths.locks_dir().join("9.lock").exists());
        let metrics = store::load_metrics(&paths.metrics_path(), Utc::now(), 30).expect("metrics");
        assert_eq!(metrics.tasks.len(), 1);
        assert_eq!(metrics.tasks[0].outcome, TaskOutcome::Failed);
    }
}
