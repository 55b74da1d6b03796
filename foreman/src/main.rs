//! Foreman CLI entry point.
//!
//! Drives an issue-by-issue development workflow against a project board.
//! Cross-process coordination happens through plain files under `.foreman/`,
//! so any number of workers can share one working directory.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};

use foreman::core::records::PauseMarker;
use foreman::exit_codes;
use foreman::io::agent::{AgentStatus, CommandAgent};
use foreman::io::board::BoardCli;
use foreman::io::config::{ForemanConfig, load_config};
use foreman::io::locks;
use foreman::io::paths::ForemanPaths;
use foreman::io::store;
use foreman::workflow::{CliBoard, Session, WorkOutcome, WorkRequest, work_issue};

#[derive(Parser)]
#[command(
    name = "foreman",
    version,
    about = "Issue-by-issue development workflow orchestrator"
)]
struct Cli {
    /// Working directory containing the `.foreman/` coordination root.
    #[arg(short = 'C', long, default_value = ".", global = true)]
    workdir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Work one issue end to end: lock, run the agent, record, release.
    Work {
        #[arg(long)]
        issue: u64,
        /// Evict a stale holder before acquiring the lock.
        #[arg(long)]
        force: bool,
    },
    /// Inspect and manage task locks.
    Locks {
        #[command(subcommand)]
        action: LockAction,
    },
    /// Halt new work across all sessions sharing this directory.
    Pause {
        #[arg(long)]
        reason: Option<String>,
    },
    /// Clear the pause marker.
    Resume,
    /// Show session stats and active locks.
    Status,
}

#[derive(Subcommand)]
enum LockAction {
    /// List all lock files with computed staleness.
    List,
    /// Release a lock owned by the given session.
    Release {
        #[arg(long)]
        issue: u64,
        #[arg(long)]
        session: String,
    },
    /// Delete a lock unconditionally (administrative stale-cleanup).
    ForceRelease {
        #[arg(long)]
        issue: u64,
    },
}

fn main() {
    foreman::logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let paths = ForemanPaths::new(&cli.workdir);
    let cfg = load_config(&paths.config_path())
        .with_context(|| format!("load {}", paths.config_path().display()))?;

    match cli.command {
        Command::Work { issue, force } => {
            let session = Session::new();
            let board = CliBoard::new(BoardCli::new(&cfg.board));
            let agent = CommandAgent::new(cfg.agent.command.clone());
            let request = WorkRequest {
                issue_number: issue,
                force,
            };
            let outcome = work_issue(&cli.workdir, &session, &request, &cfg, &board, &agent)?;
            match outcome {
                WorkOutcome::Finished(report) => {
                    println!("issue #{issue}: {:?}: {}", report.status, report.summary);
                    Ok(if report.status == AgentStatus::Completed {
                        exit_codes::OK
                    } else {
                        exit_codes::INVALID
                    })
                }
                WorkOutcome::LockHeld { holder, stale } => {
                    match holder {
                        Some(holder) => {
                            let age = Utc::now().signed_duration_since(holder.last_heartbeat);
                            println!(
                                "issue #{issue} is already being worked by session {} (heartbeat {} ago{})",
                                holder.session_id,
                                format_age(age.num_seconds().max(0) as u64),
                                if stale { ", stale" } else { "" },
                            );
                        }
                        None => println!("issue #{issue} has an unreadable foreign lock"),
                    }
                    Ok(exit_codes::LOCKED)
                }
                WorkOutcome::Paused(marker) => {
                    println!(
                        "work is paused since {}{}",
                        marker.paused_at,
                        marker
                            .reason
                            .map(|reason| format!(": {reason}"))
                            .unwrap_or_default(),
                    );
                    Ok(exit_codes::PAUSED)
                }
                WorkOutcome::AwaitingApproval(status) => {
                    println!("issue #{issue} requires approval (currently {status:?})");
                    Ok(exit_codes::INVALID)
                }
            }
        }
        Command::Locks { action } => run_locks(&paths, &cfg, action),
        Command::Pause { reason } => {
            store::write_pause(
                &paths.pause_path(),
                &PauseMarker {
                    paused_at: Utc::now(),
                    reason,
                    resume_at: None,
                },
            )?;
            println!("paused");
            Ok(exit_codes::OK)
        }
        Command::Resume => {
            if store::clear_pause(&paths.pause_path())? {
                println!("resumed");
            } else {
                println!("was not paused");
            }
            Ok(exit_codes::OK)
        }
        Command::Status => {
            let stats = store::load_session_stats(&paths.stats_path())?;
            println!("{} session(s) on record", stats.len());
            for stat in &stats {
                println!(
                    "  {}  completed={} prs={} gigachad_merges={} retries={}",
                    stat.session_id,
                    stat.issues_completed,
                    stat.prs_opened,
                    stat.gigachad_merges,
                    stat.retries,
                );
            }
            print_locks(&paths, &cfg)?;
            Ok(exit_codes::OK)
        }
    }
}

fn run_locks(paths: &ForemanPaths, cfg: &ForemanConfig, action: LockAction) -> Result<i32> {
    match action {
        LockAction::List => {
            print_locks(paths, cfg)?;
            Ok(exit_codes::OK)
        }
        LockAction::Release { issue, session } => {
            if locks::release(&paths.locks_dir(), issue, &session)? {
                println!("released lock for issue #{issue}");
                Ok(exit_codes::OK)
            } else {
                println!("no lock for issue #{issue} owned by that session");
                Ok(exit_codes::INVALID)
            }
        }
        LockAction::ForceRelease { issue } => {
            if locks::force_release(&paths.locks_dir(), issue)? {
                println!("force-released lock for issue #{issue}");
            } else {
                println!("no lock for issue #{issue}");
            }
            Ok(exit_codes::OK)
        }
    }
}

fn print_locks(paths: &ForemanPaths, cfg: &ForemanConfig) -> Result<()> {
    let infos = locks::list(&paths.locks_dir(), cfg.locks.timeout_minutes)?;
    println!("{} lock(s)", infos.len());
    for info in infos {
        match (&info.record, &info.anomaly) {
            (Some(record), _) => {
                let age = Utc::now().signed_duration_since(record.last_heartbeat);
                println!(
                    "  #{}  session={} pid={} heartbeat {} ago{}{}",
                    record.issue_number,
                    record.session_id,
                    record.pid,
                    format_age(age.num_seconds().max(0) as u64),
                    if info.stale { " STALE" } else { "" },
                    match info.pid_alive {
                        Some(true) => " (pid alive)",
                        Some(false) => " (pid gone)",
                        None => "",
                    },
                );
            }
            (None, Some(anomaly)) => {
                println!("  {}  CORRUPT: {anomaly}", info.path.display());
            }
            (None, None) => {}
        }
    }
    Ok(())
}

fn format_age(seconds: u64) -> String {
    if seconds < 60 {
        return format!("{seconds}s");
    }
    if seconds < 60 * 60 {
        return format!("{}m", seconds / 60);
    }
    if seconds < 60 * 60 * 24 {
        return format!("{}h", seconds / (60 * 60));
    }
    format!("{}d", seconds / (60 * 60 * 24))
}
