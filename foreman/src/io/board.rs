//! Resilient invocation of the external project-board CLI.
//!
//! Single invocations go through [`crate::io::process`] with a per-call
//! timeout; failures are classified from their error text and recoverable
//! ones are retried with exponential backoff and jitter. A non-recoverable
//! classification raises immediately no matter how many attempts remain.

use std::process::Command;
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::classify::{Classification, ErrorKind, classify};
use crate::io::config::BoardConfig;
use crate::io::process::run_command_with_timeout;

/// Backoff tuning for [`execute_with_retry`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt after `attempt` (1-based) failed.
    ///
    /// A server-requested `retry_after` takes precedence, capped at
    /// `max_delay`; otherwise exponential backoff plus jitter, same cap.
    pub fn delay_for(&self, attempt: u32, classification: &Classification) -> Duration {
        if let Some(retry_after) = classification.retry_after {
            return retry_after.min(self.max_delay);
        }
        let exponent = attempt.saturating_sub(1).min(16);
        let backoff = self.base_delay.saturating_mul(1 << exponent);
        let jitter_ms = if self.jitter.is_zero() {
            0
        } else {
            rand::thread_rng().gen_range(0..self.jitter.as_millis() as u64)
        };
        (backoff + Duration::from_millis(jitter_ms)).min(self.max_delay)
    }
}

/// Final failure of a retried command.
#[derive(Debug, Clone, Error)]
#[error("{kind} after {attempts} attempt(s): {message}")]
pub struct CommandError {
    pub kind: ErrorKind,
    pub attempts: u32,
    pub message: String,
}

/// Diagnostic payload passed to the retry observer before each wait.
#[derive(Debug, Clone)]
pub struct RetryNotice<'a> {
    pub attempt: u32,
    pub error: &'a str,
    pub delay: Duration,
}

/// Sleep seam so tests can record delays instead of waiting them out.
pub trait Sleeper {
    fn sleep(&self, delay: Duration);
}

/// Production sleeper backed by `std::thread::sleep`.
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, delay: Duration) {
        std::thread::sleep(delay);
    }
}

/// Drive `operation` until success, a non-recoverable failure, or attempt
/// exhaustion. The operation returns captured stdout on success and the raw
/// error text (classified here) on failure.
pub fn execute_with_retry<Op, S, F>(
    mut operation: Op,
    policy: &RetryPolicy,
    sleeper: &S,
    mut on_retry: F,
) -> Result<String, CommandError>
where
    Op: FnMut(u32) -> Result<String, String>,
    S: Sleeper,
    F: FnMut(RetryNotice<'_>),
{
    let mut attempt = 1u32;
    loop {
        let message = match operation(attempt) {
            Ok(output) => return Ok(output),
            Err(message) => message,
        };
        let classification = classify(&message);
        if !classification.recoverable || attempt >= policy.max_attempts {
            return Err(CommandError {
                kind: classification.kind,
                attempts: attempt,
                message,
            });
        }
        let delay = policy.delay_for(attempt, &classification);
        debug!(
            attempt,
            kind = %classification.kind,
            delay_ms = delay.as_millis() as u64,
            "retrying after recoverable failure"
        );
        on_retry(RetryNotice {
            attempt,
            error: &message,
            delay,
        });
        sleeper.sleep(delay);
        attempt += 1;
    }
}

/// Thin client for a `gh`-like binary.
#[derive(Debug, Clone)]
pub struct BoardCli {
    bin: String,
    timeout: Duration,
    output_limit_bytes: usize,
    policy: RetryPolicy,
}

impl BoardCli {
    pub fn new(cfg: &BoardConfig) -> Self {
        Self {
            bin: cfg.bin.clone(),
            timeout: Duration::from_secs(cfg.timeout_secs),
            output_limit_bytes: 1_000_000,
            policy: RetryPolicy {
                max_attempts: cfg.max_attempts,
                base_delay: Duration::from_millis(cfg.base_delay_ms),
                max_delay: Duration::from_millis(cfg.max_delay_ms),
                jitter: Duration::from_millis(cfg.jitter_ms),
            },
        }
    }

    /// Run one board command with retries, returning captured stdout.
    pub fn run_with_retry(&self, args: &[&str]) -> Result<String, CommandError> {
        execute_with_retry(
            |_attempt| self.invoke(args),
            &self.policy,
            &ThreadSleeper,
            |notice| {
                warn!(
                    attempt = notice.attempt,
                    delay_ms = notice.delay.as_millis() as u64,
                    error = notice.error,
                    "board command failed, will retry"
                );
            },
        )
    }

    /// Run one board command and parse its stdout as JSON.
    pub fn run_json_with_retry(&self, args: &[&str]) -> Result<Value, CommandError> {
        let stdout = self.run_with_retry(args)?;
        serde_json::from_str(&stdout).map_err(|err| CommandError {
            kind: ErrorKind::Validation,
            attempts: 1,
            message: format!("parse board output: {err}"),
        })
    }

    /// Best-effort variant: exhausted or non-recoverable failures are logged
    /// and swallowed. For call sites where the board call is optional
    /// enrichment, never a hard dependency.
    pub fn safe_run(&self, args: &[&str]) -> Option<String> {
        match self.run_with_retry(args) {
            Ok(output) => Some(output),
            Err(err) => {
                warn!(
                    kind = %err.kind,
                    attempts = err.attempts,
                    "board command gave up: {}",
                    err.message
                );
                None
            }
        }
    }

    /// Single attempt: stdout on success, classified-ready error text on
    /// failure (non-zero exit, timeout, or spawn failure).
    fn invoke(&self, args: &[&str]) -> Result<String, String> {
        let mut cmd = Command::new(&self.bin);
        cmd.args(args);
        let output =
            match run_command_with_timeout(cmd, None, self.timeout, self.output_limit_bytes) {
                Ok(output) => output,
                Err(err) => return Err(format!("spawn {}: {err:#}", self.bin)),
            };
        if output.timed_out {
            return Err(format!(
                "{} timed out after {}s",
                self.bin,
                self.timeout.as_secs()
            ));
        }
        if !output.status.success() {
            let stderr = output.stderr_text();
            let detail = if stderr.trim().is_empty() {
                output.stdout_text()
            } else {
                stderr
            };
            return Err(format!(
                "{} exited with {:?}: {}",
                self.bin,
                output.status.code(),
                detail.trim()
            ));
        }
        Ok(output.stdout_text())
    }
}
