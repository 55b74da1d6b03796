//! Executor abstraction for coding-agent invocation.
//!
//! The [`AgentExecutor`] trait decouples the workflow from the actual agent
//! backend (any CLI that accepts a prompt on stdin). Tests use scripted
//! executors that write predetermined reports without spawning processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::Draft;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::io::process::{CommandOutput, run_command_with_timeout};

const AGENT_OUTPUT_SCHEMA: &str = include_str!("../../schemas/agent_output.schema.json");

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Working directory for the agent process.
    pub workdir: PathBuf,
    /// Prompt text fed to the agent on stdin.
    pub prompt: String,
    /// Path where the agent must write its report JSON.
    pub output_path: PathBuf,
    /// Path for the captured agent stdout/stderr log.
    pub log_path: PathBuf,
    /// Maximum time to wait for the agent to complete.
    pub timeout: Duration,
    /// Truncate captured output beyond this many bytes.
    pub output_limit_bytes: usize,
}

/// Agent-declared result for the worked issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Completed,
    Failed,
    Blocked,
}

/// Structured report the agent writes when it finishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentReport {
    pub status: AgentStatus,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
    #[serde(default)]
    pub merged: bool,
}

/// Abstraction over agent execution backends.
pub trait AgentExecutor {
    /// Run the agent. Must write the report to `request.output_path`.
    fn exec(&self, request: &AgentRequest) -> Result<()>;
}

/// Executor that spawns the configured agent command.
pub struct CommandAgent {
    command: Vec<String>,
}

impl CommandAgent {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl AgentExecutor for CommandAgent {
    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs()))]
    fn exec(&self, request: &AgentRequest) -> Result<()> {
        let Some((bin, args)) = self.command.split_first() else {
            bail!("agent command is empty");
        };
        info!(workdir = %request.workdir.display(), agent = %bin, "starting agent");

        if let Some(parent) = request.output_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create output dir {}", parent.display()))?;
        }
        let mut cmd = Command::new(bin);
        cmd.args(args).current_dir(&request.workdir);

        let output = run_command_with_timeout(
            cmd,
            Some(request.prompt.as_bytes()),
            request.timeout,
            request.output_limit_bytes,
        )
        .context("run agent")?;

        write_agent_log(&request.log_path, &output)?;

        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "agent timed out");
            return Err(anyhow!("agent timed out after {:?}", request.timeout));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "agent failed");
            return Err(anyhow!(
                "agent exited with status {:?}",
                output.status.code()
            ));
        }

        debug!("agent completed successfully");
        Ok(())
    }
}

/// Execute the agent and load its schema-validated report.
#[instrument(skip_all, fields(output_path = %request.output_path.display()))]
pub fn execute_and_load<E: AgentExecutor>(
    executor: &E,
    request: &AgentRequest,
) -> Result<AgentReport> {
    executor.exec(request)?;
    let contents = fs::read_to_string(&request.output_path)
        .with_context(|| format!("missing agent report {}", request.output_path.display()))?;
    let value: Value = serde_json::from_str(&contents)
        .with_context(|| format!("parse {}", request.output_path.display()))?;
    validate_report_schema(&value)?;
    let report: AgentReport = serde_json::from_value(value)
        .with_context(|| format!("decode {}", request.output_path.display()))?;
    debug!(status = ?report.status, "parsed agent report");
    Ok(report)
}

/// Validate the report against the embedded JSON Schema (Draft 2020-12).
fn validate_report_schema(instance: &Value) -> Result<()> {
    let schema: Value =
        serde_json::from_str(AGENT_OUTPUT_SCHEMA).context("parse agent output schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile agent output schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("agent report invalid:\n- {}", messages.join("\n- "));
    }
    Ok(())
}

fn write_agent_log(path: &Path, output: &CommandOutput) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create agent log dir {}", parent.display()))?;
    }
    let mut buf = String::new();
    buf.push_str("=== stdout ===\n");
    buf.push_str(&output.stdout_text());
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&output.stderr_text());
    if output.timed_out {
        buf.push_str("\n[agent timed out]\n");
    }
    fs::write(path, buf).with_context(|| format!("write agent log {}", path.display()))
}
