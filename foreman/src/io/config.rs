//! Foreman configuration stored under `.foreman/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::io::atomic::atomic_write;

/// Foreman configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to sensible values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ForemanConfig {
    pub agent: AgentConfig,
    pub board: BoardConfig,
    pub locks: LockConfig,
    /// Days of task metrics kept before pruning.
    pub metrics_retention_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Command line of the coding agent (e.g. `["claude", "-p"]`).
    pub command: Vec<String>,
    /// Wall-clock budget for one agent invocation in seconds.
    pub timeout_secs: u64,
    /// Truncate agent stdout/stderr logs beyond this many bytes.
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BoardConfig {
    /// Binary used for project-board calls (a `gh`-like CLI).
    pub bin: String,
    /// Per-invocation timeout in seconds.
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LockConfig {
    /// Heartbeat age beyond which a lock counts as stale.
    pub timeout_minutes: u64,
    /// Interval between heartbeat refreshes while working a task.
    pub heartbeat_interval_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: vec!["claude".to_string(), "-p".to_string()],
            timeout_secs: 30 * 60,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            bin: "gh".to_string(),
            timeout_secs: 10,
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter_ms: 500,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_minutes: 120,
            heartbeat_interval_secs: 30,
        }
    }
}

impl Default for ForemanConfig {
    fn default() -> Self {
        Self {
            agent: AgentConfig::default(),
            board: BoardConfig::default(),
            locks: LockConfig::default(),
            metrics_retention_days: 30,
        }
    }
}

impl ForemanConfig {
    pub fn validate(&self) -> Result<()> {
        if self.agent.command.is_empty() || self.agent.command[0].trim().is_empty() {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        if self.agent.timeout_secs == 0 {
            return Err(anyhow!("agent.timeout_secs must be > 0"));
        }
        if self.agent.output_limit_bytes == 0 {
            return Err(anyhow!("agent.output_limit_bytes must be > 0"));
        }
        if self.board.bin.trim().is_empty() {
            return Err(anyhow!("board.bin must be set"));
        }
        if self.board.max_attempts == 0 {
            return Err(anyhow!("board.max_attempts must be > 0"));
        }
        if self.board.max_delay_ms < self.board.base_delay_ms {
            return Err(anyhow!("board.max_delay_ms must be >= board.base_delay_ms"));
        }
        if self.locks.timeout_minutes == 0 {
            return Err(anyhow!("locks.timeout_minutes must be > 0"));
        }
        if self.locks.heartbeat_interval_secs == 0 {
            return Err(anyhow!("locks.heartbeat_interval_secs must be > 0"));
        }
        if self.metrics_retention_days == 0 {
            return Err(anyhow!("metrics_retention_days must be > 0"));
        }
        Ok(())
    }

    pub fn board_timeout(&self) -> Duration {
        Duration::from_secs(self.board.timeout_secs)
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent.timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.locks.heartbeat_interval_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ForemanConfig::default()`.
pub fn load_config(path: &Path) -> Result<ForemanConfig> {
    if !path.exists() {
        let cfg = ForemanConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ForemanConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk.
pub fn write_config(path: &Path, cfg: &ForemanConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    atomic_write(path, &buf)
}
