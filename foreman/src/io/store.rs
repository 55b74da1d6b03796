//! Operational state files under `.foreman/`: session stats, task metrics,
//! progress, pause and approval markers.
//!
//! Collections load in recovery mode: one corrupt record is dropped with a
//! warning instead of making the whole history unreadable. Single required
//! records (pause, approval, progress) load strictly: silently substituting
//! defaults there would change behavior, so corruption surfaces as an error
//! with path and position context.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::records::{
    ApprovalRecord, ApprovalStatus, MetricsFile, METRICS_VERSION, PauseMarker, Progress,
    SessionStat, TaskMetric, approval_schema, metrics_file_schema, pause_schema, progress_schema,
    session_stat_schema,
};
use crate::core::schema::{Schema, parse_json, validate, validate_array};
use crate::io::atomic::{WriteRetry, safe_write};

/// Load the session-stat history, dropping corrupt entries.
pub fn load_session_stats(path: &Path) -> Result<Vec<SessionStat>> {
    let Some(value) = read_json(path)? else {
        return Ok(Vec::new());
    };
    let outcome = validate_array(&value, &session_stat_schema(), true);
    if !outcome.valid {
        let dropped = outcome.issues.iter().filter(|i| i.recovered).count();
        warn!(path = %path.display(), dropped, "dropped corrupt session stats");
    }
    Ok(decode_elements(outcome.data, path))
}

/// Insert or update the stat record for one session.
pub fn record_session_stat(path: &Path, stat: &SessionStat) -> Result<()> {
    let mut stats = load_session_stats(path)?;
    match stats
        .iter_mut()
        .find(|existing| existing.session_id == stat.session_id)
    {
        Some(existing) => *existing = stat.clone(),
        None => stats.push(stat.clone()),
    }
    write_json(path, &stats)
}

/// Load `metrics.json`, recovering per-element; missing file yields an empty
/// container.
pub fn load_metrics(path: &Path, now: DateTime<Utc>, retention_days: u32) -> Result<MetricsFile> {
    let Some(value) = read_json(path)? else {
        return Ok(MetricsFile::empty(now, retention_days));
    };
    let outcome = validate(&value, &metrics_file_schema(), true);
    let Some(data) = outcome.data else {
        return Err(anyhow!(
            "metrics file {} is invalid: {}",
            path.display(),
            first_issue(&outcome.issues)
        ));
    };
    if outcome.has_recoveries {
        warn!(path = %path.display(), "recovered fields while loading metrics");
    }
    serde_json::from_value(data).with_context(|| format!("decode metrics {}", path.display()))
}

/// Append one task metric, pruning entries older than the retention window.
pub fn record_task_metric(
    path: &Path,
    metric: TaskMetric,
    now: DateTime<Utc>,
    retention_days: u32,
) -> Result<()> {
    let mut metrics = load_metrics(path, now, retention_days)?;
    metrics.tasks.push(metric);

    let cutoff = now - chrono::Duration::days(i64::from(retention_days));
    let before = metrics.tasks.len();
    metrics
        .tasks
        .retain(|task| task.finished_at.unwrap_or(task.started_at) >= cutoff);
    if metrics.tasks.len() < before {
        debug!(
            pruned = before - metrics.tasks.len(),
            retention_days, "pruned expired task metrics"
        );
    }

    metrics.version = METRICS_VERSION;
    metrics.last_updated = now;
    metrics.retention_days = retention_days;
    write_json(path, &metrics)
}

pub fn write_progress(path: &Path, progress: &Progress) -> Result<()> {
    write_json(path, progress)
}

pub fn load_progress(path: &Path) -> Result<Option<Progress>> {
    load_single(path, &progress_schema())
}

/// Mark the coordination root paused. New work refuses to start while the
/// marker exists.
pub fn write_pause(path: &Path, marker: &PauseMarker) -> Result<()> {
    write_json(path, marker)
}

pub fn read_pause(path: &Path) -> Result<Option<PauseMarker>> {
    load_single(path, &pause_schema())
}

/// Remove the pause marker; false when none was present.
pub fn clear_pause(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}

pub fn request_approval(path: &Path, issue_number: u64, now: DateTime<Utc>) -> Result<()> {
    write_json(
        path,
        &ApprovalRecord {
            issue_number,
            requested_at: now,
            status: ApprovalStatus::Pending,
            decided_at: None,
        },
    )
}

pub fn read_approval(path: &Path) -> Result<Option<ApprovalRecord>> {
    load_single(path, &approval_schema())
}

/// Record a decision on a pending approval; false when no request exists.
pub fn decide_approval(path: &Path, status: ApprovalStatus, now: DateTime<Utc>) -> Result<bool> {
    let Some(mut record) = read_approval(path)? else {
        return Ok(false);
    };
    record.status = status;
    record.decided_at = Some(now);
    write_json(path, &record)?;
    Ok(true)
}

fn read_json(path: &Path) -> Result<Option<Value>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let value = parse_json(&contents)
        .map_err(|issue| anyhow!("parse {}: {issue}", path.display()))?;
    Ok(Some(value))
}

/// Strict load of a single record: corruption is surfaced, never repaired.
fn load_single<T: DeserializeOwned>(path: &Path, schema: &Schema) -> Result<Option<T>> {
    let Some(value) = read_json(path)? else {
        return Ok(None);
    };
    let outcome = validate(&value, schema, false);
    let Some(data) = outcome.data else {
        return Err(anyhow!(
            "{} {} is invalid: {}",
            schema.name(),
            path.display(),
            first_issue(&outcome.issues)
        ));
    };
    let record =
        serde_json::from_value(data).with_context(|| format!("decode {}", path.display()))?;
    Ok(Some(record))
}

fn decode_elements<T: DeserializeOwned>(elements: Vec<Value>, path: &Path) -> Vec<T> {
    elements
        .into_iter()
        .filter_map(|element| match serde_json::from_value(element) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(path = %path.display(), err = %err, "dropped undecodable record");
                None
            }
        })
        .collect()
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value).context("serialize json")?;
    buf.push('\n');
    safe_write(path, &buf, &WriteRetry::default())
}

fn first_issue(issues: &[crate::core::schema::ValidationIssue]) -> String {
    issues
        .first()
        .map(|issue| format!("{}: {}", issue.path, issue.message))
        .unwrap_or_else(|| "invalid record".to_string())
}
