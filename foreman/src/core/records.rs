//! Persisted record types and the validation schemas they load through.
//!
//! Every structure foreman persists under `.foreman/` has a serde type here
//! plus a named [`Schema`] declaring its field constraints. Loaders parse
//! with [`crate::core::schema::parse_json`], validate against the schema
//! (recovery mode for collections, strict for single required records), then
//! deserialize the repaired value into the typed struct.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::core::schema::{FieldSpec, Schema};

/// ISO-8601 timestamps as serialized by chrono.
const TIMESTAMP_PATTERN: &str = r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}";

/// Ownership claim for one task, stored at `locks/<issue>.lock`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Task identifier; primary key of the lock.
    pub issue_number: u64,
    /// Opaque id generated once per process lifetime.
    pub session_id: String,
    /// Holder's OS process id at acquisition time; auxiliary liveness signal.
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
    /// Refreshed periodically by the holder; the primary staleness signal.
    pub last_heartbeat: DateTime<Utc>,
}

pub fn lock_record_schema() -> Schema {
    Schema::new("lock_record")
        .field("issue_number", FieldSpec::integer().required().min(1.0))
        .field("session_id", FieldSpec::string().required().min_length(1))
        .field("pid", FieldSpec::integer().required().min(1.0))
        .field(
            "acquired_at",
            FieldSpec::string().required().pattern(TIMESTAMP_PATTERN),
        )
        .field(
            "last_heartbeat",
            FieldSpec::string().required().pattern(TIMESTAMP_PATTERN),
        )
}

/// Per-session counters, appended to `stats.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStat {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub issues_completed: u64,
    pub prs_opened: u64,
    pub gigachad_merges: u64,
    pub retries: u64,
}

impl SessionStat {
    pub fn new(session_id: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.to_string(),
            started_at,
            issues_completed: 0,
            prs_opened: 0,
            gigachad_merges: 0,
            retries: 0,
        }
    }
}

pub fn session_stat_schema() -> Schema {
    Schema::new("session_stat")
        .field("session_id", FieldSpec::string().required().min_length(1))
        .field(
            "started_at",
            FieldSpec::string().required().pattern(TIMESTAMP_PATTERN),
        )
        .field(
            "issues_completed",
            FieldSpec::integer().min(0.0).default_value(json!(0)),
        )
        .field(
            "prs_opened",
            FieldSpec::integer().min(0.0).default_value(json!(0)),
        )
        .field(
            "gigachad_merges",
            FieldSpec::integer().min(0.0).default_value(json!(0)),
        )
        .field(
            "retries",
            FieldSpec::integer().min(0.0).default_value(json!(0)),
        )
}

/// Terminal outcome recorded for one processed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskOutcome {
    Completed,
    Failed,
    Skipped,
}

/// One entry in the `tasks` array of `metrics.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMetric {
    pub issue_number: u64,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: TaskOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u64>,
    pub attempts: u32,
}

pub fn task_metric_schema() -> Schema {
    Schema::new("task_metric")
        .field("issue_number", FieldSpec::integer().required().min(1.0))
        .field(
            "started_at",
            FieldSpec::string().required().pattern(TIMESTAMP_PATTERN),
        )
        .field("finished_at", FieldSpec::string().pattern(TIMESTAMP_PATTERN))
        .field(
            "outcome",
            FieldSpec::string()
                .required()
                .one_of(&["completed", "failed", "skipped"]),
        )
        .field("duration_secs", FieldSpec::integer().min(0.0))
        .field(
            "attempts",
            FieldSpec::integer().min(0.0).default_value(json!(1)),
        )
}

/// Container persisted at `metrics.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsFile {
    pub version: u32,
    pub last_updated: DateTime<Utc>,
    pub retention_days: u32,
    pub tasks: Vec<TaskMetric>,
}

pub const METRICS_VERSION: u32 = 1;

impl MetricsFile {
    pub fn empty(now: DateTime<Utc>, retention_days: u32) -> Self {
        Self {
            version: METRICS_VERSION,
            last_updated: now,
            retention_days,
            tasks: Vec::new(),
        }
    }
}

pub fn metrics_file_schema() -> Schema {
    Schema::new("metrics_file")
        .field("version", FieldSpec::integer().required().min(1.0))
        .field(
            "last_updated",
            FieldSpec::string().required().pattern(TIMESTAMP_PATTERN),
        )
        .field(
            "retention_days",
            FieldSpec::integer().min(1.0).default_value(json!(30)),
        )
        .field("tasks", FieldSpec::array_of(task_metric_schema()).required())
}

/// Coarse progress marker for the task currently being worked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub issue_number: u64,
    pub step: u32,
    pub total_steps: u32,
    pub message: String,
    pub updated_at: DateTime<Utc>,
}

pub fn progress_schema() -> Schema {
    Schema::new("progress")
        .field("issue_number", FieldSpec::integer().required().min(1.0))
        .field("step", FieldSpec::integer().required().min(0.0))
        .field("total_steps", FieldSpec::integer().required().min(1.0))
        .field("message", FieldSpec::string().default_value(json!("")))
        .field(
            "updated_at",
            FieldSpec::string().required().pattern(TIMESTAMP_PATTERN),
        )
}

/// Marker at `pause.lock`; its presence halts new work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseMarker {
    pub paused_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_at: Option<DateTime<Utc>>,
}

pub fn pause_schema() -> Schema {
    Schema::new("pause_marker")
        .field(
            "paused_at",
            FieldSpec::string().required().pattern(TIMESTAMP_PATTERN),
        )
        .field("reason", FieldSpec::string())
        .field("resume_at", FieldSpec::string().pattern(TIMESTAMP_PATTERN))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

/// Record at `approval-<issue>.lock`, gating tasks that need a human ack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub issue_number: u64,
    pub requested_at: DateTime<Utc>,
    pub status: ApprovalStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
}

pub fn approval_schema() -> Schema {
    Schema::new("approval_record")
        .field("issue_number", FieldSpec::integer().required().min(1.0))
        .field(
            "requested_at",
            FieldSpec::string().required().pattern(TIMESTAMP_PATTERN),
        )
        .field(
            "status",
            FieldSpec::string()
                .required()
                .one_of(&["pending", "approved", "rejected"]),
        )
        .field("decided_at", FieldSpec::string().pattern(TIMESTAMP_PATTERN))
}
