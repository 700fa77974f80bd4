use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use strum::Display;
use strum::EnumString;

use crate::JobId;

/// Lifecycle state of a managed job.
///
/// `Completed`, `Failed` and `Cancelled` are terminal: once entered, a job
/// only leaves them through an explicit retry, which re-queues the same job
/// value.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Type tag for the concrete work a job performs.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobKind {
    Download,
    Export,
    Scheduled,
}

/// Point-in-time progress of a running job.
///
/// `current` is monotone within one run; it may reset when a paused job is
/// resumed and the work is re-planned from the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProgressRecord {
    pub current: u64,
    pub total: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Estimated seconds to completion, when the job can compute one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<u64>,
}

impl ProgressRecord {
    pub fn new(current: u64, total: u64) -> Self {
        Self {
            current,
            total,
            message: None,
            eta_seconds: None,
        }
    }

    pub fn with_message(current: u64, total: u64, message: impl Into<String>) -> Self {
        Self {
            current,
            total,
            message: Some(message.into()),
            eta_seconds: None,
        }
    }

    /// Completion ratio in `[0, 1]`; zero-total progress reads as 0.
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.current as f64 / self.total as f64).clamp(0.0, 1.0)
        }
    }
}

/// Read-side snapshot of a managed job, as listed by the CLI and HTTP API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub priority: i32,
    pub description: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
    pub progress: ProgressRecord,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
