use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::JobId;
use crate::JobKind;
use crate::JobStatus;
use crate::ProgressRecord;

/// Identity block of the persisted application state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AppInfo {
    pub version: String,
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_shutdown: Option<DateTime<Utc>>,
    #[serde(default)]
    pub clean_shutdown: bool,
}

/// Durable snapshot of one job, written on every pause and terminal
/// transition so an interrupted process can re-queue unfinished work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStateRecord {
    pub id: JobId,
    pub kind: JobKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub status: JobStatus,
    pub progress: ProgressRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

/// Interactive-session leftovers restored on the next start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SessionState {
    #[serde(default)]
    pub command_history: Vec<String>,
    #[serde(default)]
    pub active_queries: Vec<String>,
    #[serde(default)]
    pub variables: serde_json::Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

/// Composite persisted under the `application` component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ApplicationState {
    pub app: AppInfo,
    #[serde(default)]
    pub jobs: Vec<JobStateRecord>,
    /// Opaque snapshot of the configuration the process ran with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
    #[serde(default)]
    pub session: SessionState,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn application_state_round_trips() {
        let state = ApplicationState {
            app: AppInfo {
                version: "0.1.0".to_string(),
                pid: 4242,
                last_shutdown: None,
                clean_shutdown: true,
            },
            jobs: vec![JobStateRecord {
                id: JobId::new(),
                kind: JobKind::Download,
                source: Some("hackernews".to_string()),
                status: JobStatus::Paused,
                progress: ProgressRecord::new(2, 10),
                started_at: Some(Utc::now()),
                paused_at: Some(Utc::now()),
                metadata: serde_json::Map::new(),
            }],
            config: Some(serde_json::json!({"batch_size": 100})),
            session: SessionState::default(),
            timestamp: Utc::now(),
        };
        let encoded = serde_json::to_string_pretty(&state).expect("serialize");
        let decoded: ApplicationState = serde_json::from_str(&encoded).expect("deserialize");
        assert_eq!(decoded, state);
    }
}
