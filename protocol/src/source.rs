use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use strum::Display;
use strum::EnumString;

/// Ingestion state of one data source, as reported by `download_status`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Default,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DownloadState {
    #[default]
    NotInitialized,
    Idle,
    Downloading,
    Paused,
    Error,
    Completed,
}

/// Snapshot of a source's download progress.
///
/// Queryable at any time, including while a download run is in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DownloadStatus {
    pub active: bool,
    /// Completion ratio in `[0, 1]`.
    pub progress: f64,
    pub items_total: i64,
    pub items_cached: i64,
    pub state: DownloadState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Name/description pair listed by `/api/sources` and `sources list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub name: String,
    pub description: String,
}
