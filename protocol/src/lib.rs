//! Shared types for the PubDataHub job control plane and ingestion runtime.
//!
//! Everything here is plain data: the CLI, the HTTP adapter, the job manager
//! and the storage layer all exchange these values, so they carry serde
//! derives and no behavior beyond parsing/validation helpers.

mod app_state;
mod item;
mod job;
mod job_id;
mod query;
mod source;

pub use app_state::AppInfo;
pub use app_state::ApplicationState;
pub use app_state::JobStateRecord;
pub use app_state::SessionState;
pub use item::Item;
pub use job::JobInfo;
pub use job::JobKind;
pub use job::JobStatus;
pub use job::ProgressRecord;
pub use job_id::JobId;
pub use query::ColumnSpec;
pub use query::QueryOutput;
pub use query::TableSchema;
pub use source::DownloadState;
pub use source::DownloadStatus;
pub use source::SourceInfo;
