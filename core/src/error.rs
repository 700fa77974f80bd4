use std::time::Duration;

use pubdatahub_protocol::JobId;
use pubdatahub_protocol::JobStatus;
use pubdatahub_state::StateError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Caller-visible bad input. Surfaced verbatim, never retried.
    #[error("{0}")]
    Validation(String),

    #[error("source is not initialized; run `download` or `sources status` first")]
    NotInitialized,

    #[error(transparent)]
    Storage(#[from] StateError),

    /// Network-shaped upstream failure (timeout, connect, 5xx, rate limit).
    /// Eligible for backoff retry at the job granularity.
    #[error("transient upstream failure: {0}")]
    TransientUpstream(String),

    /// Upstream rejected the request outright (4xx other than 429).
    #[error("upstream rejected request: {0}")]
    FatalUpstream(String),

    #[error("invalid id range: {start} > {end}")]
    InvalidRange { start: i64, end: i64 },

    #[error("operation canceled")]
    Canceled,

    #[error("rate limiter is closed")]
    AlreadyClosed,

    #[error("job does not support {0}")]
    Unsupported(&'static str),

    #[error("cannot {action} job {id} while {from}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        action: &'static str,
    },

    #[error("no such job: {0}")]
    JobNotFound(JobId),

    #[error("no such source: {0}")]
    SourceNotFound(String),

    #[error("worker pool is stopped")]
    PoolStopped,

    #[error("worker pool queue is full")]
    Backpressure,

    /// Some in-flight work outlived the graceful window and was cancelled.
    #[error("stopped with {forced} job(s) force-cancelled")]
    PartialStop { forced: usize },

    #[error("{name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("state corruption: {0}")]
    Corruption(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl CoreError {
    /// Whether the failure is worth an automatic backoff retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::TransientUpstream(_))
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}
