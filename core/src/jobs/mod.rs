//! The job model: cancellable, observable background work.
//!
//! A [`Job`] is a value the manager can run at most once at a time on a
//! worker. Concrete variants stay behind the trait; the manager never
//! inspects them except through [`Job::can_pause`].

mod download;
mod export;
mod scheduled;

use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use pubdatahub_protocol::JobId;
use pubdatahub_protocol::JobKind;
use pubdatahub_protocol::ProgressRecord;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::Result;

pub use download::DownloadJob;
pub use export::ExportFormat;
pub use export::ExportJob;
pub use scheduled::ScheduledJobExecution;

/// One progress update, tagged with the job that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub record: ProgressRecord,
}

/// Non-blocking progress sink handed to [`Job::execute`].
///
/// Sends never block the job; updates from one job arrive at subscribers in
/// send order.
#[derive(Clone)]
pub struct ProgressSender {
    job_id: JobId,
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ProgressSender {
    pub(crate) fn new(job_id: JobId, tx: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        Self { job_id, tx }
    }

    /// Stand-alone sender plus the receiving end, for driving a job outside
    /// a manager.
    pub fn channel(job_id: JobId) -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(job_id, tx), rx)
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn send(&self, record: ProgressRecord) {
        let _ = self.tx.send(ProgressEvent {
            job_id: self.job_id,
            record,
        });
    }
}

/// A unit of managed background work.
#[async_trait]
pub trait Job: Send + Sync {
    fn id(&self) -> JobId;

    fn kind(&self) -> JobKind;

    /// Higher is more urgent. Mutable so a queued job can be re-prioritized.
    fn priority(&self) -> i32;

    fn set_priority(&self, priority: i32);

    fn description(&self) -> String;

    fn metadata(&self) -> serde_json::Map<String, Value> {
        serde_json::Map::new()
    }

    fn created_by(&self) -> Option<String> {
        None
    }

    /// Whether pausing (cancel-with-resume) is meaningful for this job.
    fn can_pause(&self) -> bool {
        false
    }

    fn progress(&self) -> ProgressRecord;

    /// Cheap structural check run at submission time.
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Run to completion, cancellation, or failure.
    ///
    /// Implementations must watch `cancel` and return promptly once it
    /// fires, and should push a record through `progress` whenever their
    /// current step or message changes meaningfully.
    async fn execute(&self, cancel: CancellationToken, progress: ProgressSender) -> Result<()>;
}

/// Rebuilds job values from persisted records so recovery can re-queue them.
pub trait JobReviver: Send + Sync {
    fn revive(&self, record: &pubdatahub_protocol::JobStateRecord)
    -> Option<std::sync::Arc<dyn Job>>;
}

/// Shared priority cell used by the concrete job types.
#[derive(Debug)]
pub(crate) struct PriorityCell(AtomicI32);

impl PriorityCell {
    pub(crate) fn new(priority: i32) -> Self {
        Self(AtomicI32::new(priority))
    }

    pub(crate) fn get(&self) -> i32 {
        self.0.load(Ordering::Relaxed)
    }

    pub(crate) fn set(&self, priority: i32) {
        self.0.store(priority, Ordering::Relaxed);
    }
}
