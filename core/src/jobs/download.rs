use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use pubdatahub_protocol::JobId;
use pubdatahub_protocol::JobKind;
use pubdatahub_protocol::ProgressRecord;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;

use crate::DataSource;
use crate::Result;
use crate::jobs::Job;
use crate::jobs::PriorityCell;
use crate::jobs::ProgressSender;

/// Drives one data source's download run.
///
/// Pausable: the manager pauses it by cancelling the run token, and the
/// source's ledger makes the next run resume where this one stopped.
pub struct DownloadJob {
    id: JobId,
    priority: PriorityCell,
    source: Arc<dyn DataSource>,
    progress: StdMutex<ProgressRecord>,
    ran_before: AtomicBool,
}

impl DownloadJob {
    pub fn new(source: Arc<dyn DataSource>, priority: i32) -> Self {
        Self::with_id(JobId::new(), source, priority)
    }

    /// Rebuild with a known id, preserving identity across restarts.
    pub fn with_id(id: JobId, source: Arc<dyn DataSource>, priority: i32) -> Self {
        Self {
            id,
            priority: PriorityCell::new(priority),
            source,
            progress: StdMutex::new(ProgressRecord::default()),
            ran_before: AtomicBool::new(false),
        }
    }

    fn set_progress(&self, record: ProgressRecord) {
        *self
            .progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = record;
    }
}

#[async_trait]
impl Job for DownloadJob {
    fn id(&self) -> JobId {
        self.id
    }

    fn kind(&self) -> JobKind {
        JobKind::Download
    }

    fn priority(&self) -> i32 {
        self.priority.get()
    }

    fn set_priority(&self, priority: i32) {
        self.priority.set(priority);
    }

    fn description(&self) -> String {
        format!("download {}", self.source.name())
    }

    fn metadata(&self) -> serde_json::Map<String, Value> {
        let mut metadata = serde_json::Map::new();
        metadata.insert("source".to_string(), Value::from(self.source.name()));
        metadata
    }

    fn can_pause(&self) -> bool {
        true
    }

    fn progress(&self) -> ProgressRecord {
        self.progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn execute(&self, cancel: CancellationToken, progress: ProgressSender) -> Result<()> {
        // Forward the source's per-run progress stream for as long as the
        // run lasts; the handle aborts the forwarder when execute returns.
        let _forwarder = self.source.progress_stream().map(|mut stream| {
            let sink = progress.clone();
            AbortOnDropHandle::new(tokio::spawn(async move {
                while stream.changed().await.is_ok() {
                    sink.send(stream.borrow().clone());
                }
            }))
        });

        let result = if self.ran_before.swap(true, Ordering::SeqCst) {
            self.source.resume_download(cancel).await
        } else {
            self.source.start_download(cancel).await
        };

        let status = self.source.download_status().await;
        let record = ProgressRecord {
            current: status.items_cached.max(0) as u64,
            total: status.items_total.max(0) as u64,
            message: Some(status.state.to_string()),
            eta_seconds: None,
        };
        self.set_progress(record.clone());
        progress.send(record);
        result
    }
}
