use std::sync::Arc;

use async_trait::async_trait;
use pubdatahub_protocol::JobId;
use pubdatahub_protocol::JobKind;
use pubdatahub_protocol::ProgressRecord;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::jobs::Job;
use crate::jobs::PriorityCell;
use crate::jobs::ProgressSender;

/// One firing of a scheduled entry: wraps the materialized job and carries
/// the schedule's name so listings show where it came from.
pub struct ScheduledJobExecution {
    id: JobId,
    priority: PriorityCell,
    entry: String,
    inner: Arc<dyn Job>,
}

impl ScheduledJobExecution {
    pub fn new(entry: impl Into<String>, inner: Arc<dyn Job>) -> Self {
        let priority = inner.priority();
        Self {
            id: JobId::new(),
            priority: PriorityCell::new(priority),
            entry: entry.into(),
            inner,
        }
    }
}

#[async_trait]
impl Job for ScheduledJobExecution {
    fn id(&self) -> JobId {
        self.id
    }

    fn kind(&self) -> JobKind {
        JobKind::Scheduled
    }

    fn priority(&self) -> i32 {
        self.priority.get()
    }

    fn set_priority(&self, priority: i32) {
        self.priority.set(priority);
    }

    fn description(&self) -> String {
        format!("[{}] {}", self.entry, self.inner.description())
    }

    fn metadata(&self) -> serde_json::Map<String, Value> {
        let mut metadata = self.inner.metadata();
        metadata.insert("schedule".to_string(), Value::from(self.entry.clone()));
        metadata
    }

    fn can_pause(&self) -> bool {
        self.inner.can_pause()
    }

    fn progress(&self) -> ProgressRecord {
        self.inner.progress()
    }

    fn validate(&self) -> Result<()> {
        self.inner.validate()
    }

    async fn execute(&self, cancel: CancellationToken, progress: ProgressSender) -> Result<()> {
        self.inner.execute(cancel, progress).await
    }
}
