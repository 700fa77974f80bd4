use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use pubdatahub_protocol::DownloadStatus;
use pubdatahub_protocol::ProgressRecord;
use pubdatahub_protocol::QueryOutput;
use pubdatahub_protocol::SourceInfo;
use pubdatahub_protocol::TableSchema;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::CoreError;
use crate::Result;

/// A named ingestion + query surface.
///
/// Implementations own their storage and their downloader; the rest of the
/// system only ever sees this contract. `start_download` blocks for the whole
/// run and must return promptly (within one in-flight HTTP request plus one
/// storage transaction) once `cancel` fires, leaving the ledger and items
/// consistent with whatever was committed.
#[async_trait]
pub trait DataSource: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Create the source's storage under `root` and open it. Idempotent.
    async fn init_storage(&self, root: &Path) -> Result<()>;

    /// Snapshot of the ingestion state. Callable at any time, including
    /// while a download run is in flight.
    async fn download_status(&self) -> DownloadStatus;

    async fn start_download(&self, cancel: CancellationToken) -> Result<()>;

    /// Request the running download to stop at the next safe point.
    async fn pause_download(&self) -> Result<()>;

    /// Semantically `start_download` with the ledger intact.
    async fn resume_download(&self, cancel: CancellationToken) -> Result<()>;

    /// Run `sql` verbatim against the source's store.
    async fn query(&self, sql: &str) -> Result<QueryOutput>;

    async fn schema(&self) -> Result<Vec<TableSchema>>;

    fn storage_path(&self) -> Option<PathBuf>;

    /// Per-run progress records, for sources that publish them. Consumers
    /// without a stream fall back to polling `download_status`.
    fn progress_stream(&self) -> Option<watch::Receiver<ProgressRecord>> {
        None
    }
}

/// Name-keyed set of registered sources.
#[derive(Default, Clone)]
pub struct SourceRegistry {
    sources: BTreeMap<String, Arc<dyn DataSource>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, source: Arc<dyn DataSource>) {
        self.sources.insert(source.name().to_string(), source);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn DataSource>> {
        self.sources
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::SourceNotFound(name.to_string()))
    }

    pub fn list(&self) -> Vec<SourceInfo> {
        self.sources
            .values()
            .map(|source| SourceInfo {
                name: source.name().to_string(),
                description: source.description().to_string(),
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}
