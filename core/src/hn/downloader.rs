use std::collections::HashSet;

use chrono::Utc;
use pubdatahub_protocol::DownloadState;
use pubdatahub_protocol::DownloadStatus;
use pubdatahub_protocol::ProgressRecord;
use pubdatahub_state::BatchEntry;
use pubdatahub_state::ItemStore;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::CoreError;
use crate::Result;
use crate::hn::HnClient;
use crate::hn::META_MAX_ID;

/// One resumable sweep over the remote id space.
///
/// The downloader never owns its collaborators: the source hands it handles
/// to the store and the client for the duration of a run. All durable
/// progress lives in the batch ledger, so a run can stop at any range
/// boundary and the next run picks up whatever is not yet marked completed.
pub(crate) struct Downloader {
    store: ItemStore,
    client: HnClient,
    batch_size: i64,
    density_skip_threshold: f64,
    status: watch::Sender<DownloadStatus>,
    progress: watch::Sender<ProgressRecord>,
}

impl Downloader {
    pub(crate) fn new(
        store: ItemStore,
        client: HnClient,
        batch_size: i64,
        density_skip_threshold: f64,
        status: watch::Sender<DownloadStatus>,
        progress: watch::Sender<ProgressRecord>,
    ) -> Self {
        Self {
            store,
            client,
            batch_size,
            density_skip_threshold,
            status,
            progress,
        }
    }

    pub(crate) async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let result = self.sweep(cancel).await;
        match &result {
            Ok(()) => {}
            Err(CoreError::Canceled) => {
                self.set_status(DownloadState::Paused, None);
                info!("download paused");
            }
            Err(err) => {
                self.set_status(DownloadState::Error, Some(err.to_string()));
                warn!("download failed: {err}");
            }
        }
        result
    }

    async fn sweep(&self, cancel: &CancellationToken) -> Result<()> {
        self.status.send_modify(|status| {
            status.active = true;
            status.state = DownloadState::Downloading;
            status.error_message = None;
            status.last_update = Some(Utc::now());
        });

        let max_id = self.client.max_id(cancel).await?;
        self.store.set_meta(META_MAX_ID, &max_id.to_string()).await?;
        let cached = self.store.count_items().await?;
        self.status.send_modify(|status| {
            status.items_total = max_id;
            status.items_cached = cached;
            status.last_update = Some(Utc::now());
        });

        let pending = self.reconcile(max_id).await?;
        let total = pending.len() as u64;
        info!(max_id, ranges = total, "download plan ready");
        self.send_progress(0, total, format!("{total} range(s) to fetch"));

        let mut completed_ranges = 0u64;
        let mut last_transient: Option<CoreError> = None;
        for (lo, hi) in pending {
            if cancel.is_cancelled() {
                return Err(CoreError::Canceled);
            }
            let mut entry = BatchEntry::open(lo, hi, self.batch_size);
            self.store.upsert_batch_entry(&entry).await?;

            let items = match self.client.batch(cancel, lo, hi).await {
                Ok(items) => items,
                Err(CoreError::Canceled) => return Err(CoreError::Canceled),
                Err(err) if err.is_transient() => {
                    // Intra-range retry is the job manager's problem; record
                    // the failure and move on to the next range.
                    warn!(lo, hi, "range failed transiently: {err}");
                    self.status
                        .send_modify(|status| status.error_message = Some(err.to_string()));
                    self.send_progress(
                        completed_ranges,
                        total,
                        format!("range [{lo}, {hi}] failed: {err}"),
                    );
                    last_transient = Some(err);
                    continue;
                }
                Err(err) => return Err(err),
            };

            self.store.upsert_batch(&items).await?;
            entry.completed = true;
            entry.items_downloaded = items.len() as i64;
            entry.completed_at = Some(Utc::now());
            self.store.upsert_batch_entry(&entry).await?;

            completed_ranges += 1;
            let cached = self.store.count_items().await?;
            let ratio = if total == 0 {
                1.0
            } else {
                completed_ranges as f64 / total as f64
            };
            self.status.send_modify(|status| {
                status.items_cached = cached;
                status.progress = ratio;
                status.last_update = Some(Utc::now());
            });
            self.send_progress(
                completed_ranges,
                total,
                format!("fetched range [{lo}, {hi}] ({} item(s))", entry.items_downloaded),
            );
            debug!(lo, hi, items = entry.items_downloaded, "range committed");
        }

        if let Some(err) = last_transient {
            return Err(err);
        }

        self.status.send_modify(|status| {
            status.active = false;
            status.state = DownloadState::Completed;
            status.progress = 1.0;
            status.last_update = Some(Utc::now());
        });
        self.send_progress(total, total, "download complete");
        Ok(())
    }

    /// Candidate ranges still worth fetching, highest ids first.
    ///
    /// Walks `[1, max_id]` from the top in `batch_size` steps; a range is
    /// skipped when the ledger marks it completed or when it is already at
    /// least `density_skip_threshold` populated locally.
    async fn reconcile(&self, max_id: i64) -> Result<Vec<(i64, i64)>> {
        let ledger = self.store.batch_ledger().await?;
        let completed: HashSet<(i64, i64)> = ledger
            .iter()
            .filter(|entry| entry.completed)
            .map(|entry| (entry.start, entry.end))
            .collect();

        let mut pending = Vec::new();
        let mut hi = max_id;
        while hi >= 1 {
            let lo = (hi - self.batch_size + 1).max(1);
            if !completed.contains(&(lo, hi)) {
                let width = hi - lo + 1;
                let existing = self.store.existing_ids_in_range(lo, hi).await?;
                if (existing.len() as f64) < self.density_skip_threshold * width as f64 {
                    pending.push((lo, hi));
                } else {
                    debug!(lo, hi, existing = existing.len(), "range dense enough, skipping");
                }
            }
            hi = lo - 1;
        }
        Ok(pending)
    }

    fn set_status(&self, state: DownloadState, error: Option<String>) {
        self.status.send_modify(|status| {
            status.active = false;
            status.state = state;
            status.error_message = error;
            status.last_update = Some(Utc::now());
        });
    }

    fn send_progress(&self, current: u64, total: u64, message: impl Into<String>) {
        let _ = self.progress.send(ProgressRecord::with_message(current, total, message));
    }
}
