use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::PoisonError;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use pubdatahub_protocol::ColumnSpec;
use pubdatahub_protocol::DownloadState;
use pubdatahub_protocol::DownloadStatus;
use pubdatahub_protocol::ProgressRecord;
use pubdatahub_protocol::QueryOutput;
use pubdatahub_protocol::TableSchema;
use pubdatahub_state::ItemStore;
use tokio::sync::Mutex;
use tokio::sync::RwLock;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::CoreError;
use crate::DataSource;
use crate::DownloadConfig;
use crate::RateLimiter;
use crate::Result;
use crate::hn::DEFAULT_BASE_URL;
use crate::hn::HnClient;
use crate::hn::META_MAX_ID;
use crate::hn::downloader::Downloader;

const NAME: &str = "hackernews";
const DESCRIPTION: &str = "Hacker News stories, comments, jobs and polls via the public item API";

#[derive(Default)]
struct Storage {
    store: Option<ItemStore>,
    path: Option<PathBuf>,
}

/// The reference [`DataSource`]: a rate-limited, resumable sweep over the
/// Hacker News id space into a local SQLite file.
pub struct HackerNewsSource {
    config: DownloadConfig,
    client: HnClient,
    limiter: Arc<RateLimiter>,
    storage: RwLock<Storage>,
    status_tx: watch::Sender<DownloadStatus>,
    progress_tx: watch::Sender<ProgressRecord>,
    /// Held for the duration of a run; `try_lock` failing means a run is
    /// already in flight.
    run_gate: Mutex<()>,
    run_cancel: StdMutex<Option<CancellationToken>>,
}

impl HackerNewsSource {
    pub fn new(config: &DownloadConfig) -> Result<Self> {
        Self::with_base_url(config, DEFAULT_BASE_URL)
    }

    /// Point the source at a different API root. Tests use this to target a
    /// local mock server.
    pub fn with_base_url(config: &DownloadConfig, base_url: &str) -> Result<Self> {
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit,
            Duration::from_secs(config.rate_interval_secs),
        ));
        let client = HnClient::new(
            base_url,
            Arc::clone(&limiter),
            Duration::from_secs(config.http_timeout_secs),
        )?;
        let (status_tx, _) = watch::channel(DownloadStatus::default());
        let (progress_tx, _) = watch::channel(ProgressRecord::default());
        Ok(Self {
            config: config.clone(),
            client,
            limiter,
            storage: RwLock::new(Storage::default()),
            status_tx,
            progress_tx,
            run_gate: Mutex::new(()),
            run_cancel: StdMutex::new(None),
        })
    }

    /// Release everything the source owns: the rate-limiter refill task and
    /// the store's connection pool. Safe to call more than once.
    pub async fn close(&self) {
        self.limiter.close();
        let store = self.storage.read().await.store.clone();
        if let Some(store) = store {
            store.close().await;
        }
    }

    async fn store(&self) -> Result<ItemStore> {
        self.storage
            .read()
            .await
            .store
            .clone()
            .ok_or(CoreError::NotInitialized)
    }

    fn set_run_cancel(&self, token: Option<CancellationToken>) {
        *self
            .run_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = token;
    }

    async fn run_download(&self, cancel: CancellationToken) -> Result<()> {
        let store = self.store().await?;
        let Ok(_guard) = self.run_gate.try_lock() else {
            return Err(CoreError::validation(format!(
                "download already in progress for {NAME}"
            )));
        };
        self.set_run_cancel(Some(cancel.clone()));
        let downloader = Downloader::new(
            store,
            self.client.clone(),
            self.config.batch_size,
            self.config.density_skip_threshold,
            self.status_tx.clone(),
            self.progress_tx.clone(),
        );
        let result = downloader.run(&cancel).await;
        self.set_run_cancel(None);
        result
    }
}

#[async_trait]
impl DataSource for HackerNewsSource {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        DESCRIPTION
    }

    async fn init_storage(&self, root: &Path) -> Result<()> {
        let mut storage = self.storage.write().await;
        if storage.store.is_some() {
            return Ok(());
        }
        let db_path = root.join(NAME).join(format!("{NAME}.db"));
        let store = ItemStore::init_at(&db_path).await?;
        let cached = store.count_items().await?;
        let known_max: i64 = store
            .get_meta(META_MAX_ID)
            .await?
            .and_then(|value| value.parse().ok())
            .unwrap_or(0);
        self.status_tx.send_modify(|status| {
            status.state = DownloadState::Idle;
            status.items_cached = cached;
            status.items_total = known_max;
            status.last_update = Some(Utc::now());
        });
        info!(path = %db_path.display(), cached, "initialized hackernews storage");
        storage.path = Some(db_path);
        storage.store = Some(store);
        Ok(())
    }

    async fn download_status(&self) -> DownloadStatus {
        self.status_tx.borrow().clone()
    }

    async fn start_download(&self, cancel: CancellationToken) -> Result<()> {
        self.run_download(cancel).await
    }

    async fn pause_download(&self) -> Result<()> {
        let token = self
            .run_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(token) = token {
            token.cancel();
        }
        Ok(())
    }

    async fn resume_download(&self, cancel: CancellationToken) -> Result<()> {
        self.run_download(cancel).await
    }

    async fn query(&self, sql: &str) -> Result<QueryOutput> {
        let store = self.store().await?;
        let result = store.query(sql).await?;
        Ok(QueryOutput {
            count: result.rows.len(),
            columns: result.columns,
            rows: result.rows,
            duration: result.elapsed,
        })
    }

    async fn schema(&self) -> Result<Vec<TableSchema>> {
        let store = self.store().await?;
        let tables = store
            .query(
                "SELECT name FROM sqlite_master WHERE type = 'table' \
                 AND name NOT LIKE 'sqlite_%' AND name NOT LIKE '_sqlx%' ORDER BY name",
            )
            .await?;
        let mut schema = Vec::with_capacity(tables.rows.len());
        for row in &tables.rows {
            let Some(table) = row.first().and_then(|value| value.as_str()) else {
                continue;
            };
            let info = store.query(&format!("PRAGMA table_info({table})")).await?;
            let columns = info
                .rows
                .iter()
                .filter_map(|column| {
                    Some(ColumnSpec {
                        name: column.get(1)?.as_str()?.to_string(),
                        type_tag: column.get(2)?.as_str()?.to_string(),
                    })
                })
                .collect();
            schema.push(TableSchema {
                table: table.to_string(),
                columns,
            });
        }
        Ok(schema)
    }

    fn storage_path(&self) -> Option<PathBuf> {
        self.storage
            .try_read()
            .ok()
            .and_then(|storage| storage.path.clone())
    }

    fn progress_stream(&self) -> Option<watch::Receiver<ProgressRecord>> {
        Some(self.progress_tx.subscribe())
    }
}
