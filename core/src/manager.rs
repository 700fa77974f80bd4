use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::PoisonError;
use std::sync::RwLock as StdRwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use pubdatahub_protocol::ApplicationState;
use pubdatahub_protocol::JobId;
use pubdatahub_protocol::JobInfo;
use pubdatahub_protocol::JobStateRecord;
use pubdatahub_protocol::JobStatus;
use rand::Rng;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::CoreError;
use crate::Result;
use crate::RetryConfig;
use crate::jobs::Job;
use crate::jobs::JobReviver;
use crate::jobs::ProgressEvent;
use crate::jobs::ProgressSender;
use crate::pool::PoolEvent;
use crate::pool::PoolStats;
use crate::pool::WorkItem;
use crate::pool::WorkerPool;
use crate::pool::WorkerPoolConfig;
use crate::pool::monitor::ResourceMonitor;
use crate::statefile::StateStore;

/// Component the manager persists its job table under.
pub const APPLICATION_COMPONENT: &str = "application";

const FANOUT_CAPACITY: usize = 256;
const ADMISSION_BACKOFF: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq)]
pub struct JobManagerConfig {
    pub pool: WorkerPoolConfig,
    pub retry: RetryConfig,
    /// How long terminal jobs stay visible before `cleanup` removes them.
    pub retention: Duration,
    /// Outer graceful window for `stop`.
    pub graceful_stop: Duration,
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self {
            pool: WorkerPoolConfig::default(),
            retry: RetryConfig::default(),
            retention: Duration::from_secs(24 * 60 * 60),
            graceful_stop: Duration::from_secs(30),
        }
    }
}

struct JobEntry {
    job: Arc<dyn Job>,
    info: JobInfo,
    run_cancel: Option<CancellationToken>,
    pause_requested: bool,
    paused_at: Option<DateTime<Utc>>,
}

impl JobEntry {
    fn record(&self) -> JobStateRecord {
        JobStateRecord {
            id: self.info.id,
            kind: self.info.kind,
            source: self
                .info
                .metadata
                .get("source")
                .and_then(Value::as_str)
                .map(str::to_string),
            status: self.info.status,
            progress: self.info.progress.clone(),
            started_at: self.info.started_at,
            paused_at: self.paused_at,
            metadata: self.info.metadata.clone(),
        }
    }
}

struct ManagerInner {
    jobs: StdRwLock<HashMap<JobId, JobEntry>>,
    pool: WorkerPool,
    progress_tx: mpsc::UnboundedSender<ProgressEvent>,
    fanout: broadcast::Sender<ProgressEvent>,
    state: Option<Arc<StateStore>>,
    retry: RetryConfig,
    retention: Duration,
    graceful_stop: Duration,
    monitor: StdMutex<Option<Arc<ResourceMonitor>>>,
    tasks: StdMutex<Vec<AbortOnDropHandle<()>>>,
}

impl ManagerInner {
    fn read_jobs(&self) -> RwLockReadGuard<'_, HashMap<JobId, JobEntry>> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_jobs(&self) -> RwLockWriteGuard<'_, HashMap<JobId, JobEntry>> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }

    async fn persist(&self, record: JobStateRecord) {
        let Some(state) = self.state.as_ref() else {
            return;
        };
        let mut app: ApplicationState = match state.load(APPLICATION_COMPONENT).await {
            Ok(Some(app)) => app,
            Ok(None) => ApplicationState::default(),
            Err(err) => {
                warn!("failed to read application state, rebuilding: {err}");
                ApplicationState::default()
            }
        };
        app.jobs.retain(|existing| existing.id != record.id);
        app.jobs.push(record);
        app.timestamp = Utc::now();
        if let Err(err) = state.save(APPLICATION_COMPONENT, &app).await {
            warn!("failed to persist job state: {err}");
        }
    }

    async fn persist_all(&self) {
        let Some(state) = self.state.as_ref() else {
            return;
        };
        let records: Vec<JobStateRecord> =
            self.read_jobs().values().map(JobEntry::record).collect();
        let mut app: ApplicationState = match state.load(APPLICATION_COMPONENT).await {
            Ok(Some(app)) => app,
            _ => ApplicationState::default(),
        };
        app.jobs = records;
        app.timestamp = Utc::now();
        if let Err(err) = state.save(APPLICATION_COMPONENT, &app).await {
            warn!("failed to persist job table: {err}");
        }
    }

    async fn handle_pool_event(self: &Arc<Self>, event: PoolEvent) {
        match event {
            PoolEvent::Started { job_id } => {
                let record = {
                    let mut jobs = self.write_jobs();
                    let Some(entry) = jobs.get_mut(&job_id) else {
                        return;
                    };
                    if entry.info.status != JobStatus::Queued {
                        return;
                    }
                    entry.info.status = JobStatus::Running;
                    entry.info.started_at = Some(Utc::now());
                    debug!(%job_id, "job started");
                    entry.record()
                };
                // A crash while running must leave a Running record behind,
                // or recovery has nothing to re-queue.
                self.persist(record).await;
            }
            PoolEvent::Skipped { job_id } => {
                debug!(%job_id, "queued job skipped");
            }
            PoolEvent::Finished { job_id, result } => {
                self.handle_finished(job_id, result).await;
            }
        }
    }

    async fn handle_finished(self: &Arc<Self>, job_id: JobId, result: Result<()>) {
        let mut retry_after: Option<Duration> = None;
        let record = {
            let mut jobs = self.write_jobs();
            let Some(entry) = jobs.get_mut(&job_id) else {
                return;
            };
            entry.run_cancel = None;
            match entry.info.status {
                // `pause` and `cancel` already transitioned the entry; the
                // worker's Canceled return is just the run unwinding.
                JobStatus::Paused | JobStatus::Cancelled => {}
                _ => match result {
                    Ok(()) => {
                        entry.info.status = JobStatus::Completed;
                        entry.info.completed_at = Some(Utc::now());
                        entry.info.error = None;
                        info!(%job_id, "job completed");
                    }
                    Err(CoreError::Canceled) => {
                        if entry.pause_requested {
                            entry.info.status = JobStatus::Paused;
                            entry.paused_at = Some(Utc::now());
                        } else {
                            entry.info.status = JobStatus::Cancelled;
                            entry.info.completed_at = Some(Utc::now());
                        }
                    }
                    Err(err) => {
                        entry.info.status = JobStatus::Failed;
                        entry.info.completed_at = Some(Utc::now());
                        warn!(%job_id, "job failed: {err}");
                        if err.is_transient() && entry.info.retry_count < entry.info.max_retries {
                            retry_after = Some(retry_delay(&self.retry, entry.info.retry_count));
                        }
                        entry.info.error = Some(err.to_string());
                    }
                },
            }
            entry.pause_requested = false;
            entry.record()
        };
        self.persist(record).await;

        if let Some(delay) = retry_after {
            info!(%job_id, ?delay, "scheduling retry");
            let inner = Arc::clone(self);
            let task = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                inner.requeue_after_failure(job_id);
            });
            lock_tasks(&self.tasks).push(AbortOnDropHandle::new(task));
        }
    }

    /// Automatic retry path: `Failed -> Queued` with the attempt counted.
    fn requeue_after_failure(self: &Arc<Self>, job_id: JobId) {
        let mut jobs = self.write_jobs();
        let Some(entry) = jobs.get_mut(&job_id) else {
            return;
        };
        if entry.info.status != JobStatus::Failed {
            return;
        }
        entry.info.retry_count += 1;
        entry.info.status = JobStatus::Queued;
        entry.info.completed_at = None;
        let cancel = CancellationToken::new();
        entry.run_cancel = Some(cancel.clone());
        let item = WorkItem {
            job: Arc::clone(&entry.job),
            cancel,
            progress: ProgressSender::new(job_id, self.progress_tx.clone()),
        };
        if let Err(err) = self.pool.submit(item) {
            warn!(%job_id, "retry submission failed: {err}");
            entry.info.status = JobStatus::Failed;
        }
    }
}

fn lock_tasks(
    tasks: &StdMutex<Vec<AbortOnDropHandle<()>>>,
) -> std::sync::MutexGuard<'_, Vec<AbortOnDropHandle<()>>> {
    tasks.lock().unwrap_or_else(PoisonError::into_inner)
}

fn retry_delay(retry: &RetryConfig, attempt: u32) -> Duration {
    let factor = retry.backoff_factor.powi(attempt as i32);
    let jitter = rand::rng().random_range(0.9..1.1);
    let millis = ((retry.initial_delay_ms as f64) * factor * jitter) as u64;
    Duration::from_millis(millis.min(retry.max_delay_ms))
}

/// The control plane: owns the job table, feeds the worker pool, fans out
/// progress, and mirrors pause/terminal transitions into the state store.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<ManagerInner>,
}

impl JobManager {
    /// Build the manager and start its background machinery (worker pool,
    /// pool-event loop, progress pump).
    pub fn start(config: JobManagerConfig, state: Option<Arc<StateStore>>) -> Self {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<ProgressEvent>();
        let (fanout, _) = broadcast::channel(FANOUT_CAPACITY);
        let pool = WorkerPool::new(config.pool, events_tx);
        let inner = Arc::new(ManagerInner {
            jobs: StdRwLock::new(HashMap::new()),
            pool,
            progress_tx,
            fanout,
            state,
            retry: config.retry,
            retention: config.retention,
            graceful_stop: config.graceful_stop,
            monitor: StdMutex::new(None),
            tasks: StdMutex::new(Vec::new()),
        });

        let events_inner = Arc::clone(&inner);
        let events_task = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                events_inner.handle_pool_event(event).await;
            }
        });
        let pump_inner = Arc::clone(&inner);
        let pump_task = tokio::spawn(async move {
            while let Some(event) = progress_rx.recv().await {
                {
                    let mut jobs = pump_inner.write_jobs();
                    if let Some(entry) = jobs.get_mut(&event.job_id) {
                        entry.info.progress = event.record.clone();
                    }
                }
                let _ = pump_inner.fanout.send(event);
            }
        });
        {
            let mut tasks = lock_tasks(&inner.tasks);
            tasks.push(AbortOnDropHandle::new(events_task));
            tasks.push(AbortOnDropHandle::new(pump_task));
        }
        Self { inner }
    }

    /// Validate and enqueue. The job dispatches as soon as a worker and the
    /// resource monitor allow.
    pub fn submit(&self, job: Arc<dyn Job>) -> Result<JobId> {
        job.validate()?;
        let id = job.id();
        let mut jobs = self.inner.write_jobs();
        if jobs.contains_key(&id) {
            return Err(CoreError::validation(format!("job {id} already submitted")));
        }
        let cancel = CancellationToken::new();
        let info = JobInfo {
            id,
            kind: job.kind(),
            status: JobStatus::Queued,
            priority: job.priority(),
            description: job.description(),
            metadata: job.metadata(),
            progress: job.progress(),
            retry_count: 0,
            max_retries: self.inner.retry.max_retries,
            created_by: job.created_by(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        };
        let item = WorkItem {
            job: Arc::clone(&job),
            cancel: cancel.clone(),
            progress: ProgressSender::new(id, self.inner.progress_tx.clone()),
        };
        jobs.insert(
            id,
            JobEntry {
                job,
                info,
                run_cancel: Some(cancel),
                pause_requested: false,
                paused_at: None,
            },
        );

        let deferred = {
            let monitor = self
                .inner
                .monitor
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            monitor.as_ref().is_some_and(|m| !m.can_accept_job())
        };
        if deferred {
            // Admission-control backoff: hold the job in Queued and submit
            // once pressure clears.
            drop(jobs);
            let inner = Arc::clone(&self.inner);
            let task = tokio::spawn(async move {
                loop {
                    tokio::time::sleep(ADMISSION_BACKOFF).await;
                    let clear = {
                        let monitor = inner.monitor.lock().unwrap_or_else(PoisonError::into_inner);
                        monitor.as_ref().is_none_or(|m| m.can_accept_job())
                    };
                    if clear {
                        if let Err(err) = inner.pool.submit(item) {
                            warn!(%id, "deferred submission failed: {err}");
                            // The entry may have moved on while it waited
                            // (cancelled, or cleaned up); only a job still
                            // Queued failed to launch.
                            let record = {
                                let mut jobs = inner.write_jobs();
                                match jobs.get_mut(&id) {
                                    Some(entry) if entry.info.status == JobStatus::Queued => {
                                        entry.info.status = JobStatus::Failed;
                                        entry.info.completed_at = Some(Utc::now());
                                        entry.info.error = Some(err.to_string());
                                        entry.run_cancel = None;
                                        Some(entry.record())
                                    }
                                    _ => None,
                                }
                            };
                            if let Some(record) = record {
                                inner.persist(record).await;
                            }
                        }
                        break;
                    }
                }
            });
            lock_tasks(&self.inner.tasks).push(AbortOnDropHandle::new(task));
            return Ok(id);
        }

        if let Err(err) = self.inner.pool.submit(item) {
            jobs.remove(&id);
            return Err(err);
        }
        Ok(id)
    }

    /// `Running -> Paused`, by cancelling the run. Only for pausable jobs.
    pub async fn pause(&self, id: JobId) -> Result<()> {
        let (token, record) = {
            let mut jobs = self.inner.write_jobs();
            let entry = jobs.get_mut(&id).ok_or(CoreError::JobNotFound(id))?;
            if entry.info.status != JobStatus::Running {
                return Err(CoreError::InvalidTransition {
                    id,
                    from: entry.info.status,
                    action: "pause",
                });
            }
            if !entry.job.can_pause() {
                return Err(CoreError::Unsupported("pause"));
            }
            entry.pause_requested = true;
            entry.info.status = JobStatus::Paused;
            entry.paused_at = Some(Utc::now());
            (entry.run_cancel.clone(), entry.record())
        };
        if let Some(token) = token {
            token.cancel();
        }
        self.inner.persist(record).await;
        info!(%id, "job paused");
        Ok(())
    }

    /// `Paused -> Queued`, re-submitting the same job value.
    pub async fn resume(&self, id: JobId) -> Result<()> {
        let record = {
            let mut jobs = self.inner.write_jobs();
            let entry = jobs.get_mut(&id).ok_or(CoreError::JobNotFound(id))?;
            if entry.info.status != JobStatus::Paused {
                return Err(CoreError::InvalidTransition {
                    id,
                    from: entry.info.status,
                    action: "resume",
                });
            }
            let cancel = CancellationToken::new();
            let item = WorkItem {
                job: Arc::clone(&entry.job),
                cancel: cancel.clone(),
                progress: ProgressSender::new(id, self.inner.progress_tx.clone()),
            };
            self.inner.pool.submit(item)?;
            entry.info.status = JobStatus::Queued;
            entry.pause_requested = false;
            entry.paused_at = None;
            entry.run_cancel = Some(cancel);
            entry.record()
        };
        self.inner.persist(record).await;
        info!(%id, "job resumed");
        Ok(())
    }

    /// Any non-terminal state -> `Cancelled`.
    pub async fn cancel(&self, id: JobId) -> Result<()> {
        let (token, record) = {
            let mut jobs = self.inner.write_jobs();
            let entry = jobs.get_mut(&id).ok_or(CoreError::JobNotFound(id))?;
            if entry.info.status.is_terminal() {
                return Err(CoreError::InvalidTransition {
                    id,
                    from: entry.info.status,
                    action: "cancel",
                });
            }
            entry.info.status = JobStatus::Cancelled;
            entry.info.completed_at = Some(Utc::now());
            entry.pause_requested = false;
            (entry.run_cancel.take(), entry.record())
        };
        if let Some(token) = token {
            token.cancel();
        }
        self.inner.persist(record).await;
        info!(%id, "job cancelled");
        Ok(())
    }

    /// Manual retry: `Failed | Cancelled -> Queued`, keeping the attempt
    /// counter, bounded by `max_retries`.
    pub async fn retry(&self, id: JobId) -> Result<()> {
        let record = {
            let mut jobs = self.inner.write_jobs();
            let entry = jobs.get_mut(&id).ok_or(CoreError::JobNotFound(id))?;
            if !matches!(
                entry.info.status,
                JobStatus::Failed | JobStatus::Cancelled
            ) {
                return Err(CoreError::InvalidTransition {
                    id,
                    from: entry.info.status,
                    action: "retry",
                });
            }
            if entry.info.retry_count >= entry.info.max_retries {
                return Err(CoreError::validation(format!(
                    "job {id} exhausted its {} retries",
                    entry.info.max_retries
                )));
            }
            let cancel = CancellationToken::new();
            let item = WorkItem {
                job: Arc::clone(&entry.job),
                cancel: cancel.clone(),
                progress: ProgressSender::new(id, self.inner.progress_tx.clone()),
            };
            self.inner.pool.submit(item)?;
            entry.info.status = JobStatus::Queued;
            entry.info.error = None;
            entry.info.completed_at = None;
            entry.run_cancel = Some(cancel);
            entry.record()
        };
        self.inner.persist(record).await;
        Ok(())
    }

    pub fn get(&self, id: JobId) -> Result<JobInfo> {
        self.inner
            .read_jobs()
            .get(&id)
            .map(|entry| entry.info.clone())
            .ok_or(CoreError::JobNotFound(id))
    }

    /// Snapshot of jobs, newest first, optionally filtered by status.
    pub fn list(&self, status: Option<JobStatus>) -> Vec<JobInfo> {
        let mut jobs: Vec<JobInfo> = self
            .inner
            .read_jobs()
            .values()
            .filter(|entry| status.is_none_or(|wanted| entry.info.status == wanted))
            .map(|entry| entry.info.clone())
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    /// Drop terminal jobs older than `older_than` (default: the configured
    /// retention). Returns how many were removed.
    pub async fn cleanup(&self, older_than: Option<Duration>) -> usize {
        let retention = older_than.unwrap_or(self.inner.retention);
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::zero());
        let removed = {
            let mut jobs = self.inner.write_jobs();
            let before = jobs.len();
            jobs.retain(|_, entry| {
                !(entry.info.status.is_terminal()
                    && entry
                        .info
                        .completed_at
                        .is_some_and(|completed| completed < cutoff))
            });
            before - jobs.len()
        };
        if removed > 0 {
            self.inner.persist_all().await;
            info!(removed, "cleaned up terminal jobs");
        }
        removed
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.inner.fanout.subscribe()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    /// Handle for attaching an auto-scaler or resizing manually.
    pub fn worker_pool(&self) -> WorkerPool {
        self.inner.pool.clone()
    }

    pub fn set_resource_monitor(&self, monitor: ResourceMonitor) {
        *self
            .inner
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(monitor));
    }

    /// Stop taking on new work: pause every running job that can pause, and
    /// persist the job table. Queued jobs stay queued (and persisted) so a
    /// later process re-queues them.
    pub async fn quiesce(&self) {
        let running: Vec<JobId> = self
            .inner
            .read_jobs()
            .values()
            .filter(|entry| {
                entry.info.status == JobStatus::Running && entry.job.can_pause()
            })
            .map(|entry| entry.info.id)
            .collect();
        for id in running {
            if let Err(err) = self.pause(id).await {
                warn!(%id, "pause during shutdown failed: {err}");
            }
        }
        self.inner.persist_all().await;
    }

    /// Quiesce, drain the pool within the graceful window, persist.
    pub async fn stop(&self) -> Result<()> {
        self.quiesce().await;
        let result = self.inner.pool.stop(self.inner.graceful_stop).await;
        self.inner.persist_all().await;
        result
    }

    /// Re-queue persisted jobs that did not reach a terminal state. A
    /// `Running` record means the previous process died mid-run; it is
    /// treated exactly like `Paused`.
    pub async fn resubmit_recovered(&self, reviver: &dyn JobReviver) -> Result<usize> {
        let Some(state) = self.inner.state.as_ref() else {
            return Ok(0);
        };
        let app: Option<ApplicationState> = state.load(APPLICATION_COMPONENT).await?;
        let mut resubmitted = 0;
        for record in app.map(|app| app.jobs).unwrap_or_default() {
            if !matches!(
                record.status,
                JobStatus::Paused | JobStatus::Running | JobStatus::Queued
            ) {
                continue;
            }
            match reviver.revive(&record) {
                Some(job) => {
                    let id = record.id;
                    match self.submit(job) {
                        Ok(_) => {
                            resubmitted += 1;
                            info!(%id, status = %record.status, "re-queued persisted job");
                        }
                        Err(err) => warn!(%id, "failed to re-queue persisted job: {err}"),
                    }
                }
                None => warn!(id = %record.id, "no reviver for persisted job, dropping"),
            }
        }
        Ok(resubmitted)
    }
}
