//! Bounded, adaptive worker pool over a strict priority queue.

pub mod monitor;
pub mod scaler;

use std::collections::BinaryHeap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use pubdatahub_protocol::JobId;
use tokio::sync::Notify;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::CoreError;
use crate::Result;
use crate::jobs::Job;
use crate::jobs::ProgressSender;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    pub min_size: usize,
    pub max_size: usize,
    pub initial_size: usize,
    /// Zero disables backpressure: submissions never fail on queue depth.
    pub queue_capacity: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 8,
            initial_size: 2,
            queue_capacity: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub total_workers: usize,
    pub active_workers: usize,
    pub queue_size: usize,
}

/// A submitted job plus the run-scoped handles the worker needs.
pub struct WorkItem {
    pub job: Arc<dyn Job>,
    pub cancel: CancellationToken,
    pub progress: ProgressSender,
}

/// Lifecycle notifications the pool emits toward its owner.
#[derive(Debug)]
pub enum PoolEvent {
    Started { job_id: JobId },
    Finished { job_id: JobId, result: Result<()> },
    /// A queued item whose cancel token fired before a worker picked it up.
    Skipped { job_id: JobId },
}

struct QueuedItem {
    priority: i32,
    seq: u64,
    item: WorkItem,
}

impl PartialEq for QueuedItem {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedItem {}

impl PartialOrd for QueuedItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedItem {
    /// Max-heap order: higher priority first, FIFO among equals.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct PoolShared {
    config: WorkerPoolConfig,
    queue: StdMutex<BinaryHeap<QueuedItem>>,
    notify: Notify,
    target: AtomicUsize,
    alive: AtomicUsize,
    active: AtomicUsize,
    stopped: AtomicBool,
    stop_token: CancellationToken,
    events: mpsc::UnboundedSender<PoolEvent>,
    seq: AtomicU64,
    running: StdMutex<HashMap<JobId, CancellationToken>>,
    resize_gate: StdMutex<()>,
}

impl PoolShared {
    /// One surplus worker claims its own retirement; the claim and the
    /// `alive` decrement are a single compare-exchange so two workers cannot
    /// retire for the same size step.
    fn try_claim_retirement(&self) -> bool {
        loop {
            let alive = self.alive.load(Ordering::Acquire);
            let target = self.target.load(Ordering::Acquire);
            if alive <= target {
                return false;
            }
            if self
                .alive
                .compare_exchange(alive, alive - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cheap-to-clone handle; all clones drive the same workers and queue.
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig, events: mpsc::UnboundedSender<PoolEvent>) -> Self {
        let initial = config
            .initial_size
            .clamp(config.min_size, config.max_size.max(config.min_size));
        let shared = Arc::new(PoolShared {
            config,
            queue: StdMutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            target: AtomicUsize::new(initial),
            alive: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
            stop_token: CancellationToken::new(),
            events,
            seq: AtomicU64::new(0),
            running: StdMutex::new(HashMap::new()),
            resize_gate: StdMutex::new(()),
        });
        let pool = Self { shared };
        pool.spawn_up_to(initial);
        pool
    }

    /// Enqueue at the job's current priority.
    pub fn submit(&self, item: WorkItem) -> Result<()> {
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(CoreError::PoolStopped);
        }
        {
            let mut queue = lock(&self.shared.queue);
            let capacity = self.shared.config.queue_capacity;
            if capacity != 0 && queue.len() >= capacity {
                return Err(CoreError::Backpressure);
            }
            let seq = self.shared.seq.fetch_add(1, Ordering::Relaxed);
            queue.push(QueuedItem {
                priority: item.job.priority(),
                seq,
                item,
            });
        }
        self.shared.notify.notify_one();
        Ok(())
    }

    /// Resize within `[min_size, max_size]` without dropping in-flight work:
    /// growth spawns workers, shrink lets surplus workers finish their
    /// current job and exit.
    pub fn set_size(&self, size: usize) {
        let size = size.clamp(self.shared.config.min_size, self.shared.config.max_size);
        self.shared.target.store(size, Ordering::Release);
        self.spawn_up_to(size);
        // Wake idle workers so surplus ones notice and retire.
        self.shared.notify.notify_waiters();
        debug!(size, "worker pool resized");
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            total_workers: self.shared.alive.load(Ordering::Acquire),
            active_workers: self.shared.active.load(Ordering::Acquire),
            queue_size: lock(&self.shared.queue).len(),
        }
    }

    /// Stop accepting work, drain the queue, and wait up to `grace` for
    /// in-flight jobs. Jobs still running afterwards are force-cancelled and
    /// the call reports [`CoreError::PartialStop`].
    pub async fn stop(&self, grace: Duration) -> Result<()> {
        self.shared.stopped.store(true, Ordering::Release);
        let drained: Vec<QueuedItem> = {
            let mut queue = lock(&self.shared.queue);
            std::mem::take(&mut *queue).into_vec()
        };
        for queued in drained {
            let _ = self.shared.events.send(PoolEvent::Skipped {
                job_id: queued.item.job.id(),
            });
        }
        self.shared.stop_token.cancel();
        self.shared.notify.notify_waiters();

        let deadline = Instant::now() + grace;
        while self.shared.active.load(Ordering::Acquire) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let stragglers: Vec<(JobId, CancellationToken)> =
            lock(&self.shared.running).iter().map(|(id, token)| (*id, token.clone())).collect();
        if stragglers.is_empty() {
            return Ok(());
        }
        let forced = stragglers.len();
        warn!(forced, "force-cancelling jobs that outlived the graceful window");
        for (_, token) in stragglers {
            token.cancel();
        }
        let unwind_deadline = Instant::now() + Duration::from_secs(1);
        while self.shared.active.load(Ordering::Acquire) > 0 && Instant::now() < unwind_deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Err(CoreError::PartialStop { forced })
    }

    fn spawn_up_to(&self, target: usize) {
        let _gate = lock(&self.shared.resize_gate);
        while self.shared.alive.load(Ordering::Acquire) < target {
            if self.shared.stop_token.is_cancelled() {
                return;
            }
            self.shared.alive.fetch_add(1, Ordering::AcqRel);
            let shared = Arc::clone(&self.shared);
            tokio::spawn(worker_loop(shared));
        }
    }
}

async fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        if shared.try_claim_retirement() {
            debug!("worker retiring after resize");
            return;
        }
        let next = lock(&shared.queue).pop();
        let Some(queued) = next else {
            if shared.stop_token.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = shared.notify.notified() => {}
                _ = shared.stop_token.cancelled() => {}
            }
            continue;
        };

        let item = queued.item;
        let job_id = item.job.id();
        if item.cancel.is_cancelled() {
            let _ = shared.events.send(PoolEvent::Skipped { job_id });
            continue;
        }

        shared.active.fetch_add(1, Ordering::AcqRel);
        lock(&shared.running).insert(job_id, item.cancel.clone());
        let _ = shared.events.send(PoolEvent::Started { job_id });

        let result = item.job.execute(item.cancel.clone(), item.progress.clone()).await;

        lock(&shared.running).remove(&job_id);
        shared.active.fetch_sub(1, Ordering::AcqRel);
        let _ = shared.events.send(PoolEvent::Finished { job_id, result });
    }
    shared.alive.fetch_sub(1, Ordering::AcqRel);
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use pubdatahub_protocol::JobKind;
    use pubdatahub_protocol::ProgressRecord;
    use std::sync::atomic::AtomicI32;

    struct TestJob {
        id: JobId,
        priority: AtomicI32,
        gate: Option<Arc<Notify>>,
    }

    impl TestJob {
        fn instant(priority: i32) -> Arc<Self> {
            Arc::new(Self {
                id: JobId::new(),
                priority: AtomicI32::new(priority),
                gate: None,
            })
        }

        fn gated(priority: i32, gate: Arc<Notify>) -> Arc<Self> {
            Arc::new(Self {
                id: JobId::new(),
                priority: AtomicI32::new(priority),
                gate: Some(gate),
            })
        }
    }

    #[async_trait]
    impl Job for TestJob {
        fn id(&self) -> JobId {
            self.id
        }
        fn kind(&self) -> JobKind {
            JobKind::Export
        }
        fn priority(&self) -> i32 {
            self.priority.load(Ordering::Relaxed)
        }
        fn set_priority(&self, priority: i32) {
            self.priority.store(priority, Ordering::Relaxed);
        }
        fn description(&self) -> String {
            "test job".to_string()
        }
        fn progress(&self) -> ProgressRecord {
            ProgressRecord::default()
        }
        async fn execute(&self, cancel: CancellationToken, _progress: ProgressSender) -> Result<()> {
            if let Some(gate) = &self.gate {
                tokio::select! {
                    _ = gate.notified() => {}
                    _ = cancel.cancelled() => return Err(CoreError::Canceled),
                }
            }
            Ok(())
        }
    }

    fn item(job: Arc<TestJob>) -> WorkItem {
        let (progress, _rx) = ProgressSender::channel(job.id());
        WorkItem {
            cancel: CancellationToken::new(),
            progress,
            job,
        }
    }

    async fn next_started(rx: &mut mpsc::UnboundedReceiver<PoolEvent>) -> JobId {
        loop {
            match rx.recv().await.expect("event stream open") {
                PoolEvent::Started { job_id } => return job_id,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn higher_priority_jobs_dispatch_first() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::new(
            WorkerPoolConfig {
                min_size: 1,
                max_size: 1,
                initial_size: 1,
                queue_capacity: 0,
            },
            events_tx,
        );

        // Occupy the only worker so submissions pile up in the queue.
        let gate = Arc::new(Notify::new());
        let blocker = TestJob::gated(0, Arc::clone(&gate));
        pool.submit(item(Arc::clone(&blocker))).expect("submit blocker");

        let low: Vec<_> = (0..4).map(|_| TestJob::instant(1)).collect();
        for job in &low {
            pool.submit(item(Arc::clone(job))).expect("submit low");
        }
        let high = TestJob::instant(9);
        pool.submit(item(Arc::clone(&high))).expect("submit high");

        assert_eq!(next_started(&mut events_rx).await, blocker.id());
        gate.notify_one();

        // The late, high-priority job preempts the queued low-priority ones.
        assert_eq!(next_started(&mut events_rx).await, high.id());
        let mut rest = Vec::new();
        for _ in 0..4 {
            rest.push(next_started(&mut events_rx).await);
        }
        let expected: Vec<JobId> = low.iter().map(|job| job.id()).collect();
        assert_eq!(rest, expected, "equal priorities dispatch in FIFO order");
        let _ = pool.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn zero_workers_queue_until_resized() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::new(
            WorkerPoolConfig {
                min_size: 0,
                max_size: 4,
                initial_size: 0,
                queue_capacity: 0,
            },
            events_tx,
        );
        let job = TestJob::instant(0);
        pool.submit(item(Arc::clone(&job))).expect("submit");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events_rx.try_recv().is_err(), "no worker, no dispatch");
        assert_eq!(pool.stats().queue_size, 1);

        pool.set_size(1);
        assert_eq!(next_started(&mut events_rx).await, job.id());
        let _ = pool.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn backpressure_applies_when_queue_is_bounded() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::new(
            WorkerPoolConfig {
                min_size: 0,
                max_size: 1,
                initial_size: 0,
                queue_capacity: 2,
            },
            events_tx,
        );
        pool.submit(item(TestJob::instant(0))).expect("first");
        pool.submit(item(TestJob::instant(0))).expect("second");
        let err = pool.submit(item(TestJob::instant(0))).err().expect("third");
        assert!(matches!(err, CoreError::Backpressure));
    }

    #[tokio::test]
    async fn submit_after_stop_is_rejected() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::new(WorkerPoolConfig::default(), events_tx);
        pool.stop(Duration::from_millis(100)).await.expect("clean stop");
        let err = pool.submit(item(TestJob::instant(0))).err().expect("rejected");
        assert!(matches!(err, CoreError::PoolStopped));
    }

    #[tokio::test]
    async fn stop_force_cancels_stragglers() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::new(
            WorkerPoolConfig {
                min_size: 1,
                max_size: 1,
                initial_size: 1,
                queue_capacity: 0,
            },
            events_tx,
        );
        // Never-notified gate: the job only ends via cancellation.
        let gate = Arc::new(Notify::new());
        let job = TestJob::gated(0, gate);
        pool.submit(item(Arc::clone(&job))).expect("submit");
        next_started(&mut events_rx).await;

        let err = pool.stop(Duration::from_millis(50)).await.err().expect("partial");
        assert!(matches!(err, CoreError::PartialStop { forced: 1 }));
    }

    #[tokio::test(start_paused = true)]
    async fn autoscaler_follows_demand_both_ways() {
        use crate::pool::scaler::AutoScaler;
        use crate::pool::scaler::AutoScalerConfig;

        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::new(
            WorkerPoolConfig {
                min_size: 1,
                max_size: 8,
                initial_size: 1,
                queue_capacity: 0,
            },
            events_tx,
        );
        let gate = Arc::new(Notify::new());
        for _ in 0..8 {
            pool.submit(item(TestJob::gated(0, Arc::clone(&gate))))
                .expect("submit");
        }
        let _scaler = AutoScaler::spawn(
            pool.clone(),
            AutoScalerConfig {
                cadence: Duration::from_secs(1),
                cooldown: Duration::from_secs(1),
                up_threshold: 0.8,
                down_threshold: 0.3,
                window: 1,
            },
        );

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(
            pool.stats().total_workers >= 4,
            "sustained saturation grows the pool, got {:?}",
            pool.stats()
        );

        // Release everything; with an idle pool the scaler steps back down.
        for _ in 0..64 {
            gate.notify_waiters();
            tokio::time::sleep(Duration::from_millis(100)).await;
            if pool.stats().active_workers == 0 && pool.stats().queue_size == 0 {
                break;
            }
        }
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(pool.stats().total_workers, 1, "idle pool shrinks to min");
        let _ = pool.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn shrink_lets_workers_finish_their_job() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::new(
            WorkerPoolConfig {
                min_size: 0,
                max_size: 4,
                initial_size: 2,
                queue_capacity: 0,
            },
            events_tx,
        );
        let gate = Arc::new(Notify::new());
        let job = TestJob::gated(0, Arc::clone(&gate));
        pool.submit(item(Arc::clone(&job))).expect("submit");
        next_started(&mut events_rx).await;

        pool.set_size(0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        // The busy worker survives until its job ends.
        assert_eq!(pool.stats().active_workers, 1);

        gate.notify_one();
        loop {
            if let PoolEvent::Finished { job_id, result } =
                events_rx.recv().await.expect("event")
            {
                assert_eq!(job_id, job.id());
                result.expect("job finished cleanly");
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.stats().total_workers, 0);
    }
}
