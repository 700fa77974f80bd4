use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio_util::task::AbortOnDropHandle;
use tracing::warn;

use crate::pool::WorkerPool;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceMonitorConfig {
    pub cadence: Duration,
    /// Zero disables the memory check.
    pub max_rss_bytes: u64,
    /// Zero disables the backlog check.
    pub max_queued_jobs: usize,
}

impl Default for ResourceMonitorConfig {
    fn default() -> Self {
        Self {
            cadence: Duration::from_secs(5),
            max_rss_bytes: 0,
            max_queued_jobs: 0,
        }
    }
}

/// Periodic memory/backlog sampler consulted before admitting new jobs.
pub struct ResourceMonitor {
    accept: Arc<AtomicBool>,
    _task: AbortOnDropHandle<()>,
}

impl ResourceMonitor {
    pub fn spawn(pool: WorkerPool, config: ResourceMonitorConfig) -> Self {
        let accept = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&accept);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.cadence);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let mut ok = true;
                if config.max_queued_jobs > 0 && pool.stats().queue_size > config.max_queued_jobs {
                    ok = false;
                }
                if ok
                    && config.max_rss_bytes > 0
                    && let Some(rss) = resident_set_bytes()
                    && rss > config.max_rss_bytes
                {
                    ok = false;
                }
                if !ok && flag.load(Ordering::Acquire) {
                    warn!("resource pressure: pausing job admission");
                }
                flag.store(ok, Ordering::Release);
            }
        });
        Self {
            accept,
            _task: AbortOnDropHandle::new(task),
        }
    }

    pub fn can_accept_job(&self) -> bool {
        self.accept.load(Ordering::Acquire)
    }
}

#[cfg(target_os = "linux")]
fn resident_set_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * 4096)
}

#[cfg(not(target_os = "linux"))]
fn resident_set_bytes() -> Option<u64> {
    None
}
