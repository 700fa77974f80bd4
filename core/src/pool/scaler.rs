use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::task::AbortOnDropHandle;
use tracing::debug;

use crate::pool::PoolStats;
use crate::pool::WorkerPool;

#[derive(Debug, Clone, PartialEq)]
pub struct AutoScalerConfig {
    pub cadence: Duration,
    /// Minimum quiet time between two scaling actions.
    pub cooldown: Duration,
    pub up_threshold: f64,
    pub down_threshold: f64,
    /// Samples in the rolling utilization average.
    pub window: usize,
}

impl Default for AutoScalerConfig {
    fn default() -> Self {
        Self {
            cadence: Duration::from_secs(10),
            cooldown: Duration::from_secs(30),
            up_threshold: 0.8,
            down_threshold: 0.3,
            window: 3,
        }
    }
}

/// Periodically nudges the pool size toward observed demand.
///
/// Dropping the scaler stops it; the pool itself is untouched.
pub struct AutoScaler {
    _task: AbortOnDropHandle<()>,
}

impl AutoScaler {
    pub fn spawn(pool: WorkerPool, config: AutoScalerConfig) -> Self {
        let task = tokio::spawn(run(pool, config));
        Self {
            _task: AbortOnDropHandle::new(task),
        }
    }
}

/// Busy-worker share plus a queue-pressure term capped at 0.5.
pub(crate) fn utilization(stats: PoolStats) -> f64 {
    if stats.total_workers == 0 {
        return if stats.queue_size > 0 { 1.0 } else { 0.0 };
    }
    let total = stats.total_workers as f64;
    let busy = stats.active_workers as f64 / total;
    let backlog = (stats.queue_size as f64 / (2.0 * total)).min(0.5);
    busy + backlog
}

/// A quarter of the current size, at least one worker.
pub(crate) fn step(total: usize) -> usize {
    (total / 4).max(1)
}

async fn run(pool: WorkerPool, config: AutoScalerConfig) {
    let window = config.window.max(1);
    let mut samples: VecDeque<f64> = VecDeque::with_capacity(window);
    let mut last_action = Instant::now() - config.cooldown;
    let mut ticker = tokio::time::interval(config.cadence);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let stats = pool.stats();
        samples.push_back(utilization(stats));
        if samples.len() > window {
            samples.pop_front();
        }
        let average = samples.iter().sum::<f64>() / samples.len() as f64;
        if last_action.elapsed() < config.cooldown {
            continue;
        }

        let total = stats.total_workers;
        if average > config.up_threshold {
            pool.set_size(total + step(total));
            debug!(average, total, "scaling up");
            last_action = Instant::now();
            samples.clear();
        } else if average < config.down_threshold && total > 0 {
            pool.set_size(total.saturating_sub(step(total)));
            debug!(average, total, "scaling down");
            last_action = Instant::now();
            samples.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn stats(total: usize, active: usize, queue: usize) -> PoolStats {
        PoolStats {
            total_workers: total,
            active_workers: active,
            queue_size: queue,
        }
    }

    #[test]
    fn utilization_combines_busy_share_and_backlog() {
        assert_eq!(utilization(stats(4, 4, 0)), 1.0);
        assert_eq!(utilization(stats(4, 2, 0)), 0.5);
        // Backlog term: 4 queued over 2*4 workers = 0.5, capped there.
        assert_eq!(utilization(stats(4, 0, 4)), 0.5);
        assert_eq!(utilization(stats(4, 4, 100)), 1.5);
    }

    #[test]
    fn empty_pool_reads_as_saturated_only_with_backlog() {
        assert_eq!(utilization(stats(0, 0, 0)), 0.0);
        assert_eq!(utilization(stats(0, 0, 1)), 1.0);
    }

    #[test]
    fn step_is_a_quarter_but_at_least_one() {
        assert_eq!(step(1), 1);
        assert_eq!(step(3), 1);
        assert_eq!(step(8), 2);
        assert_eq!(step(100), 25);
    }
}
