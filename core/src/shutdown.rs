use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::CoreError;
use crate::Result;

pub const DEFAULT_GRACEFUL_TIMEOUT: Duration = Duration::from_secs(30);

/// Canonical hook priorities: stop accepting work, save state, drain
/// workers, save config, close storage.
pub mod priorities {
    pub const JOB_MANAGER: i32 = 10;
    pub const STATE: i32 = 20;
    pub const WORKER_POOL: i32 = 30;
    pub const CONFIG: i32 = 40;
    pub const DATABASE: i32 = 50;
}

/// A named step in the ordered shutdown sequence.
#[async_trait]
pub trait ShutdownHook: Send + Sync {
    fn name(&self) -> &str;

    /// Lower runs earlier.
    fn priority(&self) -> i32;

    fn timeout(&self) -> Duration {
        Duration::from_secs(10)
    }

    async fn on_shutdown(&self, reason: &str) -> Result<()>;

    /// Checkpoint capability: snapshot state without stopping anything.
    /// Only consulted when `supports_checkpoint` is true.
    async fn on_checkpoint(&self) -> Result<()> {
        Ok(())
    }

    fn supports_checkpoint(&self) -> bool {
        false
    }
}

#[derive(Debug)]
pub struct HookOutcome {
    pub name: String,
    pub result: Result<()>,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub struct ShutdownReport {
    pub reason: String,
    pub outcomes: Vec<HookOutcome>,
    /// True when the outer graceful window expired before every hook ran.
    pub forced: bool,
}

/// Runs registered hooks in ascending priority; a hook timing out or
/// failing is recorded and the sequence continues.
pub struct ShutdownManager {
    hooks: StdMutex<Vec<Arc<dyn ShutdownHook>>>,
    graceful_timeout: Duration,
    initiated: AtomicBool,
}

impl ShutdownManager {
    pub fn new(graceful_timeout: Duration) -> Self {
        Self {
            hooks: StdMutex::new(Vec::new()),
            graceful_timeout,
            initiated: AtomicBool::new(false),
        }
    }

    pub fn register(&self, hook: Arc<dyn ShutdownHook>) {
        let mut hooks = self.hooks.lock().unwrap_or_else(PoisonError::into_inner);
        hooks.push(hook);
        hooks.sort_by_key(|hook| hook.priority());
    }

    fn hooks(&self) -> Vec<Arc<dyn ShutdownHook>> {
        self.hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Execute the shutdown sequence once; later calls return an empty
    /// report.
    pub async fn initiate(&self, reason: &str) -> ShutdownReport {
        if self.initiated.swap(true, Ordering::SeqCst) {
            return ShutdownReport {
                reason: reason.to_string(),
                outcomes: Vec::new(),
                forced: false,
            };
        }
        info!(reason, "shutdown initiated");
        let deadline = Instant::now() + self.graceful_timeout;
        let mut outcomes = Vec::new();
        let mut forced = false;
        for hook in self.hooks() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                forced = true;
                warn!(hook = hook.name(), "graceful window exhausted, skipping hook");
                outcomes.push(HookOutcome {
                    name: hook.name().to_string(),
                    result: Err(CoreError::Timeout {
                        name: hook.name().to_string(),
                        timeout: self.graceful_timeout,
                    }),
                    elapsed: Duration::ZERO,
                });
                continue;
            }
            let budget = hook.timeout().min(remaining);
            let started = Instant::now();
            let result = match tokio::time::timeout(budget, hook.on_shutdown(reason)).await {
                Ok(result) => result,
                Err(_) => Err(CoreError::Timeout {
                    name: hook.name().to_string(),
                    timeout: budget,
                }),
            };
            if let Err(err) = &result {
                error!(hook = hook.name(), "shutdown hook failed: {err}");
            }
            outcomes.push(HookOutcome {
                name: hook.name().to_string(),
                result,
                elapsed: started.elapsed(),
            });
        }
        ShutdownReport {
            reason: reason.to_string(),
            outcomes,
            forced,
        }
    }

    /// Run the checkpoint capability of every hook that has one, in
    /// priority order. Nothing stops.
    pub async fn checkpoint(&self) -> Vec<HookOutcome> {
        let mut outcomes = Vec::new();
        for hook in self.hooks() {
            if !hook.supports_checkpoint() {
                continue;
            }
            let started = Instant::now();
            let result = match tokio::time::timeout(hook.timeout(), hook.on_checkpoint()).await {
                Ok(result) => result,
                Err(_) => Err(CoreError::Timeout {
                    name: hook.name().to_string(),
                    timeout: hook.timeout(),
                }),
            };
            if let Err(err) = &result {
                warn!(hook = hook.name(), "checkpoint failed: {err}");
            }
            outcomes.push(HookOutcome {
                name: hook.name().to_string(),
                result,
                elapsed: started.elapsed(),
            });
        }
        outcomes
    }

    /// Translate OS signals: interrupt and terminate cancel `shutdown`
    /// (a second interrupt force-exits); SIGUSR1 checkpoints in place.
    pub fn spawn_signal_listener(
        self: &Arc<Self>,
        shutdown: CancellationToken,
    ) -> AbortOnDropHandle<()> {
        let manager = Arc::clone(self);
        AbortOnDropHandle::new(tokio::spawn(async move {
            manager.listen_for_signals(shutdown).await;
        }))
    }

    #[cfg(unix)]
    async fn listen_for_signals(self: Arc<Self>, shutdown: CancellationToken) {
        use tokio::signal::unix::SignalKind;
        use tokio::signal::unix::signal;

        let mut interrupt = match signal(SignalKind::interrupt()) {
            Ok(stream) => stream,
            Err(err) => {
                error!("cannot install SIGINT handler: {err}");
                return;
            }
        };
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                error!("cannot install SIGTERM handler: {err}");
                return;
            }
        };
        let mut checkpoint = match signal(SignalKind::user_defined1()) {
            Ok(stream) => stream,
            Err(err) => {
                error!("cannot install SIGUSR1 handler: {err}");
                return;
            }
        };

        let mut interrupted = false;
        loop {
            tokio::select! {
                _ = interrupt.recv() => {
                    if interrupted {
                        error!("second interrupt, forcing exit");
                        std::process::exit(130);
                    }
                    interrupted = true;
                    info!("interrupt received, shutting down (interrupt again to force)");
                    shutdown.cancel();
                }
                _ = terminate.recv() => {
                    info!("termination requested, shutting down");
                    shutdown.cancel();
                }
                _ = checkpoint.recv() => {
                    info!("checkpoint signal received");
                    self.checkpoint().await;
                }
            }
        }
    }

    #[cfg(not(unix))]
    async fn listen_for_signals(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interrupted = false;
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            if interrupted {
                std::process::exit(130);
            }
            interrupted = true;
            shutdown.cancel();
        }
    }
}
