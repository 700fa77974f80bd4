//! Job control plane and ingestion runtime.
//!
//! The pieces, leaves first: a token-bucket [`RateLimiter`] gating the typed
//! Hacker News client, the [`DataSource`] contract with its batched resumable
//! downloader, the [`Job`] model executed by an adaptive [`WorkerPool`], and
//! the [`JobManager`] that owns submission, state transitions, retry and
//! durability. [`StateStore`] persists component snapshots as atomic JSON;
//! [`ShutdownManager`] and [`RecoveryManager`] tie interruption and restart
//! together so progress is never lost.

mod config;
mod error;
pub mod hn;
pub mod jobs;
mod manager;
mod pool;
mod ratelimit;
pub mod recovery;
mod schedule;
pub mod shutdown;
mod source;
mod statefile;

pub use config::Config;
pub use config::DownloadConfig;
pub use config::PoolConfig;
pub use config::RetryConfig;
pub use config::ServerConfig;
pub use error::CoreError;
pub use error::Result;
pub use jobs::Job;
pub use jobs::JobReviver;
pub use jobs::ProgressEvent;
pub use jobs::ProgressSender;
pub use manager::APPLICATION_COMPONENT;
pub use manager::JobManager;
pub use manager::JobManagerConfig;
pub use pool::PoolEvent;
pub use pool::PoolStats;
pub use pool::WorkItem;
pub use pool::WorkerPool;
pub use pool::WorkerPoolConfig;
pub use pool::monitor::ResourceMonitor;
pub use pool::monitor::ResourceMonitorConfig;
pub use pool::scaler::AutoScaler;
pub use pool::scaler::AutoScalerConfig;
pub use ratelimit::RateLimiter;
pub use recovery::RecoveryHandler;
pub use recovery::RecoveryKind;
pub use recovery::RecoveryManager;
pub use recovery::RecoveryReport;
pub use schedule::CronExpr;
pub use schedule::JobScheduler;
pub use schedule::ScheduleEntry;
pub use shutdown::ShutdownHook;
pub use shutdown::ShutdownManager;
pub use shutdown::ShutdownReport;
pub use source::DataSource;
pub use source::SourceRegistry;
pub use statefile::StateStore;
