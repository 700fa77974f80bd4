use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use pubdatahub_core::Config;
use pubdatahub_core::DataSource;
use pubdatahub_core::JobManager;
use pubdatahub_core::JobManagerConfig;
use pubdatahub_core::SourceRegistry;
use pubdatahub_core::StateStore;
use pubdatahub_core::WorkerPoolConfig;
use pubdatahub_core::hn::HackerNewsSource;
use pubdatahub_protocol::JobStateRecord;
use pubdatahub_protocol::SessionState;

/// Everything a command needs, constructed explicitly from the loaded
/// config and passed down; no globals.
pub struct AppHandles {
    pub config: Config,
    pub registry: SourceRegistry,
    /// Concrete handles kept for teardown (`close`) after the registry has
    /// type-erased them.
    pub hackernews: Arc<HackerNewsSource>,
    pub state: Arc<StateStore>,
    pub manager: JobManager,
}

pub async fn build(config: Config) -> anyhow::Result<AppHandles> {
    let state = Arc::new(
        StateStore::init(&config.state_root, config.max_backups)
            .await
            .context("open state store")?,
    );
    let hackernews = Arc::new(HackerNewsSource::new(&config.download)?);
    let mut registry = SourceRegistry::new();
    registry.register(Arc::clone(&hackernews) as Arc<dyn DataSource>);
    let manager = JobManager::start(manager_config(&config), Some(Arc::clone(&state)));
    Ok(AppHandles {
        config,
        registry,
        hackernews,
        state,
        manager,
    })
}

pub fn manager_config(config: &Config) -> JobManagerConfig {
    JobManagerConfig {
        pool: WorkerPoolConfig {
            min_size: config.pool.min_workers,
            max_size: config.pool.max_workers,
            initial_size: config.pool.initial_workers,
            queue_capacity: config.pool.queue_capacity,
        },
        retry: config.retry.clone(),
        retention: Duration::from_secs(config.job_retention_hours * 3600),
        graceful_stop: Duration::from_secs(30),
    }
}

pub fn api_base(config: &Config) -> String {
    format!("http://127.0.0.1:{}", config.server.port)
}

/// Revives persisted download jobs against the registry. Export and
/// scheduled records carry no rebuildable work and are dropped.
pub struct RegistryReviver {
    pub registry: SourceRegistry,
}

impl pubdatahub_core::JobReviver for RegistryReviver {
    fn revive(
        &self,
        record: &JobStateRecord,
    ) -> Option<Arc<dyn pubdatahub_core::jobs::Job>> {
        match record.kind {
            pubdatahub_protocol::JobKind::Download => {
                let source = self.registry.get(record.source.as_deref()?).ok()?;
                Some(Arc::new(pubdatahub_core::jobs::DownloadJob::with_id(
                    record.id, source, 0,
                )))
            }
            _ => None,
        }
    }
}

/// Append this invocation to the persisted session history.
pub async fn record_invocation(state: &StateStore, line: String) {
    let mut session: SessionState = match state.load("session").await {
        Ok(Some(session)) => session,
        _ => SessionState::default(),
    };
    session.command_history.push(line);
    if let Ok(dir) = std::env::current_dir() {
        session.working_dir = Some(dir.display().to_string());
    }
    if let Err(err) = state.save("session", &session).await {
        tracing::debug!("failed to record session history: {err}");
    }
}
