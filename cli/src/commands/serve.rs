use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use pubdatahub_core::AutoScaler;
use pubdatahub_core::AutoScalerConfig;
use pubdatahub_core::Config;
use pubdatahub_core::CoreError;
use pubdatahub_core::DataSource;
use pubdatahub_core::JobManager;
use pubdatahub_core::RecoveryHandler;
use pubdatahub_core::RecoveryKind;
use pubdatahub_core::RecoveryManager;
use pubdatahub_core::ResourceMonitor;
use pubdatahub_core::ResourceMonitorConfig;
use pubdatahub_core::ShutdownHook;
use pubdatahub_core::ShutdownManager;
use pubdatahub_core::SourceRegistry;
use pubdatahub_core::StateStore;
use pubdatahub_core::hn::HackerNewsSource;
use pubdatahub_core::shutdown;
use pubdatahub_protocol::ApplicationState;
use pubdatahub_server::AppContext;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use crate::context;
use crate::context::RegistryReviver;

/// Run recovery, the job manager and the HTTP API until interrupted.
pub async fn run(mut config: Config, port: Option<u16>) -> anyhow::Result<()> {
    if let Some(port) = port {
        config.server.port = port;
    }
    let handles = context::build(config).await?;
    context::record_invocation(&handles.state, "serve".to_string()).await;
    let config = handles.config.clone();

    // Storage first: revived download jobs need an initialized source.
    handles
        .hackernews
        .init_storage(&config.storage_root)
        .await?;

    let recovery = RecoveryManager::new(Arc::clone(&handles.state));
    recovery.register(Arc::new(JobsRecovery {
        manager: handles.manager.clone(),
        registry: handles.registry.clone(),
    }));
    let report = recovery.run().await?;
    info!(kind = ?report.kind, handlers = ?report.handlers, "recovery finished");

    // Mark the process live; the state hook flips the flag on clean exit.
    write_app_info(&handles.state, false).await;

    let shutdown_manager = Arc::new(ShutdownManager::new(shutdown::DEFAULT_GRACEFUL_TIMEOUT));
    shutdown_manager.register(Arc::new(ManagerHook {
        manager: handles.manager.clone(),
    }));
    shutdown_manager.register(Arc::new(StateHook {
        state: Arc::clone(&handles.state),
    }));
    shutdown_manager.register(Arc::new(PoolHook {
        manager: handles.manager.clone(),
    }));
    shutdown_manager.register(Arc::new(ConfigHook {
        state: Arc::clone(&handles.state),
        config: config.clone(),
    }));
    shutdown_manager.register(Arc::new(DatabaseHook {
        hackernews: Arc::clone(&handles.hackernews),
    }));

    let app_token = CancellationToken::new();
    let _signals = shutdown_manager.spawn_signal_listener(app_token.clone());

    let _scaler = config.pool.autoscale.then(|| {
        AutoScaler::spawn(
            handles.manager.worker_pool(),
            AutoScalerConfig {
                cadence: Duration::from_secs(config.pool.autoscale_cadence_secs),
                cooldown: Duration::from_secs(config.pool.autoscale_cooldown_secs),
                up_threshold: config.pool.scale_up_threshold,
                down_threshold: config.pool.scale_down_threshold,
                window: 3,
            },
        )
    });
    handles.manager.set_resource_monitor(ResourceMonitor::spawn(
        handles.manager.worker_pool(),
        ResourceMonitorConfig::default(),
    ));

    let context = Arc::new(AppContext {
        registry: handles.registry.clone(),
        manager: handles.manager.clone(),
        storage_root: config.storage_root.clone(),
    });
    let addr = SocketAddr::from(([127, 0, 0, 1], config.server.port));
    let server = tokio::spawn(pubdatahub_server::serve(addr, context, |bound| {
        println!("listening on http://{bound} (interrupt to stop)");
    }));

    tokio::select! {
        _ = app_token.cancelled() => {}
        result = server => {
            result?.map_err(|err| anyhow::anyhow!("http server failed: {err}"))?;
        }
    }

    let report = shutdown_manager.initiate("signal").await;
    for outcome in &report.outcomes {
        if let Err(err) = &outcome.result {
            warn!(hook = outcome.name, "shutdown hook reported: {err}");
        }
    }
    Ok(())
}

async fn write_app_info(state: &StateStore, clean: bool) {
    let mut app: ApplicationState = match state.load("application").await {
        Ok(Some(app)) => app,
        _ => ApplicationState::default(),
    };
    app.app.version = env!("CARGO_PKG_VERSION").to_string();
    app.app.pid = std::process::id();
    app.app.last_shutdown = clean.then(Utc::now);
    app.app.clean_shutdown = clean;
    app.timestamp = Utc::now();
    if let Err(err) = state.save("application", &app).await {
        warn!("failed to write application info: {err}");
    }
}

struct JobsRecovery {
    manager: JobManager,
    registry: SourceRegistry,
}

#[async_trait]
impl RecoveryHandler for JobsRecovery {
    fn name(&self) -> &str {
        "jobs"
    }
    fn priority(&self) -> i32 {
        pubdatahub_core::recovery::priorities::JOBS
    }
    async fn recover(&self, kind: RecoveryKind) -> pubdatahub_core::Result<()> {
        let revived = self
            .manager
            .resubmit_recovered(&RegistryReviver {
                registry: self.registry.clone(),
            })
            .await?;
        info!(?kind, revived, "job recovery finished");
        Ok(())
    }
}

struct ManagerHook {
    manager: JobManager,
}

#[async_trait]
impl ShutdownHook for ManagerHook {
    fn name(&self) -> &str {
        "job-manager"
    }
    fn priority(&self) -> i32 {
        shutdown::priorities::JOB_MANAGER
    }
    async fn on_shutdown(&self, _reason: &str) -> pubdatahub_core::Result<()> {
        self.manager.quiesce().await;
        Ok(())
    }
}

struct StateHook {
    state: Arc<StateStore>,
}

#[async_trait]
impl ShutdownHook for StateHook {
    fn name(&self) -> &str {
        "state"
    }
    fn priority(&self) -> i32 {
        shutdown::priorities::STATE
    }
    async fn on_shutdown(&self, _reason: &str) -> pubdatahub_core::Result<()> {
        write_app_info(&self.state, true).await;
        Ok(())
    }
    fn supports_checkpoint(&self) -> bool {
        true
    }
    async fn on_checkpoint(&self) -> pubdatahub_core::Result<()> {
        self.state.backup().await?;
        Ok(())
    }
}

struct PoolHook {
    manager: JobManager,
}

#[async_trait]
impl ShutdownHook for PoolHook {
    fn name(&self) -> &str {
        "worker-pool"
    }
    fn priority(&self) -> i32 {
        shutdown::priorities::WORKER_POOL
    }
    fn timeout(&self) -> Duration {
        shutdown::DEFAULT_GRACEFUL_TIMEOUT
    }
    async fn on_shutdown(&self, _reason: &str) -> pubdatahub_core::Result<()> {
        match self.manager.stop().await {
            Ok(()) => Ok(()),
            Err(CoreError::PartialStop { forced }) => {
                warn!(forced, "worker pool stopped with force");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

struct ConfigHook {
    state: Arc<StateStore>,
    config: Config,
}

#[async_trait]
impl ShutdownHook for ConfigHook {
    fn name(&self) -> &str {
        "config"
    }
    fn priority(&self) -> i32 {
        shutdown::priorities::CONFIG
    }
    async fn on_shutdown(&self, _reason: &str) -> pubdatahub_core::Result<()> {
        let mut app: ApplicationState = match self.state.load("application").await {
            Ok(Some(app)) => app,
            _ => ApplicationState::default(),
        };
        app.config = serde_json::to_value(&self.config).ok();
        app.timestamp = Utc::now();
        self.state.save("application", &app).await
    }
}

struct DatabaseHook {
    hackernews: Arc<HackerNewsSource>,
}

#[async_trait]
impl ShutdownHook for DatabaseHook {
    fn name(&self) -> &str {
        "database"
    }
    fn priority(&self) -> i32 {
        shutdown::priorities::DATABASE
    }
    async fn on_shutdown(&self, _reason: &str) -> pubdatahub_core::Result<()> {
        self.hackernews.close().await;
        Ok(())
    }
}
