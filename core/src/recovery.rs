use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::PoisonError;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use pubdatahub_protocol::ApplicationState;
use tokio::time::Instant;
use tracing::info;
use tracing::warn;

use crate::CoreError;
use crate::Result;
use crate::StateStore;
use crate::manager::APPLICATION_COMPONENT;

/// Canonical recovery handler priorities.
pub mod priorities {
    pub const STATE: i32 = 5;
    pub const DATABASE: i32 = 10;
    pub const CONFIG: i32 = 15;
    pub const JOBS: i32 = 20;
    pub const SESSION: i32 = 30;
}

/// How the previous process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryKind {
    /// The clean-shutdown flag was set (or there is no previous state).
    Clean,
    /// State exists but the flag is absent or false.
    Crash,
    /// The state itself cannot be trusted.
    Corruption,
}

/// One named startup step, run in ascending priority.
#[async_trait]
pub trait RecoveryHandler: Send + Sync {
    fn name(&self) -> &str;

    fn priority(&self) -> i32;

    fn timeout(&self) -> Duration {
        Duration::from_secs(10)
    }

    async fn recover(&self, kind: RecoveryKind) -> Result<()>;

    /// Post-condition check; a failure here fails the whole recovery.
    async fn validate(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
pub struct RecoveryReport {
    pub kind: RecoveryKind,
    pub handlers: Vec<String>,
    /// Components that were found corrupt and restored or cleared.
    pub repaired: Vec<String>,
}

/// Classifies the previous shutdown and replays registered handlers.
pub struct RecoveryManager {
    state: Arc<StateStore>,
    handlers: StdMutex<Vec<Arc<dyn RecoveryHandler>>>,
}

impl RecoveryManager {
    pub fn new(state: Arc<StateStore>) -> Self {
        Self {
            state,
            handlers: StdMutex::new(Vec::new()),
        }
    }

    pub fn register(&self, handler: Arc<dyn RecoveryHandler>) {
        let mut handlers = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        handlers.push(handler);
        handlers.sort_by_key(|handler| handler.priority());
    }

    /// Inspect the persisted application state without mutating anything.
    pub async fn classify(&self) -> RecoveryKind {
        if !self.corrupt_components().await.is_empty() {
            return RecoveryKind::Corruption;
        }
        match self.state.load::<ApplicationState>(APPLICATION_COMPONENT).await {
            Err(_) => RecoveryKind::Corruption,
            Ok(None) => RecoveryKind::Clean,
            Ok(Some(app)) => {
                if app.app.pid == std::process::id() {
                    // A live state file naming our own PID means the previous
                    // writer's identity cannot be trusted.
                    return RecoveryKind::Corruption;
                }
                if app.timestamp > Utc::now() + chrono::Duration::hours(1) {
                    return RecoveryKind::Corruption;
                }
                if app.app.clean_shutdown {
                    RecoveryKind::Clean
                } else {
                    RecoveryKind::Crash
                }
            }
        }
    }

    /// Classify, repair corrupt components (restore from the newest backup,
    /// else clear), then run handlers in priority order and validate each.
    pub async fn run(&self) -> Result<RecoveryReport> {
        let mut repaired = Vec::new();
        let mut kind = self.classify().await;
        if kind == RecoveryKind::Corruption {
            repaired = self.repair().await?;
            // Re-classify with the repaired files; the run still reports
            // Corruption so callers know what happened.
            if self.classify().await == RecoveryKind::Corruption {
                warn!("application state still untrusted after repair, clearing");
                self.state.clear(APPLICATION_COMPONENT).await?;
            }
            kind = RecoveryKind::Corruption;
        }
        info!(?kind, "running recovery");

        let handlers = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut ran = Vec::new();
        for handler in handlers {
            let name = handler.name().to_string();
            let started = Instant::now();
            match tokio::time::timeout(handler.timeout(), handler.recover(kind)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(handler = name, "recovery handler failed: {err}");
                    return Err(err);
                }
                Err(_) => {
                    return Err(CoreError::Timeout {
                        name,
                        timeout: handler.timeout(),
                    });
                }
            }
            handler.validate().await.map_err(|err| {
                warn!(handler = name, "recovery validation failed: {err}");
                err
            })?;
            info!(handler = name, elapsed = ?started.elapsed(), "recovery handler done");
            ran.push(name);
        }
        Ok(RecoveryReport {
            kind,
            handlers: ran,
            repaired,
        })
    }

    async fn corrupt_components(&self) -> Vec<String> {
        let components = self.state.list().await.unwrap_or_default();
        let mut corrupt = Vec::new();
        for component in components {
            if self
                .state
                .load::<serde_json::Value>(&component)
                .await
                .is_err()
            {
                corrupt.push(component);
            }
        }
        corrupt
    }

    async fn repair(&self) -> Result<Vec<String>> {
        let corrupt = self.corrupt_components().await;
        if corrupt.is_empty() {
            return Ok(corrupt);
        }
        let newest_backup = self.state.list_backups().await?.pop();
        match newest_backup {
            Some(backup) => {
                info!(backup, components = ?corrupt, "restoring corrupt state from backup");
                self.state.restore_from_backup(&backup).await?;
            }
            None => {
                for component in &corrupt {
                    warn!(component, "no backup available, clearing corrupt state");
                    self.state.clear(component).await?;
                }
            }
        }
        // Whatever is still unparseable after the restore gets cleared.
        for component in self.corrupt_components().await {
            warn!(component, "still corrupt after restore, clearing");
            self.state.clear(&component).await?;
        }
        Ok(corrupt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use pubdatahub_protocol::AppInfo;

    async fn temp_state() -> (tempfile::TempDir, Arc<StateStore>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = Arc::new(StateStore::init(dir.path(), 3).await.expect("init"));
        (dir, state)
    }

    fn app_state(clean: bool, pid: u32) -> ApplicationState {
        ApplicationState {
            app: AppInfo {
                version: "0.1.0".to_string(),
                pid,
                last_shutdown: Some(Utc::now()),
                clean_shutdown: clean,
            },
            timestamp: Utc::now(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn no_previous_state_classifies_clean() {
        let (_dir, state) = temp_state().await;
        let recovery = RecoveryManager::new(state);
        assert_eq!(recovery.classify().await, RecoveryKind::Clean);
    }

    #[tokio::test]
    async fn clean_flag_controls_clean_vs_crash() {
        let (_dir, state) = temp_state().await;
        state
            .save(APPLICATION_COMPONENT, &app_state(true, 1))
            .await
            .expect("save");
        let recovery = RecoveryManager::new(Arc::clone(&state));
        assert_eq!(recovery.classify().await, RecoveryKind::Clean);

        state
            .save(APPLICATION_COMPONENT, &app_state(false, 1))
            .await
            .expect("save");
        assert_eq!(recovery.classify().await, RecoveryKind::Crash);
    }

    #[tokio::test]
    async fn own_pid_and_future_timestamps_are_corruption() {
        let (_dir, state) = temp_state().await;
        state
            .save(APPLICATION_COMPONENT, &app_state(true, std::process::id()))
            .await
            .expect("save");
        let recovery = RecoveryManager::new(Arc::clone(&state));
        assert_eq!(recovery.classify().await, RecoveryKind::Corruption);

        let mut future = app_state(true, 1);
        future.timestamp = Utc::now() + chrono::Duration::hours(2);
        state
            .save(APPLICATION_COMPONENT, &future)
            .await
            .expect("save");
        assert_eq!(recovery.classify().await, RecoveryKind::Corruption);
    }

    #[tokio::test]
    async fn corrupt_component_restores_from_backup() {
        let (_dir, state) = temp_state().await;
        state
            .save(APPLICATION_COMPONENT, &app_state(true, 1))
            .await
            .expect("save");
        state.backup().await.expect("backup");

        tokio::fs::write(state.component_path(APPLICATION_COMPONENT), b"garbage")
            .await
            .expect("corrupt the file");
        let recovery = RecoveryManager::new(Arc::clone(&state));
        assert_eq!(recovery.classify().await, RecoveryKind::Corruption);

        let report = recovery.run().await.expect("run");
        assert_eq!(report.kind, RecoveryKind::Corruption);
        assert_eq!(report.repaired, vec![APPLICATION_COMPONENT.to_string()]);
        // The restored file parses again.
        let restored: Option<ApplicationState> = state
            .load(APPLICATION_COMPONENT)
            .await
            .expect("load restored");
        assert!(restored.is_some_and(|app| app.app.clean_shutdown));
    }

    #[tokio::test]
    async fn corrupt_component_without_backup_is_cleared() {
        let (_dir, state) = temp_state().await;
        tokio::fs::write(state.component_path("session"), b"garbage")
            .await
            .expect("corrupt the file");
        let recovery = RecoveryManager::new(Arc::clone(&state));
        let report = recovery.run().await.expect("run");
        assert_eq!(report.kind, RecoveryKind::Corruption);
        let cleared: Option<serde_json::Value> =
            state.load("session").await.expect("load after clear");
        assert_eq!(cleared, None);
    }

    #[tokio::test]
    async fn handlers_run_in_priority_order_and_validation_gates() {
        struct OrderedHandler {
            name: String,
            priority: i32,
            order: Arc<StdMutex<Vec<String>>>,
            valid: bool,
        }

        #[async_trait]
        impl RecoveryHandler for OrderedHandler {
            fn name(&self) -> &str {
                &self.name
            }
            fn priority(&self) -> i32 {
                self.priority
            }
            async fn recover(&self, _kind: RecoveryKind) -> Result<()> {
                self.order
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(self.name.clone());
                Ok(())
            }
            async fn validate(&self) -> Result<()> {
                if self.valid {
                    Ok(())
                } else {
                    Err(CoreError::validation("invalid state after recovery"))
                }
            }
        }

        let (_dir, state) = temp_state().await;
        let recovery = RecoveryManager::new(state);
        let order = Arc::new(StdMutex::new(Vec::new()));
        recovery.register(Arc::new(OrderedHandler {
            name: "jobs".to_string(),
            priority: priorities::JOBS,
            order: Arc::clone(&order),
            valid: true,
        }));
        recovery.register(Arc::new(OrderedHandler {
            name: "state".to_string(),
            priority: priorities::STATE,
            order: Arc::clone(&order),
            valid: true,
        }));

        let report = recovery.run().await.expect("run");
        assert_eq!(report.handlers, vec!["state", "jobs"]);
        let ran = order.lock().unwrap_or_else(PoisonError::into_inner).clone();
        assert_eq!(ran, vec!["state", "jobs"]);

        recovery.register(Arc::new(OrderedHandler {
            name: "session".to_string(),
            priority: priorities::SESSION,
            order: Arc::clone(&order),
            valid: false,
        }));
        assert!(recovery.run().await.is_err(), "validation failure fails recovery");
    }
}
