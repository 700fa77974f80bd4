use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::sqlite::SqliteJournalMode;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::sqlite::SqliteSynchronous;
use tracing::debug;

use crate::Result;
use crate::StateError;
use crate::migrations::MIGRATOR;

mod items;
mod ledger;
mod meta;
mod query;

pub use query::QueryResult;

/// Handle to one source's database file.
///
/// Cloning is cheap; all clones share the underlying pool. Writers are
/// serialized by SQLite, readers run concurrently thanks to WAL mode.
#[derive(Clone)]
pub struct ItemStore {
    path: PathBuf,
    pool: Arc<SqlitePool>,
}

impl ItemStore {
    /// Open (creating if needed) the database at `path`, creating parent
    /// directories and running schema migrations.
    pub async fn init_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| StateError::init(parent, err))?;
            #[cfg(unix)]
            set_dir_permissions(parent).map_err(|err| StateError::init(parent, err))?;
        }
        let pool = open_sqlite(path)
            .await
            .map_err(|err| StateError::init(path, err))?;
        debug!("opened item store at {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            pool: Arc::new(pool),
        })
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// Close the pool. Safe to call more than once.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        self.pool.as_ref()
    }
}

async fn open_sqlite(path: &Path) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5));
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    MIGRATOR.run(&pool).await?;
    Ok(pool)
}

#[cfg(unix)]
fn set_dir_permissions(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o755))
}


#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn init_creates_parent_directories_and_is_idempotent() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let db_path = dir.path().join("hackernews").join("hackernews.db");
        let store = ItemStore::init_at(&db_path).await.expect("first init");
        store.close().await;

        // Re-running migrations against an existing file is a no-op.
        let store = ItemStore::init_at(&db_path).await.expect("second init");
        assert_eq!(store.path(), db_path.as_path());
        store.close().await;
        store.close().await;
    }

    #[tokio::test]
    async fn init_fails_on_unwritable_path() {
        let err = ItemStore::init_at(Path::new("/proc/nonexistent/nested/test.db"))
            .await
            .err()
            .expect("init must fail");
        assert!(matches!(err, StateError::Init { .. }));
    }
}
