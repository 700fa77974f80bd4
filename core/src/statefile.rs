use std::path::Path;
use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use tracing::warn;

use crate::CoreError;
use crate::Result;

const STATE_SUBDIR: &str = "state";
const BACKUPS_SUBDIR: &str = "backups";
const BACKUP_STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Component-keyed JSON documents with atomic writes and rotating backups.
///
/// `save` is atomic with respect to readers: the document is written to a
/// `.tmp` sibling, synced, then renamed over the live file. Files are 0644,
/// directories 0755.
pub struct StateStore {
    dir: PathBuf,
    max_backups: usize,
}

impl StateStore {
    /// Open (creating) `<root>/state`.
    pub async fn init(root: &Path, max_backups: usize) -> Result<Self> {
        let dir = root.join(STATE_SUBDIR);
        create_dir_0755(&dir.join(BACKUPS_SUBDIR)).await?;
        Ok(Self { dir, max_backups })
    }

    pub fn dir(&self) -> &Path {
        self.dir.as_path()
    }

    pub fn component_path(&self, component: &str) -> PathBuf {
        self.dir.join(format!("{component}.json"))
    }

    pub async fn save<T: Serialize>(&self, component: &str, value: &T) -> Result<()> {
        validate_component(component)?;
        let encoded = serde_json::to_vec_pretty(value)?;
        let live = self.component_path(component);
        let tmp = self.dir.join(format!("{component}.json.tmp"));

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&encoded).await?;
        // Durability is best-effort; the rename below is the atomicity line.
        if let Err(err) = file.sync_all().await {
            warn!("fsync of {} failed: {err}", tmp.display());
        }
        drop(file);
        #[cfg(unix)]
        set_file_permissions(&tmp).await?;
        tokio::fs::rename(&tmp, &live).await?;
        debug!(component, "state saved");
        Ok(())
    }

    /// `Ok(None)` when the component has never been saved.
    pub async fn load<T: DeserializeOwned>(&self, component: &str) -> Result<Option<T>> {
        validate_component(component)?;
        let path = self.component_path(component);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let value = serde_json::from_slice(&raw).map_err(|err| {
            CoreError::Corruption(format!("{} failed to parse: {err}", path.display()))
        })?;
        Ok(Some(value))
    }

    pub async fn clear(&self, component: &str) -> Result<()> {
        validate_component(component)?;
        match tokio::fs::remove_file(self.component_path(component)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Component names currently on disk.
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut components = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(component) = name.strip_suffix(".json") {
                components.push(component.to_string());
            }
        }
        components.sort();
        Ok(components)
    }

    /// Snapshot every component into `backups/<stamp>/`, pruning the oldest
    /// snapshots beyond `max_backups`. Returns the new backup's name.
    pub async fn backup(&self) -> Result<String> {
        let stamp = Utc::now().format(BACKUP_STAMP_FORMAT).to_string();
        let backup_dir = self.dir.join(BACKUPS_SUBDIR).join(&stamp);
        create_dir_0755(&backup_dir).await?;
        for component in self.list().await? {
            let from = self.component_path(&component);
            let to = backup_dir.join(format!("{component}.json"));
            tokio::fs::copy(&from, &to).await?;
        }
        self.prune_backups().await?;
        debug!(stamp, "state backed up");
        Ok(stamp)
    }

    pub async fn list_backups(&self) -> Result<Vec<String>> {
        let backups_dir = self.dir.join(BACKUPS_SUBDIR);
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&backups_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Copy a named backup's components back over the live files.
    pub async fn restore_from_backup(&self, name: &str) -> Result<()> {
        let backup_dir = self.dir.join(BACKUPS_SUBDIR).join(name);
        if !backup_dir.is_dir() {
            return Err(CoreError::validation(format!("no such backup: {name}")));
        }
        let mut entries = tokio::fs::read_dir(&backup_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if !file_name.ends_with(".json") {
                continue;
            }
            tokio::fs::copy(entry.path(), self.dir.join(file_name.as_ref())).await?;
        }
        debug!(name, "state restored from backup");
        Ok(())
    }

    async fn prune_backups(&self) -> Result<()> {
        let names = self.list_backups().await?;
        if names.len() <= self.max_backups {
            return Ok(());
        }
        let excess = names.len() - self.max_backups;
        for name in names.into_iter().take(excess) {
            let path = self.dir.join(BACKUPS_SUBDIR).join(&name);
            if let Err(err) = tokio::fs::remove_dir_all(&path).await {
                warn!("failed to prune backup {name}: {err}");
            }
        }
        Ok(())
    }
}

fn validate_component(component: &str) -> Result<()> {
    if component.is_empty()
        || !component
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
    {
        return Err(CoreError::validation(format!(
            "invalid component name: {component:?}"
        )));
    }
    Ok(())
}

async fn create_dir_0755(dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o755);
        tokio::fs::set_permissions(dir, perms.clone()).await?;
        if let Some(parent) = dir.parent() {
            tokio::fs::set_permissions(parent, perms).await?;
        }
    }
    Ok(())
}

#[cfg(unix)]
async fn set_file_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    async fn temp_store(max_backups: usize) -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = StateStore::init(dir.path(), max_backups).await.expect("init");
        (dir, store)
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let (_dir, store) = temp_store(3).await;
        let value = Sample {
            name: "session".to_string(),
            count: 7,
        };
        store.save("session", &value).await.expect("save");
        let loaded: Option<Sample> = store.load("session").await.expect("load");
        assert_eq!(loaded, Some(value));
    }

    #[tokio::test]
    async fn load_missing_component_is_none() {
        let (_dir, store) = temp_store(3).await;
        let loaded: Option<Sample> = store.load("absent").await.expect("load");
        assert_eq!(loaded, None);
    }

    #[tokio::test]
    async fn clear_removes_and_is_idempotent() {
        let (_dir, store) = temp_store(3).await;
        store
            .save("session", &Sample { name: "x".to_string(), count: 0 })
            .await
            .expect("save");
        store.clear("session").await.expect("clear");
        store.clear("session").await.expect("clear again");
        let loaded: Option<Sample> = store.load("session").await.expect("load");
        assert_eq!(loaded, None);
    }

    #[tokio::test]
    async fn corrupt_component_surfaces_as_corruption() {
        let (_dir, store) = temp_store(3).await;
        tokio::fs::write(store.component_path("application"), b"{not json")
            .await
            .expect("write garbage");
        let err = store
            .load::<Sample>("application")
            .await
            .err()
            .expect("must fail");
        assert!(matches!(err, CoreError::Corruption(_)));
    }

    #[tokio::test]
    async fn backup_and_restore_round_trip() {
        let (_dir, store) = temp_store(3).await;
        let original = Sample {
            name: "before".to_string(),
            count: 1,
        };
        store.save("application", &original).await.expect("save");
        let backup = store.backup().await.expect("backup");

        store
            .save(
                "application",
                &Sample {
                    name: "after".to_string(),
                    count: 2,
                },
            )
            .await
            .expect("overwrite");
        store.restore_from_backup(&backup).await.expect("restore");

        let loaded: Option<Sample> = store.load("application").await.expect("load");
        assert_eq!(loaded, Some(original));
    }

    #[tokio::test]
    async fn old_backups_are_pruned() {
        let (_dir, store) = temp_store(1).await;
        store
            .save("application", &Sample { name: "v".to_string(), count: 0 })
            .await
            .expect("save");
        // Same-second backups share a stamp; nudge the clock apart.
        let first = store.backup().await.expect("first backup");
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        let second = store.backup().await.expect("second backup");

        let backups = store.list_backups().await.expect("list");
        assert_eq!(backups, vec![second.clone()]);
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn rejects_path_traversal_component_names() {
        let (_dir, store) = temp_store(3).await;
        assert!(store.save("../evil", &1).await.is_err());
        assert!(store.load::<Sample>("a/b").await.is_err());
    }
}
