use crate::Result;
use crate::StateError;

use super::ItemStore;

impl ItemStore {
    pub async fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO download_metadata (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(self.pool())
        .await
        .map_err(StateError::Write)?;
        Ok(())
    }

    pub async fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM download_metadata WHERE key = ?")
                .bind(key)
                .fetch_optional(self.pool())
                .await
                .map_err(StateError::Query)?;
        Ok(row.map(|(value,)| value))
    }
}
