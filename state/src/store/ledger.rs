use crate::Result;
use crate::StateError;
use crate::model::BatchEntry;
use crate::model::BatchRow;

use super::ItemStore;

impl ItemStore {
    /// All ledger entries, newest ranges first (`start` descending).
    pub async fn batch_ledger(&self) -> Result<Vec<BatchEntry>> {
        let rows: Vec<BatchRow> = sqlx::query_as(
            "SELECT start_id, end_id, batch_size, completed, items_downloaded, \
             created_at, completed_at FROM batch_status ORDER BY start_id DESC",
        )
        .fetch_all(self.pool())
        .await
        .map_err(StateError::Query)?;
        Ok(rows.into_iter().map(BatchEntry::from).collect())
    }

    /// Insert or update the ledger entry keyed by `(start, end)`.
    pub async fn upsert_batch_entry(&self, entry: &BatchEntry) -> Result<()> {
        sqlx::query(
            r#"
INSERT INTO batch_status (
    start_id, end_id, batch_size, completed, items_downloaded, created_at, completed_at
) VALUES (?, ?, ?, ?, ?, ?, ?)
ON CONFLICT(start_id, end_id) DO UPDATE SET
    batch_size = excluded.batch_size,
    completed = excluded.completed,
    items_downloaded = excluded.items_downloaded,
    completed_at = excluded.completed_at
            "#,
        )
        .bind(entry.start)
        .bind(entry.end)
        .bind(entry.batch_size)
        .bind(i64::from(entry.completed))
        .bind(entry.items_downloaded)
        .bind(entry.created_at.timestamp())
        .bind(entry.completed_at.map(|at| at.timestamp()))
        .execute(self.pool())
        .await
        .map_err(StateError::Write)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    use crate::model::BatchEntry;
    use crate::store::test_support::open_temp_store;

    #[tokio::test]
    async fn ledger_sorts_by_start_descending() {
        let (_dir, store) = open_temp_store().await;
        for (start, end) in [(1, 50), (101, 150), (51, 100)] {
            store
                .upsert_batch_entry(&BatchEntry::open(start, end, 50))
                .await
                .expect("insert entry");
        }
        let ledger = store.batch_ledger().await.expect("ledger");
        let starts: Vec<i64> = ledger.iter().map(|entry| entry.start).collect();
        assert_eq!(starts, vec![101, 51, 1]);
    }

    #[tokio::test]
    async fn completing_an_entry_updates_in_place() {
        let (_dir, store) = open_temp_store().await;
        let mut entry = BatchEntry::open(1, 50, 50);
        store.upsert_batch_entry(&entry).await.expect("open entry");

        entry.completed = true;
        entry.items_downloaded = 48;
        entry.completed_at = Some(Utc::now());
        store.upsert_batch_entry(&entry).await.expect("complete entry");

        let ledger = store.batch_ledger().await.expect("ledger");
        assert_eq!(ledger.len(), 1);
        assert!(ledger[0].completed);
        assert_eq!(ledger[0].items_downloaded, 48);
        assert!(ledger[0].completed_at.is_some());
    }
}
