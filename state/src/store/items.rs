use std::collections::BTreeSet;

use chrono::Utc;
use pubdatahub_protocol::Item;
use sqlx::Sqlite;
use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;

use crate::Result;
use crate::StateError;
use crate::model::ItemRow;

use super::ItemStore;

const UPSERT_ITEM: &str = r#"
INSERT INTO items (
    id, kind, author, time, text, url, parent, kids,
    score, descendants, deleted, dead, created_at, updated_at
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT(id) DO UPDATE SET
    kind = excluded.kind,
    author = excluded.author,
    time = excluded.time,
    text = excluded.text,
    url = excluded.url,
    parent = excluded.parent,
    kids = excluded.kids,
    score = excluded.score,
    descendants = excluded.descendants,
    deleted = excluded.deleted,
    dead = excluded.dead,
    updated_at = excluded.updated_at
"#;

fn bind_item(item: &Item, kids_json: String, now: i64) -> Query<'_, Sqlite, SqliteArguments<'_>> {
    sqlx::query(UPSERT_ITEM)
        .bind(item.id)
        .bind(item.kind.as_deref())
        .bind(item.by.as_deref())
        .bind(item.time)
        .bind(item.text.as_deref())
        .bind(item.url.as_deref())
        .bind(item.parent)
        .bind(kids_json)
        .bind(item.score)
        .bind(item.descendants)
        .bind(i64::from(item.deleted))
        .bind(i64::from(item.dead))
        .bind(now)
        .bind(now)
}

impl ItemStore {
    /// Insert or update a single item, keyed by id.
    pub async fn upsert_item(&self, item: &Item) -> Result<()> {
        let kids_json = serde_json::to_string(&item.kids)?;
        bind_item(item, kids_json, Utc::now().timestamp())
            .execute(self.pool())
            .await
            .map_err(StateError::Write)?;
        Ok(())
    }

    /// Insert or update a whole batch in one transaction.
    ///
    /// Either every item lands or none does: any per-row failure rolls the
    /// transaction back. An empty batch is a no-op.
    pub async fn upsert_batch(&self, items: &[Item]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let now = Utc::now().timestamp();
        let mut tx = self.pool().begin().await.map_err(StateError::Write)?;
        for item in items {
            let kids_json = serde_json::to_string(&item.kids)?;
            bind_item(item, kids_json, now)
                .execute(&mut *tx)
                .await
                .map_err(StateError::Write)?;
        }
        tx.commit().await.map_err(StateError::Write)?;
        Ok(())
    }

    /// Ids already present in the inclusive range `[lo, hi]`.
    pub async fn existing_ids_in_range(&self, lo: i64, hi: i64) -> Result<BTreeSet<i64>> {
        let rows: Vec<(i64,)> = sqlx::query_as("SELECT id FROM items WHERE id BETWEEN ? AND ?")
            .bind(lo)
            .bind(hi)
            .fetch_all(self.pool())
            .await
            .map_err(StateError::Query)?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn count_items(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM items")
            .fetch_one(self.pool())
            .await
            .map_err(StateError::Query)?;
        Ok(count)
    }

    /// One page of items ordered by id, for sampled reads over HTTP.
    /// `page` starts at 1.
    pub async fn items_page(&self, page: u64, limit: u64) -> Result<Vec<Item>> {
        let offset = (page.saturating_sub(1)) * limit;
        let rows: Vec<ItemRow> = sqlx::query_as(
            "SELECT id, kind, author, time, text, url, parent, kids, score, descendants, \
             deleted, dead FROM items ORDER BY id LIMIT ? OFFSET ?",
        )
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(self.pool())
        .await
        .map_err(StateError::Query)?;
        rows.into_iter().map(ItemRow::into_item).collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::store::test_support::open_temp_store;
    use crate::store::test_support::story;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn upsert_batch_inserts_all_and_is_idempotent() {
        let (_dir, store) = open_temp_store().await;
        let items: Vec<_> = (1..=5).map(story).collect();
        store.upsert_batch(&items).await.expect("first upsert");
        store.upsert_batch(&items).await.expect("second upsert");
        assert_eq!(store.count_items().await.expect("count"), 5);
    }

    #[tokio::test]
    async fn upsert_batch_empty_is_noop() {
        let (_dir, store) = open_temp_store().await;
        store.upsert_batch(&[]).await.expect("empty upsert");
        assert_eq!(store.count_items().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn upsert_updates_existing_row_in_place() {
        let (_dir, store) = open_temp_store().await;
        let mut item = story(7);
        store.upsert_item(&item).await.expect("insert");

        item.score = Some(99);
        store.upsert_item(&item).await.expect("update");

        let page = store.items_page(1, 10).await.expect("page");
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].score, Some(99));
    }

    #[tokio::test]
    async fn existing_ids_in_range_is_inclusive() {
        let (_dir, store) = open_temp_store().await;
        let items: Vec<_> = [2, 3, 5, 8].into_iter().map(story).collect();
        store.upsert_batch(&items).await.expect("upsert");

        let ids = store.existing_ids_in_range(3, 8).await.expect("range");
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec![3, 5, 8]);

        let empty = store.existing_ids_in_range(10, 20).await.expect("range");
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn items_page_paginates_in_id_order() {
        let (_dir, store) = open_temp_store().await;
        let items: Vec<_> = (1..=25).map(story).collect();
        store.upsert_batch(&items).await.expect("upsert");

        let first = store.items_page(1, 10).await.expect("page 1");
        assert_eq!(first.first().map(|item| item.id), Some(1));
        let third = store.items_page(3, 10).await.expect("page 3");
        assert_eq!(third.len(), 5);
        assert_eq!(third.first().map(|item| item.id), Some(21));
    }
}
