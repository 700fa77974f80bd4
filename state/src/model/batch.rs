use chrono::DateTime;
use chrono::Utc;
use sqlx::FromRow;

/// One ledger entry: the record that the id range `[start, end]` has been
/// (or is being) fetched. `(start, end)` is the primary key; a completed
/// entry is never re-attempted unless the ledger is cleared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntry {
    pub start: i64,
    pub end: i64,
    pub batch_size: i64,
    pub completed: bool,
    pub items_downloaded: i64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BatchEntry {
    /// Fresh, not-yet-completed entry covering `[start, end]`.
    pub fn open(start: i64, end: i64, batch_size: i64) -> Self {
        Self {
            start,
            end,
            batch_size,
            completed: false,
            items_downloaded: 0,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Number of ids the range covers (inclusive on both ends).
    pub fn width(&self) -> i64 {
        self.end - self.start + 1
    }
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct BatchRow {
    pub start_id: i64,
    pub end_id: i64,
    pub batch_size: i64,
    pub completed: i64,
    pub items_downloaded: i64,
    pub created_at: i64,
    pub completed_at: Option<i64>,
}

impl From<BatchRow> for BatchEntry {
    fn from(row: BatchRow) -> Self {
        Self {
            start: row.start_id,
            end: row.end_id,
            batch_size: row.batch_size,
            completed: row.completed != 0,
            items_downloaded: row.items_downloaded,
            created_at: DateTime::from_timestamp(row.created_at, 0).unwrap_or_default(),
            completed_at: row.completed_at.and_then(|secs| DateTime::from_timestamp(secs, 0)),
        }
    }
}
