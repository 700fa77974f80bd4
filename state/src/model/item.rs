use pubdatahub_protocol::Item;
use sqlx::FromRow;

/// Raw `items` row. Child ids are stored as a JSON-encoded list.
#[derive(Debug, Clone, FromRow)]
pub(crate) struct ItemRow {
    pub id: i64,
    pub kind: Option<String>,
    pub author: Option<String>,
    pub time: Option<i64>,
    pub text: Option<String>,
    pub url: Option<String>,
    pub parent: Option<i64>,
    pub kids: String,
    pub score: Option<i64>,
    pub descendants: Option<i64>,
    pub deleted: i64,
    pub dead: i64,
}

impl ItemRow {
    pub(crate) fn into_item(self) -> crate::Result<Item> {
        let kids: Vec<i64> = serde_json::from_str(&self.kids)?;
        Ok(Item {
            id: self.id,
            kind: self.kind,
            by: self.author,
            time: self.time,
            text: self.text,
            url: self.url,
            parent: self.parent,
            kids,
            score: self.score,
            descendants: self.descendants,
            deleted: self.deleted != 0,
            dead: self.dead != 0,
        })
    }
}
