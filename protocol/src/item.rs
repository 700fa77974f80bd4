use serde::Deserialize;
use serde::Serialize;

/// One record from the remote item feed.
///
/// Mirrors the Hacker News item shape: every field except `id` is optional on
/// the wire, and unknown fields are ignored so upstream schema additions do
/// not break ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Item {
    pub id: i64,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by: Option<String>,
    /// Creation time, seconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kids: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descendants: Option<i64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dead: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn decodes_story_with_unknown_fields() {
        let raw = r#"{
            "id": 8863,
            "type": "story",
            "by": "dhouston",
            "time": 1175714200,
            "url": "http://www.getdropbox.com/u/2/screencast.html",
            "score": 111,
            "descendants": 71,
            "kids": [8952, 9224],
            "some_future_field": {"nested": true}
        }"#;
        let item: Item = serde_json::from_str(raw).expect("decode story");
        assert_eq!(item.id, 8863);
        assert_eq!(item.kind.as_deref(), Some("story"));
        assert_eq!(item.kids, vec![8952, 9224]);
        assert!(!item.deleted);
    }

    #[test]
    fn decodes_deleted_comment() {
        let raw = r#"{"id": 192327, "type": "comment", "deleted": true, "time": 1210asdf"#;
        assert!(serde_json::from_str::<Item>(raw).is_err());

        let raw = r#"{"id": 192327, "type": "comment", "deleted": true, "time": 1210155000}"#;
        let item: Item = serde_json::from_str(raw).expect("decode comment");
        assert!(item.deleted);
        assert!(item.kids.is_empty());
    }
}
