use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Post,
    Comment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordField {
    Text,
    AuthorName,
    AuthorAvatar,
    Timestamp,
    Permalink,
}

/// One post or comment as read off the page. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub kind: RecordKind,
    pub source_id: String,
    /// `true` when `source_id` is a content digest rather than a site id.
    pub source_id_derived: bool,
    pub raw_text: Option<String>,
    pub author_name: Option<String>,
    pub author_avatar_ref: Option<String>,
    pub timestamp_raw: Option<String>,
    /// Set only when `timestamp_raw` was unambiguous.
    pub timestamp: Option<DateTime<Utc>>,
    pub permalink_ref: Option<String>,
    pub parent_id: Option<String>,
    pub captured_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_fields: Vec<RecordField>,
}

impl RawRecord {
    pub fn is_partial(&self) -> bool {
        !self.missing_fields.is_empty()
    }
}
