//! Notification record types.
//!
//! Core structures shared by the streaming channel and the persisted history:
//! the record itself, its kind, the identity scoping a connection, and the key
//! used to deduplicate records coming from both sources.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Type of notification.
///
/// Known kinds get their own variant; anything else the backend sends is kept
/// verbatim in [`NotificationKind::Other`] so it still round-trips and keys
/// correctly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NotificationKind {
    /// Someone liked a post
    LikePost,
    /// Someone commented on a post
    CommentPost,
    /// Someone replied to a comment
    ReplyComment,
    /// Someone mentioned the profile
    Mention,
    /// New follower
    Follow,
    /// Pending follow request (counted by the relationship subsystem)
    FollowRequest,
    /// System announcement
    System,
    /// Other backend-specific kind
    Other(String),
}

impl NotificationKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::LikePost => "like_post",
            Self::CommentPost => "comment_post",
            Self::ReplyComment => "reply_comment",
            Self::Mention => "mention",
            Self::Follow => "follow",
            Self::FollowRequest => "follow_request",
            Self::System => "system",
            Self::Other(kind) => kind,
        }
    }
}

impl From<String> for NotificationKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "like_post" => Self::LikePost,
            "comment_post" => Self::CommentPost,
            "reply_comment" => Self::ReplyComment,
            "mention" => Self::Mention,
            "follow" => Self::Follow,
            "follow_request" => Self::FollowRequest,
            "system" => Self::System,
            _ => Self::Other(value),
        }
    }
}

impl From<&str> for NotificationKind {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<NotificationKind> for String {
    fn from(value: NotificationKind) -> Self {
        match value {
            NotificationKind::Other(kind) => kind,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The (credential, selected profile) pair scoping a connection and its state.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    profile_id: String,
    token: String,
}

impl Identity {
    pub fn new(profile_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            profile_id: profile_id.into(),
            token: token.into(),
        }
    }

    /// Selected profile the channel is opened for.
    pub fn profile_id(&self) -> &str {
        &self.profile_id
    }

    /// Short-lived credential sent with the channel handshake and REST calls.
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("profile_id", &self.profile_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// A single notification, either persisted server-side or streamed live.
///
/// A persisted record always carries an `id`. A streamed record may not have
/// one yet and is then keyed by its content (see [`RecordKey`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    /// Durable id, absent until the backend has stored the record
    #[serde(default)]
    pub id: Option<i64>,
    /// Kind of notification
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    /// Creation time
    #[serde(alias = "createdAt")]
    pub created_at: DateTime<Utc>,
    /// Whether the user has read it
    #[serde(default, alias = "isRead")]
    pub is_read: bool,
    /// Display name of the sender
    #[serde(default, alias = "senderName")]
    pub sender_name: String,
    /// Avatar of the sender
    #[serde(
        default,
        alias = "senderAvatarUrl",
        skip_serializing_if = "Option::is_none"
    )]
    pub sender_avatar_url: Option<String>,
    /// Kind-specific payload (post id, comment excerpt, ...)
    #[serde(default, alias = "extraData", deserialize_with = "null_as_empty")]
    pub extra_data: Map<String, Value>,
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}

impl NotificationRecord {
    /// Create an unread record without an id, as delivered by the stream.
    pub fn new(kind: impl Into<NotificationKind>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: None,
            kind: kind.into(),
            created_at,
            is_read: false,
            sender_name: String::new(),
            sender_avatar_url: None,
            extra_data: Map::new(),
        }
    }

    /// Set the durable id.
    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }

    /// Set the sender display name.
    pub fn with_sender(mut self, name: impl Into<String>) -> Self {
        self.sender_name = name.into();
        self
    }

    /// Add an entry to the extra data payload.
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra_data.insert(key.into(), value);
        self
    }

    /// Set the read flag.
    pub fn with_read(mut self, is_read: bool) -> Self {
        self.is_read = is_read;
        self
    }

    /// Deduplication key: the id when present, the content signature otherwise.
    pub fn key(&self) -> RecordKey {
        match self.id {
            Some(id) => RecordKey::Id(id),
            None => RecordKey::Composite(self.content_signature()),
        }
    }

    /// Content-derived signature, independent of the id.
    ///
    /// Lets a streamed record that arrived without an id be matched against
    /// the persisted copy the backend later returns with one.
    pub fn content_signature(&self) -> ContentSignature {
        let mut extra = String::new();
        write_canonical(&Value::Object(self.extra_data.clone()), &mut extra);
        ContentSignature {
            kind: self.kind.clone(),
            created_at: self.created_at,
            extra,
        }
    }
}

/// Identity of a record for deduplication purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordKey {
    Id(i64),
    Composite(ContentSignature),
}

/// Kind + timestamp + canonical extra data.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentSignature {
    kind: NotificationKind,
    created_at: DateTime<Utc>,
    extra: String,
}

/// Serialize a JSON value with object keys sorted at every depth.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (idx, (key, value)) in entries.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(value, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        leaf => out.push_str(&leaf.to_string()),
    }
}
