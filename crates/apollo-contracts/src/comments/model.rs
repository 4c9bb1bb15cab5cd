use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const MAX_COMMENT_CHARS: usize = 80;

pub const ALLOWED_EMOJIS: [&str; 20] = [
    "😀", "😂", "🥹", "😍", "🥰", "😢", "😭", "😱", "🤯", "🤔", "👍", "👎", "❤️", "🔥", "✨",
    "👏", "🙌", "💯", "🎉", "😎",
];

pub fn is_allowed_emoji(emoji: &str) -> bool {
    ALLOWED_EMOJIS.contains(&emoji)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModerationReason {
    BannedWord,
    UrlDetected,
    RepeatedChars,
    SpamPattern,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommentModeration {
    pub flagged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<ModerationReason>,
}

impl CommentModeration {
    pub fn clean() -> Self {
        Self::default()
    }

    pub fn flagged(reason: ModerationReason) -> Self {
        Self {
            flagged: true,
            reason: Some(reason),
        }
    }
}

/// Append-only: written once, never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    #[serde(default)]
    pub id: String,
    pub emoji: String,
    #[serde(default)]
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub anon_id_hash: String,
    pub moderation: CommentModeration,
}

impl Comment {
    pub fn from_document(id: &str, doc: Value) -> anyhow::Result<Self> {
        let mut comment: Comment = serde_json::from_value(doc)
            .with_context(|| format!("comment document {id} has an unexpected shape"))?;
        if comment.id.is_empty() {
            comment.id = id.to_string();
        }
        Ok(comment)
    }

    pub fn to_document(&self) -> anyhow::Result<Value> {
        serde_json::to_value(self).context("comment serialization failed")
    }
}
