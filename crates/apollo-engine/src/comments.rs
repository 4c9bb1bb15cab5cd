//! Anonymous emoji comments on published episodes.

use apollo_contracts::comments::{
    is_allowed_emoji, moderate_content, Comment, MAX_COMMENT_CHARS,
};
use apollo_contracts::episodes::paths::comments_collection;
use apollo_contracts::identity::{anon_rate_limit_key, hash_text, is_valid_anon_id};
use apollo_contracts::rate_limit::{DualAdmission, LimitWindow};
use apollo_contracts::{ApiError, ApiResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::settings::{RatePolicy, ACTION_COMMENT};
use crate::{validate_episode_id, CallContext, Service};

const OPERATION: &str = "comment";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddCommentRequest {
    pub episode_id: String,
    pub emoji: String,
    #[serde(default)]
    pub text: Option<String>,
    pub anon_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddCommentResponse {
    pub success: bool,
    pub comment_id: String,
    pub flagged: bool,
    pub remaining_minute: u32,
    pub remaining_day: u32,
}

/// Public projection of a comment; the anonymous id hash stays server side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentView {
    pub id: String,
    pub emoji: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListCommentsResponse {
    pub episode_id: String,
    pub comments: Vec<CommentView>,
}

fn validate(request: &AddCommentRequest) -> ApiResult<String> {
    validate_episode_id(&request.episode_id)?;
    if request.emoji.is_empty() {
        return Err(ApiError::invalid_argument("emoji is required."));
    }
    if !is_valid_anon_id(&request.anon_id) {
        return Err(ApiError::invalid_argument("anonId must be a valid UUID v4."));
    }
    if !is_allowed_emoji(&request.emoji) {
        return Err(ApiError::invalid_argument("This emoji is not allowed."));
    }
    let text = request.text.as_deref().unwrap_or_default().trim().to_string();
    if text.chars().count() > MAX_COMMENT_CHARS {
        return Err(ApiError::invalid_argument(format!(
            "Comment text must be {MAX_COMMENT_CHARS} characters or fewer."
        )));
    }
    Ok(text)
}

fn denial(admission: &DualAdmission) -> ApiError {
    let retry_after = admission.retry_after_seconds;
    let message = match admission.error_type {
        Some(LimitWindow::Day) => {
            "Daily comment limit reached. Please try again tomorrow.".to_string()
        }
        _ => format!(
            "Too many comments. Please wait {} seconds.",
            retry_after.unwrap_or(1)
        ),
    };
    ApiError::resource_exhausted(message, retry_after)
}

impl Service {
    /// Appends an emoji (+ optional text) comment. Callers are anonymous and
    /// identified by a client-generated UUID, which is only stored hashed.
    pub fn add_comment(
        &self,
        ctx: &CallContext,
        request: &AddCommentRequest,
    ) -> ApiResult<AddCommentResponse> {
        self.events.log(
            "comment_requested",
            json!({
                "episode_id": request.episode_id,
                "emoji": request.emoji,
                "text_chars": request.text.as_deref().map(|text| text.chars().count()),
            }),
        );
        let result = self.add_comment_inner(ctx, request);
        self.log_outcome(OPERATION, result)
    }

    fn add_comment_inner(
        &self,
        ctx: &CallContext,
        request: &AddCommentRequest,
    ) -> ApiResult<AddCommentResponse> {
        let text = validate(request)?;
        let anon_id_hash = hash_text(&request.anon_id);
        let admission = self.admit_comment(&anon_id_hash)?;

        let episode_id = request.episode_id.as_str();
        let episode = self
            .load_episode(OPERATION, episode_id)?
            .ok_or_else(|| ApiError::not_found("Episode not found."))?;
        if !episode.is_published() {
            return Err(ApiError::permission_denied(
                "Comments are only allowed on published episodes.",
            ));
        }

        let moderation = moderate_content(&text);
        let comment = Comment {
            id: Uuid::new_v4().to_string(),
            emoji: request.emoji.clone(),
            text,
            created_at: self.clock.now(),
            anon_id_hash: anon_id_hash.clone(),
            moderation,
        };
        let doc = comment
            .to_document()
            .map_err(|err| self.internal(OPERATION, err))?;
        self.documents
            .set(&comments_collection(episode_id), &comment.id, doc)
            .map_err(|err| self.internal(OPERATION, err))?;

        self.events.log(
            "comment_completed",
            json!({
                "episode_id": episode_id,
                "comment_id": comment.id,
                "anon_id_hash": anon_id_hash,
                "client_ip_hash": hash_text(&ctx.client_ip),
                "flagged": moderation.flagged,
                "reason": moderation.reason,
            }),
        );
        Ok(AddCommentResponse {
            success: true,
            comment_id: comment.id,
            flagged: moderation.flagged,
            remaining_minute: admission.remaining_minute,
            remaining_day: admission.remaining_day,
        })
    }

    fn admit_comment(&self, anon_id_hash: &str) -> ApiResult<DualAdmission> {
        let Some(RatePolicy::Dual { minute, day }) = self.settings.rate_policy(ACTION_COMMENT)
        else {
            return Ok(DualAdmission {
                allowed: true,
                remaining_minute: u32::MAX,
                remaining_day: u32::MAX,
                error_type: None,
                retry_after_seconds: None,
            });
        };
        let key = anon_rate_limit_key(anon_id_hash, ACTION_COMMENT);
        let admission = self
            .limiter
            .admit_dual(&key, minute, day)
            .map_err(|err| self.internal(OPERATION, err))?;
        if !admission.allowed {
            return Err(denial(&admission));
        }
        Ok(admission)
    }

    /// Visible comments of a published episode, newest first. Flagged
    /// comments are stored but never listed.
    pub fn list_comments(&self, episode_id: &str) -> ApiResult<ListCommentsResponse> {
        self.events.log(
            "list_comments_requested",
            json!({"episode_id": episode_id}),
        );
        let result = self.list_comments_inner(episode_id);
        if let Ok(response) = &result {
            self.events.log(
                "list_comments_completed",
                json!({"episode_id": episode_id, "visible": response.comments.len()}),
            );
        }
        self.log_outcome("list_comments", result)
    }

    fn list_comments_inner(&self, episode_id: &str) -> ApiResult<ListCommentsResponse> {
        validate_episode_id(episode_id)?;
        let visible = self
            .load_episode("list_comments", episode_id)?
            .filter(|episode| episode.is_published());
        if visible.is_none() {
            return Err(ApiError::not_found("Episode not found."));
        }
        let docs = self
            .documents
            .list(&comments_collection(episode_id))
            .map_err(|err| self.internal("list_comments", err))?;
        let mut comments = Vec::with_capacity(docs.len());
        for (id, doc) in docs {
            let comment =
                Comment::from_document(&id, doc).map_err(|err| self.internal("list_comments", err))?;
            if comment.moderation.flagged {
                continue;
            }
            comments.push(comment);
        }
        comments.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(ListCommentsResponse {
            episode_id: episode_id.to_string(),
            comments: comments
                .into_iter()
                .map(|comment| CommentView {
                    id: comment.id,
                    emoji: comment.emoji,
                    text: comment.text,
                    created_at: comment.created_at,
                })
                .collect(),
        })
    }
}
