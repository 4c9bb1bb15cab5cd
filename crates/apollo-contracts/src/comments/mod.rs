mod model;
mod moderation;

pub use model::{
    is_allowed_emoji, Comment, CommentModeration, ModerationReason, ALLOWED_EMOJIS,
    MAX_COMMENT_CHARS,
};
pub use moderation::moderate_content;
