use apollo_contracts::episodes::paths::episode_ref;
use apollo_contracts::events::summarize_for_log;
use apollo_contracts::identity::hash_text;
use apollo_contracts::{ApiError, ApiResult};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::references::{mime_for_path, sanitize_reference_filename, MAX_REFERENCE_BYTES};
use crate::{validate_episode_id, CallContext, Service};

const OPERATION: &str = "upload_reference";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadReferenceResponse {
    pub success: bool,
    /// Blob path to pass back as a `refImagePaths` entry.
    pub path: String,
}

impl Service {
    /// Stores a reference image under the episode. The episode may not exist
    /// yet (ids are reserved client side), but an existing one must belong to
    /// the caller.
    pub fn upload_reference(
        &self,
        ctx: &CallContext,
        episode_id: &str,
        filename: &str,
        bytes: &[u8],
    ) -> ApiResult<UploadReferenceResponse> {
        self.events.log(
            "upload_reference_requested",
            json!({
                "episode_id": episode_id,
                "filename": summarize_for_log(filename, 50),
                "bytes": bytes.len(),
            }),
        );
        let result = self.upload_reference_inner(ctx, episode_id, filename, bytes);
        self.log_outcome(OPERATION, result)
    }

    fn upload_reference_inner(
        &self,
        ctx: &CallContext,
        episode_id: &str,
        filename: &str,
        bytes: &[u8],
    ) -> ApiResult<UploadReferenceResponse> {
        let uid = ctx.require_uid()?;
        validate_episode_id(episode_id)?;
        let filename = sanitize_reference_filename(filename).ok_or_else(|| {
            ApiError::invalid_argument("Reference images must be .png, .jpg, .jpeg or .webp files.")
        })?;
        if bytes.is_empty() {
            return Err(ApiError::invalid_argument("Reference image is empty."));
        }
        if bytes.len() > MAX_REFERENCE_BYTES {
            return Err(ApiError::invalid_argument(format!(
                "Reference images must be at most {} MiB.",
                MAX_REFERENCE_BYTES / (1024 * 1024)
            )));
        }
        if let Some(existing) = self.load_episode(OPERATION, episode_id)? {
            if !existing.is_owned_by(uid) {
                return Err(ApiError::permission_denied(
                    "You can only modify your own episodes.",
                ));
            }
        }

        let path = episode_ref(episode_id, &filename);
        self.blobs
            .put(&path, bytes, mime_for_path(&path))
            .map_err(|err| self.internal(OPERATION, err))?;
        self.events.log(
            "upload_reference_completed",
            json!({
                "episode_id": episode_id,
                "path": path,
                "bytes": bytes.len(),
                "uid_hash": hash_text(uid),
            }),
        );
        Ok(UploadReferenceResponse {
            success: true,
            path,
        })
    }
}
