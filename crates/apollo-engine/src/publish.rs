use apollo_contracts::episodes::paths::EPISODES;
use apollo_contracts::episodes::Episode;
use apollo_contracts::{ApiError, ApiResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::settings::ACTION_PUBLISH;
use crate::{validate_episode_id, CallContext, Service};

const OPERATION: &str = "publish";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    pub episode_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishResponse {
    pub success: bool,
    pub episode_id: String,
    /// False when the episode was already published.
    pub changed: bool,
}

fn check_publishable(episode: &Episode) -> ApiResult<()> {
    let Some(planned) = episode.planned_panel_count() else {
        return Err(ApiError::failed_precondition(
            "Storyboard has not been generated yet.",
        ));
    };
    if !episode.has_all_panels() {
        return Err(ApiError::failed_precondition(format!(
            "All panels must be generated before publishing ({}/{planned}).",
            episode.panels.len()
        )));
    }
    Ok(())
}

impl Service {
    /// Draft -> published, once. Publishing a published episode succeeds
    /// without touching the document.
    pub fn publish_episode(
        &self,
        ctx: &CallContext,
        request: &PublishRequest,
    ) -> ApiResult<PublishResponse> {
        self.events.log(
            "publish_requested",
            json!({"episode_id": request.episode_id}),
        );
        let result = self.publish_episode_inner(ctx, request);
        if let Ok(response) = &result {
            self.events.log(
                "publish_completed",
                json!({"episode_id": response.episode_id, "changed": response.changed}),
            );
        }
        self.log_outcome(OPERATION, result)
    }

    fn publish_episode_inner(
        &self,
        ctx: &CallContext,
        request: &PublishRequest,
    ) -> ApiResult<PublishResponse> {
        let uid = ctx.require_uid()?;
        validate_episode_id(&request.episode_id)?;
        self.admit(ctx, ACTION_PUBLISH)?;
        let episode_id = request.episode_id.as_str();
        let episode = self.load_owned_episode(OPERATION, episode_id, uid)?;
        let unchanged = PublishResponse {
            success: true,
            episode_id: episode_id.to_string(),
            changed: false,
        };
        if episode.is_published() {
            return Ok(unchanged);
        }
        check_publishable(&episode)?;

        let now = self.clock.now();
        let mut rejection: Option<ApiError> = None;
        let mut changed = false;
        self.documents
            .transact(EPISODES, episode_id, &mut |current: Option<&Value>| {
                let Some(doc) = current else {
                    rejection = Some(ApiError::not_found("Episode not found."));
                    return Ok(None);
                };
                let mut latest = Episode::from_document(episode_id, doc.clone())?;
                if let Err(err) = check_publishable(&latest) {
                    rejection = Some(err);
                    return Ok(None);
                }
                changed = latest.publish(now);
                if !changed {
                    return Ok(None);
                }
                latest.to_document().map(Some)
            })
            .map_err(|err| self.internal(OPERATION, err))?;
        if let Some(err) = rejection {
            return Err(err);
        }
        if !changed {
            return Ok(unchanged);
        }

        self.events.log(
            "episode_status_changed",
            json!({
                "episode_id": episode_id,
                "status": "published",
                "panels": episode.panels.len(),
                "published_at": now.to_rfc3339(),
            }),
        );
        Ok(PublishResponse {
            changed: true,
            ..unchanged
        })
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use apollo_contracts::episodes::Panel;
    use apollo_contracts::stores::DocumentStore;
    use apollo_contracts::FailureKind;
    use chrono::Duration;

    use super::*;
    use crate::settings::Settings;
    use crate::testkit::{
        ctx, harness, harness_with, read_episode, seed_planned_episode, start_time, ScriptedModel,
    };

    fn request() -> PublishRequest {
        PublishRequest {
            episode_id: "ep-1".to_string(),
        }
    }

    fn with_panels(documents: &dyn DocumentStore, count: usize) -> Result<()> {
        let mut episode = read_episode(documents, "ep-1")?;
        let panels = (0..count)
            .map(|index| Panel {
                index,
                image_path: format!("episodes/ep-1/panels/{index}.png"),
                caption: String::new(),
            })
            .collect::<Vec<_>>();
        episode.merge_generated(&panels, start_time());
        documents.set(EPISODES, "ep-1", episode.to_document()?)
    }

    #[test]
    fn publish_requires_every_planned_panel() -> Result<()> {
        let h = harness(ScriptedModel::images());
        seed_planned_episode(h.documents.as_ref(), "ep-1", "uid-1", 4)?;
        with_panels(h.documents.as_ref(), 3)?;

        let err = h
            .service
            .publish_episode(&ctx("uid-1"), &request())
            .expect_err("missing panel");
        assert!(err.is(FailureKind::FailedPrecondition));
        assert!(err.message.contains("(3/4)"));
        assert!(!read_episode(h.documents.as_ref(), "ep-1")?.is_published());

        with_panels(h.documents.as_ref(), 4)?;
        h.clock.advance(Duration::seconds(5));
        let response = h.service.publish_episode(&ctx("uid-1"), &request())?;
        assert!(response.success && response.changed);
        let episode = read_episode(h.documents.as_ref(), "ep-1")?;
        assert!(episode.is_published());
        assert_eq!(
            episode.published_at,
            Some(start_time() + Duration::seconds(5))
        );
        assert_eq!(h.events_of("episode_status_changed").len(), 1);
        assert_eq!(h.events_of("publish_completed").len(), 1);
        Ok(())
    }

    #[test]
    fn republishing_is_a_successful_no_op() -> Result<()> {
        let h = harness(ScriptedModel::images());
        seed_planned_episode(h.documents.as_ref(), "ep-1", "uid-1", 2)?;
        with_panels(h.documents.as_ref(), 2)?;
        h.service.publish_episode(&ctx("uid-1"), &request())?;
        let first = read_episode(h.documents.as_ref(), "ep-1")?;

        h.clock.advance(Duration::seconds(30));
        let again = h.service.publish_episode(&ctx("uid-1"), &request())?;
        assert!(again.success);
        assert!(!again.changed);
        assert_eq!(read_episode(h.documents.as_ref(), "ep-1")?, first);
        Ok(())
    }

    #[test]
    fn unplanned_and_foreign_episodes_are_rejected() -> Result<()> {
        let h = harness(ScriptedModel::images());
        let draft = apollo_contracts::episodes::Episode::new_draft(
            "ep-1",
            "uid-1",
            "diary text here",
            4,
            start_time(),
        );
        h.documents.set(EPISODES, "ep-1", draft.to_document()?)?;

        let err = h
            .service
            .publish_episode(&ctx("uid-1"), &request())
            .expect_err("no plan");
        assert!(err.is(FailureKind::FailedPrecondition));

        let err = h
            .service
            .publish_episode(&ctx("uid-2"), &request())
            .expect_err("not owner");
        assert!(err.is(FailureKind::PermissionDenied));

        let missing = PublishRequest {
            episode_id: "ep-404".to_string(),
        };
        let err = h
            .service
            .publish_episode(&ctx("uid-1"), &missing)
            .expect_err("missing");
        assert!(err.is(FailureKind::NotFound));

        let mut settings = Settings::default();
        settings.conceal_not_found = true;
        let concealed = harness_with(ScriptedModel::images(), settings);
        let err = concealed
            .service
            .publish_episode(&ctx("uid-1"), &missing)
            .expect_err("concealed");
        assert!(err.is(FailureKind::PermissionDenied));
        Ok(())
    }

    #[test]
    fn rate_limit_applies_before_reads() -> Result<()> {
        let h = harness(ScriptedModel::images());
        let missing = PublishRequest {
            episode_id: "ep-404".to_string(),
        };
        for _ in 0..3 {
            let err = h
                .service
                .publish_episode(&ctx("uid-1"), &missing)
                .expect_err("missing");
            assert!(err.is(FailureKind::NotFound));
        }
        let err = h
            .service
            .publish_episode(&ctx("uid-1"), &missing)
            .expect_err("limited");
        assert!(err.is(FailureKind::ResourceExhausted));
        assert_eq!(err.retry_after_seconds, Some(60));
        Ok(())
    }
}
