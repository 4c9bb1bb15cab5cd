use std::collections::BTreeSet;

use anyhow::Context;
use apollo_contracts::episodes::paths::{episode_panel, EPISODES};
use apollo_contracts::episodes::{Episode, FinalPrompt, Panel};
use apollo_contracts::events::summarize_for_log;
use apollo_contracts::identity::hash_text;
use apollo_contracts::{ApiError, ApiResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::executor::{run_bounded, Task, TaskOutcome};
use crate::prompt::AspectRatio;
use crate::references::{ReferenceImageLoader, MAX_REFERENCE_IMAGES};
use crate::settings::ACTION_GENERATE_PANELS;
use crate::worker::{PanelOutcome, PanelWorker};
use crate::{validate_episode_id, CallContext, Service};

const OPERATION: &str = "panel_images";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratePanelImagesRequest {
    pub episode_id: String,
    #[serde(default)]
    pub aspect_ratio: Option<String>,
    #[serde(default)]
    pub ref_image_paths: Vec<String>,
    #[serde(default)]
    pub indices: Option<Vec<i64>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedPanel {
    pub index: usize,
    pub image_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratePanelImagesResponse {
    pub success: bool,
    pub episode_id: String,
    pub generated: Vec<GeneratedPanel>,
    pub failed: Vec<usize>,
    pub message: String,
}

struct ValidRequest {
    aspect_ratio: AspectRatio,
    indices: Option<Vec<usize>>,
}

fn validate(request: &GeneratePanelImagesRequest) -> ApiResult<ValidRequest> {
    validate_episode_id(&request.episode_id)?;
    let aspect_ratio = match request.aspect_ratio.as_deref().map(str::trim) {
        None | Some("") => AspectRatio::default(),
        Some(raw) => AspectRatio::parse(raw).ok_or_else(|| {
            ApiError::invalid_argument(format!(
                "aspectRatio must be one of 4:5, 9:16, 1:1 (got {raw})."
            ))
        })?,
    };
    if request.ref_image_paths.len() > MAX_REFERENCE_IMAGES {
        return Err(ApiError::invalid_argument(format!(
            "At most {MAX_REFERENCE_IMAGES} reference images are allowed."
        )));
    }
    let indices = match request.indices.as_ref() {
        None => None,
        Some(raw) => {
            let mut indices = Vec::with_capacity(raw.len());
            for value in raw {
                let index = usize::try_from(*value).map_err(|_| {
                    ApiError::invalid_argument("indices must be non-negative integers.")
                })?;
                indices.push(index);
            }
            Some(indices)
        }
    };
    Ok(ValidRequest {
        aspect_ratio,
        indices,
    })
}

/// Explicit indices filtered to the plan (first occurrence wins), or every
/// planned index.
fn target_indices(plan: &FinalPrompt, requested: Option<&[usize]>) -> Vec<usize> {
    match requested {
        None => plan.indices(),
        Some(requested) => {
            let mut seen = BTreeSet::new();
            requested
                .iter()
                .copied()
                .filter(|index| plan.panel(*index).is_some())
                .filter(|index| seen.insert(*index))
                .collect()
        }
    }
}

/// Regenerated panels keep a caption the author already set.
fn carry_captions(existing: &[Panel], generated: &[Panel]) -> Vec<Panel> {
    generated
        .iter()
        .map(|panel| {
            let kept = existing
                .iter()
                .find(|old| old.index == panel.index && !old.caption.trim().is_empty())
                .map(|old| old.caption.clone());
            Panel {
                caption: kept.unwrap_or_else(|| panel.caption.clone()),
                ..panel.clone()
            }
        })
        .collect()
}

fn summary_message(generated: usize, failed: &[usize]) -> String {
    if failed.is_empty() {
        return format!("Generated {generated} panel image(s).");
    }
    let list = failed
        .iter()
        .map(usize::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "{generated} succeeded, {} failed. Failed panels: [{list}]",
        failed.len()
    )
}

impl Service {
    /// Generates (or regenerates) panel images for a planned episode.
    ///
    /// Call-fatal problems (input, admission, ownership, missing plan) are
    /// returned as `ApiError` before anything is written. Per-panel
    /// generation or upload failures are reported in `failed` and retried by
    /// calling again with `indices`.
    pub fn generate_panel_images(
        &self,
        ctx: &CallContext,
        request: &GeneratePanelImagesRequest,
    ) -> ApiResult<GeneratePanelImagesResponse> {
        self.events.log(
            "panel_images_requested",
            json!({
                "episode_id": request.episode_id,
                "aspect_ratio": request.aspect_ratio,
                "ref_image_count": request.ref_image_paths.len(),
                "indices": request.indices,
            }),
        );
        let result = self.generate_panel_images_inner(ctx, request);
        self.log_outcome(OPERATION, result)
    }

    fn generate_panel_images_inner(
        &self,
        ctx: &CallContext,
        request: &GeneratePanelImagesRequest,
    ) -> ApiResult<GeneratePanelImagesResponse> {
        let uid = ctx.require_uid()?;
        let valid = validate(request)?;
        self.admit(ctx, ACTION_GENERATE_PANELS)?;

        let episode_id = request.episode_id.as_str();
        let episode = self.load_owned_episode(OPERATION, episode_id, uid)?;
        let Some(plan) = episode.final_prompt.as_ref() else {
            return Err(ApiError::failed_precondition(
                "No storyboard yet. Plan the storyboard before generating images.",
            ));
        };
        let targets = target_indices(plan, valid.indices.as_deref());
        if targets.is_empty() {
            return Err(ApiError::invalid_argument("No panels to generate."));
        }

        let reference_paths = if request.ref_image_paths.is_empty() {
            &episode.ref_image_paths
        } else {
            &request.ref_image_paths
        };
        let references = ReferenceImageLoader::new(self.blobs.clone())
            .load(reference_paths, MAX_REFERENCE_IMAGES);
        self.events.log(
            "reference_images_loaded",
            json!({
                "episode_id": episode_id,
                "requested": reference_paths.len().min(MAX_REFERENCE_IMAGES),
                "loaded": references.images.len(),
                "skipped": references
                    .skipped
                    .iter()
                    .map(|(path, reason)| json!({"path": path, "reason": summarize_for_log(reason, 120)}))
                    .collect::<Vec<_>>(),
            }),
        );
        let reference_parts = references.to_parts();

        let worker = PanelWorker::new(
            self.model.as_ref(),
            &self.settings.image_model,
            &plan.global,
            valid.aspect_ratio,
            &reference_parts,
        );
        let tasks: Vec<Task<'_, PanelOutcome>> = targets
            .iter()
            .map(|&index| {
                let worker = &worker;
                let panel_prompt = plan.panel(index).map(|panel| panel.prompt.clone());
                Box::new(move || -> anyhow::Result<PanelOutcome> {
                    Ok(match panel_prompt {
                        Some(prompt) => worker.generate(index, &prompt),
                        None => PanelOutcome::failed(index, "panel prompt not found"),
                    })
                }) as Task<'_, PanelOutcome>
            })
            .collect();
        let outcomes = run_bounded(tasks, self.settings.panel_concurrency)
            .into_iter()
            .zip(targets.iter())
            .map(|(outcome, &index)| match outcome {
                TaskOutcome::Completed(outcome) => outcome,
                TaskOutcome::Failed(error) => PanelOutcome::failed(index, error),
            })
            .collect::<Vec<_>>();

        let mut saved: Vec<Panel> = Vec::new();
        let mut failed: Vec<usize> = Vec::new();
        for outcome in outcomes {
            match outcome {
                PanelOutcome::Failed { index, error } => {
                    self.events.log(
                        "panel_failed",
                        json!({
                            "episode_id": episode_id,
                            "index": index,
                            "stage": "generate",
                            "error": summarize_for_log(&error, 200),
                        }),
                    );
                    failed.push(index);
                }
                PanelOutcome::Generated {
                    index,
                    bytes,
                    mime_type,
                } => {
                    let path = episode_panel(episode_id, index);
                    match self.store_panel(&path, &bytes, &mime_type) {
                        Ok(()) => {
                            self.events.log(
                                "panel_saved",
                                json!({
                                    "episode_id": episode_id,
                                    "index": index,
                                    "image_path": path,
                                    "bytes": bytes.len(),
                                }),
                            );
                            saved.push(Panel {
                                index,
                                image_path: path,
                                caption: plan
                                    .panel(index)
                                    .map(|panel| panel.caption_draft.clone())
                                    .unwrap_or_default(),
                            });
                        }
                        Err(err) => {
                            self.events.log(
                                "panel_failed",
                                json!({
                                    "episode_id": episode_id,
                                    "index": index,
                                    "stage": "upload",
                                    "error": crate::error_chain_text(&err, 200),
                                }),
                            );
                            failed.push(index);
                        }
                    }
                }
            }
        }

        if !saved.is_empty() {
            if let Err(err) = self.persist_panels(&episode, &saved) {
                self.events.log(
                    "panel_failed",
                    json!({
                        "episode_id": episode_id,
                        "indices": saved.iter().map(|panel| panel.index).collect::<Vec<_>>(),
                        "stage": "persist",
                        "error": crate::error_chain_text(&err, 200),
                    }),
                );
                failed.extend(saved.drain(..).map(|panel| panel.index));
            }
        }
        failed.sort_unstable();

        let response = GeneratePanelImagesResponse {
            success: failed.is_empty(),
            episode_id: episode_id.to_string(),
            message: summary_message(saved.len(), &failed),
            generated: saved
                .iter()
                .map(|panel| GeneratedPanel {
                    index: panel.index,
                    image_path: panel.image_path.clone(),
                })
                .collect(),
            failed,
        };
        self.events.log(
            "panel_images_completed",
            json!({
                "episode_id": episode_id,
                "client_ip_hash": hash_text(&ctx.client_ip),
                "successful": response.generated.len(),
                "failed": response.failed,
            }),
        );
        Ok(response)
    }

    fn store_panel(&self, path: &str, bytes: &[u8], mime_type: &str) -> anyhow::Result<()> {
        self.blobs
            .put(path, bytes, mime_type)
            .with_context(|| format!("failed to upload {path}"))?;
        self.blobs
            .make_public(path)
            .with_context(|| format!("failed to publish {path}"))?;
        Ok(())
    }

    /// One write per invocation. The default is a plain read-modify-write on
    /// the episode loaded at the start of the call; `transactional_merge`
    /// re-reads and merges inside a store transaction instead.
    fn persist_panels(&self, loaded: &Episode, saved: &[Panel]) -> anyhow::Result<()> {
        let now = self.clock.now();
        if self.settings.transactional_merge {
            let episode_id = loaded.id.clone();
            self.documents
                .transact(EPISODES, &episode_id, &mut |current: Option<&Value>| {
                    let doc = current
                        .cloned()
                        .with_context(|| format!("episode {episode_id} disappeared"))?;
                    let mut latest = Episode::from_document(&episode_id, doc)?;
                    let panels = carry_captions(&latest.panels, saved);
                    latest.merge_generated(&panels, now);
                    latest.to_document().map(Some)
                })?;
        } else {
            let mut merged = loaded.clone();
            let panels = carry_captions(&merged.panels, saved);
            merged.merge_generated(&panels, now);
            let mut fields = Map::new();
            fields.insert("panels".to_string(), serde_json::to_value(&merged.panels)?);
            if let Some(thumb) = merged.thumb_path.as_ref() {
                fields.insert("thumbPath".to_string(), json!(thumb));
            }
            fields.insert("updatedAt".to_string(), serde_json::to_value(now)?);
            self.documents
                .update(EPISODES, &loaded.id, fields)
                .with_context(|| format!("failed to update episode {}", loaded.id))?;
        }
        self.events.log(
            "episode_panels_updated",
            json!({
                "episode_id": loaded.id,
                "indices": saved.iter().map(|panel| panel.index).collect::<Vec<_>>(),
                "transactional": self.settings.transactional_merge,
            }),
        );
        Ok(())
    }
}
