//! Storyboard planning: diary text + character sheet -> validated plan.

use apollo_contracts::characters::{render_character_sheet, Character};
use apollo_contracts::episodes::paths::{CHARACTERS, EPISODES};
use apollo_contracts::episodes::{
    Episode, FinalPrompt, GlobalStyle, PanelPrompt, DEFAULT_PANEL_COUNT, MAX_CAPTION_DRAFT_CHARS,
    MAX_DIARY_CHARS, MAX_PANEL_COUNT, MIN_DIARY_CHARS, MIN_PANEL_COUNT,
};
use apollo_contracts::events::summarize_for_log;
use apollo_contracts::identity::hash_text;
use apollo_contracts::{ApiError, ApiResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::model::{ContentPart, GenerationConfig, ModelRequest, ModelResponse};
use crate::references::{ReferenceImageLoader, MAX_REFERENCE_IMAGES};
use crate::settings::ACTION_PLAN_STORYBOARD;
use crate::{validate_episode_id, CallContext, Service};

const OPERATION: &str = "storyboard";
const MIN_SHEET_CHARS: usize = 50;
const MAX_SHEET_CHARS: usize = 3000;
const PLAN_TEMPERATURE: f64 = 0.8;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStoryboardRequest {
    pub episode_id: String,
    pub diary_text: String,
    #[serde(default)]
    pub panel_count: Option<usize>,
    #[serde(default)]
    pub character_sheet_text: Option<String>,
    #[serde(default)]
    pub character_id: Option<String>,
    #[serde(default)]
    pub ref_image_paths: Vec<String>,
}

/// Plan as produced by the model, before digest and timestamp are added.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanDraft {
    pub title: String,
    pub summary: String,
    pub global: GlobalStyle,
    pub panels: Vec<PanelPrompt>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStoryboardResponse {
    pub success: bool,
    pub episode_id: String,
    pub plan: PlanDraft,
    pub remaining: u32,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("plan is not valid JSON for the storyboard schema: {0}")]
    Schema(String),
    #[error("plan has {actual} panels, expected {expected}")]
    PanelCountMismatch { expected: usize, actual: usize },
    #[error("plan panel indices are not 0..{expected}: {actual:?}")]
    IndexMismatch { expected: usize, actual: Vec<usize> },
    #[error("panel {index} caption draft exceeds {MAX_CAPTION_DRAFT_CHARS} characters")]
    CaptionTooLong { index: usize },
    #[error("panel {index} has an empty prompt")]
    EmptyPrompt { index: usize },
}

/// Parses and checks a model plan. Nothing is coerced: a wrong panel count
/// or an over-long caption is an error.
pub fn parse_plan(text: &str, panel_count: usize) -> Result<PlanDraft, PlanError> {
    let mut draft: PlanDraft =
        serde_json::from_str(text.trim()).map_err(|err| PlanError::Schema(err.to_string()))?;
    if draft.panels.len() != panel_count {
        return Err(PlanError::PanelCountMismatch {
            expected: panel_count,
            actual: draft.panels.len(),
        });
    }
    draft.panels.sort_by_key(|panel| panel.index);
    let indices = draft.panels.iter().map(|panel| panel.index).collect::<Vec<_>>();
    if indices != (0..panel_count).collect::<Vec<_>>() {
        return Err(PlanError::IndexMismatch {
            expected: panel_count,
            actual: indices,
        });
    }
    for panel in &draft.panels {
        if panel.caption_draft.chars().count() > MAX_CAPTION_DRAFT_CHARS {
            return Err(PlanError::CaptionTooLong { index: panel.index });
        }
        if panel.prompt.trim().is_empty() {
            return Err(PlanError::EmptyPrompt { index: panel.index });
        }
    }
    Ok(draft)
}

/// Structured-output schema; `panels` is pinned to exactly `panel_count`.
pub fn storyboard_schema(panel_count: usize) -> Value {
    let text = |description: &str| json!({"type": "STRING", "description": description});
    json!({
        "type": "OBJECT",
        "properties": {
            "title": text("Short, catchy episode title (15 characters or fewer)"),
            "summary": text("One or two sentence story summary"),
            "global": {
                "type": "OBJECT",
                "description": "Style applied to every panel",
                "properties": {
                    "artStyle": text("Art style, in English (e.g. cute chibi webtoon style, soft shading)"),
                    "colorPalette": text("Color palette, in English"),
                    "cameraRules": text("Camera and composition rules, in English"),
                    "typographyRules": text("Caption style rules"),
                    "negatives": text("Things to avoid, in English")
                },
                "required": ["artStyle", "colorPalette", "cameraRules", "typographyRules", "negatives"]
            },
            "panels": {
                "type": "ARRAY",
                "minItems": panel_count,
                "maxItems": panel_count,
                "items": {
                    "type": "OBJECT",
                    "properties": {
                        "index": {"type": "INTEGER", "description": "Panel order, starting at 0"},
                        "scene": text("What happens in this panel"),
                        "prompt": text("Image generation prompt in English; must restate the character's appearance"),
                        "captionDraft": text("Caption draft, 30 characters or fewer")
                    },
                    "required": ["index", "scene", "prompt", "captionDraft"]
                }
            }
        },
        "required": ["title", "summary", "global", "panels"]
    })
}

fn system_instruction(character_sheet: &str, panel_count: usize) -> String {
    format!(
        "You are an expert webtoon/instagram toon storyboard creator.\n\
         Your task is to transform a diary entry into a {panel_count}-panel comic storyboard.\n\n\
         IMPORTANT CHARACTER INFORMATION (MUST FOLLOW EXACTLY):\n{character_sheet}\n\n\
         RULES:\n\
         1. Create exactly {panel_count} panels, indexed from 0\n\
         2. Each panel must feature the character described above CONSISTENTLY\n\
         3. Every panel prompt MUST include the character's physical description\n\
         4. Keep captions short and punchy (under {MAX_CAPTION_DRAFT_CHARS} characters)\n\
         5. Vary compositions: close-up, medium shot, wide shot\n\
         6. Add visual humor and exaggeration appropriate for instagram toons\n\
         7. The style should be consistent across all panels\n\n\
         OUTPUT FORMAT: Return a valid JSON object matching the schema."
    )
}

fn user_prompt(diary_text: &str, panel_count: usize) -> String {
    format!(
        "Transform this diary entry into a {panel_count}-panel instagram toon:\n\n\
         \"\"\"\n{diary_text}\n\"\"\"\n\n\
         Create a storyboard that captures the essence and emotion of this diary entry in a cute, relatable webtoon style."
    )
}

struct ValidPlanRequest {
    diary_text: String,
    panel_count: usize,
    sheet_text: Option<String>,
    character_id: Option<String>,
}

fn validate(request: &PlanStoryboardRequest) -> ApiResult<ValidPlanRequest> {
    validate_episode_id(&request.episode_id)?;
    let diary_text = request.diary_text.trim().to_string();
    let diary_chars = diary_text.chars().count();
    if !(MIN_DIARY_CHARS..=MAX_DIARY_CHARS).contains(&diary_chars) {
        return Err(ApiError::invalid_argument(format!(
            "diaryText must be {MIN_DIARY_CHARS}-{MAX_DIARY_CHARS} characters."
        )));
    }
    let panel_count = request.panel_count.unwrap_or(DEFAULT_PANEL_COUNT);
    if !(MIN_PANEL_COUNT..=MAX_PANEL_COUNT).contains(&panel_count) {
        return Err(ApiError::invalid_argument(format!(
            "panelCount must be between {MIN_PANEL_COUNT} and {MAX_PANEL_COUNT}."
        )));
    }
    let sheet_text = request
        .character_sheet_text
        .as_deref()
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string);
    if let Some(sheet) = sheet_text.as_ref() {
        let chars = sheet.chars().count();
        if !(MIN_SHEET_CHARS..=MAX_SHEET_CHARS).contains(&chars) {
            return Err(ApiError::invalid_argument(format!(
                "characterSheetText must be {MIN_SHEET_CHARS}-{MAX_SHEET_CHARS} characters."
            )));
        }
    }
    let character_id = request
        .character_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string);
    if sheet_text.is_none() && character_id.is_none() {
        return Err(ApiError::invalid_argument(
            "Provide characterSheetText or characterId.",
        ));
    }
    if let Some(id) = character_id.as_deref() {
        if id.contains('/') || id.chars().count() > 128 {
            return Err(ApiError::invalid_argument("characterId is malformed."));
        }
    }
    if request.ref_image_paths.len() > MAX_REFERENCE_IMAGES {
        return Err(ApiError::invalid_argument(format!(
            "At most {MAX_REFERENCE_IMAGES} reference images are allowed."
        )));
    }
    Ok(ValidPlanRequest {
        diary_text,
        panel_count,
        sheet_text,
        character_id,
    })
}

impl Service {
    /// Plans (or re-plans) an episode and upserts it as a draft owned by the
    /// caller.
    pub fn plan_storyboard(
        &self,
        ctx: &CallContext,
        request: &PlanStoryboardRequest,
    ) -> ApiResult<PlanStoryboardResponse> {
        self.events.log(
            "storyboard_requested",
            json!({
                "episode_id": request.episode_id,
                "diary_summary": summarize_for_log(&request.diary_text, 50),
                "panel_count": request.panel_count,
                "character_id": request.character_id,
                "ref_image_count": request.ref_image_paths.len(),
            }),
        );
        let result = self.plan_storyboard_inner(ctx, request);
        self.log_outcome(OPERATION, result)
    }

    fn plan_storyboard_inner(
        &self,
        ctx: &CallContext,
        request: &PlanStoryboardRequest,
    ) -> ApiResult<PlanStoryboardResponse> {
        let uid = ctx.require_uid()?;
        let valid = validate(request)?;
        let admission = self.admit(ctx, ACTION_PLAN_STORYBOARD)?;
        let episode_id = request.episode_id.as_str();

        let character = match valid.character_id.as_deref() {
            Some(id) => Some(self.load_character(id)?),
            None => None,
        };
        let sheet = match (valid.sheet_text.as_ref(), character.as_ref()) {
            (Some(text), _) => text.clone(),
            (None, Some(character)) => render_character_sheet(character),
            (None, None) => {
                return Err(ApiError::invalid_argument(
                    "Provide characterSheetText or characterId.",
                ))
            }
        };
        let ref_paths: Vec<String> = if request.ref_image_paths.is_empty() {
            character
                .as_ref()
                .map(|character| {
                    character
                        .reference_image_paths
                        .iter()
                        .take(MAX_REFERENCE_IMAGES)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        } else {
            request.ref_image_paths.clone()
        };

        if let Some(existing) = self.load_episode(OPERATION, episode_id)? {
            check_replannable(&existing, uid)?;
        }

        let references = ReferenceImageLoader::new(self.blobs.clone())
            .load(&ref_paths, MAX_REFERENCE_IMAGES);
        let mut contents = references.to_parts();
        contents.push(ContentPart::text(user_prompt(&valid.diary_text, valid.panel_count)));
        let model_request = ModelRequest {
            model: self.settings.text_model.clone(),
            system_instruction: Some(system_instruction(&sheet, valid.panel_count)),
            contents,
            config: GenerationConfig::structured_json(
                storyboard_schema(valid.panel_count),
                PLAN_TEMPERATURE,
            ),
        };
        let payload = self
            .model
            .generate(&model_request)
            .map_err(|err| self.internal(OPERATION, err.context("storyboard model call failed")))?;
        let draft = ModelResponse::parse(payload)
            .and_then(|response| response.text())
            .map_err(|err| err.to_string())
            .and_then(|text| parse_plan(&text, valid.panel_count).map_err(|err| err.to_string()));
        let draft = match draft {
            Ok(draft) => draft,
            Err(reason) => {
                self.events.log(
                    "storyboard_plan_invalid",
                    json!({
                        "episode_id": episode_id,
                        "expected_panels": valid.panel_count,
                        "reason": reason,
                    }),
                );
                return Err(ApiError::internal(
                    "Storyboard generation failed. Please try again.",
                ));
            }
        };

        let now = self.clock.now();
        let plan = FinalPrompt {
            title: draft.title.clone(),
            summary: draft.summary.clone(),
            global: draft.global.clone(),
            panels: draft.panels.clone(),
            character_sheet_digest: hash_text(&sheet),
            generated_at: now,
        };
        let mut rejection: Option<ApiError> = None;
        self.documents
            .transact(EPISODES, episode_id, &mut |current: Option<&Value>| {
                let mut episode = match current {
                    Some(doc) => {
                        let existing = Episode::from_document(episode_id, doc.clone())?;
                        if let Err(err) = check_replannable(&existing, uid) {
                            rejection = Some(err);
                            return Ok(None);
                        }
                        existing
                    }
                    None => Episode::new_draft(
                        episode_id,
                        uid,
                        valid.diary_text.clone(),
                        valid.panel_count,
                        now,
                    ),
                };
                episode.diary_text = valid.diary_text.clone();
                episode.ref_image_paths = ref_paths.clone();
                episode.apply_plan(plan.clone(), now);
                episode.to_document().map(Some)
            })
            .map_err(|err| self.internal(OPERATION, err))?;
        if let Some(err) = rejection {
            return Err(err);
        }

        self.events.log(
            "storyboard_completed",
            json!({
                "episode_id": episode_id,
                "title": summarize_for_log(&draft.title, 50),
                "panels": draft.panels.len(),
                "character_sheet_digest": plan.character_sheet_digest,
                "references_loaded": references.images.len(),
            }),
        );
        Ok(PlanStoryboardResponse {
            success: true,
            episode_id: episode_id.to_string(),
            plan: draft,
            remaining: admission.remaining,
        })
    }

    fn load_character(&self, character_id: &str) -> ApiResult<Character> {
        let doc = self
            .documents
            .get(CHARACTERS, character_id)
            .map_err(|err| self.internal(OPERATION, err))?
            .ok_or_else(|| ApiError::not_found("Character not found."))?;
        Character::from_document(character_id, doc).map_err(|err| self.internal(OPERATION, err))
    }
}

fn check_replannable(existing: &Episode, uid: &str) -> ApiResult<()> {
    if !existing.is_owned_by(uid) {
        return Err(ApiError::permission_denied(
            "You can only modify your own episodes.",
        ));
    }
    if existing.is_published() {
        return Err(ApiError::failed_precondition(
            "Published episodes cannot be re-planned.",
        ));
    }
    Ok(())
}
