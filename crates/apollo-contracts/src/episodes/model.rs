use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::merge::{merge_panels, thumb_path_for};

pub const MIN_PANEL_COUNT: usize = 2;
pub const MAX_PANEL_COUNT: usize = 10;
pub const DEFAULT_PANEL_COUNT: usize = 4;
pub const MIN_DIARY_CHARS: usize = 10;
pub const MAX_DIARY_CHARS: usize = 5000;
pub const MAX_CAPTION_DRAFT_CHARS: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpisodeStatus {
    Draft,
    Published,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalStyle {
    pub art_style: String,
    pub color_palette: String,
    pub camera_rules: String,
    pub typography_rules: String,
    pub negatives: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PanelPrompt {
    pub index: usize,
    pub scene: String,
    pub prompt: String,
    pub caption_draft: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalPrompt {
    pub title: String,
    pub summary: String,
    pub global: GlobalStyle,
    pub panels: Vec<PanelPrompt>,
    pub character_sheet_digest: String,
    pub generated_at: DateTime<Utc>,
}

impl FinalPrompt {
    pub fn panel(&self, index: usize) -> Option<&PanelPrompt> {
        self.panels.iter().find(|panel| panel.index == index)
    }

    pub fn indices(&self) -> Vec<usize> {
        self.panels.iter().map(|panel| panel.index).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Panel {
    pub index: usize,
    pub image_path: String,
    #[serde(default)]
    pub caption: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Episode {
    pub id: String,
    pub status: EpisodeStatus,
    #[serde(default)]
    pub title: String,
    pub diary_text: String,
    pub panel_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_prompt: Option<FinalPrompt>,
    #[serde(default)]
    pub panels: Vec<Panel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumb_path: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ref_image_paths: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    pub creator_uid: String,
}

impl Episode {
    pub fn new_draft(
        id: impl Into<String>,
        creator_uid: impl Into<String>,
        diary_text: impl Into<String>,
        panel_count: usize,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            status: EpisodeStatus::Draft,
            title: String::new(),
            diary_text: diary_text.into(),
            panel_count,
            final_prompt: None,
            panels: Vec::new(),
            thumb_path: None,
            ref_image_paths: Vec::new(),
            created_at: now,
            updated_at: now,
            published_at: None,
            creator_uid: creator_uid.into(),
        }
    }

    pub fn from_document(id: &str, doc: Value) -> anyhow::Result<Self> {
        let mut episode: Episode = serde_json::from_value(doc)
            .with_context(|| format!("episode document {id} has an unexpected shape"))?;
        if episode.id.is_empty() {
            episode.id = id.to_string();
        }
        Ok(episode)
    }

    pub fn to_document(&self) -> anyhow::Result<Value> {
        serde_json::to_value(self).context("episode serialization failed")
    }

    pub fn is_published(&self) -> bool {
        self.status == EpisodeStatus::Published
    }

    pub fn is_owned_by(&self, uid: &str) -> bool {
        self.creator_uid == uid
    }

    pub fn planned_panel_count(&self) -> Option<usize> {
        self.final_prompt.as_ref().map(|plan| plan.panels.len())
    }

    /// True when every planned panel has a generated image.
    pub fn has_all_panels(&self) -> bool {
        match self.planned_panel_count() {
            Some(planned) => self.panels.len() >= planned,
            None => false,
        }
    }

    /// Replaces the plan. Re-planning is an overwrite, never an append, and
    /// drops panels generated for the previous plan.
    pub fn apply_plan(&mut self, plan: FinalPrompt, now: DateTime<Utc>) {
        self.title = plan.title.clone();
        self.panel_count = plan.panels.len();
        self.final_prompt = Some(plan);
        self.panels.clear();
        self.thumb_path = None;
        self.updated_at = now;
    }

    /// Merges freshly generated panels by index and recomputes the
    /// thumbnail from panel 0.
    pub fn merge_generated(&mut self, generated: &[Panel], now: DateTime<Utc>) {
        self.panels = merge_panels(&self.panels, generated);
        if let Some(thumb) = thumb_path_for(&self.panels) {
            self.thumb_path = Some(thumb);
        }
        self.updated_at = now;
    }

    /// Monotonic draft -> published. Returns false when already published.
    pub fn publish(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_published() {
            return false;
        }
        self.status = EpisodeStatus::Published;
        self.published_at = Some(now);
        self.updated_at = now;
        true
    }
}
