use apollo_contracts::episodes::paths::EPISODES;
use apollo_contracts::episodes::Episode;
use apollo_contracts::{ApiError, ApiResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::Service;

const OPERATION: &str = "gallery";
pub const DEFAULT_PAGE_SIZE: usize = 12;
pub const MAX_PAGE_SIZE: usize = 50;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GalleryRequest {
    #[serde(default)]
    pub page_size: Option<usize>,
    /// Id of the last episode of the previous page.
    #[serde(default)]
    pub after: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GalleryItem {
    pub id: String,
    pub title: String,
    pub thumb_path: Option<String>,
    pub panel_count: usize,
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GalleryPage {
    pub episodes: Vec<GalleryItem>,
    pub next_cursor: Option<String>,
}

impl From<&Episode> for GalleryItem {
    fn from(episode: &Episode) -> Self {
        Self {
            id: episode.id.clone(),
            title: episode.title.clone(),
            thumb_path: episode.thumb_path.clone(),
            panel_count: episode.panels.len(),
            published_at: episode.published_at,
        }
    }
}

impl Service {
    /// Published episodes, newest first.
    pub fn list_published(&self, request: &GalleryRequest) -> ApiResult<GalleryPage> {
        self.events.log(
            "gallery_requested",
            json!({"page_size": request.page_size, "after": request.after}),
        );
        let result = self.list_published_inner(request);
        if let Ok(page) = &result {
            self.events.log(
                "gallery_completed",
                json!({"returned": page.episodes.len(), "has_more": page.next_cursor.is_some()}),
            );
        }
        self.log_outcome(OPERATION, result)
    }

    fn list_published_inner(&self, request: &GalleryRequest) -> ApiResult<GalleryPage> {
        let page_size = request.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
        if !(1..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(ApiError::invalid_argument(format!(
                "pageSize must be between 1 and {MAX_PAGE_SIZE}."
            )));
        }
        let docs = self
            .documents
            .list(EPISODES)
            .map_err(|err| self.internal(OPERATION, err))?;
        let mut published = Vec::new();
        for (id, doc) in docs {
            let episode =
                Episode::from_document(&id, doc).map_err(|err| self.internal(OPERATION, err))?;
            if episode.is_published() {
                published.push(episode);
            }
        }
        published.sort_by(|a, b| {
            b.published_at
                .cmp(&a.published_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        let start = match request.after.as_deref().filter(|cursor| !cursor.is_empty()) {
            None => 0,
            Some(cursor) => published
                .iter()
                .position(|episode| episode.id == cursor)
                .map(|position| position + 1)
                .ok_or_else(|| ApiError::invalid_argument("Unknown gallery cursor."))?,
        };
        let page = published
            .iter()
            .skip(start)
            .take(page_size)
            .map(GalleryItem::from)
            .collect::<Vec<_>>();
        let next_cursor = if start + page.len() < published.len() {
            page.last().map(|item| item.id.clone())
        } else {
            None
        };
        Ok(GalleryPage {
            episodes: page,
            next_cursor,
        })
    }
}
