mod merge;
mod model;
pub mod paths;

pub use merge::{merge_panels, thumb_path_for};
pub use model::{
    Episode, EpisodeStatus, FinalPrompt, GlobalStyle, Panel, PanelPrompt, DEFAULT_PANEL_COUNT,
    MAX_CAPTION_DRAFT_CHARS, MAX_DIARY_CHARS, MAX_PANEL_COUNT, MIN_DIARY_CHARS, MIN_PANEL_COUNT,
};
