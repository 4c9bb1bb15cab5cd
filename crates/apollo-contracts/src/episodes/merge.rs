use std::collections::BTreeMap;

use super::model::Panel;

/// Merges `incoming` into `existing` by panel index.
///
/// Incoming panels replace existing panels with the same index, panels not
/// mentioned in `incoming` are kept untouched, and the result is sorted by
/// index with at most one panel per index. Merging the same batch twice
/// yields the same list.
pub fn merge_panels(existing: &[Panel], incoming: &[Panel]) -> Vec<Panel> {
    let mut by_index: BTreeMap<usize, Panel> = BTreeMap::new();
    for panel in existing.iter().chain(incoming.iter()) {
        by_index.insert(panel.index, panel.clone());
    }
    by_index.into_values().collect()
}

/// Thumbnail source: the image of panel 0, when present.
pub fn thumb_path_for(panels: &[Panel]) -> Option<String> {
    panels
        .iter()
        .find(|panel| panel.index == 0)
        .map(|panel| panel.image_path.clone())
}
