pub const EPISODES: &str = "episodes";
pub const CHARACTERS: &str = "characters";
pub const RATE_LIMITS: &str = "rateLimits";

pub fn comments_collection(episode_id: &str) -> String {
    format!("{EPISODES}/{episode_id}/comments")
}

pub fn episode_panel(episode_id: &str, index: usize) -> String {
    format!("{EPISODES}/{episode_id}/panels/{index}.png")
}

pub fn episode_ref(episode_id: &str, filename: &str) -> String {
    format!("{EPISODES}/{episode_id}/refs/{filename}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panel_paths_are_deterministic() {
        assert_eq!(episode_panel("ep-1", 3), "episodes/ep-1/panels/3.png");
        assert_eq!(episode_ref("ep-1", "me.jpg"), "episodes/ep-1/refs/me.jpg");
        assert_eq!(comments_collection("ep-1"), "episodes/ep-1/comments");
    }
}
