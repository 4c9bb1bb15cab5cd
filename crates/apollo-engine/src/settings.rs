use std::env;

use apollo_contracts::rate_limit::WindowLimit;
use indexmap::IndexMap;

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_TEXT_MODEL: &str = "gemini-2.0-flash";
pub const DEFAULT_IMAGE_MODEL: &str = "gemini-2.5-flash-image-preview";

pub const ACTION_PLAN_STORYBOARD: &str = "planStoryboard";
pub const ACTION_GENERATE_PANELS: &str = "generatePanelImages";
pub const ACTION_PUBLISH: &str = "publishEpisode";
pub const ACTION_COMMENT: &str = "comment";

/// Admission policy for one action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RatePolicy {
    Single(WindowLimit),
    Dual { minute: WindowLimit, day: WindowLimit },
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub api_key: Option<String>,
    pub api_base: String,
    pub text_model: String,
    pub image_model: String,
    pub panel_concurrency: usize,
    pub request_timeout_s: f64,
    pub transport_retries: usize,
    pub retry_backoff_s: f64,
    pub conceal_not_found: bool,
    pub transactional_merge: bool,
    pub public_base_url: Option<String>,
    pub rate_policies: IndexMap<&'static str, RatePolicy>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: DEFAULT_API_BASE.to_string(),
            text_model: DEFAULT_TEXT_MODEL.to_string(),
            image_model: DEFAULT_IMAGE_MODEL.to_string(),
            panel_concurrency: 2,
            request_timeout_s: 90.0,
            transport_retries: 2,
            retry_backoff_s: 1.2,
            conceal_not_found: false,
            transactional_merge: false,
            public_base_url: None,
            rate_policies: default_rate_policies(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_key: non_empty_env("GEMINI_API_KEY").or_else(|| non_empty_env("GOOGLE_API_KEY")),
            api_base: non_empty_env("GEMINI_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or(defaults.api_base),
            text_model: non_empty_env("APOLLO_TEXT_MODEL").unwrap_or(defaults.text_model),
            image_model: non_empty_env("APOLLO_IMAGE_MODEL").unwrap_or(defaults.image_model),
            panel_concurrency: parse_usize_env("APOLLO_PANEL_CONCURRENCY", defaults.panel_concurrency)
                .clamp(1, 8),
            request_timeout_s: parse_f64_env("APOLLO_REQUEST_TIMEOUT", defaults.request_timeout_s)
                .clamp(15.0, 300.0),
            transport_retries: parse_usize_env("APOLLO_TRANSPORT_RETRIES", defaults.transport_retries)
                .min(4),
            retry_backoff_s: defaults.retry_backoff_s,
            conceal_not_found: parse_bool_env("APOLLO_CONCEAL_NOT_FOUND", false),
            transactional_merge: parse_bool_env("APOLLO_TRANSACTIONAL_MERGE", false),
            public_base_url: non_empty_env("APOLLO_PUBLIC_BASE_URL"),
            rate_policies: defaults.rate_policies,
        }
    }

    pub fn rate_policy(&self, action: &str) -> Option<RatePolicy> {
        self.rate_policies.get(action).copied()
    }
}

fn default_rate_policies() -> IndexMap<&'static str, RatePolicy> {
    let mut policies = IndexMap::new();
    policies.insert(
        ACTION_PLAN_STORYBOARD,
        RatePolicy::Single(WindowLimit::per_minute(5)),
    );
    policies.insert(
        ACTION_GENERATE_PANELS,
        RatePolicy::Single(WindowLimit::per_minute(10)),
    );
    policies.insert(ACTION_PUBLISH, RatePolicy::Single(WindowLimit::per_minute(3)));
    policies.insert(
        ACTION_COMMENT,
        RatePolicy::Dual {
            minute: WindowLimit::per_minute(3),
            day: WindowLimit::per_day(30),
        },
    );
    policies
}

pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_usize_env(key: &str, default: usize) -> usize {
    non_empty_env(key)
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_f64_env(key: &str, default: f64) -> f64 {
    non_empty_env(key)
        .and_then(|value| value.parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .unwrap_or(default)
}

fn parse_bool_env(key: &str, default: bool) -> bool {
    match non_empty_env(key).map(|value| value.to_ascii_lowercase()) {
        Some(value) => matches!(value.as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policies_cover_every_action() {
        let settings = Settings::default();
        assert_eq!(
            settings.rate_policy(ACTION_GENERATE_PANELS),
            Some(RatePolicy::Single(WindowLimit::per_minute(10)))
        );
        assert!(matches!(
            settings.rate_policy(ACTION_COMMENT),
            Some(RatePolicy::Dual { .. })
        ));
        assert_eq!(
            settings.rate_policies.keys().copied().collect::<Vec<_>>(),
            vec![
                ACTION_PLAN_STORYBOARD,
                ACTION_GENERATE_PANELS,
                ACTION_PUBLISH,
                ACTION_COMMENT
            ]
        );
        assert_eq!(settings.panel_concurrency, 2);
        assert!(!settings.conceal_not_found);
    }
}
