use std::sync::OnceLock;

use regex::Regex;

use super::model::{CommentModeration, ModerationReason};

const BANNED_WORDS: [&str; 17] = [
    "시발", "씨발", "병신", "지랄", "개새끼", "좆", "닥쳐", "썅", "미친년", "미친놈", "fuck",
    "shit", "bitch", "asshole", "dick", "pussy", "cunt",
];

const REPEATED_CHAR_RUN: usize = 5;

fn url_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?i)(https?://|www\.|\.com|\.net|\.org|\.kr|\.io)").ok())
        .as_ref()
}

fn spam_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)카톡|카카오톡|텔레그램",
            r"\d{3}[-\s]?\d{3,4}[-\s]?\d{4}",
            r"광고|홍보|할인|이벤트",
        ]
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
    })
}

fn has_repeated_run(text: &str, run: usize) -> bool {
    let mut previous = None;
    let mut length = 0;
    for ch in text.chars() {
        if Some(ch) == previous {
            length += 1;
        } else {
            previous = Some(ch);
            length = 1;
        }
        if length >= run {
            return true;
        }
    }
    false
}

/// Classifies comment text. Checks run in a fixed order and the first hit
/// decides the reason; flagged comments are still stored.
pub fn moderate_content(text: &str) -> CommentModeration {
    if text.is_empty() {
        return CommentModeration::clean();
    }
    let lowered = text.to_lowercase();
    if BANNED_WORDS.iter().any(|word| lowered.contains(word)) {
        return CommentModeration::flagged(ModerationReason::BannedWord);
    }
    if url_pattern().is_some_and(|pattern| pattern.is_match(text)) {
        return CommentModeration::flagged(ModerationReason::UrlDetected);
    }
    if has_repeated_run(text, REPEATED_CHAR_RUN) {
        return CommentModeration::flagged(ModerationReason::RepeatedChars);
    }
    if spam_patterns().iter().any(|pattern| pattern.is_match(text)) {
        return CommentModeration::flagged(ModerationReason::SpamPattern);
    }
    CommentModeration::clean()
}
