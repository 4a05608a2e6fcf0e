//! Efficient text processing utilities

use std::borrow::Cow;
use regex::Regex;
use lazy_static::lazy_static;

lazy_static! {
    static ref WHITESPACE_REGEX: Regex = Regex::new(r"\s+").unwrap();
}

/// Roughly four characters per model token.
pub const CHARS_PER_TOKEN: usize = 4;

pub struct TextUtils;

impl TextUtils {
    /// Language-agnostic token estimate: `ceil(chars / 4)`.
    pub fn estimate_tokens(text: &str) -> usize {
        text.chars().count().div_ceil(CHARS_PER_TOKEN)
    }

    pub fn contains_ignore_case(text: &str, pattern: &str) -> bool {
        if pattern.is_empty() {
            return false;
        }
        text.to_lowercase().contains(&pattern.to_lowercase())
    }

    /// Number of distinct `terms` present in `text_lower`.
    ///
    /// `text_lower` must already be lowercased; terms are lowercased here.
    pub fn count_distinct_terms<S: AsRef<str>>(text_lower: &str, terms: &[S]) -> usize {
        let mut seen: Vec<String> = Vec::new();
        for term in terms {
            let term = term.as_ref().trim().to_lowercase();
            if term.is_empty() || seen.contains(&term) {
                continue;
            }
            if text_lower.contains(&term) {
                seen.push(term);
            }
        }
        seen.len()
    }

    pub fn normalize_whitespace(text: &str) -> Cow<'_, str> {
        if WHITESPACE_REGEX.is_match(text) {
            Cow::Owned(WHITESPACE_REGEX.replace_all(text, " ").trim().to_string())
        } else {
            Cow::Borrowed(text)
        }
    }

    /// Truncate to at most `max_chars` characters, ending with an ellipsis.
    pub fn truncate_with_ellipsis(text: &str, max_chars: usize) -> Cow<'_, str> {
        if text.chars().count() <= max_chars {
            Cow::Borrowed(text)
        } else if max_chars <= 3 {
            Cow::Borrowed("...")
        } else {
            let mut result: String = text.chars().take(max_chars - 3).collect();
            result.push_str("...");
            Cow::Owned(result)
        }
    }

    pub fn count_words(text: &str) -> usize {
        text.split_whitespace().count()
    }
}
