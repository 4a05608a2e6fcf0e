//! Key-topic extraction used when folding transcript ranges into summaries

use crate::memory::Message;
use lazy_static::lazy_static;
use std::collections::HashMap;

lazy_static! {
    static ref STOP_WORDS: Vec<&'static str> = vec![
        "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for",
        "of", "with", "by", "is", "am", "are", "was", "were", "be", "been",
        "being", "have", "has", "had", "do", "does", "did", "will", "would",
        "shall", "should", "may", "might", "must", "can", "could", "i", "you",
        "he", "she", "it", "we", "they", "me", "him", "her", "us", "them",
        "my", "your", "his", "its", "our", "their", "this", "that", "these",
        "those", "then", "than", "there", "here", "what", "when", "where",
        "which", "who", "whom", "into", "from", "just", "like", "about",
    ];
}

/// Ranks recurring significant words across a set of messages.
pub struct TopicExtractor {
    max_topics: usize,
    min_word_length: usize,
}

impl Default for TopicExtractor {
    fn default() -> Self {
        Self {
            max_topics: 5,
            min_word_length: 4,
        }
    }
}

impl TopicExtractor {
    pub fn new(max_topics: usize, min_word_length: usize) -> Self {
        Self {
            max_topics,
            min_word_length,
        }
    }

    /// Words ordered by frequency, ties broken by first appearance.
    pub fn extract_from_messages(&self, messages: &[Message]) -> Vec<String> {
        let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
        let mut order = 0usize;

        for message in messages {
            for word in message.text.split_whitespace() {
                let cleaned: String = word
                    .chars()
                    .filter(|c| c.is_alphanumeric() || *c == '\'')
                    .collect::<String>()
                    .to_lowercase();
                if !self.is_significant(&cleaned) {
                    continue;
                }
                let entry = counts.entry(cleaned).or_insert_with(|| {
                    order += 1;
                    (0, order)
                });
                entry.0 += 1;
            }
        }

        let mut ranked: Vec<(String, usize, usize)> = counts
            .into_iter()
            .map(|(word, (count, first))| (word, count, first))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));

        ranked
            .into_iter()
            .take(self.max_topics)
            .map(|(word, _, _)| word)
            .collect()
    }

    fn is_significant(&self, word: &str) -> bool {
        word.chars().count() >= self.min_word_length
            && !STOP_WORDS.contains(&word)
            && !word.chars().all(|c| c.is_ascii_digit())
    }

    pub fn is_stop_word(word: &str) -> bool {
        STOP_WORDS.contains(&word.to_lowercase().as_str())
    }
}
