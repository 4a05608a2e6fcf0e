//! Heuristic scene segmentation over a session transcript
//!
//! Messages are cut into candidate groups at long silences, explicit
//! transition phrases, or a size cap. Each large enough group goes through a
//! `SceneAnalyzer`; promotion to an `AutoScene` needs at least one key event
//! and a confidence strictly above the configured minimum. Confidence is a
//! linear score over event and participant counts, not a classifier, so it
//! errs towards missing scenes rather than inventing them.

use crate::config::SceneDetectionConfig;
use crate::memory::{AutoScene, Message, Role};
use crate::utils::TextUtils;
use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Arc;
use tracing::debug;

lazy_static! {
    static ref TRANSITION_REGEX: Regex = Regex::new(
        r"(?i)\b(meanwhile|later that (day|night|evening)|the next (morning|day|night)|hours later|days later|some time later|scene change|elsewhere)\b"
    )
    .unwrap();

    static ref EVENT_FAMILIES: Vec<(&'static str, Regex)> = vec![
        ("combat", Regex::new(r"(?i)\b(attacks?|attacked|initiative|fights?|battle|strikes?|ambush\w*|damage|hit points|swings?)\b").unwrap()),
        ("discovery", Regex::new(r"(?i)\b(discover\w*|finds?|found|reveal\w*|hidden|secret|notices?|uncover\w*)\b").unwrap()),
        ("social", Regex::new(r"(?i)\b(persuad\w*|negotiat\w*|bargain\w*|convinc\w*|intimidat\w*|deceiv\w*|charm\w*|diplomacy)\b").unwrap()),
        ("travel", Regex::new(r"(?i)\b(travel\w*|journey\w*|rides?|sails?|arriv\w*|march\w*|set off|sets out|road)\b").unwrap()),
        ("rest", Regex::new(r"(?i)\b(long rest|short rest|rests?|camps?|sleeps?|inn)\b").unwrap()),
        ("quest", Regex::new(r"(?i)\b(quests?|missions?|bounty|contract|objective)\b").unwrap()),
        ("loot", Regex::new(r"(?i)\b(loot\w*|treasure|gold|coins?|chests?|gems?|reward\w*)\b").unwrap()),
    ];
}

const DESCRIPTION_MAX_CHARS: usize = 160;

/// What an analyzer found in one candidate group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SceneAnalysis {
    pub participants: Vec<String>,
    pub key_events: Vec<String>,
    pub title: String,
    pub description: String,
}

/// Pluggable scene heuristics.
pub trait SceneAnalyzer: Send + Sync {
    fn analyze(&self, messages: &[Message]) -> SceneAnalysis;
}

/// Keyword families over message text; participants from speakers.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeywordSceneAnalyzer;

impl KeywordSceneAnalyzer {
    /// Speaker names in order of first appearance. Unnamed user turns count
    /// as "Player", unnamed narration as "Narrator"; system lines never count.
    pub fn participants(messages: &[Message]) -> Vec<String> {
        let mut participants: Vec<String> = Vec::new();
        for message in messages {
            let name = match (&message.speaker_name, message.role) {
                (_, Role::System) => continue,
                (Some(name), _) if !name.trim().is_empty() => name.trim().to_string(),
                (_, Role::User) => "Player".to_string(),
                (_, Role::Assistant) => "Narrator".to_string(),
            };
            if !participants.contains(&name) {
                participants.push(name);
            }
        }
        participants
    }

    pub fn key_events(messages: &[Message]) -> Vec<String> {
        EVENT_FAMILIES
            .iter()
            .filter(|(_, regex)| messages.iter().any(|m| regex.is_match(&m.text)))
            .map(|(family, _)| family.to_string())
            .collect()
    }
}

impl SceneAnalyzer for KeywordSceneAnalyzer {
    fn analyze(&self, messages: &[Message]) -> SceneAnalysis {
        let participants = Self::participants(messages);
        let key_events = Self::key_events(messages);

        let title = match key_events.first() {
            Some(event) => {
                let mut title = capitalize(event);
                if let Some(lead) = participants.first() {
                    title.push_str(" with ");
                    title.push_str(lead);
                }
                title
            }
            None => "Quiet interlude".to_string(),
        };

        let opening = messages
            .iter()
            .find(|m| m.role != Role::System)
            .map(|m| TextUtils::normalize_whitespace(&m.text).into_owned())
            .unwrap_or_default();
        let description = format!(
            "{} messages [{}] involving {}: {}",
            messages.len(),
            key_events.join(", "),
            if participants.is_empty() { "no one".to_string() } else { participants.join(", ") },
            opening
        );

        SceneAnalysis {
            participants,
            key_events,
            title,
            description: TextUtils::truncate_with_ellipsis(&description, DESCRIPTION_MAX_CHARS).into_owned(),
        }
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

pub fn contains_transition(text: &str) -> bool {
    TRANSITION_REGEX.is_match(text)
}

pub struct SceneDetector {
    config: SceneDetectionConfig,
    analyzer: Arc<dyn SceneAnalyzer>,
}

impl SceneDetector {
    pub fn new(config: SceneDetectionConfig, analyzer: Arc<dyn SceneAnalyzer>) -> Self {
        Self { config, analyzer }
    }

    pub fn with_keyword_analyzer(config: SceneDetectionConfig) -> Self {
        Self::new(config, Arc::new(KeywordSceneAnalyzer))
    }

    /// `min(1, 0.5 + 0.1 * events + 0.05 * participants)`, computed in
    /// hundredths so threshold comparisons are exact.
    pub fn confidence(key_events: usize, participants: usize) -> f32 {
        let hundredths = 50usize
            .saturating_add(key_events.saturating_mul(10))
            .saturating_add(participants.saturating_mul(5))
            .min(100);
        hundredths as f32 / 100.0
    }

    /// Cut `messages` (arrival order) into candidate groups.
    pub fn segment<'a>(&self, messages: &'a [Message]) -> Vec<&'a [Message]> {
        let mut groups = Vec::new();
        let mut start = 0;

        for idx in 1..messages.len() {
            let gap_exceeded = messages[idx]
                .timestamp
                .signed_duration_since(messages[idx - 1].timestamp)
                .to_std()
                .map_or(false, |gap| gap > self.config.max_gap);
            let transition = contains_transition(&messages[idx].text);
            let full = idx - start >= self.config.max_group_size.max(1);

            if gap_exceeded || transition || full {
                groups.push(&messages[start..idx]);
                start = idx;
            }
        }
        if start < messages.len() {
            groups.push(&messages[start..]);
        }
        groups
    }

    /// Promoted scenes over `messages`, in transcript order.
    pub fn detect(&self, session_id: &str, messages: &[Message]) -> Vec<AutoScene> {
        let mut scenes = Vec::new();

        for group in self.segment(messages) {
            if group.len() < self.config.min_group_size {
                continue;
            }
            let (Some(first), Some(last)) = (group.first(), group.last()) else {
                continue;
            };

            let analysis = self.analyzer.analyze(group);
            let confidence = Self::confidence(analysis.key_events.len(), analysis.participants.len());
            if analysis.key_events.is_empty() || confidence <= self.config.min_confidence {
                debug!(
                    "Rejected candidate scene {}..{} in session {} (confidence {:.2})",
                    first.id, last.id, session_id, confidence
                );
                continue;
            }

            scenes.push(AutoScene {
                id: format!("scene-{}-{}", first.id, last.id),
                session_id: session_id.to_string(),
                title: analysis.title,
                description: analysis.description,
                start_message_id: first.id,
                end_message_id: last.id,
                message_ids: group.iter().map(|m| m.id).collect(),
                participants: analysis.participants,
                key_events: analysis.key_events,
                confidence,
            });
        }

        scenes
    }
}
