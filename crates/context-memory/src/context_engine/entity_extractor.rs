//! Pluggable extraction of game entities from transcript text

use crate::memory::EntityType;
use crate::utils::{TextUtils, TopicExtractor};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref PATTERNS: Vec<(EntityType, f32, Regex)> = vec![
        (
            EntityType::Npc,
            0.8,
            Regex::new(r"\b(?:named|called)\s+([A-Z][a-z]+(?:\s+[A-Z][a-z]+)?)").unwrap(),
        ),
        (
            EntityType::Npc,
            0.75,
            Regex::new(r"\b((?:Captain|Lord|Lady|King|Queen|Sir|Master|Elder|Brother|Sister|Father|Mother)\s+[A-Z][a-z]+)").unwrap(),
        ),
        (
            EntityType::Location,
            0.7,
            Regex::new(r"\b((?:[Tt]own|[Vv]illage|[Cc]ity|[Cc]astle|[Tt]ower|[Ff]orest|[Tt]emple|[Kk]eep|[Rr]uins|[Kk]ingdom)\s+of\s+[A-Z][a-z]+(?:\s+[A-Z][a-z]+)?)").unwrap(),
        ),
        (
            EntityType::Location,
            0.65,
            Regex::new(r"\b(?:arrive|arrives|arrived|enter|enters|entered|reach|reaches|reached)\s+(?:at\s+|in\s+)?(?:the\s+)?([A-Z][a-z]+(?:\s+[A-Z][a-z]+)?)").unwrap(),
        ),
        (
            EntityType::Item,
            0.7,
            Regex::new(r"\b((?:Sword|Blade|Amulet|Ring|Staff|Shield|Tome|Orb|Crown|Dagger|Bow|Helm|Cloak|Wand)\s+of\s+(?:the\s+)?[A-Z][a-z]+)").unwrap(),
        ),
        (
            EntityType::Quest,
            0.6,
            Regex::new(r"(?i)\bquest\s+(?:to|for)\s+([^.!?\n]{3,60})").unwrap(),
        ),
    ];
}

const DESCRIPTION_MAX_CHARS: usize = 120;

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedEntity {
    pub entity_type: EntityType,
    pub name: String,
    pub description: Option<String>,
    /// In [0, 1].
    pub confidence: f32,
}

pub trait EntityExtractor: Send + Sync {
    fn extract(&self, text: &str) -> Vec<ExtractedEntity>;
}

/// Capitalised-name patterns for NPCs, places, notable items and quests.
#[derive(Debug, Default, Clone, Copy)]
pub struct PatternEntityExtractor;

impl EntityExtractor for PatternEntityExtractor {
    fn extract(&self, text: &str) -> Vec<ExtractedEntity> {
        let mut found: Vec<ExtractedEntity> = Vec::new();

        for (entity_type, confidence, regex) in PATTERNS.iter() {
            for captures in regex.captures_iter(text) {
                let Some(m) = captures.get(1) else { continue };
                let name = clean_name(m.as_str());
                if name.is_empty() || TopicExtractor::is_stop_word(&name) {
                    continue;
                }

                let existing = found
                    .iter_mut()
                    .find(|e| e.entity_type == *entity_type && e.name.eq_ignore_ascii_case(&name));
                match existing {
                    Some(e) => e.confidence = e.confidence.max(*confidence),
                    None => found.push(ExtractedEntity {
                        entity_type: *entity_type,
                        description: Some(surrounding_sentence(text, m.start(), m.end())),
                        name,
                        confidence: *confidence,
                    }),
                }
            }
        }

        found
    }
}

fn clean_name(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches(|c: char| c == ',' || c == ';' || c == ':');
    TextUtils::normalize_whitespace(trimmed).into_owned()
}

/// The sentence containing `start..end`, truncated for storage.
fn surrounding_sentence(text: &str, start: usize, end: usize) -> String {
    let is_boundary = |c: char| matches!(c, '.' | '!' | '?' | '\n');
    let from = text[..start].rfind(is_boundary).map_or(0, |i| i + 1);
    let to = text[end..].find(is_boundary).map_or(text.len(), |i| end + i + 1);
    let sentence = TextUtils::normalize_whitespace(text[from..to].trim()).into_owned();
    TextUtils::truncate_with_ellipsis(&sentence, DESCRIPTION_MAX_CHARS).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(found: &[ExtractedEntity], entity_type: EntityType) -> Vec<String> {
        found
            .iter()
            .filter(|e| e.entity_type == entity_type)
            .map(|e| e.name.clone())
            .collect()
    }

    #[test]
    fn finds_named_characters_and_titles() {
        let found = PatternEntityExtractor
            .extract("A goblin named Grimble waves. Captain Vex scowls at him.");
        assert_eq!(names(&found, EntityType::Npc), vec!["Grimble".to_string(), "Captain Vex".to_string()]);
        assert!(found.iter().all(|e| e.confidence >= 0.6));
        assert_eq!(found[0].description.as_deref(), Some("A goblin named Grimble waves."));
    }

    #[test]
    fn finds_places_items_and_quests() {
        let found = PatternEntityExtractor.extract(
            "You arrive at Thornwood Keep. In the Temple of Ashes lies the Blade of Dawn. \
             The elder offers a quest to recover the stolen bell.",
        );
        assert_eq!(
            names(&found, EntityType::Location),
            vec!["Temple of Ashes".to_string(), "Thornwood Keep".to_string()]
        );
        assert_eq!(names(&found, EntityType::Item), vec!["Blade of Dawn".to_string()]);
        assert_eq!(names(&found, EntityType::Quest), vec!["recover the stolen bell".to_string()]);
    }

    #[test]
    fn repeated_mentions_collapse() {
        let found = PatternEntityExtractor.extract("A man called Orin. Later, a dwarf named Orin.");
        assert_eq!(names(&found, EntityType::Npc), vec!["Orin".to_string()]);
    }

    #[test]
    fn plain_text_yields_nothing() {
        assert!(PatternEntityExtractor.extract("we wait by the fire").is_empty());
    }
}
