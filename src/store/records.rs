//! Record types for the annotated corpus.
//!
//! A [`CorpusRecord`] holds one corpus unit (a book): its scenes, each scene's
//! conversations, each conversation's turns, and the settings of every
//! participant. Annotations produced by later stages are attached next to the
//! original fields and never replace them.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable identity of a turn (or of a participant's setting) inside the corpus.
///
/// Turn keys carry all three indices. Setting keys carry none of them, since a
/// setting belongs to the participant across the whole corpus unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityKey {
    pub corpus_unit_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_index: Option<u32>,
    pub participant: String,
}

impl IdentityKey {
    /// Key of one participant's turn.
    pub fn turn(
        corpus_unit_id: impl Into<String>,
        scene_index: u32,
        conversation_index: u32,
        turn_index: u32,
        participant: impl Into<String>,
    ) -> Self {
        Self {
            corpus_unit_id: corpus_unit_id.into(),
            scene_index: Some(scene_index),
            conversation_index: Some(conversation_index),
            turn_index: Some(turn_index),
            participant: participant.into(),
        }
    }

    /// Key of a participant's character setting.
    pub fn setting(corpus_unit_id: impl Into<String>, participant: impl Into<String>) -> Self {
        Self {
            corpus_unit_id: corpus_unit_id.into(),
            scene_index: None,
            conversation_index: None,
            turn_index: None,
            participant: participant.into(),
        }
    }

    pub fn is_setting(&self) -> bool {
        self.turn_index.is_none()
    }

    /// The conversation this key belongs to, if it is a turn key.
    pub fn conversation_id(&self) -> Option<ConversationId> {
        Some(ConversationId {
            corpus_unit_id: self.corpus_unit_id.clone(),
            scene_index: self.scene_index?,
            conversation_index: self.conversation_index?,
        })
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.scene_index, self.conversation_index, self.turn_index) {
            (Some(s), Some(c), Some(t)) => write!(
                f,
                "{}/s{}/c{}/t{}/{}",
                self.corpus_unit_id, s, c, t, self.participant
            ),
            _ => write!(f, "{}/setting/{}", self.corpus_unit_id, self.participant),
        }
    }
}

/// Identity of a source conversation, used to keep splits leak-free.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationId {
    pub corpus_unit_id: String,
    pub scene_index: u32,
    pub conversation_index: u32,
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/s{}/c{}",
            self.corpus_unit_id, self.scene_index, self.conversation_index
        )
    }
}

/// Annotation stages. Each stage owns exactly one annotation slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Inner thought and physical action layered onto a turn.
    RoleThinking,
    /// Third-person plan for a turn.
    SystemThinking,
    /// Enriched character setting fields.
    SettingCompletion,
    /// Pairwise quality judgement of a training sample.
    Judgement,
}

impl Stage {
    pub const ANNOTATING: [Stage; 3] = [
        Stage::RoleThinking,
        Stage::SystemThinking,
        Stage::SettingCompletion,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::RoleThinking => "role_thinking",
            Stage::SystemThinking => "system_thinking",
            Stage::SettingCompletion => "setting_completion",
            Stage::Judgement => "judgement",
        }
    }

    /// Service capability a task of this stage asks for. Model choice is
    /// the dispatcher's concern.
    pub fn capability(&self) -> &'static str {
        "reasoning"
    }

    /// Whether annotations of this stage are keyed by setting keys.
    pub fn targets_settings(&self) -> bool {
        matches!(self, Stage::SettingCompletion)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "role_thinking" => Ok(Stage::RoleThinking),
            "system_thinking" => Ok(Stage::SystemThinking),
            "setting_completion" => Ok(Stage::SettingCompletion),
            "judgement" => Ok(Stage::Judgement),
            other => Err(format!("unknown stage '{}'", other)),
        }
    }
}

/// Structural outcome of an annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationStatus {
    /// Passed strict validation as returned.
    Clean,
    /// Passed validation after the repair pass.
    Repaired,
    /// Could not be structured; raw text kept for inspection only.
    Unstructured,
}

impl AnnotationStatus {
    pub fn is_validated(&self) -> bool {
        !matches!(self, AnnotationStatus::Unstructured)
    }
}

/// Where an annotation came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub stage: Stage,
    pub attempt: u32,
    /// SHA-256 of the chosen result's raw output.
    pub digest: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repairs: Vec<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub context_truncated: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// A stage output attached to a turn or setting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub status: AnnotationStatus,
    /// Validated text, or the raw text when unstructured.
    pub text: String,
    /// Structured fields (setting completion only), keyed `<field>_enriched`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,
    pub provenance: Provenance,
}

impl Annotation {
    pub fn is_validated(&self) -> bool {
        self.status.is_validated()
    }

    /// Ordering used to decide whether a candidate replaces this annotation.
    pub fn rank(&self) -> ResultRank {
        ResultRank::new(
            self.status.is_validated(),
            self.provenance.attempt,
            &self.provenance.digest,
        )
    }
}

/// Merge priority: validated beats unvalidated, later attempts beat earlier
/// ones, and the smaller digest wins an exact tie so the choice never depends
/// on arrival order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ResultRank {
    validated: bool,
    attempt: u32,
    digest: std::cmp::Reverse<String>,
}

impl ResultRank {
    pub fn new(validated: bool, attempt: u32, digest: &str) -> Self {
        Self {
            validated,
            attempt,
            digest: std::cmp::Reverse(digest.to_string()),
        }
    }
}

/// One utterance in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub turn_index: u32,
    pub participant: String,
    /// Original utterance; never modified after ingestion.
    pub utterance: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_thinking: Option<Annotation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_thinking: Option<Annotation>,
}

impl Turn {
    pub fn new(turn_index: u32, participant: impl Into<String>, utterance: impl Into<String>) -> Self {
        Self {
            turn_index,
            participant: participant.into(),
            utterance: utterance.into(),
            role_thinking: None,
            system_thinking: None,
        }
    }

    pub fn annotation(&self, stage: Stage) -> Option<&Annotation> {
        match stage {
            Stage::RoleThinking => self.role_thinking.as_ref(),
            Stage::SystemThinking => self.system_thinking.as_ref(),
            _ => None,
        }
    }

    pub fn annotation_slot(&mut self, stage: Stage) -> Option<&mut Option<Annotation>> {
        match stage {
            Stage::RoleThinking => Some(&mut self.role_thinking),
            Stage::SystemThinking => Some(&mut self.system_thinking),
            _ => None,
        }
    }

    /// Validated inner-thought rendering, if any.
    pub fn enriched_text(&self) -> Option<&str> {
        self.role_thinking
            .as_ref()
            .filter(|a| a.is_validated() && !a.text.trim().is_empty())
            .map(|a| a.text.as_str())
    }

    /// Validated third-person plan, if any.
    pub fn plan_text(&self) -> Option<&str> {
        self.system_thinking
            .as_ref()
            .filter(|a| a.is_validated() && !a.text.trim().is_empty())
            .map(|a| a.text.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub conversation_index: u32,
    #[serde(default)]
    pub scenario: String,
    #[serde(default)]
    pub topic: String,
    pub turns: Vec<Turn>,
}

impl Conversation {
    /// Participants in order of first appearance.
    pub fn participants(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        for turn in &self.turns {
            if !seen.contains(&turn.participant.as_str()) {
                seen.push(&turn.participant);
            }
        }
        seen
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scene {
    pub scene_index: u32,
    #[serde(default)]
    pub chapter: String,
    #[serde(default)]
    pub summary: String,
    /// Source text the scene was extracted from.
    #[serde(default)]
    pub source_excerpt: String,
    pub conversations: Vec<Conversation>,
}

/// Descriptive fields of a character setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SettingField {
    Profile,
    Background,
    Motivation,
    Description,
    Experience,
}

impl SettingField {
    pub const ALL: [SettingField; 5] = [
        SettingField::Profile,
        SettingField::Background,
        SettingField::Motivation,
        SettingField::Description,
        SettingField::Experience,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SettingField::Profile => "profile",
            SettingField::Background => "background",
            SettingField::Motivation => "motivation",
            SettingField::Description => "description",
            SettingField::Experience => "experience",
        }
    }

    pub fn enriched_key(&self) -> String {
        format!("{}_enriched", self.name())
    }
}

/// Per-participant setting. Enrichment is stored beside the original fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterSetting {
    #[serde(default)]
    pub profile: String,
    #[serde(default)]
    pub background: String,
    #[serde(default)]
    pub motivation: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub experience: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enriched: Option<Annotation>,
}

impl CharacterSetting {
    pub fn original(&self, field: SettingField) -> &str {
        match field {
            SettingField::Profile => &self.profile,
            SettingField::Background => &self.background,
            SettingField::Motivation => &self.motivation,
            SettingField::Description => &self.description,
            SettingField::Experience => &self.experience,
        }
    }

    /// Enriched value when a validated, non-empty one exists, otherwise the
    /// original value.
    pub fn field(&self, field: SettingField) -> &str {
        self.enriched
            .as_ref()
            .filter(|a| a.is_validated())
            .and_then(|a| a.fields.get(&field.enriched_key()))
            .map(|v| v.as_str())
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| self.original(field))
    }
}

/// One corpus unit with everything derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorpusRecord {
    pub corpus_unit_id: String,
    #[serde(default)]
    pub title: String,
    pub scenes: Vec<Scene>,
    #[serde(default)]
    pub settings: BTreeMap<String, CharacterSetting>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annotation(status: AnnotationStatus, attempt: u32, digest: &str) -> Annotation {
        Annotation {
            status,
            text: "text".to_string(),
            fields: BTreeMap::new(),
            provenance: Provenance {
                stage: Stage::RoleThinking,
                attempt,
                digest: digest.to_string(),
                repairs: Vec::new(),
                context_truncated: false,
            },
        }
    }

    #[test]
    fn test_identity_key_display() {
        let key = IdentityKey::turn("book", 2, 1, 5, "Alice");
        assert_eq!(key.to_string(), "book/s2/c1/t5/Alice");
        let key = IdentityKey::setting("book", "Alice");
        assert_eq!(key.to_string(), "book/setting/Alice");
        assert!(key.is_setting());
        assert!(key.conversation_id().is_none());
    }

    #[test]
    fn test_identity_key_serde_omits_setting_indices() {
        let key = IdentityKey::setting("book", "Alice");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, r#"{"corpus_unit_id":"book","participant":"Alice"}"#);
        let back: IdentityKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn test_rank_ordering() {
        let clean_first = annotation(AnnotationStatus::Clean, 1, "bb");
        let raw_last = annotation(AnnotationStatus::Unstructured, 3, "aa");
        let clean_last = annotation(AnnotationStatus::Repaired, 2, "cc");
        assert!(clean_first.rank() > raw_last.rank());
        assert!(clean_last.rank() > clean_first.rank());
        // Equal status and attempt: smaller digest wins.
        let a = annotation(AnnotationStatus::Clean, 1, "aa");
        assert!(a.rank() > clean_first.rank());
    }

    #[test]
    fn test_setting_field_fallback() {
        let mut setting = CharacterSetting {
            profile: "A knight".to_string(),
            motivation: "Honor".to_string(),
            ..Default::default()
        };
        assert_eq!(setting.field(SettingField::Profile), "A knight");

        let mut enriched = annotation(AnnotationStatus::Repaired, 1, "dd");
        enriched
            .fields
            .insert("profile_enriched".to_string(), "A weary knight".to_string());
        enriched
            .fields
            .insert("motivation_enriched".to_string(), "  ".to_string());
        setting.enriched = Some(enriched);
        assert_eq!(setting.field(SettingField::Profile), "A weary knight");
        // Blank enrichment falls back to the original.
        assert_eq!(setting.field(SettingField::Motivation), "Honor");

        setting.enriched.as_mut().unwrap().status = AnnotationStatus::Unstructured;
        assert_eq!(setting.field(SettingField::Profile), "A knight");
    }

    #[test]
    fn test_stage_parse() {
        assert_eq!("role-thinking".parse::<Stage>(), Ok(Stage::RoleThinking));
        assert_eq!("SYSTEM_THINKING".parse::<Stage>(), Ok(Stage::SystemThinking));
        assert!("nope".parse::<Stage>().is_err());
    }

    #[test]
    fn test_turn_enriched_text_requires_validation() {
        let mut turn = Turn::new(0, "Alice", "Hello");
        assert!(turn.enriched_text().is_none());
        turn.role_thinking = Some(annotation(AnnotationStatus::Unstructured, 1, "ee"));
        assert!(turn.enriched_text().is_none());
        turn.role_thinking = Some(annotation(AnnotationStatus::Clean, 1, "ee"));
        assert_eq!(turn.enriched_text(), Some("text"));
    }
}
