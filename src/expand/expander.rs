//! Expansion of enriched conversations into per-turn training samples.

use std::collections::BTreeMap;

use tracing::{debug, info};

use super::sample::{HistoryTurn, SystemContext, TargetTurn, TrainingSample};
use crate::pipeline::StageSummary;
use crate::request::prompt::{observable_text, CharacterSheet};
use crate::store::{
    CharacterSetting, Conversation, ConversationId, CorpusRecord, IdentityKey, RecordStore, Scene,
    SettingField, Turn,
};
use crate::tags::normalize_legacy;

/// Samples expanded from a store plus the stage summary.
#[derive(Debug, Clone)]
pub struct ExpandOutput {
    pub samples: Vec<TrainingSample>,
    pub summary: StageSummary,
}

/// Full rendering of a turn: the validated inner-thought text, or the
/// normalized utterance when no validated annotation exists.
fn full_text(turn: &Turn) -> String {
    turn.enriched_text()
        .map(str::to_string)
        .unwrap_or_else(|| normalize_legacy(&turn.utterance))
}

/// Expands conversations into one sample per non-narrator turn.
#[derive(Debug, Clone)]
pub struct TurnExpander {
    narrators: Vec<String>,
}

impl Default for TurnExpander {
    fn default() -> Self {
        Self {
            narrators: vec!["Environment".to_string()],
        }
    }
}

impl TurnExpander {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_narrators(mut self, narrators: Vec<String>) -> Self {
        self.narrators = narrators;
        self
    }

    fn is_narrator(&self, participant: &str) -> bool {
        self.narrators.iter().any(|n| n == participant)
    }

    pub fn expand(&self, store: &RecordStore) -> ExpandOutput {
        let mut summary = StageSummary::new("expand");
        let mut samples = Vec::new();

        for record in store.records() {
            for scene in &record.scenes {
                for conversation in &scene.conversations {
                    let before = samples.len();
                    self.expand_conversation(record, scene, conversation, &mut samples);
                    summary.processed += conversation.turns.len();
                    summary.skipped += conversation.turns.len() - (samples.len() - before);
                    summary.bump("conversations");
                }
            }
        }

        summary.add("samples", samples.len());
        summary.add(
            "with_plan",
            samples.iter().filter(|s| s.target.plan.is_some()).count(),
        );
        info!(
            samples = samples.len(),
            narrator_turns = summary.skipped,
            "Expanded conversations"
        );
        ExpandOutput { samples, summary }
    }

    /// Appends one sample per designated-speaker turn, in turn order.
    pub fn expand_conversation(
        &self,
        record: &CorpusRecord,
        scene: &Scene,
        conversation: &Conversation,
        samples: &mut Vec<TrainingSample>,
    ) {
        let source = ConversationId {
            corpus_unit_id: record.corpus_unit_id.clone(),
            scene_index: scene.scene_index,
            conversation_index: conversation.conversation_index,
        };

        for (position, turn) in conversation.turns.iter().enumerate() {
            if self.is_narrator(&turn.participant) {
                continue;
            }
            let target_key = IdentityKey::turn(
                &record.corpus_unit_id,
                scene.scene_index,
                conversation.conversation_index,
                turn.turn_index,
                &turn.participant,
            );

            let history = conversation.turns[..position]
                .iter()
                .map(|prior| {
                    let own = prior.participant == turn.participant;
                    let content = if own {
                        full_text(prior)
                    } else {
                        observable_text(&full_text(prior))
                    };
                    HistoryTurn {
                        turn_index: prior.turn_index,
                        participant: prior.participant.clone(),
                        own,
                        content,
                    }
                })
                .collect();

            debug!(key = %target_key, history = position, "Expanded turn");
            samples.push(TrainingSample {
                sample_id: target_key.to_string(),
                source: source.clone(),
                system: self.system_context(record, conversation, &turn.participant),
                target: TargetTurn {
                    turn_index: turn.turn_index,
                    participant: turn.participant.clone(),
                    plan: turn.plan_text().map(str::to_string),
                    content: full_text(turn),
                },
                target_key,
                history,
                labels: Default::default(),
                split: None,
            });
        }
    }

    fn system_context(
        &self,
        record: &CorpusRecord,
        conversation: &Conversation,
        participant: &str,
    ) -> SystemContext {
        let default_setting = CharacterSetting::default();
        let setting = record
            .settings
            .get(participant)
            .unwrap_or(&default_setting);

        let fields: BTreeMap<String, String> = SettingField::ALL
            .iter()
            .map(|f| (f.name().to_string(), setting.field(*f).to_string()))
            .filter(|(_, v)| !v.trim().is_empty())
            .collect();

        let others: BTreeMap<String, String> = conversation
            .participants()
            .into_iter()
            .filter(|name| *name != participant && !self.is_narrator(name))
            .map(|name| {
                let profile = record
                    .settings
                    .get(name)
                    .map(|s| s.field(SettingField::Profile).to_string())
                    .unwrap_or_default();
                (name.to_string(), profile)
            })
            .collect();

        let title = if record.title.is_empty() {
            &record.corpus_unit_id
        } else {
            &record.title
        };
        let prompt = CharacterSheet {
            title,
            participant,
            profile: setting.field(SettingField::Profile),
            scenario: &conversation.scenario,
            motivation: setting.field(SettingField::Motivation),
            others: &others,
            include_output_format: true,
        }
        .render();

        SystemContext {
            title: title.clone(),
            participant: participant.to_string(),
            scenario: conversation.scenario.clone(),
            setting: fields,
            prompt,
        }
    }
}
