//! Construction of inference tasks from the record store.
//!
//! Building is a read-only pass: the store is never modified, and the same
//! store snapshot always yields the same tasks in the same order with the
//! same truncation decisions.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::prompt::{
    observable_text, CharacterSheet, ROLE_THINKING_INSTRUCTION, SETTING_INSTRUCTION,
    SYSTEM_THINKING_INSTRUCTION,
};
use super::task::{InferenceTask, Message, TruncationNote};
use super::truncate::{truncate_field, truncate_history};
use crate::pipeline::StageSummary;
use crate::store::{
    Annotation, CharacterSetting, Conversation, CorpusRecord, IdentityKey, RecordStore, Scene,
    SettingField, Stage,
};
use crate::tags::normalize_legacy;

/// Character budgets for prompt context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncationBudgets {
    /// The acting participant's profile.
    pub profile_chars: usize,
    /// Each other participant's profile.
    pub other_profile_chars: usize,
    /// Source excerpt of the scene.
    pub excerpt_chars: usize,
    /// Rendered conversation history.
    pub history_chars: usize,
}

impl Default for TruncationBudgets {
    fn default() -> Self {
        Self {
            profile_chars: 1500,
            other_profile_chars: 500,
            excerpt_chars: 6000,
            history_chars: 8000,
        }
    }
}

/// Which keys get a task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Eligibility {
    /// Keys with no annotation for the stage yet.
    #[default]
    Missing,
    /// Keys with no annotation or an unstructured one.
    MissingOrUnstructured,
    /// Only these keys (typically a failure ledger), and only while they
    /// still lack a validated annotation.
    Retarget(BTreeSet<IdentityKey>),
}

impl Eligibility {
    fn admits(&self, key: &IdentityKey, existing: Option<&Annotation>) -> bool {
        let unvalidated = existing.map_or(true, |a| !a.is_validated());
        match self {
            Eligibility::Missing => existing.is_none(),
            Eligibility::MissingOrUnstructured => unvalidated,
            Eligibility::Retarget(keys) => keys.contains(key) && unvalidated,
        }
    }
}

/// Tasks built for one stage plus the stage summary.
#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub tasks: Vec<InferenceTask>,
    pub summary: StageSummary,
}

/// Builds inference tasks for one annotation stage.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    stage: Stage,
    budgets: TruncationBudgets,
    narrators: Vec<String>,
    eligibility: Eligibility,
}

impl RequestBuilder {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            budgets: TruncationBudgets::default(),
            narrators: vec!["Environment".to_string()],
            eligibility: Eligibility::default(),
        }
    }

    pub fn with_budgets(mut self, budgets: TruncationBudgets) -> Self {
        self.budgets = budgets;
        self
    }

    /// Participants that narrate rather than act; they never get tasks.
    pub fn with_narrators(mut self, narrators: Vec<String>) -> Self {
        self.narrators = narrators;
        self
    }

    pub fn with_eligibility(mut self, eligibility: Eligibility) -> Self {
        self.eligibility = eligibility;
        self
    }

    fn is_narrator(&self, participant: &str) -> bool {
        self.narrators.iter().any(|n| n == participant)
    }

    /// Builds one task per eligible key, in record order.
    pub fn build(&self, store: &RecordStore) -> BuildOutput {
        let mut summary = StageSummary::new(format!("build_requests:{}", self.stage));
        let mut tasks = Vec::new();
        if self.stage == Stage::Judgement {
            warn!("Judgement tasks are built from training samples, not records");
            return BuildOutput { tasks, summary };
        }

        for record in store.records() {
            if self.stage.targets_settings() {
                self.build_setting_tasks(record, &mut tasks, &mut summary);
            } else {
                self.build_turn_tasks(record, &mut tasks, &mut summary);
            }
        }

        let truncated = tasks.iter().filter(|t| t.is_truncated()).count();
        summary.add("tasks", tasks.len());
        summary.add("truncated", truncated);
        info!(
            stage = %self.stage,
            tasks = tasks.len(),
            truncated,
            skipped = summary.skipped,
            "Built inference tasks"
        );
        BuildOutput { tasks, summary }
    }

    fn build_turn_tasks(
        &self,
        record: &CorpusRecord,
        tasks: &mut Vec<InferenceTask>,
        summary: &mut StageSummary,
    ) {
        for scene in &record.scenes {
            for conversation in &scene.conversations {
                for (position, turn) in conversation.turns.iter().enumerate() {
                    if self.is_narrator(&turn.participant) {
                        continue;
                    }
                    summary.processed += 1;
                    let key = IdentityKey::turn(
                        &record.corpus_unit_id,
                        scene.scene_index,
                        conversation.conversation_index,
                        turn.turn_index,
                        &turn.participant,
                    );
                    if !self.eligibility.admits(&key, turn.annotation(self.stage)) {
                        debug!(key = %key, "Already annotated, skipping");
                        summary.skipped += 1;
                        continue;
                    }
                    tasks.push(self.turn_task(record, scene, conversation, position, key));
                }
            }
        }
    }

    fn build_setting_tasks(
        &self,
        record: &CorpusRecord,
        tasks: &mut Vec<InferenceTask>,
        summary: &mut StageSummary,
    ) {
        for (name, setting) in &record.settings {
            if self.is_narrator(name) {
                continue;
            }
            summary.processed += 1;
            let key = IdentityKey::setting(&record.corpus_unit_id, name);
            if !self.eligibility.admits(&key, setting.enriched.as_ref()) {
                summary.skipped += 1;
                continue;
            }
            tasks.push(self.setting_task(record, name, setting, key));
        }
    }

    /// Other participants' profiles, each cut to its budget.
    fn other_profiles(
        &self,
        record: &CorpusRecord,
        conversation: &Conversation,
        participant: &str,
        notes: &mut Vec<TruncationNote>,
    ) -> BTreeMap<String, String> {
        let mut others = BTreeMap::new();
        for name in conversation.participants() {
            if name == participant || self.is_narrator(name) {
                continue;
            }
            let profile = record
                .settings
                .get(name)
                .map(|s| s.field(SettingField::Profile))
                .unwrap_or_default();
            let (text, note) = truncate_field(
                &format!("other_profile:{}", name),
                profile,
                self.budgets.other_profile_chars,
            );
            notes.extend(note);
            others.insert(name.to_string(), text);
        }
        others
    }

    fn turn_task(
        &self,
        record: &CorpusRecord,
        scene: &Scene,
        conversation: &Conversation,
        position: usize,
        key: IdentityKey,
    ) -> InferenceTask {
        let turn = &conversation.turns[position];
        let mut notes = Vec::new();
        let default_setting = CharacterSetting::default();
        let setting = record
            .settings
            .get(&turn.participant)
            .unwrap_or(&default_setting);

        let (profile, note) = truncate_field(
            "profile",
            setting.field(SettingField::Profile),
            self.budgets.profile_chars,
        );
        notes.extend(note);
        let others = self.other_profiles(record, conversation, &turn.participant, &mut notes);

        let sheet = CharacterSheet {
            title: if record.title.is_empty() {
                &record.corpus_unit_id
            } else {
                &record.title
            },
            participant: &turn.participant,
            profile: &profile,
            scenario: &conversation.scenario,
            motivation: setting.field(SettingField::Motivation),
            others: &others,
            include_output_format: false,
        };

        let (excerpt, note) =
            truncate_field("source_excerpt", &scene.source_excerpt, self.budgets.excerpt_chars);
        notes.extend(note);

        let history: Vec<String> = conversation.turns[..position]
            .iter()
            .map(|t| format!("{}: {}", t.participant, observable_text(&t.utterance)))
            .collect();
        let (history, note) = truncate_history(&history, self.budgets.history_chars);
        notes.extend(note);

        let (target, instruction) = match self.stage {
            Stage::SystemThinking => (
                turn.enriched_text()
                    .map(str::to_string)
                    .unwrap_or_else(|| normalize_legacy(&turn.utterance)),
                SYSTEM_THINKING_INSTRUCTION,
            ),
            _ => (normalize_legacy(&turn.utterance), ROLE_THINKING_INSTRUCTION),
        };

        let user = format!(
            "===Source Excerpt===\n{}\n\n===Conversation So Far===\n{}\n\n===Target Turn===\n{}: {}\n\n{}",
            excerpt,
            history.join("\n"),
            turn.participant,
            target,
            instruction
        );

        InferenceTask::new(
            key,
            self.stage,
            self.stage.capability(),
            vec![Message::system(sheet.render()), Message::user(user)],
            notes,
        )
    }

    fn setting_task(
        &self,
        record: &CorpusRecord,
        name: &str,
        setting: &CharacterSetting,
        key: IdentityKey,
    ) -> InferenceTask {
        let mut notes = Vec::new();

        let mut current = BTreeMap::new();
        for field in SettingField::ALL {
            let budget = if field == SettingField::Profile {
                self.budgets.profile_chars
            } else {
                self.budgets.other_profile_chars
            };
            let (text, note) = truncate_field(field.name(), setting.original(field), budget);
            notes.extend(note);
            current.insert(field.name(), text);
        }
        // BTreeMap<&str, String> always serializes.
        let current = serde_json::to_string_pretty(&current).unwrap_or_default();

        // Excerpts from scenes where the participant speaks, in scene order.
        let mut excerpts = String::new();
        let mut lines = Vec::new();
        for scene in &record.scenes {
            let speaks = scene
                .conversations
                .iter()
                .flat_map(|c| c.turns.iter())
                .filter(|t| t.participant == name)
                .map(|t| format!("{}: {}", name, observable_text(&t.utterance)))
                .collect::<Vec<_>>();
            if speaks.is_empty() {
                continue;
            }
            if !excerpts.is_empty() {
                excerpts.push_str("\n\n");
            }
            excerpts.push_str(&scene.source_excerpt);
            lines.extend(speaks);
        }
        let (excerpts, note) = truncate_field("source_excerpt", &excerpts, self.budgets.excerpt_chars);
        notes.extend(note);
        let (lines, note) = truncate_history(&lines, self.budgets.history_chars);
        notes.extend(note);

        let user = format!(
            "Character: {}\n\n===Current Setting===\n{}\n\n===Excerpts===\n{}\n\n===Lines===\n{}",
            name,
            current,
            excerpts,
            lines.join("\n")
        );

        InferenceTask::new(
            key,
            self.stage,
            self.stage.capability(),
            vec![Message::system(SETTING_INSTRUCTION), Message::user(user)],
            notes,
        )
    }
}
