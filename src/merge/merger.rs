//! Folds inference results into the record store.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use super::ledger::FailureEntry;
use crate::pipeline::StageSummary;
use crate::repair::validate_output;
use crate::request::InferenceResult;
use crate::store::{Annotation, AnnotationStatus, IdentityKey, Provenance, RecordStore, Stage};

/// Result of one merge pass.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub summary: StageSummary,
    /// Keys left without a validated annotation, in key order.
    pub failures: Vec<FailureEntry>,
}

/// Merges results of one stage into a record store.
///
/// Results may arrive in any order and more than once. For each key the
/// best candidate wins by [`crate::store::ResultRank`], and it replaces an
/// annotation stored by an earlier pass only when it ranks strictly higher,
/// so merging the same results again changes nothing.
#[derive(Debug, Clone)]
pub struct ResultMerger {
    stage: Stage,
    max_attempts: u32,
}

impl ResultMerger {
    pub fn new(stage: Stage, max_attempts: u32) -> Self {
        Self {
            stage,
            max_attempts,
        }
    }

    pub fn merge(&self, store: &mut RecordStore, results: Vec<InferenceResult>) -> MergeOutcome {
        let mut summary = StageSummary::new(format!("merge:{}", self.stage));
        let mut failures = Vec::new();

        let mut grouped: BTreeMap<IdentityKey, Vec<InferenceResult>> = BTreeMap::new();
        for result in results {
            if result.stage != self.stage {
                summary.bump("other_stage");
                continue;
            }
            grouped.entry(result.key.clone()).or_default().push(result);
        }

        for (key, results) in grouped {
            summary.processed += 1;

            let Some(slot) = annotation_slot(store, self.stage, &key) else {
                warn!(key = %key, stage = %self.stage, "Result key not found in records, skipping");
                summary.skipped += 1;
                summary.bump("unresolved");
                continue;
            };

            let best = results
                .iter()
                .filter_map(|r| self.candidate(r))
                .max_by(|a, b| a.rank().cmp(&b.rank()));

            match best {
                Some(candidate) => {
                    let replace = slot
                        .as_ref()
                        .map_or(true, |existing| candidate.rank() > existing.rank());
                    if replace {
                        debug!(key = %key, status = ?candidate.status, "Attaching annotation");
                        match candidate.status {
                            AnnotationStatus::Clean => {}
                            AnnotationStatus::Repaired => summary.repaired += 1,
                            AnnotationStatus::Unstructured => {
                                summary.failed += 1;
                                summary.bump("unstructured");
                            }
                        }
                        summary.merged += 1;
                        *slot = Some(candidate);
                    } else {
                        summary.bump("unchanged");
                    }
                }
                None => {
                    summary.failed += 1;
                }
            }

            // Keys still lacking a validated annotation go to the ledger.
            if slot.as_ref().map_or(true, |a| !a.is_validated()) {
                failures.push(self.failure_entry(&key, &results, slot.as_ref()));
            }
        }

        summary.add("ledger", failures.len());
        summary.add(
            "exhausted",
            failures.iter().filter(|f| f.exhausted).count(),
        );
        info!(
            stage = %self.stage,
            merged = summary.merged,
            repaired = summary.repaired,
            failed = summary.failed,
            unchanged = summary.extra("unchanged"),
            "Merged inference results"
        );
        MergeOutcome { summary, failures }
    }

    /// Validated (or flagged) annotation for one successful result.
    fn candidate(&self, result: &InferenceResult) -> Option<Annotation> {
        let output = result.usable_output()?;
        let validated = validate_output(self.stage, output);
        Some(Annotation {
            status: validated.status,
            text: validated.text,
            fields: validated.fields,
            provenance: Provenance {
                stage: self.stage,
                attempt: result.attempt,
                digest: output.digest(),
                repairs: validated.repairs.iter().map(|r| r.to_string()).collect(),
                context_truncated: result.truncated,
            },
        })
    }

    fn failure_entry(
        &self,
        key: &IdentityKey,
        results: &[InferenceResult],
        stored: Option<&Annotation>,
    ) -> FailureEntry {
        let attempts = results.iter().map(|r| r.attempt).max().unwrap_or(0);
        let last_error = results
            .iter()
            .filter(|r| r.attempt == attempts)
            .filter_map(|r| r.error.clone())
            .min()
            .or_else(|| {
                stored
                    .filter(|a| a.status == AnnotationStatus::Unstructured)
                    .map(|_| "output could not be structured".to_string())
            })
            .unwrap_or_else(|| "no usable output".to_string());
        FailureEntry {
            key: key.clone(),
            stage: self.stage,
            attempts,
            last_error,
            exhausted: attempts >= self.max_attempts,
        }
    }
}

fn annotation_slot<'a>(
    store: &'a mut RecordStore,
    stage: Stage,
    key: &IdentityKey,
) -> Option<&'a mut Option<Annotation>> {
    if stage.targets_settings() {
        store.setting_mut(key).map(|s| &mut s.enriched)
    } else {
        store.turn_mut(key)?.annotation_slot(stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{InferenceTask, ResultOutput};
    use crate::store::{CharacterSetting, Conversation, CorpusRecord, Scene, Turn};
    use serde_json::json;

    fn store() -> RecordStore {
        let mut settings = BTreeMap::new();
        settings.insert("Alice".to_string(), CharacterSetting::default());
        RecordStore::from_records(vec![CorpusRecord {
            corpus_unit_id: "tale".to_string(),
            title: String::new(),
            scenes: vec![Scene {
                scene_index: 0,
                chapter: String::new(),
                summary: String::new(),
                source_excerpt: String::new(),
                conversations: vec![Conversation {
                    conversation_index: 0,
                    scenario: String::new(),
                    topic: String::new(),
                    turns: vec![Turn::new(0, "Alice", "Hello."), Turn::new(1, "Bob", "Hi.")],
                }],
            }],
            settings,
        }])
        .expect("store")
    }

    fn key_k() -> IdentityKey {
        IdentityKey::turn("tale", 0, 0, 0, "Alice")
    }

    fn task(key: IdentityKey, stage: Stage) -> InferenceTask {
        InferenceTask::new(key, stage, "reasoning", Vec::new(), Vec::new())
    }

    fn ok(key: IdentityKey, attempt: u32, text: &str) -> InferenceResult {
        InferenceResult::success(
            &task(key, Stage::RoleThinking),
            attempt,
            ResultOutput::Text(text.to_string()),
        )
    }

    const VALID: &str = "<role_thinking>She is nervous.</role_thinking>Hello.";
    const MALFORMED: &str = "<mood>tense</mood>Hello.";

    #[test]
    fn test_valid_result_beats_malformed_one() {
        let mut store = store();
        let merger = ResultMerger::new(Stage::RoleThinking, 3);
        let results = vec![ok(key_k(), 2, MALFORMED), ok(key_k(), 1, VALID)];
        let outcome = merger.merge(&mut store, results.clone());

        let annotation = store.turn(&key_k()).unwrap().role_thinking.clone().unwrap();
        assert_eq!(annotation.status, AnnotationStatus::Clean);
        assert_eq!(annotation.text, VALID);
        assert_eq!(annotation.provenance.attempt, 1);
        assert_eq!(outcome.summary.merged, 1);
        assert!(outcome.failures.is_empty());

        // A second pass over the same results leaves K unchanged.
        let again = merger.merge(&mut store, results);
        assert_eq!(again.summary.merged, 0);
        assert_eq!(again.summary.extra("unchanged"), 1);
        assert_eq!(store.turn(&key_k()).unwrap().role_thinking, Some(annotation));
    }

    #[test]
    fn test_choice_independent_of_arrival_order() {
        let a = ok(key_k(), 1, "<role_thinking>a</role_thinking>Hello.");
        let b = ok(key_k(), 1, "<role_thinking>b</role_thinking>Hello.");
        let merger = ResultMerger::new(Stage::RoleThinking, 3);

        let mut first = store();
        merger.merge(&mut first, vec![a.clone(), b.clone()]);
        let mut second = store();
        merger.merge(&mut second, vec![b, a]);
        assert_eq!(first.records(), second.records());
    }

    #[test]
    fn test_later_attempt_replaces_earlier_merge() {
        let mut store = store();
        let merger = ResultMerger::new(Stage::RoleThinking, 3);
        merger.merge(&mut store, vec![ok(key_k(), 1, VALID)]);

        let newer = "<role_thinking>Hide it.</role_thinking>Hello.";
        let outcome = merger.merge(&mut store, vec![ok(key_k(), 2, newer)]);
        assert_eq!(outcome.summary.merged, 1);
        let stored = store.turn(&key_k()).unwrap().role_thinking.as_ref().unwrap();
        assert_eq!(stored.text, newer);
    }

    #[test]
    fn test_unknown_key_skipped() {
        let mut store = store();
        let before = store.records().to_vec();
        let ghost = IdentityKey::turn("tale", 9, 0, 0, "Ghost");
        let outcome = ResultMerger::new(Stage::RoleThinking, 3)
            .merge(&mut store, vec![ok(ghost, 1, VALID)]);
        assert_eq!(outcome.summary.skipped, 1);
        assert_eq!(outcome.summary.extra("unresolved"), 1);
        assert_eq!(store.records(), before.as_slice());
    }

    #[test]
    fn test_failures_recorded_in_ledger() {
        let mut store = store();
        let bob = IdentityKey::turn("tale", 0, 0, 1, "Bob");
        let t = task(bob.clone(), Stage::RoleThinking);
        let results = vec![
            InferenceResult::failure(&t, 1, "timeout"),
            InferenceResult::failure(&t, 3, "rate limited"),
            ok(key_k(), 1, MALFORMED),
        ];
        let outcome = ResultMerger::new(Stage::RoleThinking, 3).merge(&mut store, results);

        assert_eq!(outcome.failures.len(), 2);
        let alice = &outcome.failures[0];
        assert_eq!(alice.key, key_k());
        assert!(!alice.exhausted);
        let bob_entry = &outcome.failures[1];
        assert_eq!(bob_entry.attempts, 3);
        assert_eq!(bob_entry.last_error, "rate limited");
        assert!(bob_entry.exhausted);

        // The unstructured output is kept for inspection.
        let raw = store.turn(&key_k()).unwrap().role_thinking.as_ref().unwrap();
        assert_eq!(raw.status, AnnotationStatus::Unstructured);
        assert_eq!(raw.text, MALFORMED);
        assert_eq!(outcome.summary.failed, 2);
    }

    #[test]
    fn test_setting_results_attach_to_setting() {
        let mut store = store();
        let key = IdentityKey::setting("tale", "Alice");
        let result = InferenceResult::success(
            &task(key.clone(), Stage::SettingCompletion),
            1,
            ResultOutput::Structured(json!({"profile_enriched": "A courier"})),
        );
        ResultMerger::new(Stage::SettingCompletion, 3).merge(&mut store, vec![result]);
        let setting = store.setting(&key).unwrap();
        assert_eq!(
            setting.field(crate::store::SettingField::Profile),
            "A courier"
        );
        assert_eq!(setting.profile, "");
    }

    #[test]
    fn test_other_stage_results_ignored() {
        let mut store = store();
        let outcome =
            ResultMerger::new(Stage::SystemThinking, 3).merge(&mut store, vec![ok(key_k(), 1, VALID)]);
        assert_eq!(outcome.summary.extra("other_stage"), 1);
        assert!(store.turn(&key_k()).unwrap().system_thinking.is_none());
    }
}
