//! Quality labels derived from pairwise judgements.
//!
//! A judgement compares two candidate continuations principle by principle.
//! The number of principles and the pattern of winners become the sample's
//! labels, which drive filtering and stratification during allocation.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::expand::TrainingSample;
use crate::pipeline::StageSummary;
use crate::repair::validate_output;
use crate::request::InferenceResult;
use crate::store::{IdentityKey, ResultRank, Stage};

/// Pattern of per-principle winners in a judgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreferenceOutcome {
    /// Each candidate wins at least one principle.
    BothSides,
    FirstOnly,
    SecondOnly,
    /// Only ties.
    TieOnly,
    /// No comparison named a winner.
    NoWinner,
}

impl PreferenceOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PreferenceOutcome::BothSides => "both_sides",
            PreferenceOutcome::FirstOnly => "first_only",
            PreferenceOutcome::SecondOnly => "second_only",
            PreferenceOutcome::TieOnly => "tie_only",
            PreferenceOutcome::NoWinner => "no_winner",
        }
    }

    fn from_counts(first: usize, second: usize, ties: usize) -> Self {
        match (first > 0, second > 0) {
            (true, true) => PreferenceOutcome::BothSides,
            (true, false) => PreferenceOutcome::FirstOnly,
            (false, true) => PreferenceOutcome::SecondOnly,
            (false, false) if ties > 0 => PreferenceOutcome::TieOnly,
            (false, false) => PreferenceOutcome::NoWinner,
        }
    }
}

impl fmt::Display for PreferenceOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category name of samples without a preference label.
pub const UNLABELED: &str = "unlabeled";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityLabels {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principle_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preference: Option<PreferenceOutcome>,
}

impl QualityLabels {
    /// Stratification bucket of the sample.
    pub fn category(&self) -> &'static str {
        self.preference.map_or(UNLABELED, |p| p.as_str())
    }

    /// Parses judge output shaped as
    /// `{"result": [{"principle": {..}, "analysis": {"principle_comparisons": [{"winner": ..}]}}]}`.
    ///
    /// `result` may also be a bare object. Returns `None` when the payload has
    /// no result entry.
    pub fn from_judgement(value: &Value) -> Option<Self> {
        let result = match value.get("result")? {
            Value::Array(items) => items.first()?,
            other => other,
        };
        let principle_count = match result.get("principle") {
            Some(Value::Object(map)) => Some(map.len() as u32),
            Some(Value::Array(items)) => Some(items.len() as u32),
            _ => None,
        };

        let (mut first, mut second, mut ties) = (0, 0, 0);
        let comparisons = result
            .get("analysis")
            .and_then(|a| a.get("principle_comparisons"))
            .and_then(|c| c.as_array());
        for comparison in comparisons.into_iter().flatten() {
            match comparison.get("winner").and_then(|w| w.as_str()) {
                Some("cand_1") => first += 1,
                Some("cand_2") => second += 1,
                Some("tie") => ties += 1,
                _ => {}
            }
        }

        Some(Self {
            principle_count,
            preference: Some(PreferenceOutcome::from_counts(first, second, ties)),
        })
    }
}

/// Attaches labels from judgement results to samples by target key.
///
/// Per key the best validated judgement wins, using the same ranking as
/// annotation merges. Samples without a usable judgement keep their labels.
pub fn attach_labels(samples: &mut [TrainingSample], results: Vec<InferenceResult>) -> StageSummary {
    let mut summary = StageSummary::new("label");
    let positions: HashMap<IdentityKey, usize> = samples
        .iter()
        .enumerate()
        .map(|(i, s)| (s.target_key.clone(), i))
        .collect();

    let mut best: BTreeMap<IdentityKey, (ResultRank, QualityLabels, bool)> = BTreeMap::new();
    for result in results {
        if result.stage != Stage::Judgement {
            summary.bump("other_stage");
            continue;
        }
        summary.processed += 1;
        let Some(output) = result.usable_output() else {
            summary.failed += 1;
            continue;
        };
        let validated = validate_output(Stage::Judgement, output);
        let labels = if validated.status.is_validated() {
            serde_json::from_str::<Value>(&validated.text)
                .ok()
                .and_then(|v| QualityLabels::from_judgement(&v))
        } else {
            None
        };
        let Some(labels) = labels else {
            debug!(key = %result.key, "Judgement carries no result entry");
            summary.failed += 1;
            continue;
        };
        let rank = ResultRank::new(true, result.attempt, &output.digest());
        let repaired = !validated.repairs.is_empty();
        match best.get(&result.key) {
            Some((current, _, _)) if *current >= rank => {}
            _ => {
                best.insert(result.key.clone(), (rank, labels, repaired));
            }
        }
    }

    for (key, (_, labels, repaired)) in best {
        match positions.get(&key) {
            Some(&idx) => {
                samples[idx].labels = labels;
                summary.merged += 1;
                if repaired {
                    summary.repaired += 1;
                }
            }
            None => {
                warn!(key = %key, "Judgement for unknown sample, skipping");
                summary.skipped += 1;
                summary.bump("unresolved");
            }
        }
    }
    summary.add("unlabeled", samples.iter().filter(|s| s.labels.preference.is_none()).count());
    info!(
        labeled = summary.merged,
        failed = summary.failed,
        "Attached quality labels"
    );
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn judgement(winners: &[&str], principles: usize) -> Value {
        let principle: serde_json::Map<String, Value> = (0..principles)
            .map(|i| (format!("p{}", i), json!("...")))
            .collect();
        let comparisons: Vec<Value> = winners.iter().map(|w| json!({"winner": w})).collect();
        json!({"result": [{"principle": principle, "analysis": {"principle_comparisons": comparisons}}]})
    }

    #[test]
    fn test_outcomes_from_winners() {
        let cases = [
            (vec!["cand_1", "cand_2", "tie"], PreferenceOutcome::BothSides),
            (vec!["cand_1", "tie"], PreferenceOutcome::FirstOnly),
            (vec!["cand_2"], PreferenceOutcome::SecondOnly),
            (vec!["tie", "tie"], PreferenceOutcome::TieOnly),
            (vec![], PreferenceOutcome::NoWinner),
        ];
        for (winners, expected) in cases {
            let labels = QualityLabels::from_judgement(&judgement(&winners, 4)).unwrap();
            assert_eq!(labels.preference, Some(expected));
            assert_eq!(labels.principle_count, Some(4));
        }
    }

    #[test]
    fn test_missing_result_yields_none() {
        assert!(QualityLabels::from_judgement(&json!({"analysis": {}})).is_none());
        assert!(QualityLabels::from_judgement(&json!({"result": []})).is_none());
    }

    #[test]
    fn test_category_of_unlabeled() {
        assert_eq!(QualityLabels::default().category(), UNLABELED);
        let labels = QualityLabels {
            principle_count: Some(3),
            preference: Some(PreferenceOutcome::TieOnly),
        };
        assert_eq!(labels.category(), "tie_only");
    }
}
