use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::allocate::QualityLabels;
use crate::store::{ConversationId, IdentityKey};

/// System context of a sample: the acting participant's character sheet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemContext {
    pub title: String,
    pub participant: String,
    pub scenario: String,
    /// Setting fields with enrichment applied, keyed by field name.
    /// Fields empty in both enriched and original form are omitted.
    #[serde(default)]
    pub setting: BTreeMap<String, String>,
    /// Rendered system prompt.
    pub prompt: String,
}

/// A prior turn as the target participant sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub turn_index: u32,
    pub participant: String,
    /// Spoken by the target participant; only such turns show thoughts.
    pub own: bool,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetTurn {
    pub turn_index: u32,
    pub participant: String,
    /// Third-person plan, attached to the target turn only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    pub content: String,
}

/// One training sample: a target turn with everything that precedes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingSample {
    /// Text form of the target key.
    pub sample_id: String,
    pub source: ConversationId,
    pub target_key: IdentityKey,
    pub system: SystemContext,
    pub history: Vec<HistoryTurn>,
    pub target: TargetTurn,
    #[serde(default)]
    pub labels: QualityLabels,
    /// Split the sample was allocated to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split: Option<String>,
}
