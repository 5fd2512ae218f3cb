//! Repair layer: strict validation of stage outputs with a bounded repair
//! pass for outputs that fail it.
//!
//! Every stage output goes through [`validate_output`]. The strict validator
//! runs first; if it rejects the output, the stage's repair passes run once
//! and the strict validator runs again. An output that still fails is kept
//! verbatim and flagged [`AnnotationStatus::Unstructured`] so consumers fall
//! back to the original fields.

pub mod json;
pub mod tags;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::request::ResultOutput;
use crate::store::{AnnotationStatus, SettingField, Stage};
use crate::tags::{parse, SegmentKind};

pub use json::repair_json;
pub use tags::repair_tagged_text;

/// One repair pass that changed the text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairAction {
    StrippedReasoning,
    StrippedTruncationArtifacts,
    DroppedStrayClosers,
    ClosedSegments,
    ExtractedPayload,
    EscapedInnerQuotes,
    RemovedTrailingCommas,
    ClosedStructures,
}

impl RepairAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepairAction::StrippedReasoning => "stripped_reasoning",
            RepairAction::StrippedTruncationArtifacts => "stripped_truncation_artifacts",
            RepairAction::DroppedStrayClosers => "dropped_stray_closers",
            RepairAction::ClosedSegments => "closed_segments",
            RepairAction::ExtractedPayload => "extracted_payload",
            RepairAction::EscapedInnerQuotes => "escaped_inner_quotes",
            RepairAction::RemovedTrailingCommas => "removed_trailing_commas",
            RepairAction::ClosedStructures => "closed_structures",
        }
    }
}

impl fmt::Display for RepairAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of validating one stage output.
#[derive(Debug, Clone, PartialEq)]
pub struct Validated {
    pub status: AnnotationStatus,
    /// Normalized text when validated, raw text when unstructured.
    pub text: String,
    pub fields: BTreeMap<String, String>,
    pub repairs: Vec<RepairAction>,
    /// Why strict validation failed, if it did.
    pub error: Option<String>,
}

impl Validated {
    fn clean(text: String, fields: BTreeMap<String, String>) -> Self {
        Self {
            status: AnnotationStatus::Clean,
            text,
            fields,
            repairs: Vec::new(),
            error: None,
        }
    }
}

type StageOutput = (String, BTreeMap<String, String>);

/// Inner-thought rendering: at least one thought, action or speech segment.
/// A leading plan is dropped; it belongs to the planning stage.
fn validate_role_thinking(text: &str) -> Result<StageOutput, String> {
    let parsed = parse(text).map_err(|e| e.to_string())?;
    let rendered = parsed.render_without(&[SegmentKind::Plan]);
    if rendered.trim().is_empty() {
        return Err("no thought, action or speech segment".to_string());
    }
    Ok((rendered, BTreeMap::new()))
}

/// Plan text: the `<system_thinking>` spans, or the whole text when it is
/// untagged prose.
fn validate_system_thinking(text: &str) -> Result<StageOutput, String> {
    let parsed = parse(text).map_err(|e| e.to_string())?;
    let plan = if parsed.has(SegmentKind::Plan) {
        parsed.spans(SegmentKind::Plan).join("\n\n")
    } else if parsed
        .segments
        .iter()
        .all(|s| s.kind == SegmentKind::Speech)
    {
        parsed.spans(SegmentKind::Speech).join("\n\n")
    } else {
        return Err("plan output contains role segments but no plan".to_string());
    };
    if plan.trim().is_empty() {
        return Err("empty plan".to_string());
    }
    Ok((plan, BTreeMap::new()))
}

/// Setting fields from a JSON object. Accepts the payload at the top level
/// or wrapped in a single-entry `characters` map.
fn validate_setting(value: &Value) -> Result<StageOutput, String> {
    let mut object = value
        .as_object()
        .ok_or_else(|| "setting output is not an object".to_string())?;
    if let Some(inner) = object
        .get("characters")
        .and_then(|c| c.as_object())
        .filter(|c| c.len() == 1)
        .and_then(|c| c.values().next())
        .and_then(|v| v.as_object())
    {
        object = inner;
    }

    let mut fields = BTreeMap::new();
    for field in SettingField::ALL {
        let enriched_key = field.enriched_key();
        let alias = format!("character_{}", enriched_key);
        let found = object
            .get(&enriched_key)
            .or_else(|| object.get(&alias))
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(v) = found {
            fields.insert(enriched_key, v.to_string());
        }
    }
    if fields.is_empty() {
        return Err("no enriched setting field present".to_string());
    }
    if let Some(reasoning) = object.get("reasoning").and_then(|v| v.as_str()) {
        fields.insert("reasoning".to_string(), reasoning.trim().to_string());
    }
    let text = serde_json::to_string(&fields).map_err(|e| e.to_string())?;
    Ok((text, fields))
}

fn validate_judgement(value: &Value) -> Result<StageOutput, String> {
    if !(value.is_object() || value.is_array()) {
        return Err("judgement output is not an object or array".to_string());
    }
    let text = serde_json::to_string(value).map_err(|e| e.to_string())?;
    Ok((text, BTreeMap::new()))
}

fn validate_json_stage(stage: Stage, value: &Value) -> Result<StageOutput, String> {
    match stage {
        Stage::SettingCompletion => validate_setting(value),
        _ => validate_judgement(value),
    }
}

fn validate_text_stage(stage: Stage, text: &str) -> Result<StageOutput, String> {
    match stage {
        Stage::SystemThinking => validate_system_thinking(text),
        _ => validate_role_thinking(text),
    }
}

fn expects_json(stage: Stage) -> bool {
    matches!(stage, Stage::SettingCompletion | Stage::Judgement)
}

/// Validates a successful result for `stage`, repairing it when needed.
pub fn validate_output(stage: Stage, output: &ResultOutput) -> Validated {
    let raw = output.as_text();

    let strict = match (expects_json(stage), output) {
        (true, ResultOutput::Structured(value)) => validate_json_stage(stage, value),
        (true, ResultOutput::Text(text)) => serde_json::from_str::<Value>(text.trim())
            .map_err(|e| e.to_string())
            .and_then(|v| validate_json_stage(stage, &v)),
        (false, _) => validate_text_stage(stage, &raw),
    };

    let strict_error = match strict {
        Ok((text, fields)) => return Validated::clean(text, fields),
        Err(e) => e,
    };

    let repaired = if expects_json(stage) {
        repair_json(&raw).and_then(|recovered| {
            validate_json_stage(stage, &recovered.value)
                .ok()
                .map(|out| (out, recovered.actions))
        })
    } else {
        let (text, actions) = repair_tagged_text(&raw);
        validate_text_stage(stage, &text)
            .ok()
            .map(|out| (out, actions))
    };

    match repaired {
        Some(((text, fields), repairs)) => Validated {
            status: AnnotationStatus::Repaired,
            text,
            fields,
            repairs,
            error: Some(strict_error),
        },
        None => Validated {
            status: AnnotationStatus::Unstructured,
            text: raw.into_owned(),
            fields: BTreeMap::new(),
            repairs: Vec::new(),
            error: Some(strict_error),
        },
    }
}
