//! Repair of malformed tagged text.
//!
//! Generation often stops mid-segment, leaves a half-written marker at the
//! end, or emits a closer for a segment it never opened. The passes here fix
//! exactly those shapes and then hand the text back to the strict parser.

use std::sync::OnceLock;

use regex::Regex;

use super::RepairAction;
use crate::request::TRUNCATION_MARKER;
use crate::tags::{marker_tokens, SegmentKind};

fn partial_marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"</?[a-z_]*$").expect("valid partial marker regex"))
}

fn reasoning_block_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<think>.*?</think>").expect("valid reasoning regex"))
}

/// Removes `<think>` blocks emitted by reasoning models. When only the closer
/// survives, everything before it is reasoning.
pub fn strip_reasoning(text: &str) -> String {
    let without_blocks = reasoning_block_re().replace_all(text, "");
    match without_blocks.rfind("</think>") {
        Some(idx) => without_blocks[idx + "</think>".len()..].to_string(),
        None => without_blocks.into_owned(),
    }
}

/// Removes artifacts that a cut-off generation leaves at the end of the text:
/// code fences, a half-written marker, and echoed truncation markers.
pub fn strip_truncation_artifacts(text: &str) -> String {
    let mut out = text.trim().to_string();
    loop {
        let before = out.len();
        if let Some(stripped) = out.strip_prefix("```") {
            out = stripped
                .trim_start_matches(|c: char| c.is_ascii_alphanumeric())
                .trim_start()
                .to_string();
        }
        if let Some(stripped) = out.strip_suffix("```") {
            out = stripped.trim_end().to_string();
        }
        if let Some(stripped) = out.strip_suffix(TRUNCATION_MARKER) {
            out = stripped.trim_end().to_string();
        }
        if let Some(m) = partial_marker_re().find(&out) {
            out.truncate(m.start());
            out = out.trim_end().to_string();
        }
        if out.len() == before {
            return out;
        }
    }
}

/// Rebuilds the marker structure: closers without a matching open segment are
/// dropped, and a segment still open when the next one starts (or when the
/// text ends) is closed there.
pub fn balance_markers(text: &str) -> (String, Vec<RepairAction>) {
    let mut out = String::with_capacity(text.len() + 32);
    let mut open: Option<SegmentKind> = None;
    let mut dropped = false;
    let mut closed = false;
    let mut cursor = 0usize;

    for (at, name, closing, end) in marker_tokens(text) {
        out.push_str(&text[cursor..at]);
        cursor = end;

        let Some(kind) = SegmentKind::from_marker(name) else {
            // Unknown markers are left for the parser to reject.
            out.push_str(&text[at..end]);
            continue;
        };

        match (open, closing) {
            (None, false) => {
                out.push_str(&text[at..end]);
                open = Some(kind);
            }
            (Some(current), false) => {
                push_closer(&mut out, current);
                closed = true;
                out.push_str(&text[at..end]);
                open = Some(kind);
            }
            (Some(current), true) if current == kind => {
                out.push_str(&text[at..end]);
                open = None;
            }
            (_, true) => dropped = true,
        }
    }
    out.push_str(&text[cursor..]);

    if let Some(current) = open {
        let trimmed_len = out.trim_end().len();
        out.truncate(trimmed_len);
        push_closer(&mut out, current);
        closed = true;
    }

    let mut actions = Vec::new();
    if dropped {
        actions.push(RepairAction::DroppedStrayClosers);
    }
    if closed {
        actions.push(RepairAction::ClosedSegments);
    }
    (out, actions)
}

fn push_closer(out: &mut String, kind: SegmentKind) {
    if let Some(name) = kind.marker() {
        out.push_str("</");
        out.push_str(name);
        out.push('>');
    }
}

/// Runs every tag repair pass in order and returns the rewritten text with
/// the actions that changed it.
pub fn repair_tagged_text(raw: &str) -> (String, Vec<RepairAction>) {
    let mut actions = Vec::new();

    let text = strip_reasoning(raw);
    if text.trim() != raw.trim() {
        actions.push(RepairAction::StrippedReasoning);
    }

    let stripped = strip_truncation_artifacts(&text);
    if stripped != text.trim() {
        actions.push(RepairAction::StrippedTruncationArtifacts);
    }

    let (balanced, balance_actions) = balance_markers(&stripped);
    actions.extend(balance_actions);
    (balanced, actions)
}
