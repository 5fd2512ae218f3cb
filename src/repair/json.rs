//! Recovery of JSON payloads from reasoning-model output.
//!
//! Model responses wrap the payload in code fences, surround it with
//! reasoning prose, leave inner quotes unescaped, or stop mid-object when the
//! generation budget runs out. [`repair_json`] runs a strict parse first and
//! then a fixed sequence of repair passes, re-parsing after each one.
//!
//! # Passes
//!
//! 1. Payload extraction (```json fence, generic fence, largest object)
//! 2. Escaping of inner quotes that do not end a string
//! 3. Removal of trailing commas before `}` or `]`
//! 4. Closing of an unterminated string and any open objects/arrays

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use super::RepairAction;

/// Structure of a possibly incomplete JSON document.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonStructure {
    /// Open containers in nesting order, as their closing characters.
    pub open: Vec<char>,
    /// Whether the scan ended inside a string literal.
    pub in_string: bool,
    /// Byte offset of the first `{` or `[`.
    pub start: Option<usize>,
}

impl JsonStructure {
    pub fn is_complete(&self) -> bool {
        self.open.is_empty() && !self.in_string
    }
}

/// Scans `s` and records which containers are still open at the end.
///
/// Stray closers are ignored rather than underflowing the stack.
pub fn analyze_json_structure(s: &str) -> JsonStructure {
    let mut open = Vec::new();
    let mut in_string = false;
    let mut escape_next = false;
    let mut start = None;

    for (i, c) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' | '[' if !in_string => {
                start.get_or_insert(i);
                open.push(if c == '{' { '}' } else { ']' });
            }
            '}' | ']' if !in_string => {
                if open.last() == Some(&c) {
                    open.pop();
                }
            }
            _ => {}
        }
    }

    JsonStructure {
        open,
        in_string,
        start,
    }
}

/// Finds the byte offset of the character that closes the container opened
/// at the start of `s` (`{` or `[`).
pub fn find_matching_close(s: &str) -> Option<usize> {
    let (open, close) = match s.chars().next()? {
        '{' => ('{', '}'),
        '[' => ('[', ']'),
        _ => return None,
    };
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            c if c == open && !in_string => depth += 1,
            c if c == close && !in_string => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn json_fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"```json\s*\n?([\s\S]*?)(?:\n?```|$)").expect("valid fence regex"))
}

fn generic_fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"```(?:\w+)?\s*\n?([\s\S]*?)\n?```").expect("valid fence regex"))
}

fn trailing_comma_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r",(\s*[}\]])").expect("valid comma regex"))
}

/// Body of the first ```json fence. An unterminated fence yields the rest of
/// the text.
pub fn extract_from_json_fence(content: &str) -> Option<&str> {
    let caps = json_fence_re().captures(content)?;
    let body = caps.get(1)?.as_str().trim();
    (!body.is_empty()).then_some(body)
}

/// Body of the first generic fence when it holds an object or array.
pub fn extract_from_generic_fence(content: &str) -> Option<&str> {
    let caps = generic_fence_re().captures(content)?;
    let body = caps.get(1)?.as_str().trim();
    body.starts_with(['{', '[']).then_some(body)
}

/// The largest complete, parseable object in `content`, preferring later
/// occurrences on equal size. Reasoning prose before the payload often
/// contains small example objects; the payload is the big one.
pub fn extract_largest_object(content: &str) -> Option<&str> {
    content
        .char_indices()
        .filter(|(_, c)| *c == '{')
        .filter_map(|(start, _)| {
            let end = find_matching_close(&content[start..])?;
            let candidate = &content[start..=start + end];
            serde_json::from_str::<Value>(candidate)
                .ok()
                .map(|_| (start, candidate))
        })
        .max_by(|(pos_a, a), (pos_b, b)| a.len().cmp(&b.len()).then(pos_a.cmp(pos_b)))
        .map(|(_, json)| json)
}

/// Escapes quotes inside string values that are not followed by a JSON
/// delimiter. A quote closes a string only when the next non-blank character
/// is one of `,}]:` or the input ends.
pub fn escape_inner_quotes(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len() + 8);
    let mut in_string = false;
    let mut escaped = false;

    for (i, &c) in chars.iter().enumerate() {
        if escaped {
            escaped = false;
            out.push(c);
            continue;
        }
        if c == '\\' && in_string {
            escaped = true;
            out.push(c);
            continue;
        }
        if c != '"' {
            out.push(c);
            continue;
        }
        if !in_string {
            in_string = true;
            out.push(c);
            continue;
        }
        let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
        match next {
            None | Some(',') | Some('}') | Some(']') | Some(':') => {
                in_string = false;
                out.push(c);
            }
            Some(_) => out.push_str("\\\""),
        }
    }
    out
}

/// Removes commas directly before a closing brace or bracket.
pub fn remove_trailing_commas(s: &str) -> String {
    trailing_comma_re().replace_all(s, "$1").into_owned()
}

/// Closes an unterminated string and every open container.
pub fn close_open_structures(s: &str) -> String {
    let structure = analyze_json_structure(s);
    let mut out = s.trim_end().to_string();
    if structure.in_string {
        // A dangling escape would swallow the closing quote.
        if out.ends_with('\\') {
            out.pop();
        }
        out.push('"');
    }
    let trimmed_len = out.trim_end_matches([',', ' ', '\n', '\t', '\r']).len();
    out.truncate(trimmed_len);
    if out.ends_with(':') {
        out.push_str("null");
    }
    for closer in structure.open.iter().rev() {
        out.push(*closer);
    }
    out
}

/// A value recovered from text, with the passes that were needed.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveredJson {
    pub value: Value,
    pub actions: Vec<RepairAction>,
}

fn parse_object(candidate: &str) -> Option<Value> {
    serde_json::from_str::<Value>(candidate)
        .ok()
        .filter(|v| v.is_object() || v.is_array())
}

/// Strict parse followed by the bounded repair sequence.
///
/// Returns `None` when no pass yields an object or array.
pub fn repair_json(raw: &str) -> Option<RecoveredJson> {
    let trimmed = raw.trim();
    if let Some(value) = parse_object(trimmed) {
        return Some(RecoveredJson {
            value,
            actions: Vec::new(),
        });
    }

    let mut actions = Vec::new();

    let extracted = extract_from_json_fence(trimmed)
        .or_else(|| extract_from_generic_fence(trimmed))
        .or_else(|| extract_largest_object(trimmed));
    let mut candidate = match extracted {
        Some(body) => {
            actions.push(RepairAction::ExtractedPayload);
            body.to_string()
        }
        None => {
            let start = analyze_json_structure(trimmed).start?;
            if start > 0 {
                actions.push(RepairAction::ExtractedPayload);
            }
            trimmed[start..].to_string()
        }
    };
    if let Some(value) = parse_object(&candidate) {
        return Some(RecoveredJson { value, actions });
    }

    let passes: [(RepairAction, fn(&str) -> String); 3] = [
        (RepairAction::EscapedInnerQuotes, escape_inner_quotes),
        (RepairAction::RemovedTrailingCommas, remove_trailing_commas),
        (RepairAction::ClosedStructures, close_open_structures),
    ];
    for (action, pass) in passes {
        let next = pass(&candidate);
        if next != candidate {
            actions.push(action);
            candidate = next;
        }
        if let Some(value) = parse_object(&candidate) {
            return Some(RecoveredJson { value, actions });
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strict_parse_needs_no_actions() {
        let recovered = repair_json(r#" {"a": 1} "#).expect("valid");
        assert!(recovered.actions.is_empty());
        assert_eq!(recovered.value, json!({"a": 1}));
    }

    #[test]
    fn test_fenced_payload_after_reasoning() {
        let raw = "Let me think. Example: {\"x\": 0}\n```json\n{\"profile_enriched\": \"A knight\"}\n```\nDone.";
        let recovered = repair_json(raw).expect("fenced");
        assert_eq!(recovered.value, json!({"profile_enriched": "A knight"}));
        assert_eq!(recovered.actions, vec![RepairAction::ExtractedPayload]);
    }

    #[test]
    fn test_largest_object_wins() {
        let raw = r#"e.g. {"a": 1} and then the answer {"a": 1, "b": {"c": 2}} ok"#;
        assert_eq!(
            extract_largest_object(raw),
            Some(r#"{"a": 1, "b": {"c": 2}}"#)
        );
    }

    #[test]
    fn test_escape_inner_quotes() {
        let broken = r#"{"profile": "She said "no" twice", "age": 3}"#;
        let fixed = escape_inner_quotes(broken);
        assert_eq!(fixed, r#"{"profile": "She said \"no\" twice", "age": 3}"#);
        let recovered = repair_json(broken).expect("repairable");
        assert_eq!(recovered.value["profile"], "She said \"no\" twice");
        assert_eq!(recovered.actions, vec![RepairAction::EscapedInnerQuotes]);
    }

    #[test]
    fn test_truncated_object_is_closed() {
        let raw = r#"{"profile_enriched": "A knight", "motivation_enriched": "To find the gra"#;
        let recovered = repair_json(raw).expect("closable");
        assert_eq!(recovered.value["motivation_enriched"], "To find the gra");
        assert!(recovered.actions.contains(&RepairAction::ClosedStructures));
    }

    #[test]
    fn test_trailing_comma_and_nested_truncation() {
        let raw = r#"{"list": [1, 2,], "inner": {"k": "v","#;
        let recovered = repair_json(raw).expect("repairable");
        assert_eq!(recovered.value, json!({"list": [1, 2], "inner": {"k": "v"}}));
    }

    #[test]
    fn test_structure_analysis_orders_closers() {
        let structure = analyze_json_structure(r#"{"a": [{"b": "x"#);
        assert_eq!(structure.open, vec!['}', ']', '}']);
        assert!(structure.in_string);
        assert_eq!(structure.start, Some(0));
        assert_eq!(close_open_structures(r#"{"a": [{"b": "x"#), r#"{"a": [{"b": "x"}]}"#);
    }

    #[test]
    fn test_no_json_is_unrecoverable() {
        assert!(repair_json("I refuse to answer.").is_none());
        assert!(repair_json("").is_none());
    }

    #[test]
    fn test_find_matching_close_respects_strings() {
        let s = r#"{"a": "}"} tail"#;
        assert_eq!(find_matching_close(s), Some(9));
        assert_eq!(find_matching_close("[1, [2]] x"), Some(7));
        assert_eq!(find_matching_close("x"), None);
    }
}
