//! Scanner for annotated turn text.
//!
//! Recognised markers are `<system_thinking>`, `<role_thinking>` and
//! `<role_action>`; anything outside a marker pair is speech. A `<` that does
//! not begin a lowercase `<name>` or `</name>` token is ordinary text, so
//! prose such as `a < b` or `<3` passes through untouched.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TagParseError;

/// Kind of a labeled span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    /// Third-person planning text.
    Plan,
    /// The speaker's inner thought.
    Thought,
    /// Physical action.
    Action,
    /// Spoken line (untagged text).
    Speech,
}

impl SegmentKind {
    /// Canonical order: plan, thought, action, speech.
    pub const CANONICAL: [SegmentKind; 4] = [
        SegmentKind::Plan,
        SegmentKind::Thought,
        SegmentKind::Action,
        SegmentKind::Speech,
    ];

    /// Marker name, or `None` for speech.
    pub fn marker(&self) -> Option<&'static str> {
        match self {
            SegmentKind::Plan => Some("system_thinking"),
            SegmentKind::Thought => Some("role_thinking"),
            SegmentKind::Action => Some("role_action"),
            SegmentKind::Speech => None,
        }
    }

    pub fn from_marker(name: &str) -> Option<Self> {
        match name {
            "system_thinking" => Some(SegmentKind::Plan),
            "role_thinking" => Some(SegmentKind::Thought),
            "role_action" => Some(SegmentKind::Action),
            _ => None,
        }
    }
}

impl fmt::Display for SegmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.marker().unwrap_or("speech"))
    }
}

/// One labeled span, trimmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub kind: SegmentKind,
    pub text: String,
}

impl Segment {
    pub fn new(kind: SegmentKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }

    fn render_into(&self, out: &mut String) {
        match self.kind.marker() {
            Some(name) => {
                out.push('<');
                out.push_str(name);
                out.push('>');
                out.push_str(&self.text);
                out.push_str("</");
                out.push_str(name);
                out.push('>');
            }
            None => out.push_str(&self.text),
        }
    }
}

/// Result of a successful parse: segments in source order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedText {
    pub segments: Vec<Segment>,
}

impl ParsedText {
    /// Ordered spans of one kind.
    pub fn spans(&self, kind: SegmentKind) -> Vec<&str> {
        self.segments
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| s.text.as_str())
            .collect()
    }

    pub fn has(&self, kind: SegmentKind) -> bool {
        self.segments.iter().any(|s| s.kind == kind)
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Plan segments precede everything else. Thought, action and speech may
    /// interleave freely.
    pub fn is_canonical(&self) -> bool {
        match self.segments.iter().position(|s| s.kind != SegmentKind::Plan) {
            Some(idx) => !self.segments[idx..]
                .iter()
                .any(|s| s.kind == SegmentKind::Plan),
            None => true,
        }
    }

    /// Renders the segments back to marker form, keeping only `kinds`.
    pub fn render_only(&self, kinds: &[SegmentKind]) -> String {
        let mut out = String::new();
        for segment in self.segments.iter().filter(|s| kinds.contains(&s.kind)) {
            if segment.kind == SegmentKind::Speech && needs_space(&out) {
                out.push(' ');
            }
            segment.render_into(&mut out);
        }
        out
    }

    /// Renders every segment.
    pub fn render(&self) -> String {
        self.render_only(&SegmentKind::CANONICAL)
    }

    /// Renders without the given kinds.
    pub fn render_without(&self, excluded: &[SegmentKind]) -> String {
        let kept: Vec<SegmentKind> = SegmentKind::CANONICAL
            .iter()
            .copied()
            .filter(|k| !excluded.contains(k))
            .collect();
        self.render_only(&kept)
    }
}

fn needs_space(out: &str) -> bool {
    out.chars()
        .last()
        .map(|c| !c.is_whitespace() && c != '>')
        .unwrap_or(false)
}

#[derive(Debug, Clone, Copy)]
struct Marker<'a> {
    name: &'a str,
    closing: bool,
    /// Byte offset just past the closing `>`.
    end: usize,
}

/// Reads a marker token at `at` (which must hold `<`). Returns `None` when the
/// bytes there do not form a marker token.
fn read_marker(text: &str, at: usize) -> Option<Marker<'_>> {
    let bytes = text.as_bytes();
    let mut j = at + 1;
    let closing = bytes.get(j) == Some(&b'/');
    if closing {
        j += 1;
    }
    let name_start = j;
    while j < bytes.len() && (bytes[j].is_ascii_lowercase() || bytes[j] == b'_') {
        j += 1;
    }
    if j == name_start || bytes.get(j) != Some(&b'>') {
        return None;
    }
    Some(Marker {
        name: &text[name_start..j],
        closing,
        end: j + 1,
    })
}

/// Finds every marker token in `text` as `(offset, name, closing, end)`.
pub(crate) fn marker_tokens(text: &str) -> Vec<(usize, &str, bool, usize)> {
    let mut tokens = Vec::new();
    let mut pos = 0;
    while let Some(rel) = text[pos..].find('<') {
        let at = pos + rel;
        match read_marker(text, at) {
            Some(m) => {
                tokens.push((at, m.name, m.closing, m.end));
                pos = m.end;
            }
            None => pos = at + 1,
        }
    }
    tokens
}

enum State {
    Speech,
    Inside { kind: SegmentKind, open_at: usize },
}

fn push_segment(segments: &mut Vec<Segment>, kind: SegmentKind, raw: &str) {
    let text = raw.trim();
    if !text.is_empty() {
        segments.push(Segment::new(kind, text));
    }
}

/// Parses annotated text into labeled segments.
///
/// Any subset of segment kinds may be absent. Nested markers, closers that
/// do not match the open segment, unknown marker names and segments left
/// open at end of input are errors; the parser never guesses.
pub fn parse(text: &str) -> Result<ParsedText, TagParseError> {
    let mut segments = Vec::new();
    let mut state = State::Speech;
    let mut run_start = 0usize;

    for (at, name, closing, end) in marker_tokens(text) {
        let kind = SegmentKind::from_marker(name).ok_or_else(|| TagParseError::UnknownMarker {
            name: name.to_string(),
            offset: at,
        })?;

        state = match (state, closing) {
            (State::Speech, false) => {
                push_segment(&mut segments, SegmentKind::Speech, &text[run_start..at]);
                State::Inside { kind, open_at: at }
            }
            (State::Speech, true) => {
                return Err(TagParseError::MismatchedClose {
                    expected: "no open segment".to_string(),
                    found: name.to_string(),
                    offset: at,
                })
            }
            (State::Inside { kind: open, .. }, false) => {
                return Err(TagParseError::NestedMarker {
                    outer: open.to_string(),
                    inner: name.to_string(),
                    offset: at,
                })
            }
            (State::Inside { kind: open, .. }, true) if open == kind => {
                push_segment(&mut segments, kind, &text[run_start..at]);
                State::Speech
            }
            (State::Inside { kind: open, .. }, true) => {
                return Err(TagParseError::MismatchedClose {
                    expected: format!("</{}>", open),
                    found: name.to_string(),
                    offset: at,
                })
            }
        };
        run_start = end;
    }

    match state {
        State::Inside { kind, open_at } => Err(TagParseError::Unterminated {
            name: kind.to_string(),
            offset: open_at,
        }),
        State::Speech => {
            push_segment(&mut segments, SegmentKind::Speech, &text[run_start..]);
            if segments.is_empty() {
                Err(TagParseError::Empty)
            } else {
                Ok(ParsedText { segments })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_canonical_order() {
        let text = "<system_thinking>Alice is wary.</system_thinking><role_thinking>Who is he?</role_thinking><role_action>steps back</role_action>Who are you?";
        let parsed = parse(text).expect("parse");
        assert_eq!(parsed.spans(SegmentKind::Plan), vec!["Alice is wary."]);
        assert_eq!(parsed.spans(SegmentKind::Thought), vec!["Who is he?"]);
        assert_eq!(parsed.spans(SegmentKind::Action), vec!["steps back"]);
        assert_eq!(parsed.spans(SegmentKind::Speech), vec!["Who are you?"]);
        assert!(parsed.is_canonical());
        assert_eq!(parsed.render(), text);
    }

    #[test]
    fn test_subsets_and_interleaving() {
        let parsed = parse("Hello.").expect("speech only");
        assert_eq!(parsed.segments.len(), 1);
        assert!(!parsed.has(SegmentKind::Thought));

        let parsed = parse(
            "<role_thinking>a</role_thinking>Hi.<role_action>waves</role_action><role_thinking>b</role_thinking>Bye.",
        )
        .expect("interleaved");
        assert_eq!(parsed.spans(SegmentKind::Thought), vec!["a", "b"]);
        assert_eq!(parsed.spans(SegmentKind::Speech), vec!["Hi.", "Bye."]);
    }

    #[test]
    fn test_plain_angle_brackets_are_text() {
        let parsed = parse("I <3 you, and 2 < 5. <Tom> said so.").expect("parse");
        assert_eq!(
            parsed.spans(SegmentKind::Speech),
            vec!["I <3 you, and 2 < 5. <Tom> said so."]
        );
    }

    #[test]
    fn test_structural_errors() {
        assert!(matches!(
            parse("<role_thinking>open"),
            Err(TagParseError::Unterminated { offset: 0, .. })
        ));
        assert!(matches!(
            parse("<role_thinking>a<role_action>b</role_action></role_thinking>"),
            Err(TagParseError::NestedMarker { offset: 16, .. })
        ));
        assert!(matches!(
            parse("<role_thinking>a</role_action>"),
            Err(TagParseError::MismatchedClose { .. })
        ));
        assert!(matches!(
            parse("speech</role_action>"),
            Err(TagParseError::MismatchedClose { .. })
        ));
        assert!(matches!(
            parse("<think>hmm</think>Hi"),
            Err(TagParseError::UnknownMarker { .. })
        ));
        assert_eq!(parse("   "), Err(TagParseError::Empty));
    }

    #[test]
    fn test_adjacent_segments_keep_their_own_markers() {
        let parsed = parse("<role_action>nods</role_action><role_action>sits</role_action>")
            .expect("parse");
        assert_eq!(parsed.spans(SegmentKind::Action), vec!["nods", "sits"]);
    }

    #[test]
    fn test_render_without_thoughts() {
        let parsed = parse("<role_thinking>secret</role_thinking><role_action>smiles</role_action>Welcome.")
            .expect("parse");
        assert_eq!(
            parsed.render_without(&[SegmentKind::Thought]),
            "<role_action>smiles</role_action>Welcome."
        );
        assert_eq!(parsed.render_only(&[SegmentKind::Speech]), "Welcome.");
    }

    #[test]
    fn test_plan_after_speech_is_not_canonical() {
        let parsed = parse("Hi.<system_thinking>late plan</system_thinking>").expect("parse");
        assert!(!parsed.is_canonical());
    }
}
