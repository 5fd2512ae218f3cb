//! Prompt text for annotation stages.
//!
//! The wording is a placeholder: only the section layout matters to the rest
//! of the pipeline.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};

use crate::repair::repair_tagged_text;
use crate::tags::{normalize_legacy, parse, SegmentKind};

pub const ROLE_THINKING_INSTRUCTION: &str = "Rewrite the target turn in character. Wrap the speaker's private thoughts in <role_thinking></role_thinking> and physical actions in <role_action></role_action>; leave spoken words untagged. Keep the spoken words unchanged.";

pub const SYSTEM_THINKING_INSTRUCTION: &str = "Write a third-person plan describing how the speaker should portray the target turn, wrapped in <system_thinking></system_thinking>. Do not write the turn itself.";

pub const SETTING_INSTRUCTION: &str = "Enrich the character setting using the excerpts. Return one JSON object with any of the keys profile_enriched, background_enriched, motivation_enriched, description_enriched, experience_enriched, and a short reasoning string.";

pub const OUTPUT_FORMAT: &str = "Start with a single <system_thinking></system_thinking> block analysing how to portray the role. Then respond in character, using <role_thinking></role_thinking> for thoughts (invisible to others) and <role_action></role_action> for actions (visible to others). Thought, speech and action may appear several times and interleave freely.";

/// Character sheet used as the system prompt for a participant.
pub struct CharacterSheet<'a> {
    pub title: &'a str,
    pub participant: &'a str,
    pub profile: &'a str,
    pub scenario: &'a str,
    pub motivation: &'a str,
    pub others: &'a BTreeMap<String, String>,
    pub include_output_format: bool,
}

impl CharacterSheet<'_> {
    pub fn render(&self) -> String {
        let mut out = format!("You are {} from {}.\n\n", self.participant, self.title);
        out.push_str(&format!(
            "==={}'s Profile===\n{}\n\n",
            self.participant, self.profile
        ));
        out.push_str(&format!("===Current Scenario===\n{}\n\n", self.scenario));

        let others: Vec<String> = self
            .others
            .iter()
            .filter(|(name, profile)| name.as_str() != self.participant && !profile.is_empty())
            .map(|(name, profile)| format!("{}: {}", name, profile))
            .collect();
        if !others.is_empty() {
            out.push_str(&format!(
                "===Information about the other Characters===\n{}\n\n",
                others.join("\n\n")
            ));
        }
        if !self.motivation.is_empty() {
            out.push_str(&format!("===Your Inner Thoughts===\n{}\n\n", self.motivation));
        }
        if self.include_output_format {
            out.push_str(&format!("===Requirements===\n{}\n\n", OUTPUT_FORMAT));
        }
        out.trim_end().to_string()
    }
}

/// What other participants can observe of a turn: actions and speech, never
/// thoughts. Text that does not parse even after tag repair is stripped
/// leniently instead.
pub fn observable_text(text: &str) -> String {
    let normalized = normalize_legacy(text);
    let parsed = parse(&normalized).or_else(|_| parse(&repair_tagged_text(&normalized).0));
    match parsed {
        Ok(parsed) => parsed.render_without(&[SegmentKind::Plan, SegmentKind::Thought]),
        Err(_) => strip_thoughts(&normalized),
    }
}

fn thought_span_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)<(?:role|system)_thinking>.*?(?:</(?:role|system)_thinking>|\z)|\[[^\]]*\]")
            .expect("valid thought span regex")
    })
}

fn marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"</?([A-Za-z_][A-Za-z0-9_]*)>").expect("valid marker regex"))
}

/// Drops thought spans, unterminated ones included, and every marker other
/// than actions.
fn strip_thoughts(text: &str) -> String {
    let without = thought_span_re().replace_all(text, "");
    let cleaned = marker_re().replace_all(&without, |caps: &Captures| {
        if &caps[1] == "role_action" {
            caps[0].to_string()
        } else {
            String::new()
        }
    });
    cleaned.trim().to_string()
}
