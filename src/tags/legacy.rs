//! Conversion from the corpus' native bracket notation.
//!
//! Source utterances write inner thoughts as `[...]` and actions as `(...)`.
//! Downstream code works only with marker form.

use std::sync::OnceLock;

use regex::Regex;

use super::parser::marker_tokens;

fn thought_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[([^\]]+)\]").expect("valid thought regex"))
}

fn action_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\(([^()]+)\)").expect("valid action regex"))
}

fn closer_space_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(</role_thinking>|</role_action>)\s+").expect("valid closer regex")
    })
}

/// Converts `[thought]` and `(action)` notation to markers.
///
/// Text that already contains markers is returned unchanged.
pub fn normalize_legacy(utterance: &str) -> String {
    if !marker_tokens(utterance).is_empty() {
        return utterance.to_string();
    }
    let converted = thought_re().replace_all(utterance, "<role_thinking>$1</role_thinking>");
    let converted = action_re().replace_all(&converted, "<role_action>$1</role_action>");
    closer_space_re()
        .replace_all(&converted, "$1")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_legacy() {
        assert_eq!(
            normalize_legacy("[I am tired] (knocks twice) Open up."),
            "<role_thinking>I am tired</role_thinking><role_action>knocks twice</role_action>Open up."
        );
    }

    #[test]
    fn test_normalize_leaves_marker_text_alone() {
        let text = "<role_action>nods</role_action> (aside) fine";
        assert_eq!(normalize_legacy(text), text);
    }

    #[test]
    fn test_normalize_plain_text() {
        assert_eq!(normalize_legacy("  Just words.  "), "Just words.");
    }
}
