//! Deterministic truncation of prompt context.
//!
//! Budgets are counted in characters, never bytes, so a cut can not split a
//! UTF-8 sequence. Every cut leaves [`TRUNCATION_MARKER`] in the text.

use super::task::TruncationNote;

/// Appended to a truncated field, and prefixed to truncated history.
pub const TRUNCATION_MARKER: &str = "…[truncated]";

/// Cuts `text` to `budget` characters. Returns the kept text (with marker
/// when cut) and a note describing the cut.
pub fn truncate_field(field: &str, text: &str, budget: usize) -> (String, Option<TruncationNote>) {
    let original_chars = text.chars().count();
    if original_chars <= budget {
        return (text.to_string(), None);
    }
    let mut kept: String = text.chars().take(budget).collect();
    let kept_chars = budget;
    kept.push_str(TRUNCATION_MARKER);
    (
        kept,
        Some(TruncationNote {
            field: field.to_string(),
            original_chars,
            kept_chars,
        }),
    )
}

/// Keeps the most recent history lines that fit in `budget` characters.
///
/// Older lines are dropped whole and replaced by a single marker line. The
/// newest line is always kept, cut to the budget if it alone exceeds it.
pub fn truncate_history(lines: &[String], budget: usize) -> (Vec<String>, Option<TruncationNote>) {
    let original_chars: usize = lines.iter().map(|l| l.chars().count()).sum();
    if original_chars <= budget {
        return (lines.to_vec(), None);
    }

    let mut used = 0usize;
    let mut keep_from = lines.len();
    for (idx, line) in lines.iter().enumerate().rev() {
        let len = line.chars().count();
        if used + len > budget {
            break;
        }
        used += len;
        keep_from = idx;
    }

    let mut kept: Vec<String> = Vec::with_capacity(lines.len() - keep_from + 1);
    if keep_from == lines.len() {
        // Even the newest line is over budget.
        let last = &lines[lines.len() - 1];
        let (cut, _) = truncate_field("history", last, budget);
        used = budget;
        keep_from = lines.len() - 1;
        kept.push(format!("{} {} earlier turns omitted", TRUNCATION_MARKER, keep_from));
        kept.push(cut);
    } else {
        kept.push(format!("{} {} earlier turns omitted", TRUNCATION_MARKER, keep_from));
        kept.extend(lines[keep_from..].iter().cloned());
    }

    (
        kept,
        Some(TruncationNote {
            field: "history".to_string(),
            original_chars,
            kept_chars: used,
        }),
    )
}
