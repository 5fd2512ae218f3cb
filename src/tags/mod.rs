//! Tag parsing for annotated turn text.
//!
//! Annotated turns interleave inner thoughts, actions and speech, optionally
//! preceded by a third-person plan:
//!
//! ```
//! use roleplay_forge::tags::{parse, SegmentKind};
//!
//! let parsed = parse("<role_thinking>He lies.</role_thinking>I believe you.").unwrap();
//! assert_eq!(parsed.spans(SegmentKind::Thought), vec!["He lies."]);
//! assert_eq!(parsed.render_without(&[SegmentKind::Thought]), "I believe you.");
//! ```

mod legacy;
mod parser;

pub use legacy::normalize_legacy;
pub use parser::{parse, ParsedText, Segment, SegmentKind};
pub(crate) use parser::marker_tokens;
