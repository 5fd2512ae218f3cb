//! Corpus ingestion.
//!
//! Converts a directory of per-book JSON files into record-store lines. Each
//! book file holds `plots`, each plot a list of `conversation` entries with
//! `dialogues`, plus a `character_datasets` map of character profiles.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::records::{CharacterSetting, Conversation, CorpusRecord, Scene, Turn};
use crate::error::StoreError;

#[derive(Debug, Deserialize)]
struct RawBook {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    plots: Vec<RawPlot>,
    #[serde(default)]
    character_datasets: BTreeMap<String, RawCharacter>,
}

#[derive(Debug, Deserialize)]
struct RawPlot {
    #[serde(default)]
    text: String,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    chapter: String,
    #[serde(default)]
    key_characters: Vec<RawKeyCharacter>,
    #[serde(default)]
    conversation: Vec<RawConversation>,
}

#[derive(Debug, Deserialize)]
struct RawConversation {
    #[serde(default)]
    scenario: String,
    #[serde(default)]
    topic: String,
    #[serde(default)]
    key_characters: Vec<RawKeyCharacter>,
    #[serde(default)]
    dialogues: Vec<RawDialogue>,
}

#[derive(Debug, Deserialize)]
struct RawDialogue {
    #[serde(default)]
    character: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawKeyCharacter {
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    experience: String,
    #[serde(default)]
    motivation: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawCharacter {
    #[serde(default)]
    profile: String,
    #[serde(default)]
    background: String,
}

/// Counters reported by an ingestion run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub books: usize,
    pub scenes: usize,
    pub conversations: usize,
    pub turns: usize,
    pub dropped_scenes: usize,
    pub dropped_conversations: usize,
    pub failed_files: usize,
}

/// Lists `*.json` book files under the corpus root in lexical order.
pub fn book_files(corpus_root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(corpus_root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
        .collect();
    files.sort();
    files
}

/// Converts one book's JSON text into a record.
///
/// Plots without source text and conversations without dialogue are dropped
/// and counted in `summary`. Indices keep their position in the source file so
/// identity keys stay stable when neighbours are dropped.
pub fn convert_book(
    corpus_unit_id: &str,
    content: &str,
    summary: &mut IngestSummary,
) -> Result<CorpusRecord, StoreError> {
    let raw: RawBook = serde_json::from_str(content).map_err(|e| StoreError::Ingest {
        path: corpus_unit_id.to_string(),
        reason: e.to_string(),
    })?;

    let mut settings: BTreeMap<String, CharacterSetting> = BTreeMap::new();
    for (name, character) in &raw.character_datasets {
        settings.insert(
            name.clone(),
            CharacterSetting {
                profile: character.profile.clone(),
                background: character.background.clone(),
                ..Default::default()
            },
        );
    }

    let mut scenes = Vec::new();
    for (plot_idx, plot) in raw.plots.iter().enumerate() {
        if plot.text.trim().is_empty() {
            summary.dropped_scenes += 1;
            continue;
        }

        for kc in &plot.key_characters {
            absorb_key_character(&mut settings, kc, false);
        }

        let mut conversations = Vec::new();
        for (conv_idx, conv) in plot.conversation.iter().enumerate() {
            if conv.dialogues.is_empty() {
                summary.dropped_conversations += 1;
                continue;
            }
            for kc in &conv.key_characters {
                absorb_key_character(&mut settings, kc, true);
            }
            let turns: Vec<Turn> = conv
                .dialogues
                .iter()
                .enumerate()
                .map(|(i, d)| Turn::new(i as u32, d.character.trim(), d.message.clone()))
                .collect();
            summary.turns += turns.len();
            conversations.push(Conversation {
                conversation_index: conv_idx as u32,
                scenario: conv.scenario.clone(),
                topic: conv.topic.clone(),
                turns,
            });
        }

        summary.conversations += conversations.len();
        scenes.push(Scene {
            scene_index: plot_idx as u32,
            chapter: plot.chapter.clone(),
            summary: plot.summary.clone(),
            source_excerpt: plot.text.clone(),
            conversations,
        });
    }

    summary.scenes += scenes.len();
    Ok(CorpusRecord {
        corpus_unit_id: corpus_unit_id.to_string(),
        title: raw.title.unwrap_or_else(|| corpus_unit_id.to_string()),
        scenes,
        settings,
    })
}

/// Fills empty setting fields from a plot or conversation key-character entry.
/// The first non-empty value seen for a field wins.
fn absorb_key_character(
    settings: &mut BTreeMap<String, CharacterSetting>,
    kc: &RawKeyCharacter,
    conversation_level: bool,
) {
    let name = kc.name.trim();
    if name.is_empty() {
        return;
    }
    let entry = settings.entry(name.to_string()).or_default();
    if conversation_level {
        fill(&mut entry.motivation, &kc.motivation);
    } else {
        fill(&mut entry.description, &kc.description);
        fill(&mut entry.experience, &kc.experience);
    }
    if entry.profile.is_empty() {
        fill(&mut entry.profile, &kc.description);
    }
}

fn fill(target: &mut String, value: &str) {
    if target.trim().is_empty() && !value.trim().is_empty() {
        *target = value.trim().to_string();
    }
}

/// Ingests every book under `corpus_root`. Files that fail to parse are
/// logged and counted; they never abort the run.
pub async fn ingest_corpus(
    corpus_root: &Path,
) -> Result<(Vec<CorpusRecord>, IngestSummary), StoreError> {
    let mut summary = IngestSummary::default();
    let mut records = Vec::new();

    for path in book_files(corpus_root) {
        let unit_id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        let content = fs::read_to_string(&path).await?;
        match convert_book(&unit_id, &content, &mut summary) {
            Ok(record) => {
                debug!(book = %unit_id, scenes = record.scenes.len(), "Ingested book");
                summary.books += 1;
                records.push(record);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable book file");
                summary.failed_files += 1;
            }
        }
    }

    records.sort_by(|a, b| a.corpus_unit_id.cmp(&b.corpus_unit_id));
    info!(
        books = summary.books,
        conversations = summary.conversations,
        turns = summary.turns,
        failed = summary.failed_files,
        "Corpus ingestion complete"
    );
    Ok((records, summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const BOOK: &str = r#"{
        "plots": [
            {
                "text": "The hall was cold.",
                "summary": "Arrival",
                "chapter": "Chapter 1",
                "key_characters": [
                    {"name": "Bob", "description": "A guard", "experience": "Years at the gate"}
                ],
                "conversation": [
                    {
                        "scenario": "Alice arrives",
                        "key_characters": [{"name": "Alice", "motivation": "Get inside"}],
                        "dialogues": [
                            {"character": "Alice", "message": "[I am tired] (knocks) Open up."},
                            {"character": "Bob", "message": "Who goes there?"}
                        ]
                    },
                    {"scenario": "empty", "dialogues": []}
                ]
            },
            {"text": "", "conversation": []}
        ],
        "character_datasets": {"Alice": {"profile": "A traveller"}}
    }"#;

    #[test]
    fn test_convert_book() {
        let mut summary = IngestSummary::default();
        let record = convert_book("tale", BOOK, &mut summary).expect("convert");

        assert_eq!(record.corpus_unit_id, "tale");
        assert_eq!(record.scenes.len(), 1);
        assert_eq!(summary.dropped_scenes, 1);
        assert_eq!(summary.dropped_conversations, 1);
        assert_eq!(summary.turns, 2);

        let conv = &record.scenes[0].conversations[0];
        assert_eq!(conv.turns[1].participant, "Bob");
        assert_eq!(conv.turns[0].utterance, "[I am tired] (knocks) Open up.");

        let alice = &record.settings["Alice"];
        assert_eq!(alice.profile, "A traveller");
        assert_eq!(alice.motivation, "Get inside");
        let bob = &record.settings["Bob"];
        // Profile falls back to the key-character description.
        assert_eq!(bob.profile, "A guard");
        assert_eq!(bob.experience, "Years at the gate");
    }

    #[test]
    fn test_convert_book_rejects_invalid_json() {
        let mut summary = IngestSummary::default();
        let result = convert_book("bad", "{not json", &mut summary);
        assert!(matches!(result, Err(StoreError::Ingest { .. })));
    }

    #[tokio::test]
    async fn test_ingest_corpus_sorted_and_tolerant() {
        let dir = TempDir::new().expect("temp dir");
        std::fs::write(dir.path().join("zeta.json"), BOOK).unwrap();
        std::fs::write(dir.path().join("alpha.json"), BOOK).unwrap();
        std::fs::write(dir.path().join("broken.json"), "[").unwrap();

        let (records, summary) = ingest_corpus(dir.path()).await.expect("ingest");
        let ids: Vec<&str> = records.iter().map(|r| r.corpus_unit_id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "zeta"]);
        assert_eq!(summary.books, 2);
        assert_eq!(summary.failed_files, 1);
    }
}
