//! In-memory view of a record file with an identity index.

use std::collections::HashMap;
use std::path::Path;

use tracing::info;

use super::jsonl::{read_jsonl, write_jsonl};
use super::records::{CharacterSetting, CorpusRecord, IdentityKey, Turn};
use crate::error::StoreError;

#[derive(Debug, Clone, Copy)]
enum Slot {
    Turn {
        record: usize,
        scene: usize,
        conversation: usize,
        turn: usize,
    },
    Setting {
        record: usize,
    },
}

/// Records of one stage file, addressable by [`IdentityKey`].
#[derive(Debug, Clone)]
pub struct RecordStore {
    records: Vec<CorpusRecord>,
    index: HashMap<IdentityKey, Slot>,
}

impl RecordStore {
    /// Builds the store, rejecting any identity key that occurs twice.
    pub fn from_records(records: Vec<CorpusRecord>) -> Result<Self, StoreError> {
        let mut index = HashMap::new();
        for (r, record) in records.iter().enumerate() {
            for name in record.settings.keys() {
                let key = IdentityKey::setting(&record.corpus_unit_id, name);
                if index.insert(key.clone(), Slot::Setting { record: r }).is_some() {
                    return Err(StoreError::DuplicateKey(key.to_string()));
                }
            }
            for (s, scene) in record.scenes.iter().enumerate() {
                for (c, conversation) in scene.conversations.iter().enumerate() {
                    for (t, turn) in conversation.turns.iter().enumerate() {
                        let key = IdentityKey::turn(
                            &record.corpus_unit_id,
                            scene.scene_index,
                            conversation.conversation_index,
                            turn.turn_index,
                            &turn.participant,
                        );
                        let slot = Slot::Turn {
                            record: r,
                            scene: s,
                            conversation: c,
                            turn: t,
                        };
                        if index.insert(key.clone(), slot).is_some() {
                            return Err(StoreError::DuplicateKey(key.to_string()));
                        }
                    }
                }
            }
        }
        Ok(Self { records, index })
    }

    /// Loads a record file. Malformed lines are skipped and their count
    /// returned alongside the store.
    pub async fn load(path: &Path) -> Result<(Self, usize), StoreError> {
        let read = read_jsonl::<CorpusRecord>(path).await?;
        let store = Self::from_records(read.items)?;
        info!(
            path = %path.display(),
            records = store.records.len(),
            keys = store.index.len(),
            skipped = read.skipped,
            "Loaded record store"
        );
        Ok((store, read.skipped))
    }

    /// Writes the records atomically in their original order.
    pub async fn save(&self, path: &Path) -> Result<usize, StoreError> {
        write_jsonl(path, &self.records).await
    }

    pub fn records(&self) -> &[CorpusRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn turn(&self, key: &IdentityKey) -> Option<&Turn> {
        match self.index.get(key)? {
            Slot::Turn {
                record,
                scene,
                conversation,
                turn,
            } => Some(
                &self.records[*record].scenes[*scene].conversations[*conversation].turns[*turn],
            ),
            Slot::Setting { .. } => None,
        }
    }

    pub fn turn_mut(&mut self, key: &IdentityKey) -> Option<&mut Turn> {
        match *self.index.get(key)? {
            Slot::Turn {
                record,
                scene,
                conversation,
                turn,
            } => Some(
                &mut self.records[record].scenes[scene].conversations[conversation].turns[turn],
            ),
            Slot::Setting { .. } => None,
        }
    }

    pub fn setting(&self, key: &IdentityKey) -> Option<&CharacterSetting> {
        match self.index.get(key)? {
            Slot::Setting { record } => self.records[*record].settings.get(&key.participant),
            Slot::Turn { .. } => None,
        }
    }

    pub fn setting_mut(&mut self, key: &IdentityKey) -> Option<&mut CharacterSetting> {
        match *self.index.get(key)? {
            Slot::Setting { record } => self.records[record].settings.get_mut(&key.participant),
            Slot::Turn { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::records::{Conversation, Scene};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn record(turns: Vec<Turn>) -> CorpusRecord {
        let mut settings = BTreeMap::new();
        settings.insert(
            "Alice".to_string(),
            CharacterSetting {
                profile: "Alice's profile".to_string(),
                ..Default::default()
            },
        );
        CorpusRecord {
            corpus_unit_id: "book".to_string(),
            title: "Book".to_string(),
            scenes: vec![Scene {
                scene_index: 0,
                chapter: "One".to_string(),
                summary: String::new(),
                source_excerpt: "Once upon a time".to_string(),
                conversations: vec![Conversation {
                    conversation_index: 0,
                    scenario: "A meeting".to_string(),
                    topic: String::new(),
                    turns,
                }],
            }],
            settings,
        }
    }

    #[test]
    fn test_lookup_by_key() {
        let store = RecordStore::from_records(vec![record(vec![
            Turn::new(0, "Alice", "Hi"),
            Turn::new(1, "Bob", "Hello"),
        ])])
        .expect("store");

        assert!(!store.is_empty());
        assert_eq!(store.len(), 3);
        let key = IdentityKey::turn("book", 0, 0, 1, "Bob");
        assert_eq!(store.turn(&key).map(|t| t.utterance.as_str()), Some("Hello"));
        assert!(store.setting(&key).is_none());

        let setting_key = IdentityKey::setting("book", "Alice");
        assert_eq!(
            store.setting(&setting_key).map(|s| s.profile.as_str()),
            Some("Alice's profile")
        );
        // Participant is part of the key.
        assert!(store.turn(&IdentityKey::turn("book", 0, 0, 1, "Alice")).is_none());
    }

    #[test]
    fn test_duplicate_turn_key_rejected() {
        let result = RecordStore::from_records(vec![record(vec![
            Turn::new(0, "Alice", "Hi"),
            Turn::new(0, "Alice", "Hi again"),
        ])]);
        assert!(matches!(result, Err(StoreError::DuplicateKey(_))));
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("records.jsonl");
        let store =
            RecordStore::from_records(vec![record(vec![Turn::new(0, "Alice", "Hi")])]).unwrap();
        store.save(&path).await.expect("save");

        let (loaded, skipped) = RecordStore::load(&path).await.expect("load");
        assert_eq!(skipped, 0);
        assert_eq!(loaded.records(), store.records());
    }
}
