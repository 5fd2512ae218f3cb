//! Record store: corpus records, identity keys and line-delimited file access.

pub mod ingest;
pub mod jsonl;
mod record_store;
pub mod records;

pub use ingest::{ingest_corpus, IngestSummary};
pub use jsonl::{
    append_jsonl, digest_bytes, digest_sources, read_jsonl, read_jsonl_if_exists,
    read_jsonl_sources, write_jsonl, JsonlRead,
};
pub use record_store::RecordStore;
pub use records::{
    Annotation, AnnotationStatus, CharacterSetting, Conversation, ConversationId, CorpusRecord,
    IdentityKey, Provenance, ResultRank, Scene, SettingField, Stage, Turn,
};
