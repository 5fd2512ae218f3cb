//! End-to-end tests over the public pipeline API.
//!
//! A small corpus is ingested from disk, annotated through a scripted
//! reasoning service, merged, expanded, labeled and allocated.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;

use roleplay_forge::allocate::{attach_labels, QualityAllocator, SplitPlan, TiePolicy};
use roleplay_forge::dispatch::{Dispatcher, ReasoningService};
use roleplay_forge::expand::{TrainingSample, TurnExpander};
use roleplay_forge::merge::{ledger_keys, ledger_path, ResultMerger};
use roleplay_forge::request::{InferenceResult, InferenceTask, RequestBuilder, ResultOutput};
use roleplay_forge::store::{
    ingest_corpus, read_jsonl, write_jsonl, AnnotationStatus, IdentityKey, RecordStore, Stage,
};
use roleplay_forge::ServiceError;

const CONVERSATIONS: u32 = 12;
const MALFORMED: &str = "<mood>tense</mood>Are you sure?";

/// Answers every task from a fixed table.
struct ScriptedService {
    replies: HashMap<IdentityKey, String>,
}

#[async_trait]
impl ReasoningService for ScriptedService {
    async fn complete(&self, task: &InferenceTask) -> Result<ResultOutput, ServiceError> {
        self.replies
            .get(&task.key)
            .cloned()
            .map(ResultOutput::Text)
            .ok_or(ServiceError::EmptyResponse)
    }
}

fn conversation(i: u32) -> serde_json::Value {
    json!({
        "scenario": format!("Inspection {}", i),
        "topic": "smuggling",
        "dialogues": [
            {"character": "Alice", "message": "Good evening."},
            {"character": "Bob", "message": "(smiles) Nothing to declare."},
            {"character": "Alice", "message": "Are you sure?"}
        ]
    })
}

async fn write_corpus(root: &Path) {
    let book = json!({
        "title": "The Customs House",
        "plots": [{
            "chapter": "One",
            "text": "The customs house at dusk. Alice checks the ledgers while Bob waits.",
            "summary": "Bob passes inspection.",
            "key_characters": [{"name": "Bob", "description": "A nervous traveller."}],
            "conversation": (0..CONVERSATIONS).map(conversation).collect::<Vec<_>>()
        }],
        "character_datasets": {
            "Alice": {"profile": "A quiet customs officer.", "background": "Twenty years at the border."}
        }
    });
    tokio::fs::create_dir_all(root).await.unwrap();
    tokio::fs::write(root.join("tale.json"), book.to_string())
        .await
        .unwrap();
}

async fn ingested_store(dir: &TempDir) -> RecordStore {
    let corpus = dir.path().join("corpus");
    write_corpus(&corpus).await;
    let (records, summary) = ingest_corpus(&corpus).await.unwrap();
    assert_eq!(summary.books, 1);
    assert_eq!(summary.turns, (CONVERSATIONS * 3) as usize);
    RecordStore::from_records(records).unwrap()
}

fn key(conversation: u32, turn: u32) -> IdentityKey {
    let participant = if turn == 1 { "Bob" } else { "Alice" };
    IdentityKey::turn("tale", 0, conversation, turn, participant)
}

/// Role-thinking replies for every turn. Conversation 0 carries distinct
/// thoughts and a malformed reply for its last turn.
fn role_thinking_replies() -> HashMap<IdentityKey, String> {
    let mut replies = HashMap::new();
    for c in 0..CONVERSATIONS {
        replies.insert(
            key(c, 0),
            format!("<role_thinking>A{} secret</role_thinking>Good evening.", c),
        );
        replies.insert(
            key(c, 1),
            format!(
                "<role_thinking>B{} secret</role_thinking><role_action>smiles</role_action>Nothing to declare.",
                c
            ),
        );
        replies.insert(
            key(c, 2),
            "<role_thinking>Doubtful.</role_thinking>Are you sure?".to_string(),
        );
    }
    replies.insert(key(0, 2), MALFORMED.to_string());
    replies
}

/// Builds, dispatches and merges the role-thinking stage.
async fn annotate(dir: &TempDir, store: &mut RecordStore) -> Vec<InferenceResult> {
    let built = RequestBuilder::new(Stage::RoleThinking).build(store);
    assert_eq!(built.tasks.len(), (CONVERSATIONS * 3) as usize);

    let results_path = dir.path().join("role_thinking.results.jsonl");
    let summary = Dispatcher::new(Arc::new(ScriptedService {
        replies: role_thinking_replies(),
    }))
    .with_concurrency(4)
    .with_backoff(Duration::from_millis(1))
    .dispatch(built.tasks, &results_path)
    .await
    .unwrap();
    assert_eq!(summary.merged, (CONVERSATIONS * 3) as usize);

    let results = read_jsonl::<InferenceResult>(&results_path).await.unwrap().items;
    let outcome = ResultMerger::new(Stage::RoleThinking, 3).merge(store, results.clone());
    write_jsonl(&ledger_path(dir.path(), Stage::RoleThinking), &outcome.failures)
        .await
        .unwrap();
    results
}

#[tokio::test]
async fn test_merge_twice_is_byte_identical() {
    let dir = TempDir::new().expect("temp dir");
    let mut store = ingested_store(&dir).await;
    let results = annotate(&dir, &mut store).await;

    let once = dir.path().join("once.jsonl");
    store.save(&once).await.unwrap();

    let (mut reloaded, skipped) = RecordStore::load(&once).await.unwrap();
    assert_eq!(skipped, 0);
    let outcome = ResultMerger::new(Stage::RoleThinking, 3).merge(&mut reloaded, results);
    assert_eq!(outcome.summary.merged, 0);

    let twice = dir.path().join("twice.jsonl");
    reloaded.save(&twice).await.unwrap();
    let a = tokio::fs::read(&once).await.unwrap();
    let b = tokio::fs::read(&twice).await.unwrap();
    assert_eq!(a, b);
}

#[tokio::test]
async fn test_valid_result_wins_over_malformed_for_same_key() {
    let dir = TempDir::new().expect("temp dir");
    let mut store = ingested_store(&dir).await;
    let k = key(3, 0);
    let task = InferenceTask::new(k.clone(), Stage::RoleThinking, "reasoning", Vec::new(), Vec::new());
    let valid = "<role_thinking>Watch his hands.</role_thinking>Good evening.";
    let results = vec![
        InferenceResult::success(&task, 2, ResultOutput::Text("<mood>x</mood>Good evening.".into())),
        InferenceResult::success(&task, 1, ResultOutput::Text(valid.into())),
    ];

    let merger = ResultMerger::new(Stage::RoleThinking, 3);
    merger.merge(&mut store, results.clone());
    let merged = store.turn(&k).unwrap().role_thinking.clone().unwrap();
    assert_eq!(merged.text, valid);
    assert_eq!(merged.status, AnnotationStatus::Clean);

    let second = merger.merge(&mut store, results);
    assert_eq!(second.summary.extra("unchanged"), 1);
    assert_eq!(store.turn(&k).unwrap().role_thinking.as_ref(), Some(&merged));
}

#[tokio::test]
async fn test_expanded_history_hides_other_participants_thoughts() {
    let dir = TempDir::new().expect("temp dir");
    let mut store = ingested_store(&dir).await;
    annotate(&dir, &mut store).await;

    let expanded = TurnExpander::new().expand(&store);
    assert_eq!(expanded.samples.len(), (CONVERSATIONS * 3) as usize);

    let conv0: Vec<&TrainingSample> = expanded
        .samples
        .iter()
        .filter(|s| s.source.conversation_index == 0)
        .collect();
    for (i, sample) in conv0.iter().enumerate() {
        assert_eq!(sample.history.len(), i);
    }

    // Target Bob sees Alice's words, not her thought, and nothing after him.
    let bob = conv0[1];
    assert_eq!(bob.target.participant, "Bob");
    assert!(bob.history[0].content.contains("Good evening."));
    assert!(!bob.history[0].content.contains("A0 secret"));
    assert!(!bob.history.iter().any(|h| h.content.contains("Are you sure?")));
    assert!(bob.target.content.contains("B0 secret"));

    // Alice sees her own thought but only Bob's action and speech.
    let alice = conv0[2];
    assert!(alice.history[0].own);
    assert!(alice.history[0].content.contains("A0 secret"));
    assert!(!alice.history[1].own);
    assert!(alice.history[1].content.contains("smiles"));
    assert!(!alice.history[1].content.contains("B0 secret"));
}

#[tokio::test]
async fn test_failed_annotation_falls_back_to_original() {
    let dir = TempDir::new().expect("temp dir");
    let mut store = ingested_store(&dir).await;
    annotate(&dir, &mut store).await;

    let failed = ledger_keys(&ledger_path(dir.path(), Stage::RoleThinking), false)
        .await
        .unwrap();
    assert_eq!(failed, BTreeSet::from([key(0, 2)]));
    let exhausted = ledger_keys(&ledger_path(dir.path(), Stage::RoleThinking), true)
        .await
        .unwrap();
    assert!(exhausted.is_empty());

    let samples = TurnExpander::new().expand(&store).samples;
    let fallback = samples
        .iter()
        .find(|s| s.target_key == key(0, 2))
        .unwrap();
    assert_eq!(fallback.target.content, "Are you sure?");

    // No setting completion ran: original fields are used and stay non-empty.
    assert_eq!(
        fallback.system.setting.get("profile").map(String::as_str),
        Some("A quiet customs officer.")
    );
    let bob = samples.iter().find(|s| s.target.participant == "Bob").unwrap();
    assert_eq!(
        bob.system.setting.get("profile").map(String::as_str),
        Some("A nervous traveller.")
    );
}

/// Judgement for conversation `c`: the last conversation falls below the
/// principle threshold, the others rotate through three preference outcomes.
fn judgement(c: u32) -> serde_json::Value {
    let principles = if c == CONVERSATIONS - 1 {
        json!({"empathy": "", "consistency": ""})
    } else {
        json!({"empathy": "", "consistency": "", "immersion": ""})
    };
    let winners = match c % 3 {
        0 => vec!["cand_1", "cand_2"],
        1 => vec!["cand_1", "cand_1"],
        _ => vec!["tie", "tie"],
    };
    let comparisons: Vec<_> = winners.iter().map(|w| json!({"winner": w})).collect();
    json!({"result": [{"principle": principles, "analysis": {"principle_comparisons": comparisons}}]})
}

async fn labeled_pool() -> Vec<TrainingSample> {
    let dir = TempDir::new().expect("temp dir");
    let mut store = ingested_store(&dir).await;
    annotate(&dir, &mut store).await;
    let mut samples = TurnExpander::new().expand(&store).samples;

    let results: Vec<InferenceResult> = samples
        .iter()
        .map(|s| {
            let task = InferenceTask::new(
                s.target_key.clone(),
                Stage::Judgement,
                "judge",
                Vec::new(),
                Vec::new(),
            );
            let c = s.source.conversation_index;
            InferenceResult::success(&task, 1, ResultOutput::Structured(judgement(c)))
        })
        .collect();
    let summary = attach_labels(&mut samples, results);
    assert_eq!(summary.merged, samples.len());
    samples
}

fn plan() -> SplitPlan {
    SplitPlan {
        seed: 7,
        min_principles: 3,
        carve_outs: Vec::new(),
        splits: vec!["train".to_string(), "eval".to_string()],
        default_shares: [("train".to_string(), 0.75), ("eval".to_string(), 0.25)]
            .into_iter()
            .collect(),
        category_shares: BTreeMap::new(),
        tie_policy: TiePolicy::Proportional,
    }
}

#[tokio::test]
async fn test_allocation_conserves_pool_without_conversation_leaks() {
    let pool = labeled_pool().await;
    assert_eq!(pool[0].labels.principle_count, Some(3));

    let allocation = QualityAllocator::new(plan()).allocate(pool.clone()).unwrap();
    let report = &allocation.report;
    assert_eq!(report.pool, pool.len());
    assert!(report.is_conserved());
    assert_eq!(report.excluded.get("below_threshold"), Some(&3));

    let mut owner: BTreeMap<String, String> = BTreeMap::new();
    for (split, samples) in &allocation.splits {
        for sample in samples {
            assert_eq!(sample.split.as_deref(), Some(split.as_str()));
            let previous = owner.insert(sample.source.to_string(), split.clone());
            assert!(previous.map_or(true, |p| &p == split));
        }
    }

    let out = TempDir::new().expect("temp dir");
    allocation.write(out.path()).await.unwrap();
    let train = read_jsonl::<TrainingSample>(&out.path().join("train.jsonl"))
        .await
        .unwrap();
    assert_eq!(train.items.len(), report.splits["train"]);
    assert!(out.path().join("allocation_report.json").exists());
}

#[tokio::test]
async fn test_allocation_independent_of_input_order() {
    let pool = labeled_pool().await;
    let allocator = QualityAllocator::new(plan());
    let forward = allocator.allocate(pool.clone()).unwrap();

    let mut reversed = pool;
    reversed.reverse();
    let backward = allocator.allocate(reversed).unwrap();

    assert_eq!(forward.membership(), backward.membership());
    assert_eq!(forward.report, backward.report);
}
