//! Bounded-concurrency submission of inference tasks with retries.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

use super::service::ReasoningService;
use crate::error::StoreError;
use crate::pipeline::{StageCounters, StageSummary};
use crate::repair::validate_output;
use crate::request::{InferenceResult, InferenceTask};
use crate::store::{append_jsonl, read_jsonl_if_exists, IdentityKey, Stage};

/// Submits tasks to a [`ReasoningService`] and appends every attempt's
/// result to a results file.
///
/// Tasks whose key already has a successful result that validates are not
/// submitted again; a key whose only answers are unstructured is. Attempt numbers continue from the highest attempt
/// already recorded for the key.
pub struct Dispatcher {
    service: Arc<dyn ReasoningService>,
    max_attempts: u32,
    concurrency: usize,
    backoff: Duration,
}

impl Dispatcher {
    pub fn new(service: Arc<dyn ReasoningService>) -> Self {
        Self {
            service,
            max_attempts: 3,
            concurrency: 16,
            backoff: Duration::from_secs(2),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Base delay; the n-th retry waits `n * backoff`.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub async fn dispatch(
        &self,
        tasks: Vec<InferenceTask>,
        results_path: &Path,
    ) -> Result<StageSummary, StoreError> {
        let stage = tasks.first().map(|t| t.stage);
        let existing = read_jsonl_if_exists::<InferenceResult>(results_path).await?;
        let mut done: HashSet<(IdentityKey, Stage)> = HashSet::new();
        let mut attempts: HashMap<(IdentityKey, Stage), u32> = HashMap::new();
        for result in existing.items {
            let id = (result.key, result.stage);
            let seen = attempts.entry(id.clone()).or_insert(0);
            *seen = (*seen).max(result.attempt);
            let validated = result
                .output
                .as_ref()
                .is_some_and(|output| validate_output(result.stage, output).status.is_validated());
            if result.success && validated {
                done.insert(id);
            }
        }

        let counters = StageCounters::new();
        let mut pending = Vec::with_capacity(tasks.len());
        for task in tasks {
            let id = (task.key.clone(), task.stage);
            if done.contains(&id) {
                debug!(key = %task.key, "Already has a validated result, skipping");
                StageCounters::incr(&counters.skipped);
                continue;
            }
            let first_attempt = attempts.get(&id).copied().unwrap_or(0) + 1;
            pending.push((task, first_attempt));
        }

        info!(
            pending = pending.len(),
            skipped = existing.skipped,
            concurrency = self.concurrency,
            "Dispatching tasks"
        );

        // Each task appends its own attempts as soon as it finishes, so an
        // interrupted run keeps every completed result.
        let sem = Arc::new(Semaphore::new(self.concurrency));
        let write_lock = Arc::new(Mutex::new(()));
        let mut task_futures = Vec::with_capacity(pending.len());
        for (task, first_attempt) in pending {
            let sem = sem.clone();
            let write_lock = write_lock.clone();
            let counters = counters.clone();
            task_futures.push(async move {
                let results = {
                    let _permit = sem.acquire().await.ok();
                    self.run_task(task, first_attempt, &counters).await
                };
                let _guard = write_lock.lock().await;
                append_jsonl(results_path, &results).await
            });
        }

        for outcome in futures::future::join_all(task_futures).await {
            outcome?;
        }

        let label = match stage {
            Some(stage) => format!("dispatch:{}", stage),
            None => "dispatch".to_string(),
        };
        let mut summary = counters.snapshot(&label);
        summary.add("malformed_result_lines", existing.skipped);
        summary.log();
        Ok(summary)
    }

    /// Runs one task until it succeeds, hits a permanent error or spends its
    /// attempt budget. Returns one result per attempt.
    async fn run_task(
        &self,
        mut task: InferenceTask,
        first_attempt: u32,
        counters: &StageCounters,
    ) -> Vec<InferenceResult> {
        StageCounters::incr(&counters.processed);
        let mut results = Vec::new();

        for n in 0..self.max_attempts {
            let attempt = first_attempt + n;
            task.attempt = attempt;
            match self.service.complete(&task).await {
                Ok(output) => {
                    StageCounters::incr(&counters.merged);
                    results.push(InferenceResult::success(&task, attempt, output));
                    return results;
                }
                Err(err) => {
                    warn!(key = %task.key, attempt, error = %err, "Attempt failed");
                    results.push(InferenceResult::failure(&task, attempt, err.to_string()));
                    if !err.is_transient() || n + 1 == self.max_attempts {
                        break;
                    }
                    StageCounters::incr(&counters.retried);
                    tokio::time::sleep(self.backoff * (n + 1)).await;
                }
            }
        }

        StageCounters::incr(&counters.failed);
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;
    use crate::request::ResultOutput;
    use crate::store::read_jsonl;
    use async_trait::async_trait;
    use tempfile::TempDir;

    /// Fails each key a scripted number of times before answering.
    struct ScriptedService {
        failures: std::sync::Mutex<HashMap<IdentityKey, u32>>,
        permanent: bool,
    }

    impl ScriptedService {
        fn new(failures: &[(IdentityKey, u32)], permanent: bool) -> Self {
            Self {
                failures: std::sync::Mutex::new(failures.iter().cloned().collect()),
                permanent,
            }
        }
    }

    #[async_trait]
    impl ReasoningService for ScriptedService {
        async fn complete(&self, task: &InferenceTask) -> Result<ResultOutput, ServiceError> {
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(&task.key) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    if self.permanent {
                        Err(ServiceError::Configuration("bad key".to_string()))
                    } else {
                        Err(ServiceError::Timeout(1))
                    }
                }
                _ => Ok(ResultOutput::Text(format!("answer for {}", task.key))),
            }
        }
    }

    fn task(turn: u32) -> InferenceTask {
        InferenceTask::new(
            IdentityKey::turn("tale", 0, 0, turn, "A"),
            Stage::RoleThinking,
            "reasoning",
            Vec::new(),
            Vec::new(),
        )
    }

    fn dispatcher(service: ScriptedService) -> Dispatcher {
        Dispatcher::new(Arc::new(service))
            .with_max_attempts(3)
            .with_concurrency(4)
            .with_backoff(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("results.jsonl");
        let flaky = task(0).key;
        let service = ScriptedService::new(&[(flaky.clone(), 2)], false);

        let summary = dispatcher(service)
            .dispatch(vec![task(0), task(1)], &path)
            .await
            .unwrap();
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.merged, 2);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.extra("retried"), 2);

        let results = read_jsonl::<InferenceResult>(&path).await.unwrap().items;
        let mut flaky_attempts: Vec<(u32, bool)> = results
            .iter()
            .filter(|r| r.key == flaky)
            .map(|r| (r.attempt, r.success))
            .collect();
        flaky_attempts.sort();
        assert_eq!(flaky_attempts, vec![(1, false), (2, false), (3, true)]);
    }

    #[tokio::test]
    async fn test_exhausted_and_permanent_failures() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("results.jsonl");
        let service = ScriptedService::new(&[(task(0).key, 10)], false);
        let summary = dispatcher(service).dispatch(vec![task(0)], &path).await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(read_jsonl::<InferenceResult>(&path).await.unwrap().items.len(), 3);

        let other = dir.path().join("permanent.jsonl");
        let service = ScriptedService::new(&[(task(0).key, 10)], true);
        dispatcher(service).dispatch(vec![task(0)], &other).await.unwrap();
        assert_eq!(read_jsonl::<InferenceResult>(&other).await.unwrap().items.len(), 1);
    }

    #[tokio::test]
    async fn test_completed_keys_not_resubmitted() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("results.jsonl");
        let service = ScriptedService::new(&[(task(1).key, 3)], false);
        dispatcher(service)
            .dispatch(vec![task(0), task(1)], &path)
            .await
            .unwrap();

        // Second run: key 0 is done, key 1 continues its attempt numbering.
        let service = ScriptedService::new(&[], false);
        let summary = dispatcher(service)
            .dispatch(vec![task(0), task(1)], &path)
            .await
            .unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.processed, 1);

        let results = read_jsonl::<InferenceResult>(&path).await.unwrap().items;
        let last = results.iter().filter(|r| r.key == task(1).key).last().unwrap();
        assert_eq!(last.attempt, 4);
        assert!(last.success);
    }

    #[tokio::test]
    async fn test_unstructured_answer_is_resubmitted() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("results.jsonl");
        let garbled = InferenceResult::success(&task(0), 1, ResultOutput::Text("<mood>x".to_string()));
        append_jsonl(&path, &[garbled]).await.unwrap();

        let service = ScriptedService::new(&[], false);
        let summary = dispatcher(service).dispatch(vec![task(0)], &path).await.unwrap();
        assert_eq!(summary.skipped, 0);
        assert_eq!(summary.processed, 1);

        let results = read_jsonl::<InferenceResult>(&path).await.unwrap().items;
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].attempt, 2);
        assert!(results[1].success);
    }
}
