//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::models::{Fields, Record, UpdateBatch};
use crate::pipeline::{PipelineEvent, PipelineReporter};
use crate::predicate::Predicate;
use crate::traits::{Generator, RecordStore};

// ---------------------------------------------------------------------------
// MockRecordStore
// ---------------------------------------------------------------------------

/// In-memory document store evaluating predicates with [`Predicate::matches`].
#[derive(Clone, Default)]
pub struct MockRecordStore {
    docs: Arc<Mutex<BTreeMap<String, Value>>>,
    /// Bulk updates larger than this fail.
    bulk_limit: Arc<Mutex<Option<usize>>>,
    /// Updates touching these IDs fail.
    poisoned: Arc<Mutex<HashSet<String>>>,
    select_error: Arc<Mutex<Option<AppError>>>,
    bulk_calls: Arc<Mutex<Vec<usize>>>,
    single_calls: Arc<Mutex<Vec<String>>>,
    updated: Arc<Mutex<BTreeSet<String>>>,
}

impl MockRecordStore {
    pub fn new<I, K>(docs: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let store = Self::default();
        {
            let mut map = store.docs.lock().unwrap();
            for (id, doc) in docs {
                map.insert(id.into(), doc);
            }
        }
        store
    }

    pub fn fail_bulk_above(&self, size: usize) {
        *self.bulk_limit.lock().unwrap() = Some(size);
    }

    pub fn poison(&self, id: &str) {
        self.poisoned.lock().unwrap().insert(id.to_string());
    }

    /// Fail the next `select_matching` call.
    pub fn fail_next_select(&self, error: AppError) {
        *self.select_error.lock().unwrap() = Some(error);
    }

    pub fn document(&self, id: &str) -> Option<Value> {
        self.docs.lock().unwrap().get(id).cloned()
    }

    /// Sizes of every bulk update attempted, including failed ones.
    pub fn bulk_calls(&self) -> Vec<usize> {
        self.bulk_calls.lock().unwrap().clone()
    }

    /// IDs of every single-record update attempted.
    pub fn single_calls(&self) -> Vec<String> {
        self.single_calls.lock().unwrap().clone()
    }

    /// IDs whose documents were actually written, sorted.
    pub fn updated_ids(&self) -> Vec<String> {
        self.updated.lock().unwrap().iter().cloned().collect()
    }

    fn apply(&self, id: &str, fields: &Fields) -> bool {
        let mut docs = self.docs.lock().unwrap();
        let Some(Value::Object(doc)) = docs.get_mut(id) else {
            return false;
        };
        for (k, v) in fields {
            doc.insert(k.clone(), v.clone());
        }
        self.updated.lock().unwrap().insert(id.to_string());
        true
    }
}

impl RecordStore for MockRecordStore {
    async fn count_matching(&self, predicate: &Predicate) -> Result<u64, AppError> {
        let docs = self.docs.lock().unwrap();
        Ok(docs.values().filter(|d| predicate.matches(d)).count() as u64)
    }

    async fn select_matching(
        &self,
        predicate: &Predicate,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Record>, AppError> {
        if let Some(e) = self.select_error.lock().unwrap().take() {
            return Err(e);
        }
        let docs = self.docs.lock().unwrap();
        Ok(docs
            .iter()
            .filter(|(id, _)| after.is_none_or(|a| id.as_str() > a))
            .filter(|(_, doc)| predicate.matches(doc))
            .take(limit)
            .map(|(id, doc)| Record::new(id.clone(), doc.clone()))
            .collect())
    }

    async fn bulk_update(&self, batch: &UpdateBatch) -> Result<u64, AppError> {
        self.bulk_calls.lock().unwrap().push(batch.len());

        if let Some(limit) = *self.bulk_limit.lock().unwrap()
            && batch.len() > limit
        {
            return Err(AppError::PersistenceError(format!(
                "batch of {} exceeds mock limit {limit}",
                batch.len()
            )));
        }
        {
            let poisoned = self.poisoned.lock().unwrap();
            if let Some(bad) = batch.items().iter().find(|r| poisoned.contains(&r.record_id)) {
                return Err(AppError::PersistenceError(format!(
                    "write rejected for {}",
                    bad.record_id
                )));
            }
        }

        let matched = batch
            .items()
            .iter()
            .filter(|r| self.apply(&r.record_id, &r.fields))
            .count();
        Ok(matched as u64)
    }

    async fn update_one(&self, id: &str, fields: &Fields) -> Result<bool, AppError> {
        self.single_calls.lock().unwrap().push(id.to_string());
        if self.poisoned.lock().unwrap().contains(id) {
            return Err(AppError::PersistenceError(format!("write rejected for {id}")));
        }
        Ok(self.apply(id, fields))
    }
}

// ---------------------------------------------------------------------------
// MockGenerator
// ---------------------------------------------------------------------------

/// Scripted generator.
///
/// Responses are keyed by a substring of the prompt. Each call pops the next
/// scripted response; the last one repeats forever. Prompts matching no key
/// get the fallback response.
#[derive(Clone)]
pub struct MockGenerator {
    scripts: Arc<Mutex<Vec<(String, VecDeque<Result<String, AppError>>)>>>,
    fallback: Arc<Mutex<Result<String, AppError>>>,
    latency: Duration,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockGenerator {
    pub fn new(fallback: &str) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(Vec::new())),
            fallback: Arc::new(Mutex::new(Ok(fallback.to_string()))),
            latency: Duration::ZERO,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn failing(error: AppError) -> Self {
        let generator = Self::new("");
        *generator.fallback.lock().unwrap() = Err(error);
        generator
    }

    pub fn script(self, prompt_contains: &str, responses: Vec<Result<String, AppError>>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .push((prompt_contains.to_string(), responses.into()));
        self
    }

    /// Simulated request latency. Not interrupted by cancellation, like a
    /// request already on the wire.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Calls whose prompt contains `needle`.
    pub fn calls_for(&self, needle: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.contains(needle))
            .count()
    }

    fn next_response(&self, prompt: &str) -> Result<String, AppError> {
        let mut scripts = self.scripts.lock().unwrap();
        if let Some((_, queue)) = scripts.iter_mut().find(|(key, _)| prompt.contains(key.as_str())) {
            if queue.len() > 1 {
                return queue.pop_front().unwrap();
            }
            if let Some(last) = queue.front() {
                return replay(last);
            }
        }
        replay(&self.fallback.lock().unwrap())
    }
}

impl Generator for MockGenerator {
    async fn generate(&self, prompt: &str, cancel: &CancellationToken) -> Result<String, AppError> {
        if cancel.is_cancelled() {
            return Err(AppError::Shutdown);
        }
        self.calls.lock().unwrap().push(prompt.to_string());
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.next_response(prompt)
    }
}

fn replay(response: &Result<String, AppError>) -> Result<String, AppError> {
    match response {
        Ok(text) => Ok(text.clone()),
        Err(e) => Err(match e {
            AppError::Transient {
                message,
                status_code,
            } => AppError::Transient {
                message: message.clone(),
                status_code: *status_code,
            },
            AppError::Overloaded(m) => AppError::Overloaded(m.clone()),
            AppError::Timeout(ms) => AppError::Timeout(*ms),
            AppError::NetworkError(m) => AppError::NetworkError(m.clone()),
            AppError::ServiceError {
                message,
                status_code,
            } => AppError::ServiceError {
                message: message.clone(),
                status_code: *status_code,
            },
            AppError::Shutdown => AppError::Shutdown,
            other => AppError::Generic(other.to_string()),
        }),
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Mock pipeline reporter that records event labels.
#[derive(Default)]
pub struct MockReporter {
    pub events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, label: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.as_str() == label)
            .count()
    }
}

impl PipelineReporter for MockReporter {
    fn report(&self, event: PipelineEvent<'_>) {
        let label = match &event {
            PipelineEvent::Started { .. } => "Started",
            PipelineEvent::PageSelected { .. } => "PageSelected",
            PipelineEvent::RecordSkipped { .. } => "RecordSkipped",
            PipelineEvent::AttemptFailed { .. } => "AttemptFailed",
            PipelineEvent::RecordSucceeded { .. } => "RecordSucceeded",
            PipelineEvent::RecordFailed { .. } => "RecordFailed",
            PipelineEvent::RecordAborted { .. } => "RecordAborted",
            PipelineEvent::BatchPersisted { .. } => "BatchPersisted",
            PipelineEvent::ShuttingDown { .. } => "ShuttingDown",
            PipelineEvent::Finished { .. } => "Finished",
        };
        self.events.lock().unwrap().push(label.to_string());
    }
}

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

/// A support-ticket style document lacking a summary.
pub fn make_ticket(id: &str, replies: u64) -> (String, Value) {
    (
        id.to_string(),
        serde_json::json!({
            "ticket_id": id,
            "subject": format!("Subject of {id}"),
            "reply_count": replies,
        }),
    )
}
