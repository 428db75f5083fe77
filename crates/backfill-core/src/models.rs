use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::util;

/// Partial-field update payload: top-level keys merged into a document.
pub type Fields = serde_json::Map<String, Value>;

/// One document selected for enrichment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub document: Value,
}

impl Record {
    pub fn new(id: impl Into<String>, document: Value) -> Self {
        Self {
            id: id.into(),
            document,
        }
    }

    /// Look up a dotted path inside the document.
    pub fn get(&self, path: &str) -> Option<&Value> {
        util::lookup(&self.document, path)
    }
}

/// Validated, ready-to-persist content for one record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationResult {
    pub record_id: String,
    pub fields: Fields,
}

impl GenerationResult {
    pub fn new(record_id: impl Into<String>, fields: Fields) -> Self {
        Self {
            record_id: record_id.into(),
            fields,
        }
    }
}

/// Ordered collection of pending updates, capped at a batch size.
#[derive(Debug, Clone, Default)]
pub struct UpdateBatch {
    items: Vec<GenerationResult>,
    capacity: usize,
}

impl UpdateBatch {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn from_items(items: Vec<GenerationResult>) -> Self {
        let capacity = items.len().max(1);
        Self { items, capacity }
    }

    /// Append a result. Returns true once the batch has reached capacity.
    pub fn push(&mut self, result: GenerationResult) -> bool {
        self.items.push(result);
        self.is_full()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn items(&self) -> &[GenerationResult] {
        &self.items
    }

    pub fn ids(&self) -> Vec<String> {
        self.items.iter().map(|r| r.record_id.clone()).collect()
    }

    /// Split into independent batches of at most `size` items, preserving order.
    pub fn chunks(&self, size: usize) -> Vec<UpdateBatch> {
        self.items
            .chunks(size.max(1))
            .map(|c| UpdateBatch::from_items(c.to_vec()))
            .collect()
    }

    /// Move the accumulated items out, leaving an empty batch of the same capacity.
    pub fn take(&mut self) -> UpdateBatch {
        let items = std::mem::replace(&mut self.items, Vec::with_capacity(self.capacity));
        UpdateBatch {
            items,
            capacity: self.capacity,
        }
    }
}

/// A record that exhausted every attempt and needs human follow-up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualReviewEntry {
    #[serde(rename = "recordID")]
    pub record_id: String,
    #[serde(rename = "retryAttempts")]
    pub retry_attempts: u32,
    #[serde(rename = "lastError", default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}
