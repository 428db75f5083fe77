//! Batched write-back of validated results with graceful degradation.
//!
//! `flush` tries one bulk update. If the store errors, the batch is split
//! into `fallback_chunk_size` chunks, each its own bulk call; a chunk that
//! still errors (or matches fewer documents than it holds) is retried one
//! record at a time. The returned [`FlushReport`] names exactly which IDs
//! were written, so checkpointing never claims a write that did not happen.

use std::time::Duration;

use crate::models::{GenerationResult, UpdateBatch};
use crate::traits::RecordStore;

#[derive(Debug, Clone)]
pub struct PersisterConfig {
    /// Results buffered before an automatic flush.
    pub batch_size: usize,
    /// Chunk size used after a failed bulk update.
    pub fallback_chunk_size: usize,
    /// Longest a partial batch waits before being flushed anyway.
    pub flush_interval: Duration,
}

impl Default for PersisterConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            fallback_chunk_size: 10,
            flush_interval: Duration::from_secs(30),
        }
    }
}

impl PersisterConfig {
    pub fn with_batch_size(mut self, n: usize) -> Self {
        self.batch_size = n.max(1);
        self
    }

    pub fn with_fallback_chunk_size(mut self, n: usize) -> Self {
        self.fallback_chunk_size = n.max(1);
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }
}

/// A result the store refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub record_id: String,
    pub reason: String,
}

/// Outcome of one flush. Every flushed ID appears in exactly one list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub updated: Vec<String>,
    pub rejected: Vec<Rejection>,
}

impl FlushReport {
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.rejected.is_empty()
    }

    fn merge(&mut self, other: FlushReport) {
        self.updated.extend(other.updated);
        self.rejected.extend(other.rejected);
    }
}

pub struct BatchPersister<S: RecordStore> {
    store: S,
    config: PersisterConfig,
    pending: UpdateBatch,
}

impl<S: RecordStore> BatchPersister<S> {
    pub fn new(store: S, config: PersisterConfig) -> Self {
        let pending = UpdateBatch::new(config.batch_size);
        Self {
            store,
            config,
            pending,
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Buffer a result, flushing when the batch is full.
    pub async fn push(&mut self, result: GenerationResult) -> Option<FlushReport> {
        if self.pending.push(result) {
            Some(self.flush().await)
        } else {
            None
        }
    }

    /// Write everything buffered.
    pub async fn flush(&mut self) -> FlushReport {
        let batch = self.pending.take();
        if batch.is_empty() {
            return FlushReport::default();
        }

        let report = match self.store.bulk_update(&batch).await {
            Ok(matched) if matched as usize >= batch.len() => FlushReport {
                updated: batch.ids(),
                rejected: Vec::new(),
            },
            Ok(matched) => {
                tracing::warn!(
                    expected = batch.len(),
                    matched,
                    "Bulk update matched fewer documents than submitted, resolving per record"
                );
                self.write_each(&batch).await
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    size = batch.len(),
                    chunk_size = self.config.fallback_chunk_size,
                    "Bulk update failed, falling back to chunks"
                );
                self.write_chunks(&batch).await
            }
        };

        tracing::debug!(
            updated = report.updated.len(),
            rejected = report.rejected.len(),
            "Batch flushed"
        );
        report
    }

    async fn write_chunks(&self, batch: &UpdateBatch) -> FlushReport {
        let mut report = FlushReport::default();
        for chunk in batch.chunks(self.config.fallback_chunk_size) {
            match self.store.bulk_update(&chunk).await {
                Ok(matched) if matched as usize >= chunk.len() => {
                    report.updated.extend(chunk.ids());
                }
                Ok(matched) => {
                    tracing::debug!(matched, size = chunk.len(), "Partial chunk, resolving per record");
                    report.merge(self.write_each(&chunk).await);
                }
                Err(e) => {
                    tracing::warn!(error = %e, size = chunk.len(), "Chunk update failed, writing per record");
                    report.merge(self.write_each(&chunk).await);
                }
            }
        }
        report
    }

    async fn write_each(&self, batch: &UpdateBatch) -> FlushReport {
        let mut report = FlushReport::default();
        for item in batch.items() {
            match self.store.update_one(&item.record_id, &item.fields).await {
                Ok(true) => report.updated.push(item.record_id.clone()),
                Ok(false) => {
                    tracing::warn!(record_id = %item.record_id, "No document matched update");
                    report.rejected.push(Rejection {
                        record_id: item.record_id.clone(),
                        reason: "no matching document".to_string(),
                    });
                }
                Err(e) => {
                    tracing::error!(record_id = %item.record_id, error = %e, "Record update failed");
                    report.rejected.push(Rejection {
                        record_id: item.record_id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        report
    }
}
