//! Resumable checkpoint of per-record completion state.
//!
//! The checkpoint is the single source of "already done" truth across
//! restarts: a record present in `processedIDs` is skipped even if the store
//! still reports it as incomplete. State lives in memory behind one mutex and
//! is written to a JSON file every `interval` mutations (in the background)
//! and once more at shutdown via [`CheckpointStore::save`].
//!
//! File writes are atomic (temp file + rename). A missing or unreadable file
//! is treated as an empty checkpoint, never as an error.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Default number of mutations between background saves.
pub const DEFAULT_CHECKPOINT_INTERVAL: u64 = 10;

/// Aggregate counters carried in the checkpoint file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointStats {
    pub start_time: Option<DateTime<Utc>>,
    pub processed_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub retry_count: u64,
}

/// On-disk representation. ID lists are sorted so diffs stay readable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CheckpointFile {
    #[serde(rename = "processedIDs", default)]
    processed_ids: Vec<String>,
    #[serde(rename = "failedIDs", default)]
    failed_ids: Vec<String>,
    #[serde(rename = "retryAttempts", default)]
    retry_attempts: BTreeMap<String, u32>,
    #[serde(default)]
    stats: CheckpointStats,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct CheckpointInner {
    processed: HashSet<String>,
    failed: HashSet<String>,
    retries: HashMap<String, u32>,
    stats: CheckpointStats,
    /// Mutations since this store was opened; doubles as snapshot sequence.
    mutations: u64,
}

impl CheckpointInner {
    fn from_file(file: CheckpointFile) -> Self {
        let mut processed: HashSet<String> = file.processed_ids.into_iter().collect();
        let failed: HashSet<String> = file.failed_ids.into_iter().collect();
        // failed ⊆ processed
        processed.extend(failed.iter().cloned());

        Self {
            processed,
            failed,
            retries: file.retry_attempts.into_iter().collect(),
            stats: file.stats,
            mutations: 0,
        }
    }

    fn to_file(&self) -> CheckpointFile {
        let mut processed_ids: Vec<String> = self.processed.iter().cloned().collect();
        processed_ids.sort();
        let mut failed_ids: Vec<String> = self.failed.iter().cloned().collect();
        failed_ids.sort();

        CheckpointFile {
            processed_ids,
            failed_ids,
            retry_attempts: self
                .retries
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
            stats: self.stats.clone(),
            timestamp: Some(Utc::now()),
        }
    }
}

/// Thread-safe, file-backed checkpoint store.
#[derive(Clone)]
pub struct CheckpointStore {
    path: PathBuf,
    interval: u64,
    inner: Arc<Mutex<CheckpointInner>>,
    /// Sequence number of the newest snapshot on disk. Serializes writers.
    written: Arc<tokio::sync::Mutex<u64>>,
}

impl CheckpointStore {
    /// Open the checkpoint at `path`, loading any previous state.
    ///
    /// Missing or corrupt files yield an empty checkpoint.
    pub fn open(path: impl Into<PathBuf>, interval: u64) -> Self {
        let path = path.into();
        let mut inner = match load_file(&path) {
            Some(file) => {
                let inner = CheckpointInner::from_file(file);
                tracing::info!(
                    path = %path.display(),
                    processed = inner.processed.len(),
                    failed = inner.failed.len(),
                    "Resuming from checkpoint"
                );
                inner
            }
            None => CheckpointInner::default(),
        };
        if inner.stats.start_time.is_none() {
            inner.stats.start_time = Some(Utc::now());
        }

        Self {
            path,
            interval: interval.max(1),
            inner: Arc::new(Mutex::new(inner)),
            written: Arc::new(tokio::sync::Mutex::new(0)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_inner(&self) -> MutexGuard<'_, CheckpointInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(path = %self.path.display(), "Recovered from poisoned checkpoint mutex");
            poisoned.into_inner()
        })
    }

    pub fn is_processed(&self, id: &str) -> bool {
        self.lock_inner().processed.contains(id)
    }

    pub fn is_failed(&self, id: &str) -> bool {
        self.lock_inner().failed.contains(id)
    }

    /// Record a terminal outcome for `id`.
    ///
    /// Idempotent: repeating an outcome is a no-op. A later success clears an
    /// earlier failure; a later failure never downgrades a success.
    /// Returns true if the state changed.
    pub fn mark_processed(&self, id: &str, success: bool) -> bool {
        let snapshot = {
            let mut inner = self.lock_inner();
            let was_processed = inner.processed.contains(id);
            let was_failed = inner.failed.contains(id);

            let changed = match (was_processed, was_failed, success) {
                (false, _, _) => {
                    inner.processed.insert(id.to_string());
                    inner.stats.processed_count += 1;
                    if success {
                        inner.stats.success_count += 1;
                    } else {
                        inner.failed.insert(id.to_string());
                        inner.stats.failure_count += 1;
                    }
                    true
                }
                (true, true, true) => {
                    inner.failed.remove(id);
                    inner.stats.failure_count = inner.stats.failure_count.saturating_sub(1);
                    inner.stats.success_count += 1;
                    true
                }
                (true, false, false) => {
                    tracing::debug!(record_id = %id, "Ignoring failure for already-succeeded record");
                    false
                }
                (true, _, _) => false,
            };

            if !changed {
                return false;
            }
            self.bump(&mut inner)
        };

        if let Some((seq, file)) = snapshot {
            self.persist_in_background(seq, file);
        }
        true
    }

    pub fn retry_count(&self, id: &str) -> u32 {
        self.lock_inner().retries.get(id).copied().unwrap_or(0)
    }

    /// Increment and return the retry counter for `id`.
    pub fn increment_retry(&self, id: &str) -> u32 {
        let (count, snapshot) = {
            let mut inner = self.lock_inner();
            let count = {
                let entry = inner.retries.entry(id.to_string()).or_insert(0);
                *entry += 1;
                *entry
            };
            inner.stats.retry_count += 1;
            (count, self.bump(&mut inner))
        };

        if let Some((seq, file)) = snapshot {
            self.persist_in_background(seq, file);
        }
        count
    }

    /// Forget permanent failures so they are selected again. Returns how many.
    pub fn requeue_failed(&self) -> usize {
        let mut inner = self.lock_inner();
        let failed: Vec<String> = inner.failed.drain().collect();
        for id in &failed {
            inner.processed.remove(id);
        }
        let n = failed.len() as u64;
        inner.stats.processed_count = inner.stats.processed_count.saturating_sub(n);
        inner.stats.failure_count = inner.stats.failure_count.saturating_sub(n);
        inner.mutations += 1;
        failed.len()
    }

    pub fn stats(&self) -> CheckpointStats {
        self.lock_inner().stats.clone()
    }

    pub fn processed_len(&self) -> usize {
        self.lock_inner().processed.len()
    }

    pub fn failed_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock_inner().failed.iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Write the current state to disk now.
    pub async fn save(&self) -> Result<(), AppError> {
        let mut written = self.written.lock().await;
        let (seq, file) = {
            let inner = self.lock_inner();
            (inner.mutations, inner.to_file())
        };

        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_file(&path, &file))
            .await
            .map_err(|e| AppError::CheckpointError(format!("Checkpoint writer panicked: {e}")))??;

        *written = seq;
        tracing::debug!(path = %self.path.display(), seq, "Checkpoint saved");
        Ok(())
    }

    /// Count a mutation; every `interval` mutations, hand back a snapshot to persist.
    fn bump(&self, inner: &mut CheckpointInner) -> Option<(u64, CheckpointFile)> {
        inner.mutations += 1;
        (inner.mutations % self.interval == 0).then(|| (inner.mutations, inner.to_file()))
    }

    fn persist_in_background(&self, seq: u64, file: CheckpointFile) {
        let path = self.path.clone();
        let written = self.written.clone();

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            if let Err(e) = write_file(&path, &file) {
                tracing::warn!(error = %e, "Checkpoint save failed; will retry next interval");
            }
            return;
        };

        handle.spawn(async move {
            let mut last = written.lock().await;
            if seq <= *last {
                return;
            }
            let target = path.clone();
            match tokio::task::spawn_blocking(move || write_file(&target, &file)).await {
                Ok(Ok(())) => {
                    *last = seq;
                    tracing::debug!(path = %path.display(), seq, "Checkpoint persisted");
                }
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "Checkpoint save failed; will retry next interval");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Checkpoint writer task failed");
                }
            }
        });
    }
}

fn load_file(path: &Path) -> Option<CheckpointFile> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "No checkpoint found, starting fresh");
            return None;
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Unreadable checkpoint, starting fresh");
            return None;
        }
    };

    match serde_json::from_str(&raw) {
        Ok(file) => Some(file),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Corrupt checkpoint, starting fresh");
            None
        }
    }
}

fn write_file(path: &Path, file: &CheckpointFile) -> Result<(), AppError> {
    let bytes = serde_json::to_vec_pretty(file)?;
    write_atomic(path, &bytes)
        .map_err(|e| AppError::CheckpointError(format!("{}: {e}", path.display())))
}

/// Write `bytes` to a sibling temp file, fsync, then rename over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let mut temp_name = path.as_os_str().to_owned();
    temp_name.push(".tmp");
    let temp_path = PathBuf::from(temp_name);

    {
        let mut f = std::fs::File::create(&temp_path)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }

    std::fs::rename(&temp_path, path).inspect_err(|_| {
        let _ = std::fs::remove_file(&temp_path);
    })
}
