//! The enrichment run: select incomplete records, generate, validate, persist.
//!
//! ```text
//! select page ──► [semaphore] ──► record task ──► mpsc ──► persister task
//!      ▲                            │ attempts                   │ flush
//!      └──── keyset cursor          ▼                            ▼
//!                           breaker ► generator        store ► checkpoint
//! ```
//!
//! A record is checkpointed as a success only after the store confirmed the
//! write. Exhausted records are checkpointed as failures and listed in the
//! manual-review file.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::checkpoint::{CheckpointStats, CheckpointStore, write_atomic};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerError};
use crate::error::AppError;
use crate::job::{JobDefinition, PipelineConfig};
use crate::models::{Fields, GenerationResult, ManualReviewEntry, Record};
use crate::persister::{BatchPersister, FlushReport};
use crate::predicate::Predicate;
use crate::progress::{ProgressMonitor, ProgressSnapshot};
use crate::prompt::TemplatePrompt;
use crate::traits::{Generator, PromptBuilder, RecordStore};
use crate::validator::ResponseValidator;

/// Events emitted by the pipeline for monitoring/logging.
#[derive(Debug, Clone)]
pub enum PipelineEvent<'a> {
    Started {
        run_id: Uuid,
        job: &'a str,
        candidates: u64,
        resumed: usize,
    },
    PageSelected {
        records: usize,
        after: Option<&'a str>,
    },
    RecordSkipped {
        record_id: &'a str,
    },
    AttemptFailed {
        record_id: &'a str,
        attempt: u32,
        error: &'a str,
        will_retry: bool,
    },
    RecordSucceeded {
        record_id: &'a str,
        attempts: u32,
    },
    RecordFailed {
        record_id: &'a str,
        attempts: u32,
        error: &'a str,
    },
    RecordAborted {
        record_id: &'a str,
    },
    BatchPersisted {
        updated: usize,
        rejected: usize,
    },
    ShuttingDown {
        in_flight: usize,
    },
    Finished {
        summary: &'a RunSummary,
    },
}

/// Trait for receiving pipeline events (decoupled logging).
pub trait PipelineReporter: Send + Sync {
    fn report(&self, event: PipelineEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl PipelineReporter for TracingReporter {
    fn report(&self, event: PipelineEvent<'_>) {
        match event {
            PipelineEvent::Started {
                run_id,
                job,
                candidates,
                resumed,
            } => {
                tracing::info!(%run_id, %job, %candidates, %resumed, "Backfill started");
            }
            PipelineEvent::PageSelected { records, after } => {
                tracing::debug!(%records, ?after, "Selected page");
            }
            PipelineEvent::RecordSkipped { record_id } => {
                tracing::debug!(%record_id, "Already checkpointed, skipping");
            }
            PipelineEvent::AttemptFailed {
                record_id,
                attempt,
                error,
                will_retry,
            } => {
                tracing::warn!(%record_id, %attempt, %error, %will_retry, "Attempt failed");
            }
            PipelineEvent::RecordSucceeded {
                record_id,
                attempts,
            } => {
                tracing::info!(%record_id, %attempts, "Record generated");
            }
            PipelineEvent::RecordFailed {
                record_id,
                attempts,
                error,
            } => {
                tracing::error!(%record_id, %attempts, %error, "Record exhausted, sent to manual review");
            }
            PipelineEvent::RecordAborted { record_id } => {
                tracing::info!(%record_id, "Record abandoned for shutdown");
            }
            PipelineEvent::BatchPersisted { updated, rejected } => {
                tracing::info!(%updated, %rejected, "Batch persisted");
            }
            PipelineEvent::ShuttingDown { in_flight } => {
                tracing::warn!(%in_flight, "Shutting down, draining in-flight records");
            }
            PipelineEvent::Finished { summary } => {
                tracing::info!(
                    run_id = %summary.run_id,
                    job = %summary.job,
                    succeeded = summary.progress.succeeded,
                    failed = summary.progress.failed,
                    persisted = summary.progress.persisted,
                    interrupted = summary.interrupted,
                    "Backfill finished"
                );
            }
        }
    }
}

/// Final report of a run, printed as JSON by the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub job: String,
    pub dry_run: bool,
    pub candidates: u64,
    pub started: usize,
    pub interrupted: bool,
    pub progress: ProgressSnapshot,
    pub manual_review: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manual_review_path: Option<String>,
    pub checkpoint: CheckpointStats,
    pub circuit: String,
}

/// What the pipeline needs to know about the job itself.
#[derive(Clone)]
pub struct JobPlan<P> {
    pub name: String,
    pub predicate: Predicate,
    pub prompt: P,
    pub validator: ResponseValidator,
}

impl JobPlan<TemplatePrompt> {
    pub fn from_definition(job: &JobDefinition) -> Result<Self, AppError> {
        Ok(Self {
            name: job.name.clone(),
            predicate: job.incomplete_when.clone(),
            prompt: job.prompt(),
            validator: job.validator()?,
        })
    }
}

#[derive(Default)]
struct ReviewQueue(Mutex<Vec<ManualReviewEntry>>);

impl ReviewQueue {
    fn lock(&self) -> MutexGuard<'_, Vec<ManualReviewEntry>> {
        self.0.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned manual review mutex");
            poisoned.into_inner()
        })
    }

    fn push(&self, entry: ManualReviewEntry) {
        self.lock().push(entry);
    }
}

/// Everything a record task needs, shared across tasks.
struct RecordWorker<G, P, R> {
    generator: G,
    prompt: P,
    validator: ResponseValidator,
    checkpoint: CheckpointStore,
    breaker: CircuitBreaker,
    config: PipelineConfig,
    progress: ProgressMonitor,
    reporter: Arc<R>,
    review: Arc<ReviewQueue>,
}

impl<G, P, R> RecordWorker<G, P, R>
where
    G: Generator,
    P: PromptBuilder,
    R: PipelineReporter,
{
    async fn process(
        &self,
        record: Record,
        results: mpsc::Sender<GenerationResult>,
        cancel: CancellationToken,
    ) {
        let prompt = match self.prompt.build(&record) {
            Ok(p) => p,
            Err(e) => return self.give_up(&record, 0, &e.to_string()),
        };

        let max_attempts = self.config.max_attempts_per_record.max(1);
        let mut attempts = 0;
        let mut after_overload = false;
        let mut open_for = None;
        let mut last_error = String::new();

        for attempt in 0..max_attempts {
            if cancel.is_cancelled() {
                return self.abort(&record);
            }

            if attempt > 0 {
                let mut delay = self.config.backoff_for(attempt, after_overload);
                if let Some(cooldown) = open_for {
                    delay = delay.max(cooldown).min(self.config.cap_wait);
                }
                tracing::debug!(
                    record_id = %record.id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Backing off before retry"
                );
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = cancel.cancelled() => return self.abort(&record),
                }
            }

            attempts += 1;
            self.progress.record_attempt();

            let (error, retryable) = match self.attempt(&record, &prompt, &cancel).await {
                Ok(fields) => {
                    return self.succeed(record, fields, attempts, &results).await;
                }
                Err(CircuitBreakerError::Inner(AppError::Shutdown)) => {
                    return self.abort(&record);
                }
                Err(CircuitBreakerError::Open { retry_after, .. }) => {
                    open_for = Some(retry_after);
                    after_overload = false;
                    (format!("circuit open, retry after {} ms", retry_after.as_millis()), true)
                }
                Err(CircuitBreakerError::Inner(e)) => {
                    open_for = None;
                    after_overload = e.is_overload();
                    (e.to_string(), e.is_retryable())
                }
            };

            if !self.config.dry_run {
                self.checkpoint.increment_retry(&record.id);
            }
            let will_retry = retryable && attempt + 1 < max_attempts;
            self.reporter.report(PipelineEvent::AttemptFailed {
                record_id: &record.id,
                attempt: attempt + 1,
                error: &error,
                will_retry,
            });
            last_error = error;
            if !retryable {
                break;
            }
        }

        self.give_up(&record, attempts, &last_error)
    }

    /// One bounded call to the service followed by validation.
    async fn attempt(
        &self,
        record: &Record,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<Fields, CircuitBreakerError> {
        let call = self
            .breaker
            .call(|| self.generator.generate(prompt, cancel));

        let raw = match tokio::time::timeout(self.config.attempt_timeout, call).await {
            Ok(result) => result?,
            Err(_) => {
                let e = AppError::Timeout(self.config.attempt_timeout.as_millis() as u64);
                self.breaker.record_failure(&e);
                return Err(CircuitBreakerError::Inner(e));
            }
        };

        self.validator
            .validate(&raw, record)
            .map_err(|e| CircuitBreakerError::Inner(e.into()))
    }

    async fn succeed(
        &self,
        record: Record,
        fields: Fields,
        attempts: u32,
        results: &mpsc::Sender<GenerationResult>,
    ) {
        self.reporter.report(PipelineEvent::RecordSucceeded {
            record_id: &record.id,
            attempts,
        });
        if results
            .send(GenerationResult::new(record.id.clone(), fields))
            .await
            .is_err()
        {
            tracing::error!(record_id = %record.id, "Persister gone, dropping result");
            return self.abort(&record);
        }
        self.progress.record_success();
    }

    /// Exhausted records go to manual review. A dry run leaves the
    /// checkpoint alone so the next real run still picks them up.
    fn give_up(&self, record: &Record, attempts: u32, error: &str) {
        let mut retry_attempts = self.checkpoint.retry_count(&record.id);
        if self.config.dry_run {
            retry_attempts += attempts;
        } else {
            self.checkpoint.mark_processed(&record.id, false);
        }
        self.review.push(ManualReviewEntry {
            record_id: record.id.clone(),
            retry_attempts,
            last_error: Some(error.to_string()).filter(|e| !e.is_empty()),
        });
        self.progress.record_failure();
        self.reporter.report(PipelineEvent::RecordFailed {
            record_id: &record.id,
            attempts,
            error,
        });
    }

    fn abort(&self, record: &Record) {
        self.progress.record_abort();
        self.reporter.report(PipelineEvent::RecordAborted {
            record_id: &record.id,
        });
    }
}

/// Pipeline driving one job against one store.
pub struct EnrichmentPipeline<S, G, P>
where
    S: RecordStore,
    G: Generator,
    P: PromptBuilder,
{
    plan: JobPlan<P>,
    store: S,
    generator: G,
    checkpoint: CheckpointStore,
    circuit_breaker: CircuitBreaker,
    config: PipelineConfig,
}

impl<S, G, P> EnrichmentPipeline<S, G, P>
where
    S: RecordStore + 'static,
    G: Generator + 'static,
    P: PromptBuilder + 'static,
{
    pub fn new(
        plan: JobPlan<P>,
        store: S,
        generator: G,
        checkpoint: CheckpointStore,
        circuit_breaker: CircuitBreaker,
        config: PipelineConfig,
    ) -> Self {
        Self {
            plan,
            store,
            generator,
            checkpoint,
            circuit_breaker,
            config,
        }
    }

    pub fn checkpoint(&self) -> &CheckpointStore {
        &self.checkpoint
    }

    /// Run until every matching record has been attempted or `cancel` fires.
    ///
    /// Only a store failure while counting candidates is returned as an
    /// error; everything later degrades to logging.
    pub async fn run<R: PipelineReporter + 'static>(
        &self,
        cancel: CancellationToken,
        reporter: Arc<R>,
    ) -> Result<RunSummary, AppError> {
        let run_id = Uuid::new_v4();
        let mut candidates = self.store.count_matching(&self.plan.predicate).await?;
        if let Some(limit) = self.config.limit {
            candidates = candidates.min(limit as u64);
        }

        let progress = ProgressMonitor::new(candidates);
        let review = Arc::new(ReviewQueue::default());
        reporter.report(PipelineEvent::Started {
            run_id,
            job: &self.plan.name,
            candidates,
            resumed: self.checkpoint.processed_len(),
        });

        let logger_cancel = CancellationToken::new();
        let logger = progress.spawn_logger(self.config.progress_interval, logger_cancel.clone());

        let (tx, rx) = mpsc::channel(self.config.persister.batch_size.max(1) * 2);
        let persister = tokio::spawn(persist_results(
            BatchPersister::new(self.store.clone(), self.config.persister.clone()),
            rx,
            PersistContext {
                checkpoint: self.checkpoint.clone(),
                progress: progress.clone(),
                reporter: reporter.clone(),
                review: review.clone(),
                dry_run: self.config.dry_run,
                flush_interval: self.config.persister.flush_interval,
            },
        ));

        let worker = Arc::new(RecordWorker {
            generator: self.generator.clone(),
            prompt: self.plan.prompt.clone(),
            validator: self.plan.validator.clone(),
            checkpoint: self.checkpoint.clone(),
            breaker: self.circuit_breaker.clone(),
            config: self.config.clone(),
            progress: progress.clone(),
            reporter: reporter.clone(),
            review: review.clone(),
        });

        let started = self
            .dispatch(&worker, &tx, &cancel, &progress, reporter.as_ref())
            .await;
        drop(tx);
        drop(worker);

        let interrupted = cancel.is_cancelled();

        if let Err(e) = persister.await {
            tracing::error!(error = %e, "Persister task failed");
        }
        if !self.config.dry_run
            && let Err(e) = self.checkpoint.save().await
        {
            tracing::error!(error = %e, "Final checkpoint save failed");
        }

        let entries = std::mem::take(&mut *review.lock());
        let manual_review_path = self.write_manual_review(&entries).await;

        logger_cancel.cancel();
        let _ = logger.await;

        let summary = RunSummary {
            run_id,
            job: self.plan.name.clone(),
            dry_run: self.config.dry_run,
            candidates,
            started,
            interrupted,
            progress: progress.snapshot(),
            manual_review: entries.len(),
            manual_review_path,
            checkpoint: self.checkpoint.stats(),
            circuit: self.circuit_breaker.state().to_string(),
        };
        reporter.report(PipelineEvent::Finished { summary: &summary });
        Ok(summary)
    }

    /// Page through candidates and spawn record tasks. Returns how many
    /// records were started. Waits for every spawned task before returning.
    async fn dispatch<R: PipelineReporter + 'static>(
        &self,
        worker: &Arc<RecordWorker<G, P, R>>,
        tx: &mpsc::Sender<GenerationResult>,
        cancel: &CancellationToken,
        progress: &ProgressMonitor,
        reporter: &R,
    ) -> usize {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut after: Option<String> = None;
        let mut started = 0usize;
        let limit = self.config.limit.unwrap_or(usize::MAX);

        'pages: while !cancel.is_cancelled() && started < limit {
            let page = match self
                .store
                .select_matching(&self.plan.predicate, after.as_deref(), self.config.page_size)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    tracing::error!(error = %e, "Selecting candidates failed, stopping selection");
                    break;
                }
            };
            reporter.report(PipelineEvent::PageSelected {
                records: page.len(),
                after: after.as_deref(),
            });
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.id.clone());
            let full_page = page.len() >= self.config.page_size;

            for record in page {
                if started >= limit {
                    break 'pages;
                }
                if self.checkpoint.is_processed(&record.id) {
                    progress.record_skip();
                    reporter.report(PipelineEvent::RecordSkipped {
                        record_id: &record.id,
                    });
                    continue;
                }

                let permit = tokio::select! {
                    permit = semaphore.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break 'pages,
                    },
                    () = cancel.cancelled() => break 'pages,
                };

                started += 1;
                let worker = worker.clone();
                let tx = tx.clone();
                let cancel = cancel.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    worker.process(record, tx, cancel).await
                });

                while let Some(joined) = tasks.try_join_next() {
                    log_join(joined);
                }
            }

            if !full_page {
                break;
            }
            if !self.config.inter_page_delay.is_zero() {
                tokio::select! {
                    () = tokio::time::sleep(self.config.inter_page_delay) => {}
                    () = cancel.cancelled() => break,
                }
            }
        }

        if cancel.is_cancelled() {
            reporter.report(PipelineEvent::ShuttingDown {
                in_flight: tasks.len(),
            });
        }
        while let Some(joined) = tasks.join_next().await {
            log_join(joined);
        }
        started
    }

    async fn write_manual_review(&self, entries: &[ManualReviewEntry]) -> Option<String> {
        let path = self.config.manual_review_path.clone()?;
        if entries.is_empty() {
            return None;
        }

        let bytes = match serde_json::to_vec_pretty(entries) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(error = %e, "Could not serialize manual review list");
                return None;
            }
        };
        let target = path.clone();
        match tokio::task::spawn_blocking(move || write_atomic(&target, &bytes)).await {
            Ok(Ok(())) => {
                tracing::info!(path = %path.display(), count = entries.len(), "Manual review list written");
                Some(path.display().to_string())
            }
            Ok(Err(e)) => {
                tracing::error!(path = %path.display(), error = %e, "Manual review list not written");
                None
            }
            Err(e) => {
                tracing::error!(error = %e, "Manual review writer failed");
                None
            }
        }
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        tracing::error!(error = %e, "Record task panicked");
    }
}

struct PersistContext<R> {
    checkpoint: CheckpointStore,
    progress: ProgressMonitor,
    reporter: Arc<R>,
    review: Arc<ReviewQueue>,
    dry_run: bool,
    flush_interval: Duration,
}

impl<R: PipelineReporter> PersistContext<R> {
    fn apply(&self, report: FlushReport) {
        if report.is_empty() {
            return;
        }
        for id in &report.updated {
            self.checkpoint.mark_processed(id, true);
        }
        for rejection in &report.rejected {
            self.checkpoint.mark_processed(&rejection.record_id, false);
            self.review.push(ManualReviewEntry {
                record_id: rejection.record_id.clone(),
                retry_attempts: self.checkpoint.retry_count(&rejection.record_id),
                last_error: Some(rejection.reason.clone()),
            });
        }
        self.progress.record_persisted(report.updated.len() as u64);
        self.progress.record_rejected(report.rejected.len() as u64);
        self.reporter.report(PipelineEvent::BatchPersisted {
            updated: report.updated.len(),
            rejected: report.rejected.len(),
        });
    }
}

/// Sole owner of the pending batch. Drains the channel until every sender
/// is gone, then flushes whatever is left.
async fn persist_results<S, R>(
    mut persister: BatchPersister<S>,
    mut rx: mpsc::Receiver<GenerationResult>,
    ctx: PersistContext<R>,
) where
    S: RecordStore,
    R: PipelineReporter,
{
    let mut ticker = tokio::time::interval(ctx.flush_interval.max(Duration::from_millis(10)));
    ticker.tick().await;

    loop {
        tokio::select! {
            received = rx.recv() => {
                let Some(result) = received else { break };
                if ctx.dry_run {
                    tracing::info!(
                        record_id = %result.record_id,
                        fields = %serde_json::Value::Object(result.fields),
                        "Dry run, not persisting"
                    );
                    continue;
                }
                if let Some(report) = persister.push(result).await {
                    ctx.apply(report);
                }
            }
            _ = ticker.tick() => {
                if persister.pending_len() > 0 {
                    ctx.apply(persister.flush().await);
                }
            }
        }
    }

    ctx.apply(persister.flush().await);
}
