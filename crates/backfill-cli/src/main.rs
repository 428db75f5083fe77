use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use backfill_client::{ApiFlavor, HttpGenerator};
use backfill_core::persister::PersisterConfig;
use backfill_core::{
    CheckpointStore, CircuitBreaker, CircuitBreakerConfig, EnrichmentPipeline, JobDefinition,
    JobPlan, PipelineConfig, RateGate, RateGateConfig, RequestRetryConfig, ShutdownController,
    TracingReporter,
};
use backfill_db::{Database, DatabaseConfig, PgRecordStore};

#[derive(Parser)]
#[command(name = "backfill", version, about = "Fill missing document fields with an LLM")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate and store the missing fields of every incomplete record
    Run(RunArgs),

    /// Show how many records still match the job and what the checkpoint holds
    Status {
        /// Path to the job definition (JSON)
        #[arg(short, long)]
        job: PathBuf,

        /// Checkpoint file (defaults to checkpoints/<job>.json)
        #[arg(long)]
        checkpoint: Option<PathBuf>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Path to the job definition (JSON)
    #[arg(short, long)]
    job: PathBuf,

    /// Model name passed to the generation service
    #[arg(short, long, env = "BACKFILL_MODEL")]
    model: String,

    /// Base URL of the generation service
    #[arg(
        short,
        long,
        env = "BACKFILL_BASE_URL",
        default_value = "http://localhost:11434"
    )]
    base_url: String,

    /// Request format: "ollama" or "openai"
    #[arg(long, env = "BACKFILL_FLAVOR", default_value = "ollama")]
    flavor: ApiFlavor,

    /// Bearer token for the generation service
    #[arg(short, long, env = "BACKFILL_API_KEY")]
    api_key: Option<String>,

    /// Dotted path of the generated text in the service response
    #[arg(long, env = "BACKFILL_RESPONSE_PATH")]
    response_path: Option<String>,

    /// System prompt (openai flavor only)
    #[arg(long)]
    system_prompt: Option<String>,

    /// Records processed concurrently (1 = serial)
    #[arg(long, default_value_t = 4)]
    max_concurrent: usize,

    /// Attempts per record before it goes to manual review
    #[arg(long, default_value_t = 3)]
    max_attempts: u32,

    /// Wall-clock ceiling of one attempt, in seconds. Defaults to the time
    /// every in-call retry needs when each request times out.
    #[arg(long, env = "BACKFILL_ATTEMPT_TIMEOUT")]
    attempt_timeout: Option<u64>,

    /// Timeout of a single HTTP request inside an attempt, in seconds
    #[arg(long, env = "BACKFILL_REQUEST_TIMEOUT", default_value_t = 120)]
    request_timeout: u64,

    /// Minimum spacing between generation requests, in milliseconds
    #[arg(long, env = "BACKFILL_REQUEST_DELAY_MS", default_value_t = 0)]
    request_delay_ms: u64,

    /// Consecutive generation failures that open the circuit
    #[arg(long, default_value_t = 5)]
    failure_threshold: u32,

    /// Results written per bulk update
    #[arg(long, default_value_t = 50)]
    batch_size: usize,

    /// Records selected per page
    #[arg(long, default_value_t = 100)]
    page_size: usize,

    /// Checkpoint file (defaults to checkpoints/<job>.json)
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Checkpoint mutations between background saves
    #[arg(long, default_value_t = 10)]
    checkpoint_interval: u64,

    /// Where exhausted records are listed (defaults to manual_review/<job>.json)
    #[arg(long)]
    manual_review: Option<PathBuf>,

    /// Stop after starting this many records
    #[arg(long)]
    limit: Option<usize>,

    /// Give previously failed records another chance
    #[arg(long, default_value_t = false)]
    retry_failed: bool,

    /// Generate and validate but write nothing back
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("backfill=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => cmd_run(args).await?,
        Commands::Status { job, checkpoint } => cmd_status(&job, checkpoint).await?,
    }

    Ok(())
}

fn load_job(path: &Path) -> Result<JobDefinition> {
    JobDefinition::load(path).with_context(|| format!("Invalid job file: {}", path.display()))
}

fn default_checkpoint(job: &JobDefinition) -> PathBuf {
    PathBuf::from("checkpoints").join(format!("{}.json", job.name))
}

/// Connect to PostgreSQL and resolve the job's collection. Any failure is fatal.
async fn connect_store(collection: &str) -> Result<PgRecordStore> {
    let config = DatabaseConfig::from_env()?;
    let db = Database::connect(&config)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await.context("Failed to run migrations")?;
    let store = db
        .record_store(collection)
        .await
        .with_context(|| format!("Record store for collection '{collection}' unavailable"))?;
    Ok(store)
}

async fn cmd_run(args: RunArgs) -> Result<()> {
    let job = load_job(&args.job)?;
    let store = connect_store(&job.collection).await?;

    let request_timeout = Duration::from_secs(args.request_timeout.max(1));
    let retry = RequestRetryConfig::default();
    let worst_case = retry.worst_case(request_timeout);
    let attempt_timeout = match args.attempt_timeout {
        Some(secs) => {
            let timeout = Duration::from_secs(secs.max(1));
            if timeout < worst_case {
                tracing::warn!(
                    attempt_timeout_secs = timeout.as_secs(),
                    needed_secs = worst_case.as_secs(),
                    "Attempt timeout is shorter than the in-call retries can take"
                );
            }
            timeout
        }
        None => worst_case,
    };

    let rate_gate = RateGate::new(RateGateConfig::new(Duration::from_millis(args.request_delay_ms)));
    let mut generator = HttpGenerator::new(args.flavor, &args.base_url, &args.model)
        .context("Invalid generation service settings")?
        .with_timeout(request_timeout)?
        .with_options(job.generation.clone())
        .with_rate_gate(rate_gate)
        .with_retry(retry);
    if let Some(key) = args.api_key.filter(|k| !k.is_empty()) {
        generator = generator.with_api_key(key);
    }
    if let Some(path) = args.response_path {
        generator = generator.with_response_path(path);
    }
    if let Some(prompt) = args.system_prompt {
        generator = generator.with_system_prompt(prompt);
    }

    let checkpoint_path = args.checkpoint.unwrap_or_else(|| default_checkpoint(&job));
    let checkpoint = CheckpointStore::open(&checkpoint_path, args.checkpoint_interval);
    if args.retry_failed {
        let requeued = checkpoint.requeue_failed();
        tracing::info!(requeued, "Requeued previously failed records");
    }

    let manual_review = args
        .manual_review
        .unwrap_or_else(|| PathBuf::from("manual_review").join(format!("{}.json", job.name)));

    let config = PipelineConfig::default()
        .with_max_concurrent(args.max_concurrent)
        .with_max_attempts(args.max_attempts)
        .with_attempt_timeout(attempt_timeout)
        .with_page_size(args.page_size)
        .with_limit(args.limit)
        .with_dry_run(args.dry_run)
        .with_manual_review_path(manual_review)
        .with_persister(PersisterConfig::default().with_batch_size(args.batch_size));

    let breaker = CircuitBreaker::new(
        "generation",
        CircuitBreakerConfig {
            failure_threshold: args.failure_threshold.max(1),
            ..Default::default()
        },
    );

    tracing::info!(
        job = %job.name,
        collection = %job.collection,
        endpoint = %generator.endpoint(),
        model = %args.model,
        checkpoint = %checkpoint_path.display(),
        attempt_timeout_secs = attempt_timeout.as_secs(),
        dry_run = args.dry_run,
        "Starting backfill"
    );

    let plan = JobPlan::from_definition(&job)?;
    let pipeline = EnrichmentPipeline::new(plan, store, generator, checkpoint, breaker, config);

    let shutdown = ShutdownController::new();
    let _listener = shutdown.spawn_signal_listener();

    let summary = pipeline
        .run(shutdown.token(), Arc::new(TracingReporter))
        .await
        .context("Backfill run failed")?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn cmd_status(job_path: &Path, checkpoint: Option<PathBuf>) -> Result<()> {
    let job = load_job(job_path)?;
    let store = connect_store(&job.collection).await?;

    let documents = store.count_all().await?;
    let incomplete = store.count_matching(&job.incomplete_when).await?;

    let checkpoint_path = checkpoint.unwrap_or_else(|| default_checkpoint(&job));
    let checkpoint = CheckpointStore::open(&checkpoint_path, 1);

    let report = json!({
        "job": job.name,
        "collection": job.collection,
        "documents": documents,
        "incomplete": incomplete,
        "checkpoint": {
            "path": checkpoint_path.display().to_string(),
            "processed": checkpoint.processed_len(),
            "failed": checkpoint.failed_ids().len(),
            "stats": checkpoint.stats(),
        },
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
