pub mod checkpoint;
pub mod circuit_breaker;
pub mod error;
pub mod job;
pub mod models;
pub mod persister;
pub mod pipeline;
pub mod predicate;
pub mod progress;
pub mod prompt;
pub mod rate_gate;
pub mod shutdown;
pub mod testutil;
pub mod traits;
pub mod util;
pub mod validator;

pub use checkpoint::CheckpointStore;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
pub use error::AppError;
pub use job::{JobDefinition, PipelineConfig, RequestRetryConfig};
pub use models::{Fields, GenerationResult, Record, UpdateBatch};
pub use pipeline::{EnrichmentPipeline, JobPlan, RunSummary, TracingReporter};
pub use predicate::{FieldCondition, Predicate};
pub use rate_gate::{RateGate, RateGateConfig};
pub use shutdown::ShutdownController;
pub use traits::{Generator, PromptBuilder, RecordStore};
pub use validator::{ResponseValidator, ValidationError};
