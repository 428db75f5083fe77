use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::persister::PersisterConfig;
use crate::predicate::Predicate;
use crate::prompt::TemplatePrompt;
use crate::util::derive_job_name;
use crate::validator::{ResponseContract, ResponseValidator};

/// Sampling options forwarded to the generation service.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    #[serde(default = "GenerationOptions::default_temperature")]
    pub temperature: f32,
    #[serde(default = "GenerationOptions::default_max_tokens")]
    pub max_tokens: u32,
}

impl GenerationOptions {
    fn default_temperature() -> f32 {
        0.2
    }

    fn default_max_tokens() -> u32 {
        1024
    }
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: Self::default_temperature(),
            max_tokens: Self::default_max_tokens(),
        }
    }
}

/// One backfill job as described by its JSON job file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    /// Defaults to the job file's stem.
    #[serde(default)]
    pub name: String,
    pub collection: String,
    /// A record needs work while any of these conditions holds.
    pub incomplete_when: Predicate,
    pub prompt_template: String,
    #[serde(default)]
    pub contract: ResponseContract,
    #[serde(default)]
    pub generation: GenerationOptions,
}

impl JobDefinition {
    /// Read, parse, and validate a job file.
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::ConfigError(format!("Cannot read job file {}: {e}", path.display()))
        })?;
        let mut job: JobDefinition = serde_json::from_str(&raw).map_err(|e| {
            AppError::ConfigError(format!("Invalid job file {}: {e}", path.display()))
        })?;
        if job.name.trim().is_empty() {
            job.name = derive_job_name(path);
        }
        job.validate()?;
        Ok(job)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.collection.trim().is_empty() {
            return Err(AppError::ConfigError(
                "Job 'collection' must not be empty".to_string(),
            ));
        }
        if self.incomplete_when.is_empty() {
            return Err(AppError::ConfigError(
                "Job 'incomplete_when' needs at least one condition".to_string(),
            ));
        }
        if self.prompt_template.trim().is_empty() {
            return Err(AppError::ConfigError(
                "Job 'prompt_template' must not be empty".to_string(),
            ));
        }
        self.prompt().placeholders()?;
        for rule in &self.contract.ranges {
            if rule.min > rule.max {
                return Err(AppError::ConfigError(format!(
                    "Range for '{}' has min {} > max {}",
                    rule.field, rule.min, rule.max
                )));
            }
        }
        self.validator()?;
        Ok(())
    }

    pub fn prompt(&self) -> TemplatePrompt {
        TemplatePrompt::new(&self.prompt_template)
    }

    pub fn validator(&self) -> Result<ResponseValidator, AppError> {
        ResponseValidator::new(self.contract.clone())
    }
}

/// Retry policy for requests inside the generation client.
#[derive(Debug, Clone)]
pub struct RequestRetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RequestRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RequestRetryConfig {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// `base · 2^attempt`, capped. `attempt` is 0-indexed.
    pub fn exponential(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// `base · (attempt + 1)`, capped. Used after client timeouts.
    pub fn linear(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(attempt.saturating_add(1))
            .min(self.max_delay)
    }

    /// Longest a `generate` call can take when every request runs into
    /// `request_timeout`: all requests plus the sleeps between them.
    /// Rate-gate spacing is not included.
    pub fn worst_case(&self, request_timeout: Duration) -> Duration {
        (0..self.max_retries).fold(
            request_timeout.saturating_mul(self.max_retries.saturating_add(1)),
            |total, attempt| total.saturating_add(self.exponential(attempt).max(self.linear(attempt))),
        )
    }
}

/// Tunables for one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Records in flight at once. 1 runs fully serial.
    pub max_concurrent: usize,
    pub max_attempts_per_record: u32,
    /// Base of the per-record backoff.
    pub retry_delay: Duration,
    /// Backoff base multiplier after an overload-classified failure.
    pub rate_limit_multiplier: u32,
    /// Upper bound of a single backoff sleep.
    pub cap_wait: Duration,
    /// Wall-clock ceiling on one attempt.
    pub attempt_timeout: Duration,
    pub page_size: usize,
    pub inter_page_delay: Duration,
    /// Maximum records started in this run.
    pub limit: Option<usize>,
    /// Generate and validate, but write nothing to the store.
    pub dry_run: bool,
    pub manual_review_path: Option<PathBuf>,
    pub progress_interval: Duration,
    pub persister: PersisterConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            max_attempts_per_record: 3,
            retry_delay: Duration::from_secs(2),
            rate_limit_multiplier: 3,
            cap_wait: Duration::from_secs(60),
            attempt_timeout: Duration::from_secs(180),
            page_size: 100,
            inter_page_delay: Duration::from_millis(500),
            limit: None,
            dry_run: false,
            manual_review_path: None,
            progress_interval: Duration::from_secs(30),
            persister: PersisterConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn with_max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n.max(1);
        self
    }

    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts_per_record = n.max(1);
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_page_size(mut self, n: usize) -> Self {
        self.page_size = n.max(1);
        self
    }

    pub fn with_inter_page_delay(mut self, delay: Duration) -> Self {
        self.inter_page_delay = delay;
        self
    }

    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_manual_review_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.manual_review_path = Some(path.into());
        self
    }

    pub fn with_persister(mut self, persister: PersisterConfig) -> Self {
        self.persister = persister;
        self
    }

    /// Sleep before attempt `attempt` (1-indexed retries).
    ///
    /// `min(cap_wait, base · 2^(attempt-1))` where `base` is `retry_delay`,
    /// multiplied by `rate_limit_multiplier` after an overload.
    pub fn backoff_for(&self, attempt: u32, after_overload: bool) -> Duration {
        let base = if after_overload {
            self.retry_delay.saturating_mul(self.rate_limit_multiplier.max(1))
        } else {
            self.retry_delay
        };
        let exp = attempt.saturating_sub(1).min(16);
        base.saturating_mul(2u32.pow(exp)).min(self.cap_wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_worst_case_covers_every_request_and_sleep() {
        let retry = RequestRetryConfig::default();
        // 4 requests of 120 s plus sleeps of 1, 2 and 4 s.
        assert_eq!(
            retry.worst_case(Duration::from_secs(120)),
            Duration::from_secs(487)
        );
        assert_eq!(
            retry.with_max_retries(0).worst_case(Duration::from_secs(30)),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_backoff_schedule() {
        let config = PipelineConfig {
            retry_delay: Duration::from_secs(2),
            rate_limit_multiplier: 3,
            cap_wait: Duration::from_secs(20),
            ..Default::default()
        };
        assert_eq!(config.backoff_for(1, false), Duration::from_secs(2));
        assert_eq!(config.backoff_for(2, false), Duration::from_secs(4));
        assert_eq!(config.backoff_for(3, false), Duration::from_secs(8));
        assert_eq!(config.backoff_for(5, false), Duration::from_secs(20));
        assert_eq!(config.backoff_for(1, true), Duration::from_secs(6));
        assert_eq!(config.backoff_for(2, true), Duration::from_secs(12));
    }

    #[test]
    fn test_request_retry_delays() {
        let config = RequestRetryConfig::default()
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(500));
        assert_eq!(config.exponential(0), Duration::from_millis(100));
        assert_eq!(config.exponential(2), Duration::from_millis(400));
        assert_eq!(config.exponential(3), Duration::from_millis(500));
        assert_eq!(config.linear(0), Duration::from_millis(100));
        assert_eq!(config.linear(2), Duration::from_millis(300));
    }

    fn write_job(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .prefix("ticket-summaries")
            .suffix(".json")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_job_file() {
        let file = write_job(
            r#"{
                "collection": "tickets",
                "incomplete_when": [{"missing": "summary"}],
                "prompt_template": "Summarize: {{subject}}",
                "contract": {
                    "required_fields": ["summary"],
                    "count_policy": "truncate"
                },
                "generation": {"temperature": 0.5}
            }"#,
        );
        let job = JobDefinition::load(file.path()).unwrap();
        assert!(job.name.starts_with("ticket-summaries"));
        assert_eq!(job.collection, "tickets");
        assert_eq!(job.generation.temperature, 0.5);
        assert_eq!(job.generation.max_tokens, 1024);
        assert_eq!(
            job.contract.count_policy,
            crate::validator::CountPolicy::Truncate
        );
    }

    #[test]
    fn test_invalid_job_files_are_config_errors() {
        let cases = [
            "not json",
            r#"{"collection": "", "incomplete_when": [{"missing": "a"}], "prompt_template": "x"}"#,
            r#"{"collection": "c", "incomplete_when": [], "prompt_template": "x"}"#,
            r#"{"collection": "c", "incomplete_when": [{"missing": "a"}], "prompt_template": "{{a"}"#,
            r#"{"collection": "c", "incomplete_when": [{"missing": "a"}], "prompt_template": "x",
                "contract": {"ranges": [{"field": "u", "min": 5, "max": 1}]}}"#,
        ];
        for case in cases {
            let file = write_job(case);
            let err = JobDefinition::load(file.path()).unwrap_err();
            assert!(matches!(err, AppError::ConfigError(_)), "case: {case}");
        }
    }

    #[test]
    fn test_bundled_job_file_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../jobs/support_tickets.json");
        let job = JobDefinition::load(&path).unwrap();
        assert_eq!(job.name, "support_tickets");
        assert_eq!(job.incomplete_when.conditions().len(), 3);
        assert_eq!(
            job.prompt().placeholders().unwrap(),
            vec!["ticket_id", "subject", "messages"]
        );
    }

    #[test]
    fn test_missing_job_file() {
        let err = JobDefinition::load(Path::new("/nonexistent/job.json")).unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
    }
}
