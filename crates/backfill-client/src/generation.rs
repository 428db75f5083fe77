use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use backfill_core::error::AppError;
use backfill_core::job::{GenerationOptions, RequestRetryConfig};
use backfill_core::rate_gate::{RateGate, RateGateConfig};
use backfill_core::traits::Generator;
use backfill_core::util::lookup;
use backfill_core::validator::ValidationError;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_ERROR_BODY: usize = 300;

/// Wire format spoken by the generation service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiFlavor {
    /// `POST {base}/api/generate`
    Ollama,
    /// `POST {base}/chat/completions`, any OpenAI-compatible server.
    OpenAi,
}

impl ApiFlavor {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiFlavor::Ollama => "ollama",
            ApiFlavor::OpenAi => "openai",
        }
    }

    fn endpoint_path(&self) -> &'static str {
        match self {
            ApiFlavor::Ollama => "/api/generate",
            ApiFlavor::OpenAi => "/chat/completions",
        }
    }

    /// Where the generated text lives in a successful response.
    pub fn default_response_path(&self) -> &'static str {
        match self {
            ApiFlavor::Ollama => "response",
            ApiFlavor::OpenAi => "choices.0.message.content",
        }
    }
}

impl fmt::Display for ApiFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ApiFlavor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ollama" => Ok(ApiFlavor::Ollama),
            "openai" | "openai-compatible" => Ok(ApiFlavor::OpenAi),
            _ => Err(format!("Unknown API flavor: {}", s)),
        }
    }
}

// ---- Request bodies ----

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    stream: bool,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

/// HTTP client for the generation service.
///
/// Every request waits on the shared [`RateGate`]. Overload (429), gateway
/// errors (500/502/503/504), connection failures, and client timeouts are
/// retried inside a single [`Generator::generate`] call; anything else is
/// returned immediately.
#[derive(Clone)]
pub struct HttpGenerator {
    client: Client,
    flavor: ApiFlavor,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    system_prompt: Option<String>,
    response_path: String,
    options: GenerationOptions,
    timeout: Duration,
    rate_gate: RateGate,
    retry: RequestRetryConfig,
}

impl HttpGenerator {
    pub fn new(flavor: ApiFlavor, base_url: &str, model: &str) -> Result<Self, AppError> {
        let parsed = url::Url::parse(base_url)
            .map_err(|e| AppError::ConfigError(format!("Invalid base URL '{base_url}': {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(AppError::ConfigError(format!(
                "Base URL must be http or https, got '{}'",
                parsed.scheme()
            )));
        }
        if model.trim().is_empty() {
            return Err(AppError::ConfigError("Model name must not be empty".into()));
        }

        let endpoint = format!(
            "{}{}",
            base_url.trim_end_matches('/'),
            flavor.endpoint_path()
        );

        Ok(Self {
            client: build_client(DEFAULT_REQUEST_TIMEOUT)?,
            flavor,
            endpoint,
            model: model.to_string(),
            api_key: None,
            system_prompt: None,
            response_path: flavor.default_response_path().to_string(),
            options: GenerationOptions::default(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            rate_gate: RateGate::new(RateGateConfig::default()),
            retry: RequestRetryConfig::default(),
        })
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        self.api_key = (!key.is_empty()).then_some(key);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, AppError> {
        self.client = build_client(timeout)?;
        self.timeout = timeout;
        Ok(self)
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_response_path(mut self, path: impl Into<String>) -> Self {
        self.response_path = path.into();
        self
    }

    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }

    /// Share a gate between generators hitting the same service.
    pub fn with_rate_gate(mut self, gate: RateGate) -> Self {
        self.rate_gate = gate;
        self
    }

    pub fn with_retry(mut self, retry: RequestRetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn rate_gate(&self) -> &RateGate {
        &self.rate_gate
    }

    fn request_body(&self, prompt: &str) -> Result<Value, AppError> {
        let body = match self.flavor {
            ApiFlavor::Ollama => serde_json::to_value(OllamaRequest {
                model: &self.model,
                prompt,
                system: self.system_prompt.as_deref(),
                stream: false,
                options: OllamaOptions {
                    temperature: self.options.temperature,
                    num_predict: self.options.max_tokens,
                },
            })?,
            ApiFlavor::OpenAi => {
                let mut messages = Vec::with_capacity(2);
                if let Some(system) = &self.system_prompt {
                    messages.push(Message {
                        role: "system",
                        content: system,
                    });
                }
                messages.push(Message {
                    role: "user",
                    content: prompt,
                });
                serde_json::to_value(ChatRequest {
                    model: &self.model,
                    messages,
                    stream: false,
                    temperature: self.options.temperature,
                    max_tokens: self.options.max_tokens,
                })?
            }
        };
        Ok(body)
    }

    /// One HTTP round trip, classified.
    async fn send_once(&self, body: &Value) -> Result<String, AppError> {
        let mut request = self.client.post(&self.endpoint).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &body));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| self.map_send_error(e))?;
        extract_text(&payload, &self.response_path)
    }

    fn map_send_error(&self, e: reqwest::Error) -> AppError {
        if e.is_timeout() {
            AppError::Timeout(self.timeout.as_millis() as u64)
        } else if e.is_connect() {
            AppError::NetworkError(format!("Connection failed: {}", e))
        } else if e.is_decode() {
            AppError::Validation(ValidationError::MalformedPayload(format!(
                "Undecodable service response: {e}"
            )))
        } else {
            AppError::NetworkError(e.to_string())
        }
    }
}

fn build_client(timeout: Duration) -> Result<Client, AppError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| AppError::ConfigError(format!("Cannot build HTTP client: {e}")))
}

/// Map a non-success HTTP status to the error taxonomy.
pub fn classify_status(status: u16, body: &str) -> AppError {
    let message = error_message(body).unwrap_or_else(|| format!("HTTP {status}"));
    match status {
        429 => AppError::Overloaded(message),
        500 | 502 | 503 | 504 => AppError::Transient {
            message,
            status_code: status,
        },
        _ => AppError::ServiceError {
            message,
            status_code: status,
        },
    }
}

fn error_message(body: &str) -> Option<String> {
    let from_json = serde_json::from_str::<Value>(body).ok().and_then(|v| {
        lookup(&v, "error.message")
            .or_else(|| lookup(&v, "error"))
            .and_then(Value::as_str)
            .map(str::to_string)
    });
    from_json.or_else(|| {
        let trimmed = body.trim();
        (!trimmed.is_empty()).then(|| trimmed.chars().take(MAX_ERROR_BODY).collect())
    })
}

/// Pull the generated text out of a decoded response.
///
/// A missing or empty field is a content problem, not a service failure.
pub fn extract_text(payload: &Value, path: &str) -> Result<String, AppError> {
    match lookup(payload, path) {
        Some(Value::String(text)) if !text.trim().is_empty() => Ok(text.clone()),
        Some(Value::String(_)) | Some(Value::Null) | None => Err(AppError::Validation(
            ValidationError::MalformedPayload(format!("no generated text at '{path}'")),
        )),
        Some(other) => Ok(other.to_string()),
    }
}

fn retry_inside_call(e: &AppError) -> bool {
    matches!(
        e,
        AppError::Transient { .. }
            | AppError::Overloaded(_)
            | AppError::Timeout(_)
            | AppError::NetworkError(_)
    )
}

impl Generator for HttpGenerator {
    async fn generate(&self, prompt: &str, cancel: &CancellationToken) -> Result<String, AppError> {
        let body = self.request_body(prompt)?;
        let mut attempt = 0u32;

        loop {
            self.rate_gate.acquire(cancel).await?;

            let error = match self.send_once(&body).await {
                Ok(text) => return Ok(text),
                Err(e) => e,
            };

            if error.is_overload() {
                self.rate_gate.record_overload();
            }
            if !retry_inside_call(&error) || attempt >= self.retry.max_retries {
                return Err(error);
            }

            let delay = match &error {
                AppError::Timeout(_) => self.retry.linear(attempt),
                _ => self.retry.exponential(attempt),
            };
            tracing::warn!(
                flavor = %self.flavor,
                attempt = attempt + 1,
                max_retries = self.retry.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Generation request failed, retrying"
            );

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel.cancelled() => return Err(AppError::Shutdown),
            }
            attempt += 1;
        }
    }
}
