//! OpenAI embedding provider. Requires the `api_embed` feature.
//!
//! Selected by an embedding model of the form `openai:<model>`, e.g.
//! `openai:text-embedding-3-small`. The API key is read from
//! `OPENAI_API_KEY` unless configured otherwise.

use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::embedding::{BatchEmbeddingResult, EmbeddingProvider, EmbeddingResult};
use crate::error::EmbeddingError;

/// Model prefix that routes an embedding config to this provider.
pub const OPENAI_MODEL_PREFIX: &str = "openai:";

/// OpenAI embedding model information
#[derive(Debug, Clone)]
pub struct OpenAIModelInfo {
    pub name: &'static str,
    /// Native output dimension
    pub dimension: usize,
    /// Maximum texts per batch request
    pub max_batch_size: usize,
    /// Whether the model accepts the `dimensions` request parameter
    pub shortenable: bool,
}

pub static OPENAI_MODELS: &[OpenAIModelInfo] = &[
    OpenAIModelInfo {
        name: "text-embedding-3-small",
        dimension: 1536,
        max_batch_size: 2048,
        shortenable: true,
    },
    OpenAIModelInfo {
        name: "text-embedding-3-large",
        dimension: 3072,
        max_batch_size: 2048,
        shortenable: true,
    },
    OpenAIModelInfo {
        name: "text-embedding-ada-002",
        dimension: 1536,
        max_batch_size: 2048,
        shortenable: false,
    },
];

#[must_use]
pub fn get_openai_model_info(name: &str) -> Option<&'static OpenAIModelInfo> {
    OPENAI_MODELS.iter().find(|m| m.name == name)
}

#[derive(Debug, Clone)]
pub struct OpenAIConfig {
    pub model: String,
    /// Requested output dimension
    pub dimension: usize,
    /// Environment variable holding the API key
    pub api_key_env: String,
    /// Custom API base URL (for Azure OpenAI, proxies, etc.)
    pub base_url: String,
    pub timeout_secs: u64,
    /// Maximum retries on rate limit (429), timeout and connection errors
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    /// Texts per request, capped by the model's own limit
    pub batch_size: usize,
}

impl Default for OpenAIConfig {
    fn default() -> Self {
        Self {
            model: "text-embedding-3-small".to_string(),
            dimension: 1536,
            api_key_env: "OPENAI_API_KEY".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            timeout_secs: 30,
            max_retries: 3,
            initial_backoff_ms: 1000,
            batch_size: 100,
        }
    }
}

impl OpenAIConfig {
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    #[must_use]
    pub fn with_api_key_env(mut self, env_var: impl Into<String>) -> Self {
        self.api_key_env = env_var.into();
        self
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
    encoding_format: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[derive(Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
    #[serde(rename = "type")]
    error_type: Option<String>,
}

fn other(reason: impl Into<Box<str>>) -> EmbeddingError {
    EmbeddingError::Other {
        reason: reason.into(),
    }
}

pub struct OpenAIEmbedder {
    config: OpenAIConfig,
    model_info: &'static OpenAIModelInfo,
    client: Client,
    api_key: String,
}

impl OpenAIEmbedder {
    /// Reads the API key from the configured environment variable.
    pub fn new(config: OpenAIConfig) -> Result<Self, EmbeddingError> {
        let api_key = std::env::var(&config.api_key_env).unwrap_or_default();
        if api_key.is_empty() {
            return Err(EmbeddingError::ModelUnavailable {
                reason: format!(
                    "API key not found. Set the {} environment variable.",
                    config.api_key_env
                )
                .into(),
            });
        }

        let model_info =
            get_openai_model_info(&config.model).ok_or_else(|| EmbeddingError::ModelUnavailable {
                reason: format!("unknown OpenAI embedding model '{}'", config.model).into(),
            })?;
        if config.dimension != model_info.dimension && !model_info.shortenable {
            return Err(EmbeddingError::ModelUnavailable {
                reason: format!(
                    "{} only produces {}-dimensional embeddings",
                    model_info.name, model_info.dimension
                )
                .into(),
            });
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| other(format!("Failed to create HTTP client: {e}")))?;

        tracing::info!(
            model = %model_info.name,
            dimension = config.dimension,
            "OpenAI embedder initialized"
        );

        Ok(Self {
            config,
            model_info,
            client,
            api_key,
        })
    }

    /// Make an embedding request with retry logic
    fn request_embeddings(&self, texts: &[&str]) -> BatchEmbeddingResult {
        let url = format!("{}/embeddings", self.config.base_url);
        let dimensions =
            (self.config.dimension != self.model_info.dimension).then_some(self.config.dimension);
        let request_body = EmbeddingRequest {
            model: self.model_info.name,
            input: texts.to_vec(),
            encoding_format: "float",
            dimensions,
        };

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.api_key))
                .map_err(|_| other("Invalid API key format"))?,
        );

        let mut backoff_ms = self.config.initial_backoff_ms;
        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                tracing::warn!(attempt, backoff_ms, "retrying OpenAI embedding request");
                std::thread::sleep(Duration::from_millis(backoff_ms));
                backoff_ms *= 2;
            }

            let response = self
                .client
                .post(&url)
                .headers(headers.clone())
                .json(&request_body)
                .send();

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let parsed: EmbeddingResponse = resp
                            .json()
                            .map_err(|e| other(format!("Failed to parse response: {e}")))?;
                        let mut data = parsed.data;
                        data.sort_by_key(|d| d.index);
                        let embeddings: Vec<Vec<f32>> =
                            data.into_iter().map(|d| d.embedding).collect();
                        if embeddings.len() != texts.len() {
                            return Err(other(format!(
                                "expected {} embeddings, received {}",
                                texts.len(),
                                embeddings.len()
                            )));
                        }
                        tracing::debug!(texts = texts.len(), "generated OpenAI embeddings");
                        return Ok(embeddings);
                    }

                    if status.as_u16() == 429 {
                        last_error = Some(other("Rate limit exceeded"));
                        continue;
                    }

                    let error_text = resp.text().unwrap_or_default();
                    let message = match serde_json::from_str::<ApiError>(&error_text) {
                        Ok(api_error) => format!(
                            "OpenAI API error ({}): {}",
                            api_error.error.error_type.unwrap_or_default(),
                            api_error.error.message
                        ),
                        Err(_) => format!("OpenAI API error ({status}): {error_text}"),
                    };
                    return Err(other(message));
                }
                Err(e) if e.is_timeout() => {
                    last_error = Some(EmbeddingError::Timeout);
                }
                Err(e) if e.is_connect() => {
                    last_error = Some(EmbeddingError::ModelUnavailable {
                        reason: format!("connection failed: {e}").into(),
                    });
                }
                Err(e) => return Err(other(format!("Request failed: {e}"))),
            }
        }

        Err(last_error.unwrap_or_else(|| other("Max retries exceeded")))
    }
}

impl std::fmt::Debug for OpenAIEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAIEmbedder")
            .field("config", &self.config)
            .field("model_info", &self.model_info)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

impl EmbeddingProvider for OpenAIEmbedder {
    fn kind(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        self.model_info.name
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }

    fn embed_text(&self, text: &str) -> EmbeddingResult {
        if text.trim().is_empty() {
            return Err(EmbeddingError::EmptyText);
        }
        self.request_embeddings(&[text])?
            .into_iter()
            .next()
            .ok_or_else(|| other("No embedding returned"))
    }

    fn embed_batch(&self, texts: &[&str]) -> BatchEmbeddingResult {
        if texts.iter().any(|text| text.trim().is_empty()) {
            return Err(EmbeddingError::EmptyText);
        }
        let max_batch = self
            .config
            .batch_size
            .clamp(1, self.model_info.max_batch_size);
        let mut all_embeddings = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(max_batch) {
            all_embeddings.extend(self.request_embeddings(chunk)?);
        }
        Ok(all_embeddings)
    }

    fn is_ready(&self) -> bool {
        !self.api_key.is_empty()
    }
}
