//! Embedding providers.
//!
//! A provider turns canonical text into a fixed-length vector. Calls are
//! at-most-once: nothing here retries, a failed call fails the caller.
//!
//! - `HttpEmbedder`: OpenAI-compatible `/embeddings` endpoint
//! - `LocalEmbedder`: in-process fastembed model (feature `local-embed`)

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::config::{EmbeddingsConfig, ProviderKind};

/// Error type for embedding operations
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Provider initialization failed: {0}")]
    Init(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Rate limited by provider: {0}")]
    RateLimited(String),

    #[error("Provider returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed provider response: {0}")]
    Malformed(String),
}

pub trait EmbeddingProvider: Send + Sync {
    /// Provider/model name for logs and health output.
    fn name(&self) -> &str;

    fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;
}

/// Build the provider selected in config.
pub fn provider_from_config(
    config: &EmbeddingsConfig,
    base_path: &Path,
) -> Result<Arc<dyn EmbeddingProvider>, ProviderError> {
    match config.provider {
        ProviderKind::Openai => {
            let api_key = api_key_from_env(&config.api_key_env)?;
            Ok(Arc::new(HttpEmbedder::new(
                &api_key,
                &config.endpoint,
                &config.model,
                config.dimensions,
                Duration::from_secs(config.timeout_secs),
            )?))
        }
        #[cfg(feature = "local-embed")]
        ProviderKind::Fastembed => Ok(Arc::new(LocalEmbedder::new(&config.model, base_path)?)),
        #[cfg(not(feature = "local-embed"))]
        ProviderKind::Fastembed => {
            let _ = base_path;
            Err(ProviderError::Init(
                "fastembed provider requires building with --features local-embed".to_string(),
            ))
        }
    }
}

/// Blocking client for OpenAI-compatible embedding endpoints.
pub struct HttpEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    dimensions: Option<usize>,
}

impl HttpEmbedder {
    pub fn new(
        api_key: &str,
        base_url: &str,
        model: &str,
        dimensions: Option<usize>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        if api_key.trim().is_empty() {
            return Err(ProviderError::Init("missing API key".to_string()));
        }
        if model.trim().is_empty() {
            return Err(ProviderError::Init("missing model name".to_string()));
        }

        Ok(Self {
            client: json_client(api_key, timeout)?,
            endpoint: embeddings_endpoint(base_url),
            model: model.to_string(),
            dimensions,
        })
    }
}

/// Blocking client sending JSON with a bearer token on every request.
pub(super) fn json_client(api_key: &str, timeout: Duration) -> Result<Client, ProviderError> {
    let mut headers = reqwest::header::HeaderMap::new();
    let auth = format!("Bearer {}", api_key.trim());
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&auth)
            .map_err(|_| ProviderError::Init("invalid API key".to_string()))?,
    );
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    Client::builder()
        .timeout(timeout)
        .default_headers(headers)
        .build()
        .map_err(|e| ProviderError::Init(format!("failed to build HTTP client: {e}")))
}

/// Read the API key from the environment variable named in config.
pub(super) fn api_key_from_env(var: &str) -> Result<String, ProviderError> {
    std::env::var(var)
        .map_err(|_| ProviderError::Init(format!("environment variable {var} is not set")))
}

fn embeddings_endpoint(base_url: &str) -> String {
    format!("{}/embeddings", base_url.trim_end_matches('/'))
}

impl EmbeddingProvider for HttpEmbedder {
    fn name(&self) -> &str {
        &self.model
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let request = EmbeddingRequest {
            model: &self.model,
            input: [text],
            dimensions: self.dimensions,
        };

        let resp = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp
                .text()
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(classify_status(status, body));
        }

        let body = resp
            .bytes()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        parse_response(&body)
    }
}

pub(super) fn classify_status(status: StatusCode, body: String) -> ProviderError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        ProviderError::RateLimited(body)
    } else {
        ProviderError::Status {
            status: status.as_u16(),
            body,
        }
    }
}

fn parse_response(body: &[u8]) -> Result<Vec<f32>, ProviderError> {
    let parsed: EmbeddingResponse =
        serde_json::from_slice(body).map_err(|e| ProviderError::Malformed(e.to_string()))?;

    let embedding = parsed
        .data
        .into_iter()
        .min_by_key(|entry| entry.index)
        .map(|entry| entry.embedding)
        .ok_or_else(|| ProviderError::Malformed("no embedding returned".to_string()))?;

    validate_vector(embedding)
}

/// Rejects vectors that cannot be stored or compared.
pub fn validate_vector(vector: Vec<f32>) -> Result<Vec<f32>, ProviderError> {
    if vector.is_empty() {
        return Err(ProviderError::Malformed("empty embedding".to_string()));
    }
    if vector.iter().any(|v| !v.is_finite()) {
        return Err(ProviderError::Malformed(
            "embedding contains non-finite values".to_string(),
        ));
    }
    Ok(vector)
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: [&'a str; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

/// Wrapper around fastembed's TextEmbedding model.
/// Uses a Mutex because fastembed's embed() requires &mut self.
#[cfg(feature = "local-embed")]
pub struct LocalEmbedder {
    model: std::sync::Mutex<fastembed::TextEmbedding>,
    model_name: String,
}

#[cfg(feature = "local-embed")]
impl LocalEmbedder {
    /// Load `model_name`, downloading it into `<cache_dir>/models` on first use.
    pub fn new(model_name: &str, cache_dir: &Path) -> Result<Self, ProviderError> {
        use fastembed::{InitOptions, TextEmbedding};

        let model_enum = Self::parse_model_name(model_name)?;

        let models_dir = cache_dir.join("models");
        std::fs::create_dir_all(&models_dir).map_err(|e| {
            ProviderError::Init(format!("Failed to create models directory: {}", e))
        })?;

        let options = InitOptions::new(model_enum)
            .with_cache_dir(models_dir)
            .with_show_download_progress(true);

        let model =
            TextEmbedding::try_new(options).map_err(|e| ProviderError::Init(e.to_string()))?;

        Ok(Self {
            model: std::sync::Mutex::new(model),
            model_name: model_name.to_string(),
        })
    }

    fn parse_model_name(name: &str) -> Result<fastembed::EmbeddingModel, ProviderError> {
        match name.to_lowercase().as_str() {
            "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
            "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
            "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
            "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
            _ => Err(ProviderError::Init(format!(
                "Unknown model: {}. Supported models: all-MiniLM-L6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5",
                name
            ))),
        }
    }
}

#[cfg(feature = "local-embed")]
impl EmbeddingProvider for LocalEmbedder {
    fn name(&self) -> &str {
        &self.model_name
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let mut model = self.model.lock().map_err(|e| {
            ProviderError::Transport(format!("Failed to acquire model lock: {}", e))
        })?;

        let embeddings = model
            .embed(vec![text], None)
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let embedding = embeddings
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Malformed("No embedding returned".to_string()))?;

        validate_vector(embedding)
    }
}
