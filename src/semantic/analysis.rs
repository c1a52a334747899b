//! Structured reading of free text by a chat model.
//!
//! The model is asked for interests, preferences, hard requirements and
//! sentiment as JSON. A reply that is not that JSON yields
//! [`TextAnalysis::default`] instead of an error, so callers always get the
//! same shape back.

use std::sync::Arc;
use std::time::Duration;

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::AnalysisConfig;

use super::embeddings::{api_key_from_env, classify_status, json_client, ProviderError};

const SYSTEM_PROMPT: &str = "You extract structured information about a person's interests \
and needs from what they write. Reply with JSON only.";

pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Single-turn completion; returns the reply text.
    fn complete(&self, system: &str, prompt: &str) -> Result<String, ProviderError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextAnalysis {
    #[serde(default)]
    pub interests: Vec<String>,
    /// e.g. location, time, group size
    #[serde(default)]
    pub preferences: Map<String, Value>,
    #[serde(default)]
    pub requirements: Vec<String>,
    /// aspect -> positive / negative / neutral
    #[serde(default)]
    pub sentiment: Map<String, Value>,
}

impl Default for TextAnalysis {
    fn default() -> Self {
        let mut sentiment = Map::new();
        sentiment.insert("overall".to_string(), Value::String("neutral".to_string()));
        Self {
            interests: vec![],
            preferences: Map::new(),
            requirements: vec![],
            sentiment,
        }
    }
}

pub struct TextAnalyzer {
    provider: Arc<dyn CompletionProvider>,
}

impl TextAnalyzer {
    pub fn new(provider: Arc<dyn CompletionProvider>) -> Self {
        Self { provider }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Blank text is answered with the empty analysis without calling the
    /// model. Provider failures are returned; unparseable replies are not.
    pub fn analyze(&self, text: &str) -> Result<TextAnalysis, ProviderError> {
        if text.trim().is_empty() {
            return Ok(TextAnalysis::default());
        }

        let reply = self.provider.complete(SYSTEM_PROMPT, &analysis_prompt(text))?;
        Ok(parse_analysis(&reply))
    }
}

fn analysis_prompt(text: &str) -> String {
    format!(
        "Read the text below and describe its author as JSON with these fields:\n\
         - interests: array of strings\n\
         - preferences: object, for example location, time or group size\n\
         - requirements: array of strings with anything they cannot do without\n\
         - sentiment: object mapping aspects to positive, negative or neutral\n\
         \n\
         Text:\n\
         {text}\n\
         \n\
         Respond with the JSON object only."
    )
}

/// Parse a model reply, falling back to the empty analysis.
pub fn parse_analysis(reply: &str) -> TextAnalysis {
    match serde_json::from_str(strip_code_fence(reply)) {
        Ok(analysis) => analysis,
        Err(err) => {
            log::error!("failed to parse analysis reply: {err}");
            TextAnalysis::default()
        }
    }
}

/// Models often wrap JSON in a ```json fence despite being told not to.
fn strip_code_fence(reply: &str) -> &str {
    let reply = reply.trim();
    let Some(inner) = reply.strip_prefix("```") else {
        return reply;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

/// Blocking client for OpenAI-compatible chat completion endpoints.
pub struct HttpCompleter {
    client: Client,
    endpoint: String,
    model: String,
    max_tokens: u32,
}

impl HttpCompleter {
    pub fn new(
        api_key: &str,
        base_url: &str,
        model: &str,
        max_tokens: u32,
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
            endpoint: chat_endpoint(base_url),
            model: model.to_string(),
            max_tokens,
        })
    }
}

fn chat_endpoint(base_url: &str) -> String {
    format!("{}/chat/completions", base_url.trim_end_matches('/'))
}

impl CompletionProvider for HttpCompleter {
    fn name(&self) -> &str {
        &self.model
    }

    fn complete(&self, system: &str, prompt: &str) -> Result<String, ProviderError> {
        let request = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: 0.0,
            max_tokens: self.max_tokens,
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
        parse_chat_response(&body)
    }
}

fn parse_chat_response(body: &[u8]) -> Result<String, ProviderError> {
    let parsed: ChatResponse =
        serde_json::from_slice(body).map_err(|e| ProviderError::Malformed(e.to_string()))?;

    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| ProviderError::Malformed("no completion returned".to_string()))
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    content: Option<String>,
}

/// Build the completion provider selected in config.
pub fn completer_from_config(
    config: &AnalysisConfig,
) -> Result<Arc<dyn CompletionProvider>, ProviderError> {
    let api_key = api_key_from_env(&config.api_key_env)?;
    Ok(Arc::new(HttpCompleter::new(
        &api_key,
        &config.endpoint,
        &config.model,
        config.max_tokens,
        Duration::from_secs(config.timeout_secs),
    )?))
}
