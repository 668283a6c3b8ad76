//! Answer generator implementations.
//!
//! [`create_generator`] picks the backend from `generation.provider`:
//! `openai` (chat completions), `ollama` (`/api/generate`, non-streaming)
//! or `extractive` (offline, see [`ExtractiveGenerator`]). Every backend
//! receives the literal query text and the assembled context; failures
//! surface as [`RagError::Generation`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use knowledge_rag_core::error::{RagError, Result};
use knowledge_rag_core::generate::{
    build_prompt, AnswerGenerator, ExtractiveGenerator, GenerationRequest, SYSTEM_PROMPT,
};

use crate::config::GenerationConfig;

pub fn create_generator(config: &GenerationConfig) -> anyhow::Result<Arc<dyn AnswerGenerator>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAIGenerator::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaGenerator::new(config)?)),
        "extractive" => Ok(Arc::new(ExtractiveGenerator)),
        other => bail!("Unknown generation provider: {}", other),
    }
}

fn http_client(timeout_secs: u64) -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

fn generation_err(service: &str, e: impl std::fmt::Display) -> RagError {
    RagError::Generation(format!("{}: {}", service, e))
}

async fn read_json<T: for<'de> Deserialize<'de>>(
    response: reqwest::Response,
    service: &str,
) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let text = response
            .text()
            .await
            .unwrap_or_else(|_| "<body unavailable>".to_string());
        return Err(RagError::Generation(format!(
            "{} returned {}: {}",
            service, status, text
        )));
    }
    response
        .json()
        .await
        .map_err(|e| generation_err(service, format!("failed to parse response: {}", e)))
}

/// User turn for chat-style backends; the instructions go in the system turn.
fn user_message(query: &str, context: &str) -> String {
    format!("CONTEXT:\n{}\n\nQUESTION:\n{}\n\nANSWER:", context, query)
}

// ============ OpenAI ============

pub struct OpenAIGenerator {
    client: reqwest::Client,
    url: String,
    api_key: String,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAIGenerator {
    pub fn new(config: &GenerationConfig) -> anyhow::Result<Self> {
        let api_key = match std::env::var("OPENAI_API_KEY") {
            Ok(key) => key,
            Err(_) => bail!("OPENAI_API_KEY environment variable not set"),
        };
        Self::with_api_key(config, api_key)
    }

    pub fn with_api_key(config: &GenerationConfig, api_key: String) -> anyhow::Result<Self> {
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            url: config
                .url
                .as_deref()
                .unwrap_or("https://api.openai.com")
                .trim_end_matches('/')
                .to_string(),
            api_key,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    max_tokens: u32,
    messages: Vec<ChatMessage<'a>>,
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
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl AnswerGenerator for OpenAIGenerator {
    fn name(&self) -> &str {
        "openai"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let user = user_message(&request.query, &request.context);
        let body = ChatRequest {
            model: &request.model,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &user,
                },
            ],
        };
        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.url))
            .bearer_auth(self.api_key.trim())
            .json(&body)
            .send()
            .await
            .map_err(|e| generation_err("OpenAI", e))?;

        let parsed: ChatResponse = read_json(response, "OpenAI").await?;
        parsed
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .map(|s| s.trim().to_string())
            .ok_or_else(|| RagError::Generation("OpenAI returned no choices".into()))
    }
}

// ============ Ollama ============

pub struct OllamaGenerator {
    client: reqwest::Client,
    url: String,
    temperature: f32,
    max_tokens: u32,
}

impl OllamaGenerator {
    pub fn new(config: &GenerationConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            url: config
                .url
                .as_deref()
                .unwrap_or("http://localhost:11434")
                .trim_end_matches('/')
                .to_string(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }
}

#[derive(Debug, Deserialize)]
struct OllamaGenerateResponse {
    response: String,
}

#[async_trait]
impl AnswerGenerator for OllamaGenerator {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let body = serde_json::json!({
            "model": request.model,
            "prompt": build_prompt(&request.query, &request.context),
            "stream": false,
            "options": {
                "temperature": self.temperature,
                "num_predict": self.max_tokens,
            },
        });
        let response = self
            .client
            .post(format!("{}/api/generate", self.url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                generation_err(
                    "Ollama",
                    format!("connection error (is Ollama running at {}?): {}", self.url, e),
                )
            })?;

        let parsed: OllamaGenerateResponse = read_json(response, "Ollama").await?;
        Ok(parsed.response.trim().to_string())
    }
}
