//! The code-generation capability behind the gateway.
//!
//! [`ModelBackend`] is deliberately thin: one prompt in, raw text out, no
//! retries. Rate limiting, timeouts, fallback and response validation all
//! live in the gateway.

use async_trait::async_trait;
use refine_common::config::{ConfigError, ModelConfig};
use serde::{Deserialize, Serialize};

/// A rendered prompt. The gateway sets `temperature` from config before
/// the prompt reaches a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
    pub temperature: f32,
}

impl Prompt {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            temperature: crate::gateway::DEFAULT_TEMPERATURE,
        }
    }
}

#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Ask `model` to complete `prompt`, returning the raw response text
    async fn complete(&self, model: &str, prompt: &Prompt) -> anyhow::Result<String>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    #[serde(default)]
    content: Option<String>,
}

/// Backend for any OpenAI-compatible chat-completions endpoint
pub struct ChatCompletionsBackend {
    client: reqwest::Client,
    url: String,
    api_key: String,
    max_tokens: u32,
}

impl ChatCompletionsBackend {
    /// Build from config; fails when the API key variable is unset
    pub fn from_config(config: &ModelConfig) -> Result<Self, ConfigError> {
        let api_key = config.api_key()?;
        let url = format!("{}/chat/completions", config.api_base.trim_end_matches('/'));
        Ok(Self {
            client: reqwest::Client::new(),
            url,
            api_key,
            max_tokens: config.max_tokens,
        })
    }
}

#[async_trait]
impl ModelBackend for ChatCompletionsBackend {
    async fn complete(&self, model: &str, prompt: &Prompt) -> anyhow::Result<String> {
        let request = ChatRequest {
            model,
            messages: vec![
                Message {
                    role: "system",
                    content: &prompt.system,
                },
                Message {
                    role: "user",
                    content: &prompt.user,
                },
            ],
            max_tokens: self.max_tokens,
            temperature: prompt.temperature,
            stream: false,
        };

        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            let reason = match status.as_u16() {
                401 | 403 => "invalid API key".to_string(),
                429 => "rate limited by provider".to_string(),
                code => format!("HTTP {}", code),
            };
            anyhow::bail!("{}: {}", reason, truncate(&text, 500));
        }

        let parsed: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| anyhow::anyhow!("failed to parse chat response: {}\n{}", e, truncate(&text, 500)))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| anyhow::anyhow!("chat response had no content"))
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push('…');
    out
}
