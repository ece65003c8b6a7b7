use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{LlmProvider, Message};

pub struct OllamaProvider {
    url: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: String,
}

impl OllamaProvider {
    pub fn new(url: String, model: String) -> Self {
        Self {
            url,
            model,
            client: reqwest::Client::new(),
        }
    }

    fn request<'a>(&'a self, system_prompt: &'a str, messages: &'a [Message]) -> ChatRequest<'a> {
        let mut wire = Vec::with_capacity(messages.len() + 1);
        wire.push(WireMessage {
            role: "system",
            content: system_prompt,
        });
        wire.extend(messages.iter().map(|m| WireMessage {
            role: &m.role,
            content: &m.content,
        }));
        ChatRequest {
            model: &self.model,
            messages: wire,
            stream: false,
            // Extraction wants structured output, not creative text.
            options: ChatOptions { temperature: 0.0 },
        }
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    async fn chat(&self, system_prompt: &str, messages: &[Message]) -> anyhow::Result<String> {
        let resp: ChatResponse = self
            .client
            .post(format!("{}/api/chat", self.url))
            .json(&self.request(system_prompt, messages))
            .send()
            .await
            .context("failed to call Ollama API")?
            .error_for_status()
            .context("Ollama API returned error")?
            .json()
            .await
            .context("failed to parse Ollama response")?;

        Ok(resp.message.content)
    }
}
