//! HTTP client for the OpenAI-compatible chat-completion endpoint.

use crate::config::ChatConfig;
use crate::context::Turn;
use crate::error::GenerationError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Turn],
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Thin client around the local completions endpoint.
#[derive(Clone)]
pub struct ChatClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    temperature: f32,
}

impl ChatClient {
    pub fn new(config: &ChatConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
        }
    }

    /// Run one completion over the given message list.
    pub async fn complete(&self, messages: Vec<Turn>) -> Result<String, GenerationError> {
        let request = ChatRequest {
            model: &self.model,
            messages: &messages,
            temperature: self.temperature,
        };

        let response = self
            .http
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|error| GenerationError::Network(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(GenerationError::Protocol { status: status.as_u16() });
        }

        let raw = response
            .text()
            .await
            .map_err(|error| GenerationError::Network(error.to_string()))?;
        if raw.trim().is_empty() {
            return Err(GenerationError::EmptyResponse);
        }

        let parsed: ChatResponse =
            serde_json::from_str(&raw).map_err(|error| GenerationError::Parse(error.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.is_empty())
            .ok_or(GenerationError::EmptyResponse)
    }
}
