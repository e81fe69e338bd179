//! OpenAI-compatible chat-completions provider over HTTP.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use super::{Completion, CompletionRequest, Provider, ProviderFailure};
use crate::errors::ProviderError;
use crate::ledger::{ModelPricing, TokenUsage};

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Value,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

/// Any endpoint speaking the `/chat/completions` protocol.
pub struct OpenAiCompatibleProvider {
    name: String,
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    pricing: HashMap<String, ModelPricing>,
}

impl OpenAiCompatibleProvider {
    pub fn new(name: &str, base_url: &str, api_key: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            client: Client::new(),
            endpoint: resolve_chat_endpoint(base_url),
            api_key,
            pricing: HashMap::new(),
        }
    }

    pub fn with_pricing(mut self, model: &str, pricing: ModelPricing) -> Self {
        self.pricing.insert(model.to_string(), pricing);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn body(request: &CompletionRequest) -> Value {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": request.prompt}));

        let mut body = json!({
            "model": request.model,
            "messages": messages,
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        body
    }
}

#[async_trait]
impl Provider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderFailure> {
        debug!(provider = %self.name, model = %request.model, "POST {}", self.endpoint);

        let mut http = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .json(&Self::body(request));
        if let Some(key) = &self.api_key {
            http = http.bearer_auth(key);
        }

        let response = http.send().await.map_err(|e| ProviderError::Transient {
            provider: self.name.clone(),
            message: e.to_string(),
            status_code: e.status().map(|s| s.as_u16()),
        })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| ProviderError::Transient {
            provider: self.name.clone(),
            message: format!("failed to read body: {}", e),
            status_code: Some(status.as_u16()),
        })?;

        if !status.is_success() {
            return Err(ProviderError::from_status(&self.name, status.as_u16(), text).into());
        }

        parse_response(&self.name, &text).map_err(ProviderFailure::from)
    }

    fn pricing(&self, model: &str) -> Option<ModelPricing> {
        self.pricing.get(model).copied()
    }
}

fn resolve_chat_endpoint(base_url: &str) -> String {
    if base_url.contains("/chat/completions") {
        base_url.to_string()
    } else {
        format!("{}/chat/completions", base_url.trim_end_matches('/'))
    }
}

fn parse_response(provider: &str, text: &str) -> Result<Completion, ProviderError> {
    let malformed = |message: String| ProviderError::Malformed {
        provider: provider.to_string(),
        message,
    };
    let parsed: ChatResponse = serde_json::from_str(text).map_err(|e| malformed(e.to_string()))?;
    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| malformed("response has no choices".to_string()))?;

    let content = match choice.message.content {
        Value::String(text) => text,
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    };

    let usage = parsed
        .usage
        .map(|u| {
            TokenUsage::new(
                u.prompt_tokens.unwrap_or_default(),
                u.completion_tokens.unwrap_or_default(),
            )
        })
        .unwrap_or_default();

    Ok(Completion { content, usage })
}
