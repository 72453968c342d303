//! Anthropic Messages API client.
//!
//! No schema-constrained endpoint: structured output is requested through a
//! system instruction and validated by the caller.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{Result, SibylError};
use crate::models::Provider;
use crate::types::{Role, Usage};

use super::http::{post_json, AuthScheme};
use super::{GenerateReply, GenerateRequest, ProviderClient};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicClient {
    api_key: String,
    base_url: String,
}

impl AnthropicClient {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }

    fn build_request_body(&self, request: &GenerateRequest, extra_system: Option<&str>) -> Value {
        let mut system_parts: Vec<&str> = Vec::new();
        if let Some(extra) = extra_system {
            system_parts.push(extra);
        }
        let mut messages = Vec::new();

        for msg in &request.messages {
            match msg.role {
                Role::System => system_parts.push(&msg.content),
                Role::User | Role::Tool => messages.push(serde_json::json!({
                    "role": "user",
                    "content": msg.content,
                })),
                Role::Assistant => messages.push(serde_json::json!({
                    "role": "assistant",
                    "content": msg.content,
                })),
            }
        }

        let mut body = serde_json::json!({
            "model": request.model,
            "messages": messages,
            "max_tokens": request.options.max_completion_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        });
        let obj = body.as_object_mut().unwrap();

        if !system_parts.is_empty() {
            obj.insert("system".into(), system_parts.join("\n\n").into());
        }
        if let Some(temp) = request.options.temperature {
            obj.insert("temperature".into(), temp.into());
        }

        body
    }

    async fn send(&self, body: Value) -> Result<GenerateReply> {
        let url = format!("{}/messages", self.base_url);
        let auth = AuthScheme::AnthropicKey {
            key: &self.api_key,
            version: API_VERSION,
        };
        let raw = post_json(&url, auth, &body).await?;
        let data: MessagesResponse = serde_json::from_value(raw.clone())?;

        let text: String = data
            .content
            .iter()
            .filter_map(|block| block.text.as_deref())
            .collect();
        if text.is_empty() {
            return Err(SibylError::api(200, "No text content in Anthropic response"));
        }

        Ok(GenerateReply {
            text,
            raw,
            usage: data
                .usage
                .map(|u| Usage {
                    input_tokens: u.input_tokens,
                    output_tokens: u.output_tokens,
                    total_tokens: u.input_tokens + u.output_tokens,
                    ..Default::default()
                })
                .unwrap_or_default(),
        })
    }
}

#[async_trait]
impl ProviderClient for AnthropicClient {
    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    async fn generate_text(&self, request: &GenerateRequest) -> Result<GenerateReply> {
        debug!(model = %request.model, "Anthropic generate_text");
        self.send(self.build_request_body(request, None)).await
    }

    async fn generate_structured(
        &self,
        request: &GenerateRequest,
        schema: &Value,
        _schema_name: &str,
    ) -> Result<GenerateReply> {
        debug!(model = %request.model, "Anthropic generate_structured");
        let instruction = format!(
            "You must respond with ONLY valid JSON (no markdown, no explanation) matching this schema:\n```json\n{}\n```",
            serde_json::to_string_pretty(schema).unwrap_or_default()
        );
        self.send(self.build_request_body(request, Some(&instruction)))
            .await
    }
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    usage: Option<MessagesUsage>,
}

#[derive(Deserialize)]
struct ContentBlock {
    text: Option<String>,
}

#[derive(Deserialize)]
struct MessagesUsage {
    input_tokens: u32,
    output_tokens: u32,
}
