//! xAI Grok client (OpenAI-compatible chat completions).

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{Result, SibylError};
use crate::models::Provider;
use crate::types::Usage;

use super::http::{post_json, AuthScheme};
use super::{GenerateReply, GenerateRequest, ProviderClient};

const DEFAULT_BASE_URL: &str = "https://api.x.ai/v1";

pub struct XaiClient {
    api_key: String,
    base_url: String,
}

impl XaiClient {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }

    fn build_request_body(
        &self,
        request: &GenerateRequest,
        format: Option<(&Value, &str)>,
    ) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| serde_json::json!({"role": m.role.to_string(), "content": m.content}))
            .collect();

        let mut body = serde_json::json!({
            "model": request.model,
            "messages": messages,
        });
        let obj = body.as_object_mut().unwrap();

        if let Some(max) = request.options.max_completion_tokens {
            obj.insert("max_completion_tokens".into(), max.into());
        }
        if let Some(temp) = request.options.temperature {
            obj.insert("temperature".into(), temp.into());
        }
        if let Some((schema, name)) = format {
            obj.insert(
                "response_format".into(),
                serde_json::json!({
                    "type": "json_schema",
                    "json_schema": {
                        "name": name,
                        "schema": schema,
                        "strict": true,
                    }
                }),
            );
        }

        body
    }

    async fn send(&self, body: Value) -> Result<GenerateReply> {
        let url = format!("{}/chat/completions", self.base_url);
        let raw = post_json(&url, AuthScheme::Bearer(&self.api_key), &body).await?;
        let data: ChatResponse = serde_json::from_value(raw.clone())?;
        let choice = data
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| SibylError::api(200, "No choices in Grok response"))?;

        Ok(GenerateReply {
            text: choice.message.content.unwrap_or_default(),
            raw,
            usage: data
                .usage
                .map(|u| Usage {
                    input_tokens: u.prompt_tokens,
                    output_tokens: u.completion_tokens,
                    total_tokens: u.total_tokens,
                    ..Default::default()
                })
                .unwrap_or_default(),
        })
    }
}

#[async_trait]
impl ProviderClient for XaiClient {
    fn provider(&self) -> Provider {
        Provider::Xai
    }

    async fn generate_text(&self, request: &GenerateRequest) -> Result<GenerateReply> {
        debug!(model = %request.model, "Grok generate_text");
        self.send(self.build_request_body(request, None)).await
    }

    async fn generate_structured(
        &self,
        request: &GenerateRequest,
        schema: &Value,
        schema_name: &str,
    ) -> Result<GenerateReply> {
        debug!(model = %request.model, "Grok generate_structured");
        self.send(self.build_request_body(request, Some((schema, schema_name))))
            .await
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}
