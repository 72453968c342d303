//! OpenAI Chat Completions client. The deferred surface (Responses API)
//! lives in [`super::openai_responses`] and is exposed through `deferred()`.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{Result, SibylError};
use crate::models::Provider;
use crate::types::Usage;

use super::http::{post_json, AuthScheme};
use super::openai_responses::OpenAiResponsesClient;
use super::{DeferredClient, GenerateReply, GenerateRequest, ProviderClient};

pub(crate) const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiClient {
    api_key: String,
    base_url: String,
    responses: OpenAiResponsesClient,
}

impl OpenAiClient {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        let base_url = base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            responses: OpenAiResponsesClient::new(api_key.clone(), base_url.clone()),
            api_key,
            base_url,
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
        if let Some(effort) = request.options.reasoning_effort {
            obj.insert("reasoning_effort".into(), effort.to_string().into());
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
            .ok_or_else(|| SibylError::api(200, "No choices in OpenAI response"))?;

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
impl ProviderClient for OpenAiClient {
    fn provider(&self) -> Provider {
        Provider::OpenAi
    }

    async fn generate_text(&self, request: &GenerateRequest) -> Result<GenerateReply> {
        debug!(model = %request.model, "OpenAI generate_text");
        self.send(self.build_request_body(request, None)).await
    }

    async fn generate_structured(
        &self,
        request: &GenerateRequest,
        schema: &Value,
        schema_name: &str,
    ) -> Result<GenerateReply> {
        debug!(model = %request.model, "OpenAI generate_structured");
        self.send(self.build_request_body(request, Some((schema, schema_name))))
            .await
    }

    fn deferred(&self) -> Option<&dyn DeferredClient> {
        Some(&self.responses)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChatMessage, ReasoningEffort};

    fn client() -> OpenAiClient {
        OpenAiClient::new("test-key".into(), None)
    }

    fn request() -> GenerateRequest {
        GenerateRequest {
            model: "gpt-5".into(),
            messages: vec![ChatMessage::user("hello")],
            options: Default::default(),
        }
    }

    #[test]
    fn body_includes_reasoning_effort_when_set() {
        let mut req = request();
        req.options.reasoning_effort = Some(ReasoningEffort::High);
        let body = client().build_request_body(&req, None);
        assert_eq!(body["reasoning_effort"], "high");
        assert_eq!(body["messages"][0]["role"], "user");
        assert!(body.get("response_format").is_none());
    }

    #[test]
    fn body_includes_json_schema_format() {
        let schema = serde_json::json!({"type": "object"});
        let body = client().build_request_body(&request(), Some((&schema, "advice_response")));
        assert_eq!(body["response_format"]["type"], "json_schema");
        assert_eq!(
            body["response_format"]["json_schema"]["name"],
            "advice_response"
        );
        assert_eq!(body["response_format"]["json_schema"]["strict"], true);
    }

    #[test]
    fn deferred_surface_is_exposed() {
        assert!(client().deferred().is_some());
    }
}
