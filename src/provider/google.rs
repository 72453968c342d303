//! Google Gemini API client.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{Result, SibylError};
use crate::models::Provider;
use crate::types::{Role, Usage};

use super::http::{post_json, AuthScheme};
use super::{GenerateReply, GenerateRequest, ProviderClient};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GoogleClient {
    api_key: String,
    base_url: String,
}

impl GoogleClient {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }

    fn build_request_body(&self, request: &GenerateRequest, schema: Option<&Value>) -> Value {
        let mut system_instruction = None;
        let mut contents = Vec::new();

        for msg in &request.messages {
            match msg.role {
                Role::System => {
                    system_instruction = Some(serde_json::json!({
                        "parts": [{"text": msg.content}]
                    }));
                }
                Role::User | Role::Tool => contents.push(serde_json::json!({
                    "role": "user",
                    "parts": [{"text": msg.content}],
                })),
                Role::Assistant => contents.push(serde_json::json!({
                    "role": "model",
                    "parts": [{"text": msg.content}],
                })),
            }
        }

        let mut generation_config = serde_json::Map::new();
        if let Some(temp) = request.options.temperature {
            generation_config.insert("temperature".into(), temp.into());
        }
        if let Some(max) = request.options.max_completion_tokens {
            generation_config.insert("maxOutputTokens".into(), max.into());
        }
        if let Some(schema) = schema {
            generation_config.insert("responseMimeType".into(), "application/json".into());
            generation_config.insert("responseSchema".into(), schema.clone());
        }

        let mut body = serde_json::json!({ "contents": contents });
        let obj = body.as_object_mut().unwrap();
        if let Some(sys) = system_instruction {
            obj.insert("systemInstruction".into(), sys);
        }
        if !generation_config.is_empty() {
            obj.insert("generationConfig".into(), Value::Object(generation_config));
        }

        body
    }

    async fn send(&self, model: &str, body: Value) -> Result<GenerateReply> {
        let url = format!("{}/models/{model}:generateContent", self.base_url);
        let raw = post_json(&url, AuthScheme::GoogleKey(&self.api_key), &body).await?;
        let data: GenerateContentResponse = serde_json::from_value(raw.clone())?;
        let candidate = data
            .candidates
            .unwrap_or_default()
            .into_iter()
            .next()
            .ok_or_else(|| SibylError::api(200, "No candidates in Gemini response"))?;

        let text: String = candidate
            .content
            .map(|c| {
                c.parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<String>()
            })
            .unwrap_or_default();

        Ok(GenerateReply {
            text,
            raw,
            usage: data
                .usage_metadata
                .map(|u| Usage {
                    input_tokens: u.prompt_token_count.unwrap_or(0),
                    output_tokens: u.candidates_token_count.unwrap_or(0),
                    total_tokens: u.total_token_count.unwrap_or(0),
                    ..Default::default()
                })
                .unwrap_or_default(),
        })
    }
}

#[async_trait]
impl ProviderClient for GoogleClient {
    fn provider(&self) -> Provider {
        Provider::Google
    }

    async fn generate_text(&self, request: &GenerateRequest) -> Result<GenerateReply> {
        debug!(model = %request.model, "Gemini generate_text");
        self.send(&request.model, self.build_request_body(request, None))
            .await
    }

    async fn generate_structured(
        &self,
        request: &GenerateRequest,
        schema: &Value,
        _schema_name: &str,
    ) -> Result<GenerateReply> {
        debug!(model = %request.model, "Gemini generate_structured");
        self.send(&request.model, self.build_request_body(request, Some(schema)))
            .await
    }
}

#[derive(Deserialize)]
struct GenerateContentResponse {
    candidates: Option<Vec<Candidate>>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Deserialize)]
struct UsageMetadata {
    #[serde(rename = "promptTokenCount")]
    prompt_token_count: Option<u32>,
    #[serde(rename = "candidatesTokenCount")]
    candidates_token_count: Option<u32>,
    #[serde(rename = "totalTokenCount")]
    total_token_count: Option<u32>,
}
