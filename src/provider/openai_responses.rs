//! OpenAI Responses API: the deferred-completion endpoint.
//!
//! Jobs are opened with `background: true` and polled via
//! `GET /responses/{id}` until they reach a terminal status.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::Result;
use crate::types::{RequestStatus, Usage};

use super::http::{get_json, post_json, AuthScheme};
use super::{DeferredClient, GenerateRequest, JobState};

pub struct OpenAiResponsesClient {
    api_key: String,
    base_url: String,
}

impl OpenAiResponsesClient {
    pub fn new(api_key: String, base_url: String) -> Self {
        Self { api_key, base_url }
    }

    fn build_request_body(&self, request: &GenerateRequest) -> Value {
        let input: Vec<Value> = request
            .messages
            .iter()
            .map(|m| serde_json::json!({"role": m.role.to_string(), "content": m.content}))
            .collect();

        let mut body = serde_json::json!({
            "model": request.model,
            "input": input,
            "background": true,
            "store": true,
        });
        let obj = body.as_object_mut().unwrap();

        if let Some(max) = request.options.max_completion_tokens {
            obj.insert("max_output_tokens".into(), max.into());
        }
        if let Some(temp) = request.options.temperature {
            obj.insert("temperature".into(), temp.into());
        }
        if let Some(effort) = request.options.reasoning_effort {
            obj.insert(
                "reasoning".into(),
                serde_json::json!({ "effort": effort.to_string() }),
            );
        }
        if let Some(verbosity) = request.options.verbosity {
            obj.insert(
                "text".into(),
                serde_json::json!({ "verbosity": verbosity.to_string() }),
            );
        }

        body
    }

    fn parse_job(raw: Value) -> Result<JobState> {
        let data: ResponsesApiResponse = serde_json::from_value(raw.clone())?;

        let status = match data.status.as_deref() {
            Some("queued") => RequestStatus::Queued,
            Some("completed") => RequestStatus::Completed,
            Some("failed") => RequestStatus::Failed,
            Some("cancelled") => RequestStatus::Cancelled,
            Some("incomplete") | Some("expired") => RequestStatus::Expired,
            _ => RequestStatus::InProgress,
        };

        let mut text = String::new();
        for item in data.output.unwrap_or_default() {
            if item.kind.as_deref() == Some("message") || item.kind.is_none() {
                for c in item.content.unwrap_or_default() {
                    if let Some(t) = c.text {
                        text.push_str(&t);
                    }
                }
            }
        }

        Ok(JobState {
            provider_response_id: data.id,
            status,
            output_text: if text.is_empty() { None } else { Some(text) },
            error: data.error,
            usage: data.usage.map(|u| Usage {
                input_tokens: u.input_tokens,
                output_tokens: u.output_tokens,
                total_tokens: u
                    .total_tokens
                    .unwrap_or(u.input_tokens + u.output_tokens),
                ..Default::default()
            }),
            raw,
        })
    }
}

#[async_trait]
impl DeferredClient for OpenAiResponsesClient {
    async fn open_job(&self, request: &GenerateRequest) -> Result<JobState> {
        let body = self.build_request_body(request);
        let url = format!("{}/responses", self.base_url);

        debug!(model = %request.model, "OpenAI Responses open_job");

        let raw = post_json(&url, AuthScheme::Bearer(&self.api_key), &body).await?;
        Self::parse_job(raw)
    }

    async fn fetch_job(&self, provider_response_id: &str) -> Result<JobState> {
        let url = format!("{}/responses/{provider_response_id}", self.base_url);

        debug!(response_id = provider_response_id, "OpenAI Responses fetch_job");

        let raw = get_json(&url, AuthScheme::Bearer(&self.api_key)).await?;
        Self::parse_job(raw)
    }
}

// Internal response types for the Responses API.

#[derive(Deserialize)]
struct ResponsesApiResponse {
    id: String,
    status: Option<String>,
    output: Option<Vec<ResponsesOutputItem>>,
    usage: Option<ResponsesUsage>,
    error: Option<Value>,
}

#[derive(Deserialize)]
struct ResponsesOutputItem {
    #[serde(rename = "type")]
    kind: Option<String>,
    content: Option<Vec<ResponsesContent>>,
}

#[derive(Deserialize)]
struct ResponsesContent {
    text: Option<String>,
}

#[derive(Deserialize)]
struct ResponsesUsage {
    input_tokens: u32,
    output_tokens: u32,
    total_tokens: Option<u32>,
}
