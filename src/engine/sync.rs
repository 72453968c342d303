//! Synchronous advice path: capability probing, structured output with
//! text-mode fallback, per-class timeouts, retry, and concurrency caps.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::Display;
use tracing::{debug, warn};

use crate::engine::capability::CapabilityCache;
use crate::engine::limiter::ProviderLimiter;
use crate::error::{Result, SibylError};
use crate::models::{ModelDescriptor, ModelRegistry, Provider};
use crate::provider::{ClientSet, GenerateOptions, GenerateRequest, ProviderClient};
use crate::types::{ChatMessage, ReasoningEffort, Usage, Verbosity};
use crate::util::retry::RetryPolicy;
use crate::util::timeout::with_timeout;

/// Callers may loop on `needs_context`; past this many iterations the
/// engine answers terminally without calling upstream.
pub const MAX_ITERATIONS: u32 = 3;

pub const ADVICE_SCHEMA_NAME: &str = "advice_response";

const PROBE_PROMPT: &str = "Confirm you are ready to answer. Reply in one line.";

/// Timeout class of a model. Classification is by substring against the
/// model name, fast markers first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelClass {
    Fast,
    Reasoning,
    Standard,
}

impl ModelClass {
    pub fn classify(name: &str) -> Self {
        const FAST_MARKERS: [&str; 4] = ["mini", "flash", "nano", "haiku"];
        if FAST_MARKERS.iter().any(|marker| name.contains(marker)) {
            return Self::Fast;
        }
        let o_series =
            name.starts_with("o1") || name.starts_with("o3") || name.starts_with("o4");
        if o_series || name.contains("gpt-5") {
            Self::Reasoning
        } else {
            Self::Standard
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        match self {
            Self::Fast => Duration::from_secs(3),
            Self::Reasoning => Duration::from_secs(10),
            Self::Standard => Duration::from_secs(5),
        }
    }

    pub fn structured_timeout(&self) -> Duration {
        match self {
            Self::Fast => Duration::from_secs(30),
            Self::Reasoning => Duration::from_secs(120),
            Self::Standard => Duration::from_secs(60),
        }
    }

    pub fn overall_timeout(&self) -> Duration {
        match self {
            Self::Fast => Duration::from_secs(45),
            Self::Reasoning => Duration::from_secs(180),
            Self::Standard => Duration::from_secs(90),
        }
    }
}

/// Options accepted by [`SyncEngine::advise`].
#[derive(Debug, Clone)]
pub struct AdviceOptions {
    pub reasoning_effort: Option<ReasoningEffort>,
    pub verbosity: Option<Verbosity>,
    pub additional_context: Option<String>,
    pub temperature: Option<f64>,
    pub max_completion_tokens: Option<u32>,
    /// Caller-maintained loop counter, 1-based.
    pub iteration: u32,
}

impl Default for AdviceOptions {
    fn default() -> Self {
        Self {
            reasoning_effort: None,
            verbosity: None,
            additional_context: None,
            temperature: None,
            max_completion_tokens: None,
            iteration: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AdviceStatus {
    Complete,
    NeedsContext,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AdviceResponseType {
    Complete,
    NeedsContext,
    Continue,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContextNeedKind {
    Code,
    Library,
    Environment,
    Error,
    Requirements,
    Other,
}

/// One item of context the model asked the caller to provide.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextNeed {
    #[serde(rename = "type")]
    pub kind: ContextNeedKind,
    pub description: String,
}

/// The structured reply shape requested from every model.
#[derive(Debug, Deserialize)]
struct AdviceReply {
    response_type: AdviceResponseType,
    response: String,
    #[serde(default)]
    context_needed: Option<Vec<ContextNeed>>,
    #[serde(default)]
    questions: Option<Vec<String>>,
    #[serde(default)]
    confidence: Option<f64>,
}

/// JSON schema for the structured advice reply.
pub fn advice_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "response_type": {
                "type": "string",
                "enum": ["complete", "needs_context", "continue"]
            },
            "response": {
                "type": "string",
                "description": "The advice text shown to the user"
            },
            "context_needed": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "type": {
                            "type": "string",
                            "enum": ["code", "library", "environment", "error", "requirements", "other"]
                        },
                        "description": {"type": "string"}
                    },
                    "required": ["type", "description"]
                }
            },
            "questions": {
                "type": "array",
                "items": {"type": "string"}
            },
            "confidence": {
                "type": "number",
                "minimum": 0,
                "maximum": 1
            }
        },
        "required": ["response_type", "response"]
    })
}

/// Result of [`SyncEngine::advise`].
#[derive(Debug, Clone)]
pub struct Advice {
    pub text: String,
    pub status: AdviceStatus,
    pub confidence: Option<f64>,
    pub context_request: Option<Vec<ContextNeed>>,
    pub questions: Option<Vec<String>>,
    pub fallback_mode: bool,
    pub model: String,
    pub iteration: u32,
    pub usage: Usage,
}

/// Result of a generic structured call ([`SyncEngine::structured_call`]).
#[derive(Debug, Clone)]
pub struct StructuredOutcome {
    /// Parsed JSON document, absent in text-mode fallback.
    pub json: Option<Value>,
    pub text: String,
    pub usage: Usage,
    pub fallback_mode: bool,
}

/// The single-shot advice engine.
pub struct SyncEngine {
    registry: Arc<ModelRegistry>,
    clients: Arc<ClientSet>,
    limiter: Arc<ProviderLimiter>,
    capabilities: Arc<CapabilityCache>,
    retry: RetryPolicy,
}

impl SyncEngine {
    pub fn new(
        registry: Arc<ModelRegistry>,
        clients: Arc<ClientSet>,
        limiter: Arc<ProviderLimiter>,
        capabilities: Arc<CapabilityCache>,
    ) -> Self {
        Self {
            registry,
            clients,
            limiter,
            capabilities,
            retry: RetryPolicy::default(),
        }
    }

    /// Single-shot advice. See the module docs for the full algorithm.
    pub async fn advise(&self, model_id: &str, prompt: &str, opts: &AdviceOptions) -> Result<Advice> {
        let descriptor = self.registry.resolve(model_id)?;
        if prompt.trim().is_empty() {
            return Err(SibylError::InvalidParams("prompt cannot be empty".into()));
        }
        if opts.iteration > MAX_ITERATIONS {
            debug!(model = %descriptor.id, iteration = opts.iteration, "max iterations reached");
            return Ok(Advice {
                text: format!(
                    "Max iterations reached ({MAX_ITERATIONS}). Refine the prompt with the \
                     context gathered so far and start a new request."
                ),
                status: AdviceStatus::Complete,
                confidence: None,
                context_request: None,
                questions: None,
                fallback_mode: false,
                model: descriptor.id.clone(),
                iteration: opts.iteration,
                usage: Usage::default(),
            });
        }

        let prompt = augment_prompt(prompt, opts.additional_context.as_deref());
        let outcome = self
            .structured_call(
                model_id,
                None,
                &prompt,
                advice_schema(),
                ADVICE_SCHEMA_NAME,
                opts,
            )
            .await?;

        Ok(interpret_advice(descriptor, opts, outcome))
    }

    /// Generic schema-constrained call with text-mode fallback. Shared by
    /// the advice and idiom tools.
    pub async fn structured_call(
        &self,
        model_id: &str,
        system: Option<&str>,
        prompt: &str,
        schema: Value,
        schema_name: &str,
        opts: &AdviceOptions,
    ) -> Result<StructuredOutcome> {
        let descriptor = self.registry.resolve(model_id)?;
        let client = Arc::clone(self.clients.get(descriptor.provider)?);
        let class = ModelClass::classify(descriptor.name);
        let request = build_request(descriptor, system, prompt, opts);

        if self.structured_support(descriptor, &client, class).await {
            let attempt = self
                .retry
                .execute(|| {
                    let client = Arc::clone(&client);
                    let request = request.clone();
                    let schema = schema.clone();
                    async move {
                        let _permit = self.limiter.acquire(descriptor.provider).await;
                        with_timeout(
                            class.structured_timeout(),
                            client.generate_structured(&request, &schema, schema_name),
                        )
                        .await
                    }
                })
                .await;

            match attempt {
                Ok(reply) => match parse_structured(&reply.text) {
                    Ok(json) => {
                        return Ok(StructuredOutcome {
                            json: Some(json),
                            text: reply.text,
                            usage: reply.usage,
                            fallback_mode: false,
                        })
                    }
                    Err(e) => {
                        warn!(model = %descriptor.id, error = %e,
                            "structured reply did not parse; falling back to text mode");
                        self.capabilities.insert(&descriptor.id, false);
                    }
                },
                Err(e) if e.is_format_failure() => {
                    warn!(model = %descriptor.id, error = %e,
                        "structured call rejected; falling back to text mode");
                    self.capabilities.insert(&descriptor.id, false);
                }
                Err(e) => return Err(e),
            }
        }

        let reply = self
            .retry
            .execute(|| {
                let client = Arc::clone(&client);
                let request = request.clone();
                async move {
                    let _permit = self.limiter.acquire(descriptor.provider).await;
                    with_timeout(class.overall_timeout(), client.generate_text(&request)).await
                }
            })
            .await?;

        Ok(StructuredOutcome {
            json: None,
            text: reply.text,
            usage: reply.usage,
            fallback_mode: true,
        })
    }

    /// Resolve structured-output support: cache, then a shared probe, then
    /// the descriptor's static default when the probe is inconclusive.
    async fn structured_support(
        &self,
        descriptor: &ModelDescriptor,
        client: &Arc<dyn ProviderClient>,
        class: ModelClass,
    ) -> bool {
        let probe = || {
            let client = Arc::clone(client);
            let request = GenerateRequest {
                model: descriptor.name.to_string(),
                messages: vec![ChatMessage::user(PROBE_PROMPT)],
                options: GenerateOptions::default(),
            };
            let schema = advice_schema();
            async move {
                let _permit = self.limiter.acquire(descriptor.provider).await;
                let result = with_timeout(
                    class.probe_timeout(),
                    client.generate_structured(&request, &schema, ADVICE_SCHEMA_NAME),
                )
                .await;
                match result {
                    Ok(reply) => Some(parse_structured(&reply.text).is_ok()),
                    Err(e) if e.is_format_failure() => Some(false),
                    Err(e) => {
                        warn!(model = %descriptor.id, error = %e, "capability probe inconclusive");
                        None
                    }
                }
            }
        };

        match self.capabilities.resolve(&descriptor.id, probe).await {
            Some(value) => value,
            None => descriptor.structured_output,
        }
    }
}

/// Append caller-supplied context to the prompt.
pub fn augment_prompt(prompt: &str, additional_context: Option<&str>) -> String {
    match additional_context {
        Some(ctx) if !ctx.trim().is_empty() => {
            format!("{prompt}\n\nAdditional Context Provided:\n{ctx}")
        }
        _ => prompt.to_string(),
    }
}

fn build_request(
    descriptor: &ModelDescriptor,
    system: Option<&str>,
    prompt: &str,
    opts: &AdviceOptions,
) -> GenerateRequest {
    let mut messages = Vec::new();
    if let Some(system) = system {
        messages.push(ChatMessage::system(system));
    }
    messages.push(ChatMessage::user(prompt));

    let mut options = GenerateOptions {
        temperature: opts.temperature,
        max_completion_tokens: opts.max_completion_tokens,
        ..Default::default()
    };
    // The reasoning options blob is assembled only for OpenAI
    // reasoning-class models.
    if descriptor.provider == Provider::OpenAi && descriptor.reasoning {
        options.reasoning_effort = opts
            .reasoning_effort
            .or(descriptor.defaults.reasoning_effort);
        if descriptor.name.starts_with("gpt-5") {
            options.verbosity = opts.verbosity.or(descriptor.defaults.verbosity);
        }
    }

    GenerateRequest {
        model: descriptor.name.to_string(),
        messages,
        options,
    }
}

fn interpret_advice(
    descriptor: &ModelDescriptor,
    opts: &AdviceOptions,
    outcome: StructuredOutcome,
) -> Advice {
    let reply = outcome
        .json
        .and_then(|json| serde_json::from_value::<AdviceReply>(json).ok());

    match reply {
        Some(reply) => Advice {
            text: reply.response,
            status: match reply.response_type {
                AdviceResponseType::NeedsContext => AdviceStatus::NeedsContext,
                _ => AdviceStatus::Complete,
            },
            confidence: reply.confidence,
            context_request: reply.context_needed,
            questions: reply.questions,
            fallback_mode: false,
            model: descriptor.id.clone(),
            iteration: opts.iteration,
            usage: outcome.usage,
        },
        None => Advice {
            text: outcome.text,
            status: AdviceStatus::Complete,
            confidence: None,
            context_request: None,
            questions: None,
            fallback_mode: true,
            model: descriptor.id.clone(),
            iteration: opts.iteration,
            usage: outcome.usage,
        },
    }
}

/// Parse a structured reply, tolerating markdown code fences around the JSON.
pub fn parse_structured(text: &str) -> Result<Value> {
    let json_text = strip_code_fences(text);
    serde_json::from_str(&json_text)
        .map_err(|e| SibylError::StructuredOutput(format!("reply is not valid JSON: {e}")))
}

/// Strip markdown code fences from a JSON response.
fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.starts_with("```") {
        let without_opening = if let Some(rest) = trimmed.strip_prefix("```json") {
            rest
        } else if let Some(rest) = trimmed.strip_prefix("```") {
            rest
        } else {
            trimmed
        };
        if let Some(stripped) = without_opening.strip_suffix("```") {
            return stripped.trim().to_string();
        }
        return without_opening.trim().to_string();
    }
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_checks_fast_markers_first() {
        assert_eq!(ModelClass::classify("gpt-5-mini"), ModelClass::Fast);
        assert_eq!(ModelClass::classify("gemini-2.5-flash"), ModelClass::Fast);
        assert_eq!(ModelClass::classify("gpt-5-nano"), ModelClass::Fast);
        assert_eq!(ModelClass::classify("claude-haiku-3-5"), ModelClass::Fast);
        assert_eq!(ModelClass::classify("o4-mini"), ModelClass::Fast);
        assert_eq!(ModelClass::classify("gpt-5"), ModelClass::Reasoning);
        assert_eq!(ModelClass::classify("o3"), ModelClass::Reasoning);
        assert_eq!(ModelClass::classify("gpt-4.1"), ModelClass::Standard);
        assert_eq!(ModelClass::classify("claude-sonnet-4-5"), ModelClass::Standard);
        assert_eq!(ModelClass::classify("grok-4"), ModelClass::Standard);
    }

    #[test]
    fn timeout_table() {
        assert_eq!(ModelClass::Fast.probe_timeout(), Duration::from_secs(3));
        assert_eq!(ModelClass::Fast.structured_timeout(), Duration::from_secs(30));
        assert_eq!(ModelClass::Fast.overall_timeout(), Duration::from_secs(45));
        assert_eq!(ModelClass::Reasoning.probe_timeout(), Duration::from_secs(10));
        assert_eq!(
            ModelClass::Reasoning.structured_timeout(),
            Duration::from_secs(120)
        );
        assert_eq!(
            ModelClass::Reasoning.overall_timeout(),
            Duration::from_secs(180)
        );
        assert_eq!(ModelClass::Standard.probe_timeout(), Duration::from_secs(5));
        assert_eq!(
            ModelClass::Standard.structured_timeout(),
            Duration::from_secs(60)
        );
        assert_eq!(ModelClass::Standard.overall_timeout(), Duration::from_secs(90));
    }

    #[test]
    fn augment_prompt_appends_context() {
        assert_eq!(augment_prompt("help", None), "help");
        assert_eq!(
            augment_prompt("help", Some("using tokio 1.x")),
            "help\n\nAdditional Context Provided:\nusing tokio 1.x"
        );
        assert_eq!(augment_prompt("help", Some("   ")), "help");
    }

    #[test]
    fn advice_schema_requires_type_and_response() {
        let schema = advice_schema();
        let required = schema["required"].as_array().unwrap();
        assert!(required.contains(&"response_type".into()));
        assert!(required.contains(&"response".into()));
    }

    #[test]
    fn parse_structured_accepts_fenced_json() {
        let fenced = "```json\n{\"response_type\": \"complete\", \"response\": \"ok\"}\n```";
        let value = parse_structured(fenced).unwrap();
        assert_eq!(value["response"], "ok");

        let bare = "```\n{\"a\": 1}\n```";
        assert_eq!(parse_structured(bare).unwrap()["a"], 1);

        assert!(matches!(
            parse_structured("plain prose"),
            Err(SibylError::StructuredOutput(_))
        ));
    }

    #[test]
    fn advice_reply_deserializes_minimal_shape() {
        let reply: AdviceReply = serde_json::from_str(
            r#"{"response_type": "needs_context", "response": "tell me more"}"#,
        )
        .unwrap();
        assert_eq!(reply.response_type, AdviceResponseType::NeedsContext);
        assert!(reply.context_needed.is_none());
        assert!(reply.confidence.is_none());
    }
}
