//! Tool router: `models`, `advice`, and `idiom` handlers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::AppContext;
use crate::engine::sync::{Advice, AdviceOptions};
use crate::engine::turn::{
    TurnOptions, TurnOutcome, TurnParams, TurnResult, DEFAULT_OVERALL_TIMEOUT_MS,
};
use crate::error::{Result, SibylError};
use crate::idiom;
use crate::models::Provider;
use crate::types::{ReasoningEffort, Verbosity};

/// Schema of one tool exposed over `tools/list`.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// The `tools/list` result.
pub fn tools_list() -> Value {
    serde_json::json!({ "tools": tool_specs() })
}

fn tool_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "models",
            description: "List available models, optionally with per-provider status",
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "detailed": { "type": "boolean", "description": "Include provider configuration status" }
                }
            }),
        },
        ToolSpec {
            name: "advice",
            description: "Ask a model for advice, synchronously or as a tracked conversation turn",
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "model": { "type": "string", "description": "Model id, provider:name" },
                    "prompt": { "type": "string" },
                    "reasoning_effort": { "type": "string", "enum": ["minimal", "low", "medium", "high"] },
                    "verbosity": { "type": "string", "enum": ["low", "medium", "high"] },
                    "additional_context": { "type": "string" },
                    "conversation_id": { "type": "integer" },
                    "request_id": { "type": "integer" },
                    "check_status": { "type": "boolean", "description": "Check a tracked request instead of asking" },
                    "temperature": { "type": "number" },
                    "max_completion_tokens": { "type": "integer" },
                    "wait_timeout_ms": { "type": "integer", "description": "How long to wait for a tracked request" },
                    "iteration": { "type": "integer", "minimum": 1 }
                },
                "required": ["model", "prompt"]
            }),
        },
        ToolSpec {
            name: "idiom",
            description: "Get ecosystem-idiomatic approach advice for a task",
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "task": { "type": "string" },
                    "current_approach": { "type": "string" },
                    "context": { "type": "object", "description": "Language, dependencies, constraints" },
                    "model": { "type": "string" }
                },
                "required": ["task"]
            }),
        },
    ]
}

#[derive(Debug, Deserialize)]
struct ToolCallParams {
    name: String,
    #[serde(default)]
    arguments: Option<Value>,
}

/// Dispatch a `tools/call` request to its handler.
pub async fn handle_tools_call(ctx: &AppContext, params: Option<Value>) -> Result<Value> {
    let params = params.ok_or_else(|| SibylError::InvalidParams("missing params".into()))?;
    let call: ToolCallParams = serde_json::from_value(params)
        .map_err(|e| SibylError::InvalidParams(format!("bad tools/call params: {e}")))?;
    let args = call.arguments.unwrap_or_else(|| serde_json::json!({}));

    match call.name.as_str() {
        "models" => models_tool(ctx, &args),
        "advice" => advice_tool(ctx, args).await,
        "idiom" => idiom_tool(ctx, args).await,
        other => Err(SibylError::MethodNotFound(format!("Unknown tool: {other}"))),
    }
}

fn tool_text(text: String, metadata: Option<Value>) -> Value {
    let mut result = serde_json::json!({
        "content": [{"type": "text", "text": text}],
    });
    if let Some(metadata) = metadata {
        result["metadata"] = metadata;
    }
    result
}

fn non_empty<'a>(value: Option<&'a str>, name: &str) -> Result<&'a str> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(SibylError::InvalidParams(format!("{name} cannot be empty"))),
    }
}

// ── models ─────────────────────────────────────────────────────────────

fn models_tool(ctx: &AppContext, args: &Value) -> Result<Value> {
    let detailed = args
        .get("detailed")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let body = if detailed {
        detailed_models(ctx)
    } else {
        serde_json::json!({ "models": ctx.registry.list() })
    };
    Ok(tool_text(serde_json::to_string_pretty(&body)?, None))
}

fn detailed_models(ctx: &AppContext) -> Value {
    let mut providers = serde_json::Map::new();
    let mut total_models = 0;
    let mut total_configured = 0;

    for provider in Provider::all() {
        let configured = ctx.registry.configured(provider);
        if configured {
            total_configured += 1;
        }

        let models: Vec<Value> = ctx
            .registry
            .models_for(provider)
            .into_iter()
            .map(|d| {
                serde_json::json!({
                    "id": d.id,
                    "reasoning": d.reasoning,
                    "structuredOutput": d.structured_output,
                    "capabilities": d.capabilities,
                })
            })
            .collect();
        total_models += models.len();

        let api_key = if configured {
            "configured".to_string()
        } else {
            format!("missing (set {})", provider.api_key_hint())
        };

        providers.insert(
            provider.to_string(),
            serde_json::json!({
                "configured": configured,
                "apiKey": api_key,
                "models": models,
            }),
        );
    }

    let mut body = serde_json::json!({
        "providers": providers,
        "summary": {
            "totalProvidersConfigured": total_configured,
            "totalModelsAvailable": total_models,
            "readyToUse": total_configured > 0,
        }
    });

    if total_configured == 0 {
        body["quickSetup"] = serde_json::json!({
            "openai": "export OPENAI_API_KEY=sk-...",
            "google": "export GOOGLE_API_KEY=... (or GEMINI_API_KEY)",
            "anthropic": "export ANTHROPIC_API_KEY=...",
            "xai": "export XAI_API_KEY=... (or GROK_API_KEY)",
        });
    }

    body
}

// ── advice ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AdviceArgs {
    model: Option<String>,
    prompt: Option<String>,
    reasoning_effort: Option<ReasoningEffort>,
    verbosity: Option<Verbosity>,
    additional_context: Option<String>,
    conversation_id: Option<i64>,
    request_id: Option<i64>,
    #[serde(default)]
    check_status: bool,
    temperature: Option<f64>,
    max_completion_tokens: Option<u32>,
    wait_timeout_ms: Option<u64>,
    iteration: Option<u32>,
}

async fn advice_tool(ctx: &AppContext, args: Value) -> Result<Value> {
    let args: AdviceArgs = serde_json::from_value(args)
        .map_err(|e| SibylError::InvalidParams(format!("bad advice arguments: {e}")))?;

    // Status check of a tracked request; model and prompt are not needed.
    if args.check_status {
        let request_id = args.request_id.ok_or_else(|| {
            SibylError::InvalidParams("check_status requires request_id".into())
        })?;
        let outcome = ctx
            .turns
            .check_or_wait(
                request_id,
                args.wait_timeout_ms.unwrap_or(DEFAULT_OVERALL_TIMEOUT_MS),
            )
            .await?;
        return Ok(turn_outcome_result(&outcome));
    }

    let model = non_empty(args.model.as_deref(), "model")?;
    let prompt = non_empty(args.prompt.as_deref(), "prompt")?;
    let descriptor = ctx.registry.resolve(model)?;

    let has_deferred = ctx
        .clients
        .get(descriptor.provider)
        .ok()
        .is_some_and(|client| client.deferred().is_some());
    let wants_conversation = args.conversation_id.is_some()
        || args.request_id.is_some()
        || args.wait_timeout_ms.is_some();

    if has_deferred && wants_conversation {
        let opts = TurnOptions {
            params: TurnParams {
                reasoning_effort: args.reasoning_effort,
                verbosity: args.verbosity,
                temperature: args.temperature,
                max_completion_tokens: args.max_completion_tokens,
            },
            overall_timeout_ms: args.wait_timeout_ms.unwrap_or(DEFAULT_OVERALL_TIMEOUT_MS),
            ..Default::default()
        };
        let outcome = ctx
            .turns
            .run_turn(model, args.conversation_id, prompt, &opts)
            .await?;
        return Ok(turn_outcome_result(&outcome));
    }

    let opts = AdviceOptions {
        reasoning_effort: args.reasoning_effort,
        verbosity: args.verbosity,
        additional_context: args.additional_context,
        temperature: args.temperature,
        max_completion_tokens: args.max_completion_tokens,
        iteration: args.iteration.unwrap_or(1),
    };
    let advice = ctx.sync.advise(model, prompt, &opts).await?;
    Ok(advice_result(&advice))
}

fn advice_result(advice: &Advice) -> Value {
    let mut metadata = serde_json::json!({
        "model": advice.model,
        "status": advice.status.to_string(),
        "iteration": advice.iteration,
    });
    let meta = metadata.as_object_mut().unwrap();
    if let Some(confidence) = advice.confidence {
        meta.insert("confidence".into(), confidence.into());
    }
    if advice.fallback_mode {
        meta.insert("fallback_mode".into(), true.into());
    }
    if let Some(needs) = &advice.context_request {
        if let Ok(value) = serde_json::to_value(needs) {
            meta.insert("context_request".into(), value);
        }
    }
    if let Some(questions) = &advice.questions {
        if let Ok(value) = serde_json::to_value(questions) {
            meta.insert("questions".into(), value);
        }
    }
    tool_text(advice.text.clone(), Some(metadata))
}

fn turn_outcome_result(outcome: &TurnOutcome) -> Value {
    match &outcome.result {
        TurnResult::Completed {
            request_id,
            text,
            usage,
        } => {
            let mut metadata = serde_json::json!({
                "conversation_id": outcome.conversation_id,
                "request_id": request_id,
                "status": "completed",
            });
            if let Some(usage) = usage {
                if let Ok(value) = serde_json::to_value(usage) {
                    metadata["usage"] = value;
                }
            }
            tool_text(text.clone(), Some(metadata))
        }
        TurnResult::Waiting {
            request_id,
            provider_response_id,
        } => {
            let mut metadata = serde_json::json!({
                "conversation_id": outcome.conversation_id,
                "request_id": request_id,
                "status": "waiting",
            });
            if let Some(response_id) = provider_response_id {
                metadata["provider_response_id"] = response_id.clone().into();
            }
            tool_text(
                format!(
                    "Request {request_id} is still running. Check again with \
                     check_status and this request_id."
                ),
                Some(metadata),
            )
        }
        TurnResult::Error { request_id, error } => {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            tool_text(
                format!("Request {request_id} failed: {message}"),
                Some(serde_json::json!({
                    "conversation_id": outcome.conversation_id,
                    "request_id": request_id,
                    "status": "error",
                    "error": error,
                })),
            )
        }
    }
}

// ── idiom ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct IdiomArgs {
    task: Option<String>,
    current_approach: Option<String>,
    context: Option<Value>,
    model: Option<String>,
}

async fn idiom_tool(ctx: &AppContext, args: Value) -> Result<Value> {
    let args: IdiomArgs = serde_json::from_value(args)
        .map_err(|e| SibylError::InvalidParams(format!("bad idiom arguments: {e}")))?;
    let task = non_empty(args.task.as_deref(), "task")?;

    let model = match args.model {
        Some(model) if !model.trim().is_empty() => model,
        _ => default_idiom_model(ctx)?,
    };

    let prompt = idiom::build_prompt(task, args.current_approach.as_deref(), args.context.as_ref());
    let outcome = ctx
        .sync
        .structured_call(
            &model,
            Some(idiom::SYSTEM_PROMPT),
            &prompt,
            idiom::idiom_schema(),
            idiom::IDIOM_SCHEMA_NAME,
            &AdviceOptions::default(),
        )
        .await?;

    let metadata = serde_json::json!({
        "model": model,
        "fallback_mode": outcome.fallback_mode,
    });
    Ok(tool_text(idiom::render(&outcome), Some(metadata)))
}

fn default_idiom_model(ctx: &AppContext) -> Result<String> {
    if ctx.registry.resolve("openai:gpt-5-mini").is_ok() {
        return Ok("openai:gpt-5-mini".to_string());
    }
    ctx.registry.list().into_iter().next().ok_or_else(|| {
        SibylError::Configuration(
            "no providers configured; set an API key to use the idiom tool".into(),
        )
    })
}
