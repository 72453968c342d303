//! Asynchronous advice path: the turn runner and its poller.
//!
//! A turn persists one user message and one request row, opens a deferred
//! job upstream when the provider has one, and drives a backoff poll until
//! the job terminates or the wait budget elapses. Identical turns within a
//! conversation dedup onto the same request row by input hash.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::engine::limiter::ProviderLimiter;
use crate::error::{Result, SibylError};
use crate::models::{ModelDescriptor, ModelRegistry, Provider};
use crate::provider::{ClientSet, DeferredClient, GenerateOptions, GenerateRequest, JobState};
use crate::store::{RequestRow, Store};
use crate::types::{ChatMessage, ReasoningEffort, RequestStatus, Role, Usage, Verbosity};
use crate::util::canonical::input_hash;
use crate::util::timeout::with_timeout;

pub const DEFAULT_OVERALL_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_HISTORY_MESSAGES: usize = 50;

const INITIAL_POLL_DELAY: Duration = Duration::from_secs(1);
const MAX_POLL_DELAY: Duration = Duration::from_secs(5);
const POLL_BACKOFF_FACTOR: f64 = 1.5;

/// Generation parameters persisted (canonically) into the request row.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TurnParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verbosity: Option<Verbosity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct TurnOptions {
    pub params: TurnParams,
    /// Budget for the poll loop, not for the upstream job.
    pub overall_timeout_ms: u64,
    pub max_history_messages: usize,
}

impl Default for TurnOptions {
    fn default() -> Self {
        Self {
            params: TurnParams::default(),
            overall_timeout_ms: DEFAULT_OVERALL_TIMEOUT_MS,
            max_history_messages: DEFAULT_MAX_HISTORY_MESSAGES,
        }
    }
}

/// Outcome of a turn or a status check.
#[derive(Debug, Clone)]
pub enum TurnResult {
    Completed {
        request_id: i64,
        text: String,
        usage: Option<Usage>,
    },
    Waiting {
        request_id: i64,
        provider_response_id: Option<String>,
    },
    Error {
        request_id: i64,
        error: Value,
    },
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub conversation_id: i64,
    pub result: TurnResult,
}

/// Drives conversation turns against deferred-completion providers.
/// Providers without one degrade to a single synchronous call wrapped in
/// the same persistence.
pub struct TurnRunner {
    store: Arc<Store>,
    registry: Arc<ModelRegistry>,
    clients: Arc<ClientSet>,
    limiter: Arc<ProviderLimiter>,
}

impl TurnRunner {
    pub fn new(
        store: Arc<Store>,
        registry: Arc<ModelRegistry>,
        clients: Arc<ClientSet>,
        limiter: Arc<ProviderLimiter>,
    ) -> Self {
        Self {
            store,
            registry,
            clients,
            limiter,
        }
    }

    /// Run one user-message → assistant-message turn.
    pub async fn run_turn(
        &self,
        model_id: &str,
        conversation_id: Option<i64>,
        user_text: &str,
        opts: &TurnOptions,
    ) -> Result<TurnOutcome> {
        let descriptor = self.registry.resolve(model_id)?;
        if user_text.trim().is_empty() {
            return Err(SibylError::InvalidParams("prompt cannot be empty".into()));
        }

        let conversation_id = match conversation_id {
            Some(id) if self.store.get_conversation(id).await?.is_some() => id,
            _ => self.store.create_conversation(None, None).await?.id,
        };

        let user_message = self
            .store
            .append_message(conversation_id, Role::User, user_text, None)
            .await?;

        let history = self.store.list_messages(conversation_id).await?;
        let start = history.len().saturating_sub(opts.max_history_messages);
        let messages: Vec<ChatMessage> = history[start..]
            .iter()
            .map(|m| ChatMessage {
                role: m.role,
                content: m.content.clone(),
            })
            .collect();

        // The hash covers the turn's own input, so identical calls within a
        // conversation land on the same request row regardless of how much
        // history has accumulated around them.
        let params_value = serde_json::to_value(&opts.params)?;
        let hash = input_hash(
            &descriptor.id,
            &Value::String(user_text.to_string()),
            &params_value,
        );
        let params_json = params_value.to_string();

        let (request, _created) = self
            .store
            .upsert_request(
                conversation_id,
                user_message.id,
                &descriptor.id,
                &params_json,
                &hash,
            )
            .await?;

        if request.status.is_terminal() {
            if request.status == RequestStatus::Completed {
                debug!(request_id = request.id, "turn dedup cache hit");
            }
            return Ok(TurnOutcome {
                conversation_id,
                result: result_from_row(&request),
            });
        }
        if request.provider_response_id.is_some() {
            // Another caller owns the poll; observe from the side.
            debug!(request_id = request.id, "turn already in flight");
            return Ok(TurnOutcome {
                conversation_id,
                result: TurnResult::Waiting {
                    request_id: request.id,
                    provider_response_id: request.provider_response_id.clone(),
                },
            });
        }

        // Claim the queued row. Losing the claim means a concurrent caller
        // with the same input won it and is opening the job right now.
        if !self.store.mark_started(request.id).await? {
            debug!(request_id = request.id, "lost the ownership claim");
            let row = self
                .store
                .get_request(request.id)
                .await?
                .ok_or_else(|| SibylError::Internal(format!("request {} vanished", request.id)))?;
            return Ok(TurnOutcome {
                conversation_id,
                result: result_from_row(&row),
            });
        }

        let client = self.clients.get(descriptor.provider)?;
        let gen_request = GenerateRequest {
            model: descriptor.name.to_string(),
            messages,
            options: generate_options(descriptor, &opts.params),
        };

        let result = match client.deferred() {
            Some(deferred) => {
                self.drive_deferred(conversation_id, request.id, descriptor, deferred, &gen_request, opts)
                    .await?
            }
            None => {
                self.run_inline(conversation_id, request.id, descriptor, &gen_request, opts)
                    .await?
            }
        };

        Ok(TurnOutcome {
            conversation_id,
            result,
        })
    }

    /// Check a persisted request and optionally continue its poll within
    /// `wait_ms`.
    pub async fn check_or_wait(&self, request_id: i64, wait_ms: u64) -> Result<TurnOutcome> {
        let request = self
            .store
            .get_request(request_id)
            .await?
            .ok_or_else(|| SibylError::InvalidParams(format!("unknown request_id {request_id}")))?;
        let conversation_id = request.conversation_id;

        if request.status.is_terminal() {
            return Ok(TurnOutcome {
                conversation_id,
                result: result_from_row(&request),
            });
        }

        let Some(response_id) = request.provider_response_id.clone() else {
            return Ok(TurnOutcome {
                conversation_id,
                result: TurnResult::Waiting {
                    request_id,
                    provider_response_id: None,
                },
            });
        };

        let descriptor = self.registry.resolve(&request.model)?;
        let client = self.clients.get(descriptor.provider)?;
        let result = match client.deferred() {
            Some(deferred) => {
                self.poll(
                    conversation_id,
                    request_id,
                    descriptor,
                    deferred,
                    &response_id,
                    Duration::from_millis(wait_ms),
                    true,
                )
                .await?
            }
            None => TurnResult::Waiting {
                request_id,
                provider_response_id: Some(response_id),
            },
        };

        Ok(TurnOutcome {
            conversation_id,
            result,
        })
    }

    async fn drive_deferred(
        &self,
        conversation_id: i64,
        request_id: i64,
        descriptor: &ModelDescriptor,
        deferred: &dyn DeferredClient,
        request: &GenerateRequest,
        opts: &TurnOptions,
    ) -> Result<TurnResult> {
        let opened = {
            let _permit = self.limiter.acquire(descriptor.provider).await;
            deferred.open_job(request).await
        };

        let job = match opened {
            Ok(job) => job,
            Err(e) => {
                let error = error_value(&e);
                self.store
                    .save_failure(request_id, RequestStatus::Failed, &error)
                    .await?;
                return Ok(TurnResult::Error { request_id, error });
            }
        };

        match job.status {
            RequestStatus::Completed => {
                self.finish_completed(conversation_id, request_id, &job).await
            }
            status if status.is_terminal() => self.finish_failed(request_id, &job).await,
            _ => {
                self.store
                    .save_in_progress(request_id, &job.provider_response_id)
                    .await?;
                self.poll(
                    conversation_id,
                    request_id,
                    descriptor,
                    deferred,
                    &job.provider_response_id,
                    Duration::from_millis(opts.overall_timeout_ms),
                    false,
                )
                .await
            }
        }
    }

    /// Degraded path for providers without a deferred endpoint: one
    /// synchronous call through the same request-row lifecycle.
    async fn run_inline(
        &self,
        conversation_id: i64,
        request_id: i64,
        descriptor: &ModelDescriptor,
        request: &GenerateRequest,
        opts: &TurnOptions,
    ) -> Result<TurnResult> {
        let client = Arc::clone(self.clients.get(descriptor.provider)?);

        let reply = {
            let _permit = self.limiter.acquire(descriptor.provider).await;
            with_timeout(
                Duration::from_millis(opts.overall_timeout_ms),
                client.generate_text(request),
            )
            .await
        };

        match reply {
            Ok(reply) => {
                let job = JobState {
                    provider_response_id: String::new(),
                    status: RequestStatus::Completed,
                    output_text: Some(reply.text),
                    error: None,
                    usage: Some(reply.usage),
                    raw: reply.raw,
                };
                self.finish_completed(conversation_id, request_id, &job).await
            }
            Err(e) => {
                let error = error_value(&e);
                self.store
                    .save_failure(request_id, RequestStatus::Failed, &error)
                    .await?;
                Ok(TurnResult::Error { request_id, error })
            }
        }
    }

    /// Steps the poll loop: sleep, fetch, persist, repeat, until a terminal
    /// state or the budget elapses. Elapsing returns `Waiting` without
    /// mutating the persisted status; the upstream job keeps running.
    #[allow(clippy::too_many_arguments)]
    async fn poll(
        &self,
        conversation_id: i64,
        request_id: i64,
        descriptor: &ModelDescriptor,
        deferred: &dyn DeferredClient,
        response_id: &str,
        budget: Duration,
        fetch_first: bool,
    ) -> Result<TurnResult> {
        let started = Instant::now();
        let mut delay = INITIAL_POLL_DELAY;

        if !fetch_first {
            tokio::time::sleep(delay).await;
            if started.elapsed() >= budget {
                return Ok(TurnResult::Waiting {
                    request_id,
                    provider_response_id: Some(response_id.to_string()),
                });
            }
        }

        loop {
            let fetched = {
                let _permit = self.limiter.acquire(descriptor.provider).await;
                deferred.fetch_job(response_id).await
            };

            match fetched {
                Ok(job) => match job.status {
                    RequestStatus::Completed => {
                        return self.finish_completed(conversation_id, request_id, &job).await
                    }
                    status if status.is_terminal() => {
                        return self.finish_failed(request_id, &job).await
                    }
                    status => {
                        self.store.advance_status(request_id, status).await?;
                    }
                },
                Err(e) if e.is_retryable() => {
                    warn!(request_id, error = %e, "transient poll error");
                }
                // Hard poll errors surface without touching the status; the
                // job may still complete and a later check can pick it up.
                Err(e) => return Err(e),
            }

            delay = Duration::from_secs_f64(
                (delay.as_secs_f64() * POLL_BACKOFF_FACTOR).min(MAX_POLL_DELAY.as_secs_f64()),
            );
            tokio::time::sleep(delay).await;
            if started.elapsed() >= budget {
                return Ok(TurnResult::Waiting {
                    request_id,
                    provider_response_id: Some(response_id.to_string()),
                });
            }
        }
    }

    async fn finish_completed(
        &self,
        conversation_id: i64,
        request_id: i64,
        job: &JobState,
    ) -> Result<TurnResult> {
        let text = job.output_text.clone().unwrap_or_default();
        let usage_value = job.usage.as_ref().map(serde_json::to_value).transpose()?;

        let saved = self
            .store
            .save_completion(request_id, &text, Some(&job.raw), usage_value.as_ref())
            .await?;

        if saved {
            self.store
                .append_message(conversation_id, Role::Assistant, &text, Some(request_id))
                .await?;
            return Ok(TurnResult::Completed {
                request_id,
                text,
                usage: job.usage.clone(),
            });
        }

        // Lost a completion race with another poller; report the row as-is.
        let row = self
            .store
            .get_request(request_id)
            .await?
            .ok_or_else(|| SibylError::Internal(format!("request {request_id} vanished")))?;
        Ok(result_from_row(&row))
    }

    async fn finish_failed(&self, request_id: i64, job: &JobState) -> Result<TurnResult> {
        let error = job.error.clone().unwrap_or_else(|| {
            serde_json::json!({ "message": format!("provider reported status {}", job.status) })
        });
        self.store
            .save_failure(request_id, job.status, &error)
            .await?;
        Ok(TurnResult::Error { request_id, error })
    }
}

fn generate_options(descriptor: &ModelDescriptor, params: &TurnParams) -> GenerateOptions {
    let mut options = GenerateOptions {
        temperature: params.temperature,
        max_completion_tokens: params.max_completion_tokens,
        ..Default::default()
    };
    // The reasoning options blob is assembled only for OpenAI
    // reasoning-class models.
    if descriptor.provider == Provider::OpenAi && descriptor.reasoning {
        options.reasoning_effort = params
            .reasoning_effort
            .or(descriptor.defaults.reasoning_effort);
        if descriptor.name.starts_with("gpt-5") {
            options.verbosity = params.verbosity.or(descriptor.defaults.verbosity);
        }
    }
    options
}

/// Render a persisted request row as a turn result.
pub fn result_from_row(row: &RequestRow) -> TurnResult {
    match row.status {
        RequestStatus::Completed => TurnResult::Completed {
            request_id: row.id,
            text: row.output_text.clone().unwrap_or_default(),
            usage: row
                .usage_json
                .as_deref()
                .and_then(|json| serde_json::from_str(json).ok()),
        },
        RequestStatus::Failed | RequestStatus::Cancelled | RequestStatus::Expired => {
            TurnResult::Error {
                request_id: row.id,
                error: row
                    .error_json
                    .as_deref()
                    .and_then(|json| serde_json::from_str(json).ok())
                    .unwrap_or_else(|| serde_json::json!({ "message": "request failed" })),
            }
        }
        _ => TurnResult::Waiting {
            request_id: row.id,
            provider_response_id: row.provider_response_id.clone(),
        },
    }
}

fn error_value(error: &SibylError) -> Value {
    serde_json::json!({
        "code": error.rpc_code(),
        "message": error.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_params_serialize_sparsely() {
        let params = TurnParams {
            temperature: Some(0.2),
            ..Default::default()
        };
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value, serde_json::json!({"temperature": 0.2}));
        assert_eq!(
            serde_json::to_value(TurnParams::default()).unwrap(),
            serde_json::json!({})
        );
    }

    #[test]
    fn default_options() {
        let opts = TurnOptions::default();
        assert_eq!(opts.overall_timeout_ms, 30_000);
        assert_eq!(opts.max_history_messages, 50);
    }
}
