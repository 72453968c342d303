//! Provider trait and the upstream HTTP clients.

pub mod anthropic;
pub mod google;
pub mod http;
pub mod openai;
pub mod openai_responses;
pub mod xai;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Result, SibylError};
use crate::models::{Provider, ProviderBinding};
use crate::types::{ChatMessage, RequestStatus, Usage};

/// A request sent to a model provider.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    /// Provider-native model name (no `provider:` prefix).
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub options: GenerateOptions,
}

/// Generation knobs shared across providers. Each client sends only the
/// fields its API understands.
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub temperature: Option<f64>,
    pub max_completion_tokens: Option<u32>,
    pub reasoning_effort: Option<crate::types::ReasoningEffort>,
    pub verbosity: Option<crate::types::Verbosity>,
}

/// Response from a provider.
#[derive(Debug, Clone)]
pub struct GenerateReply {
    pub text: String,
    pub raw: Value,
    pub usage: Usage,
}

/// State of a deferred-completion job as reported upstream.
#[derive(Debug, Clone)]
pub struct JobState {
    pub provider_response_id: String,
    pub status: RequestStatus,
    pub output_text: Option<String>,
    pub error: Option<Value>,
    pub usage: Option<Usage>,
    pub raw: Value,
}

/// Core trait implemented by all provider clients. One client per provider,
/// injected once at startup; requests carry the model name.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn provider(&self) -> Provider;

    /// Generate plain text.
    async fn generate_text(&self, request: &GenerateRequest) -> Result<GenerateReply>;

    /// Generate schema-constrained output. The reply text is the JSON
    /// document; callers parse and validate it.
    async fn generate_structured(
        &self,
        request: &GenerateRequest,
        schema: &Value,
        schema_name: &str,
    ) -> Result<GenerateReply>;

    /// The deferred-completion surface, for providers that offer one.
    fn deferred(&self) -> Option<&dyn DeferredClient> {
        None
    }
}

/// Deferred-completion endpoint: open a job, poll it later.
#[async_trait]
pub trait DeferredClient: Send + Sync {
    /// Submit a job. May complete synchronously on fast inputs.
    async fn open_job(&self, request: &GenerateRequest) -> Result<JobState>;

    /// Fetch the current state of a previously opened job.
    async fn fetch_job(&self, provider_response_id: &str) -> Result<JobState>;
}

/// The process-wide set of provider clients, built once from bindings.
#[derive(Default)]
pub struct ClientSet {
    clients: HashMap<Provider, Arc<dyn ProviderClient>>,
}

impl ClientSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct one client per binding with a non-empty key.
    pub fn from_bindings(bindings: &[ProviderBinding]) -> Self {
        let mut set = Self::new();
        for binding in bindings {
            if binding.api_key.is_empty() {
                continue;
            }
            let client: Arc<dyn ProviderClient> = match binding.provider {
                Provider::OpenAi => Arc::new(openai::OpenAiClient::new(
                    binding.api_key.clone(),
                    binding.base_url.clone(),
                )),
                Provider::Google => Arc::new(google::GoogleClient::new(
                    binding.api_key.clone(),
                    binding.base_url.clone(),
                )),
                Provider::Anthropic => Arc::new(anthropic::AnthropicClient::new(
                    binding.api_key.clone(),
                    binding.base_url.clone(),
                )),
                Provider::Xai => Arc::new(xai::XaiClient::new(
                    binding.api_key.clone(),
                    binding.base_url.clone(),
                )),
            };
            set.insert(client);
        }
        set
    }

    /// Register (or replace) a client. Used at startup and by tests
    /// injecting mocks.
    pub fn insert(&mut self, client: Arc<dyn ProviderClient>) {
        self.clients.insert(client.provider(), client);
    }

    /// Look up the client for a provider. The registry guarantees a live
    /// model has a binding, so a miss here is an internal inconsistency.
    pub fn get(&self, provider: Provider) -> Result<&Arc<dyn ProviderClient>> {
        self.clients
            .get(&provider)
            .ok_or_else(|| SibylError::Internal(format!("no client bound for provider {provider}")))
    }
}
