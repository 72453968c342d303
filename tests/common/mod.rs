//! Shared test support: mock provider clients and context assembly.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use sibyl::error::{Result, SibylError};
use sibyl::models::{ModelRegistry, Provider, ProviderBinding};
use sibyl::provider::{
    ClientSet, DeferredClient, GenerateReply, GenerateRequest, JobState, ProviderClient,
};
use sibyl::store::Store;
use sibyl::types::{RequestStatus, Usage};
use sibyl::AppContext;

/// A canned reply for one mock call.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Succeed with this body text.
    Text(String),
    /// Fail with an API error of this status.
    Fail(u16),
}

impl MockReply {
    fn produce(&self) -> Result<GenerateReply> {
        match self {
            MockReply::Text(text) => Ok(GenerateReply {
                text: text.clone(),
                raw: serde_json::json!({"mock": true}),
                usage: Usage {
                    input_tokens: 3,
                    output_tokens: 5,
                    total_tokens: 8,
                    reasoning_tokens: None,
                },
            }),
            MockReply::Fail(status) => Err(SibylError::api(*status, "mock upstream rejection")),
        }
    }
}

/// Mock provider client with scripted structured/text behavior.
pub struct MockClient {
    provider: Provider,
    structured: Mutex<VecDeque<MockReply>>,
    structured_fallback: MockReply,
    text_fallback: MockReply,
    deferred: Option<Arc<MockDeferred>>,
    work_delay: Option<std::time::Duration>,
    pub structured_calls: AtomicUsize,
    pub text_calls: AtomicUsize,
    pub last_request: Mutex<Option<GenerateRequest>>,
    gauge_current: AtomicUsize,
    gauge_peak: AtomicUsize,
}

impl MockClient {
    fn new(provider: Provider, structured_fallback: MockReply, text_fallback: MockReply) -> Self {
        Self {
            provider,
            structured: Mutex::new(VecDeque::new()),
            structured_fallback,
            text_fallback,
            deferred: None,
            work_delay: None,
            structured_calls: AtomicUsize::new(0),
            text_calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
            gauge_current: AtomicUsize::new(0),
            gauge_peak: AtomicUsize::new(0),
        }
    }

    /// Structured calls always succeed with `json`.
    pub fn structured_ok(provider: Provider, json: impl Into<String>) -> Self {
        Self::new(
            provider,
            MockReply::Text(json.into()),
            MockReply::Text("plain text reply".into()),
        )
    }

    /// Structured calls always fail with `status`; text mode replies `text`.
    pub fn structured_rejecting(provider: Provider, status: u16, text: impl Into<String>) -> Self {
        Self::new(provider, MockReply::Fail(status), MockReply::Text(text.into()))
    }

    /// Queue replies consumed before the fallback applies.
    pub fn queue_structured(self, replies: Vec<MockReply>) -> Self {
        *self.structured.lock().unwrap() = replies.into();
        self
    }

    pub fn with_deferred(mut self, deferred: Arc<MockDeferred>) -> Self {
        self.deferred = Some(deferred);
        self
    }

    /// Simulate upstream latency inside each call, for concurrency tests.
    pub fn with_work_delay(mut self, delay: std::time::Duration) -> Self {
        self.work_delay = Some(delay);
        self
    }

    pub fn structured_call_count(&self) -> usize {
        self.structured_calls.load(Ordering::SeqCst)
    }

    pub fn text_call_count(&self) -> usize {
        self.text_calls.load(Ordering::SeqCst)
    }

    /// Highest number of calls observed in flight at once.
    pub fn peak_concurrency(&self) -> usize {
        self.gauge_peak.load(Ordering::SeqCst)
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.last_request
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|r| r.messages.last().map(|m| m.content.clone()))
    }

    async fn enter(&self, request: &GenerateRequest) {
        *self.last_request.lock().unwrap() = Some(request.clone());
        let current = self.gauge_current.fetch_add(1, Ordering::SeqCst) + 1;
        self.gauge_peak.fetch_max(current, Ordering::SeqCst);
        if let Some(delay) = self.work_delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn exit(&self) {
        self.gauge_current.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProviderClient for MockClient {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn generate_text(&self, request: &GenerateRequest) -> Result<GenerateReply> {
        self.enter(request).await;
        self.text_calls.fetch_add(1, Ordering::SeqCst);
        let reply = self.text_fallback.produce();
        self.exit();
        reply
    }

    async fn generate_structured(
        &self,
        request: &GenerateRequest,
        _schema: &Value,
        _schema_name: &str,
    ) -> Result<GenerateReply> {
        self.enter(request).await;
        self.structured_calls.fetch_add(1, Ordering::SeqCst);
        let queued = self.structured.lock().unwrap().pop_front();
        let reply = queued
            .unwrap_or_else(|| self.structured_fallback.clone())
            .produce();
        self.exit();
        reply
    }

    fn deferred(&self) -> Option<&dyn DeferredClient> {
        self.deferred.as_deref().map(|d| d as &dyn DeferredClient)
    }
}

/// Mock deferred-completion endpoint with scripted job states.
pub struct MockDeferred {
    open: Mutex<VecDeque<JobState>>,
    fetch: Mutex<VecDeque<JobState>>,
    pub open_calls: AtomicUsize,
    pub fetch_calls: AtomicUsize,
}

impl MockDeferred {
    /// Every opened job completes synchronously with `text`.
    pub fn completing_immediately(text: impl Into<String>) -> Self {
        Self {
            open: Mutex::new(VecDeque::from([job(
                RequestStatus::Completed,
                "resp-imm",
                Some(&text.into()),
            )])),
            fetch: Mutex::new(VecDeque::new()),
            open_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
        }
    }

    /// Open returns `opened`; fetches walk `states`, repeating the last.
    pub fn with_sequence(opened: JobState, states: Vec<JobState>) -> Self {
        Self {
            open: Mutex::new(VecDeque::from([opened])),
            fetch: Mutex::new(states.into()),
            open_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
        }
    }

    pub fn open_call_count(&self) -> usize {
        self.open_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_call_count(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeferredClient for MockDeferred {
    async fn open_job(&self, _request: &GenerateRequest) -> Result<JobState> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        let mut open = self.open.lock().unwrap();
        if open.len() > 1 {
            Ok(open.pop_front().unwrap())
        } else {
            open.front()
                .cloned()
                .ok_or_else(|| SibylError::api(500, "mock has no job to open"))
        }
    }

    async fn fetch_job(&self, provider_response_id: &str) -> Result<JobState> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let mut fetch = self.fetch.lock().unwrap();
        let mut state = if fetch.len() > 1 {
            fetch.pop_front().unwrap()
        } else {
            fetch
                .front()
                .cloned()
                .ok_or_else(|| SibylError::api(404, "mock job not found"))?
        };
        state.provider_response_id = provider_response_id.to_string();
        Ok(state)
    }
}

/// Build a job state for the mocks.
pub fn job(status: RequestStatus, response_id: &str, text: Option<&str>) -> JobState {
    JobState {
        provider_response_id: response_id.to_string(),
        status,
        output_text: text.map(str::to_string),
        error: matches!(
            status,
            RequestStatus::Failed | RequestStatus::Cancelled | RequestStatus::Expired
        )
        .then(|| serde_json::json!({"message": "mock job failure"})),
        usage: text.map(|_| Usage {
            input_tokens: 10,
            output_tokens: 4,
            total_tokens: 14,
            reasoning_tokens: None,
        }),
        raw: serde_json::json!({"mock": true}),
    }
}

/// A structured advice reply body.
pub fn advice_json(response: &str) -> String {
    serde_json::json!({
        "response_type": "complete",
        "response": response,
        "confidence": 0.9,
    })
    .to_string()
}

pub fn binding(provider: Provider) -> ProviderBinding {
    ProviderBinding {
        provider,
        api_key: "test-key".into(),
        base_url: None,
    }
}

/// Assemble a context over an in-memory store with the given mock clients;
/// a provider is configured iff a client is supplied for it.
pub async fn test_context(clients: Vec<Arc<dyn ProviderClient>>) -> Arc<AppContext> {
    let bindings = clients.iter().map(|c| binding(c.provider())).collect();
    let registry = Arc::new(ModelRegistry::new(bindings));
    let mut set = ClientSet::new();
    for client in clients {
        set.insert(client);
    }
    let store = Arc::new(Store::in_memory().await.expect("in-memory store"));
    Arc::new(AppContext::assemble(registry, Arc::new(set), store))
}
