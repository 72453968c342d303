//! Engine behavior against mock providers: structured output and fallback,
//! capability caching, iteration caps, turn persistence, dedup, and the
//! poll loop.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{advice_json, job, test_context, MockClient, MockDeferred};
use sibyl::engine::sync::{AdviceOptions, AdviceStatus};
use sibyl::engine::turn::{TurnOptions, TurnResult};
use sibyl::error::SibylError;
use sibyl::models::Provider;
use sibyl::provider::ProviderClient;
use sibyl::types::{RequestStatus, Role};

fn turn_opts(wait_ms: u64) -> TurnOptions {
    TurnOptions {
        overall_timeout_ms: wait_ms,
        ..Default::default()
    }
}

// ── Sync engine ────────────────────────────────────────────────────────

#[tokio::test]
async fn advise_returns_structured_reply() {
    let client = Arc::new(MockClient::structured_ok(
        Provider::OpenAi,
        advice_json("use a worker pool"),
    ));
    let ctx = test_context(vec![client.clone() as Arc<dyn ProviderClient>]).await;

    let advice = ctx
        .sync
        .advise("openai:gpt-4.1", "how do I parallelize this?", &AdviceOptions::default())
        .await
        .unwrap();

    assert_eq!(advice.text, "use a worker pool");
    assert_eq!(advice.status, AdviceStatus::Complete);
    assert_eq!(advice.confidence, Some(0.9));
    assert!(!advice.fallback_mode);
    assert_eq!(advice.model, "openai:gpt-4.1");
    // One capability probe plus the real call.
    assert_eq!(client.structured_call_count(), 2);
    assert_eq!(client.text_call_count(), 0);
}

#[tokio::test]
async fn advise_maps_needs_context() {
    let reply = serde_json::json!({
        "response_type": "needs_context",
        "response": "I need to see the error output",
        "context_needed": [{"type": "error", "description": "full backtrace"}],
        "questions": ["Which OS?"],
        "confidence": 0.4,
    })
    .to_string();
    let client = Arc::new(MockClient::structured_ok(Provider::OpenAi, reply));
    let ctx = test_context(vec![client as Arc<dyn ProviderClient>]).await;

    let advice = ctx
        .sync
        .advise("openai:gpt-4.1", "why does it crash?", &AdviceOptions::default())
        .await
        .unwrap();

    assert_eq!(advice.status, AdviceStatus::NeedsContext);
    assert_eq!(advice.context_request.as_ref().unwrap().len(), 1);
    assert_eq!(advice.questions.as_ref().unwrap()[0], "Which OS?");
    assert_eq!(advice.confidence, Some(0.4));
}

#[tokio::test]
async fn structured_rejection_falls_back_to_text_and_caches() {
    let client = Arc::new(MockClient::structured_rejecting(
        Provider::OpenAi,
        400,
        "text-mode answer",
    ));
    let ctx = test_context(vec![client.clone() as Arc<dyn ProviderClient>]).await;

    let advice = ctx
        .sync
        .advise("openai:gpt-4.1", "help", &AdviceOptions::default())
        .await
        .unwrap();

    assert_eq!(advice.text, "text-mode answer");
    assert!(advice.fallback_mode);
    assert_eq!(advice.status, AdviceStatus::Complete);
    // The probe hit the 400 and cached `false`; only one structured call.
    assert_eq!(client.structured_call_count(), 1);
    assert_eq!(client.text_call_count(), 1);

    // Second call skips the probe entirely: capability is cached false.
    let advice = ctx
        .sync
        .advise("openai:gpt-4.1", "help again", &AdviceOptions::default())
        .await
        .unwrap();
    assert!(advice.fallback_mode);
    assert_eq!(client.structured_call_count(), 1);
    assert_eq!(client.text_call_count(), 2);
}

#[tokio::test]
async fn unparseable_structured_reply_falls_back() {
    let client = Arc::new(MockClient::structured_ok(
        Provider::OpenAi,
        "this is not json at all",
    ));
    let ctx = test_context(vec![client.clone() as Arc<dyn ProviderClient>]).await;

    let advice = ctx
        .sync
        .advise("openai:gpt-4.1", "help", &AdviceOptions::default())
        .await
        .unwrap();

    assert!(advice.fallback_mode);
    assert_eq!(advice.text, "plain text reply");
}

#[tokio::test]
async fn iteration_above_cap_short_circuits() {
    let client = Arc::new(MockClient::structured_ok(Provider::OpenAi, advice_json("x")));
    let ctx = test_context(vec![client.clone() as Arc<dyn ProviderClient>]).await;

    let opts = AdviceOptions {
        iteration: 4,
        ..Default::default()
    };
    let advice = ctx.sync.advise("openai:gpt-4.1", "keep going", &opts).await.unwrap();

    assert!(advice.text.contains("Max iterations reached"));
    assert_eq!(advice.iteration, 4);
    // No upstream traffic at all.
    assert_eq!(client.structured_call_count(), 0);
    assert_eq!(client.text_call_count(), 0);
}

#[tokio::test]
async fn advise_rejects_empty_prompt_and_unknown_model() {
    let client = Arc::new(MockClient::structured_ok(Provider::OpenAi, advice_json("x")));
    let ctx = test_context(vec![client as Arc<dyn ProviderClient>]).await;

    match ctx
        .sync
        .advise("openai:gpt-4.1", "   ", &AdviceOptions::default())
        .await
    {
        Err(SibylError::InvalidParams(message)) => assert!(message.contains("cannot be empty")),
        other => panic!("expected invalid params, got {other:?}"),
    }

    match ctx
        .sync
        .advise("openai:gpt-99", "hi", &AdviceOptions::default())
        .await
    {
        Err(SibylError::ModelNotFound { available, .. }) => {
            assert!(available.contains(&"openai:gpt-4.1".to_string()))
        }
        other => panic!("expected model-not-found, got {other:?}"),
    }
}

#[tokio::test]
async fn additional_context_is_appended_to_the_prompt() {
    let client = Arc::new(MockClient::structured_ok(Provider::OpenAi, advice_json("x")));
    let ctx = test_context(vec![client.clone() as Arc<dyn ProviderClient>]).await;

    let opts = AdviceOptions {
        additional_context: Some("the stack uses tokio 1.x".into()),
        ..Default::default()
    };
    ctx.sync.advise("openai:gpt-4.1", "advise me", &opts).await.unwrap();

    let prompt = client.last_prompt().unwrap();
    assert!(prompt.starts_with("advise me"));
    assert!(prompt.contains("Additional Context Provided:\nthe stack uses tokio 1.x"));
}

#[tokio::test]
async fn concurrent_advice_respects_provider_cap() {
    let client = Arc::new(
        MockClient::structured_ok(Provider::Xai, advice_json("ok"))
            .with_work_delay(Duration::from_millis(5)),
    );
    let ctx = test_context(vec![client.clone() as Arc<dyn ProviderClient>]).await;

    let mut handles = Vec::new();
    for _ in 0..12 {
        let ctx = Arc::clone(&ctx);
        handles.push(tokio::spawn(async move {
            ctx.sync
                .advise("xai:grok-4", "quick question", &AdviceOptions::default())
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    // xAI's semaphore capacity is 4; in-flight calls never exceed it.
    assert!(client.peak_concurrency() <= 4, "peak {}", client.peak_concurrency());
}

// ── Turn runner ────────────────────────────────────────────────────────

#[tokio::test]
async fn inline_turn_persists_full_cycle() {
    // Anthropic has no deferred endpoint: the turn degrades to one
    // synchronous call inside the same request lifecycle.
    let client = Arc::new(MockClient::structured_ok(Provider::Anthropic, advice_json("x")));
    let ctx = test_context(vec![client as Arc<dyn ProviderClient>]).await;

    let outcome = ctx
        .turns
        .run_turn("anthropic:claude-sonnet-4-5", None, "hello there", &turn_opts(30_000))
        .await
        .unwrap();

    let TurnResult::Completed { request_id, text, .. } = outcome.result else {
        panic!("expected completion, got {:?}", outcome.result);
    };
    assert_eq!(text, "plain text reply");

    let messages = ctx.store.list_messages(outcome.conversation_id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[0].content, "hello there");
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].request_id, Some(request_id));

    let request = ctx.store.get_request(request_id).await.unwrap().unwrap();
    assert_eq!(request.status, RequestStatus::Completed);
    assert!(request.completed_at.is_some());
    assert_eq!(request.tries, 1);
}

#[tokio::test]
async fn identical_turns_dedup_to_one_request() {
    let client = Arc::new(
        MockClient::structured_ok(Provider::OpenAi, advice_json("x"))
            .with_deferred(Arc::new(MockDeferred::completing_immediately("the cached answer"))),
    );
    let ctx = test_context(vec![client as Arc<dyn ProviderClient>]).await;

    let first = ctx
        .turns
        .run_turn("openai:gpt-5", None, "same question", &turn_opts(30_000))
        .await
        .unwrap();
    let second = ctx
        .turns
        .run_turn(
            "openai:gpt-5",
            Some(first.conversation_id),
            "same question",
            &turn_opts(30_000),
        )
        .await
        .unwrap();

    let TurnResult::Completed { request_id: id_a, text: text_a, .. } = first.result else {
        panic!("first turn should complete");
    };
    let TurnResult::Completed { request_id: id_b, text: text_b, .. } = second.result else {
        panic!("second turn should hit the cache");
    };
    assert_eq!(id_a, id_b);
    assert_eq!(text_a, text_b);
    assert_eq!(text_a, "the cached answer");

    // One request row; the cache hit appended its user message but no
    // second assistant message.
    assert!(ctx.store.get_request(2).await.unwrap().is_none());
    let messages = ctx.store.list_messages(first.conversation_id).await.unwrap();
    assert_eq!(messages.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn concurrent_identical_turns_share_one_upstream_job() {
    let deferred = Arc::new(MockDeferred::with_sequence(
        job(RequestStatus::InProgress, "resp-shared", None),
        vec![job(RequestStatus::Completed, "resp-shared", Some("one job"))],
    ));
    let client = Arc::new(
        MockClient::structured_ok(Provider::OpenAi, advice_json("x"))
            .with_deferred(Arc::clone(&deferred)),
    );
    let ctx = test_context(vec![client as Arc<dyn ProviderClient>]).await;
    let conversation = ctx.store.create_conversation(None, None).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..2 {
        let ctx = Arc::clone(&ctx);
        let conversation_id = conversation.id;
        handles.push(tokio::spawn(async move {
            ctx.turns
                .run_turn("openai:gpt-5", Some(conversation_id), "same turn", &turn_opts(1))
                .await
        }));
    }

    let mut request_ids = Vec::new();
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        let request_id = match outcome.result {
            TurnResult::Completed { request_id, .. }
            | TurnResult::Waiting { request_id, .. }
            | TurnResult::Error { request_id, .. } => request_id,
        };
        request_ids.push(request_id);
    }

    // Both callers converge on the same request, and exactly one of them
    // won the ownership claim and opened a job upstream.
    assert_eq!(request_ids[0], request_ids[1]);
    assert_eq!(deferred.open_call_count(), 1);

    let done = ctx.turns.check_or_wait(request_ids[0], 30_000).await.unwrap();
    let TurnResult::Completed { text, .. } = done.result else {
        panic!("expected completion, got {:?}", done.result);
    };
    assert_eq!(text, "one job");
}

#[tokio::test(start_paused = true)]
async fn elapsed_budget_returns_waiting_and_check_resumes() {
    let deferred = Arc::new(MockDeferred::with_sequence(
        job(RequestStatus::InProgress, "resp-77", None),
        vec![
            job(RequestStatus::InProgress, "resp-77", None),
            job(RequestStatus::Completed, "resp-77", Some("slow but done")),
        ],
    ));
    let client = Arc::new(
        MockClient::structured_ok(Provider::OpenAi, advice_json("x")).with_deferred(deferred),
    );
    let ctx = test_context(vec![client as Arc<dyn ProviderClient>]).await;

    let outcome = ctx
        .turns
        .run_turn("openai:gpt-5", None, "long running job", &turn_opts(1))
        .await
        .unwrap();

    let TurnResult::Waiting { request_id, provider_response_id } = outcome.result else {
        panic!("expected waiting, got {:?}", outcome.result);
    };
    assert_eq!(provider_response_id.as_deref(), Some("resp-77"));

    // The budget elapsing did not mutate the persisted status.
    let row = ctx.store.get_request(request_id).await.unwrap().unwrap();
    assert_eq!(row.status, RequestStatus::InProgress);
    assert_eq!(row.provider_response_id.as_deref(), Some("resp-77"));

    // A follow-up check continues the poll on the same row to completion.
    let checked = ctx.turns.check_or_wait(request_id, 30_000).await.unwrap();
    let TurnResult::Completed { request_id: checked_id, text, .. } = checked.result else {
        panic!("expected completion, got {:?}", checked.result);
    };
    assert_eq!(checked_id, request_id);
    assert_eq!(text, "slow but done");

    let row = ctx.store.get_request(request_id).await.unwrap().unwrap();
    assert_eq!(row.status, RequestStatus::Completed);
    let messages = ctx.store.list_messages(checked.conversation_id).await.unwrap();
    assert_eq!(messages.last().unwrap().role, Role::Assistant);
    assert_eq!(messages.last().unwrap().request_id, Some(request_id));
}

#[tokio::test(start_paused = true)]
async fn failed_job_persists_error() {
    let deferred = Arc::new(MockDeferred::with_sequence(
        job(RequestStatus::InProgress, "resp-9", None),
        vec![job(RequestStatus::Failed, "resp-9", None)],
    ));
    let client = Arc::new(
        MockClient::structured_ok(Provider::OpenAi, advice_json("x")).with_deferred(deferred),
    );
    let ctx = test_context(vec![client as Arc<dyn ProviderClient>]).await;

    let outcome = ctx
        .turns
        .run_turn("openai:gpt-5", None, "doomed job", &turn_opts(30_000))
        .await
        .unwrap();

    let TurnResult::Error { request_id, error } = outcome.result else {
        panic!("expected error, got {:?}", outcome.result);
    };
    assert_eq!(error["message"], "mock job failure");

    let row = ctx.store.get_request(request_id).await.unwrap().unwrap();
    assert_eq!(row.status, RequestStatus::Failed);
    assert!(row.error_json.is_some());
    assert!(row.completed_at.is_none());

    // No assistant message for a failed request.
    let messages = ctx.store.list_messages(outcome.conversation_id).await.unwrap();
    assert_eq!(messages.len(), 1);
}

#[tokio::test]
async fn check_on_terminal_row_does_not_poll_upstream() {
    let deferred = Arc::new(MockDeferred::completing_immediately("already done"));
    let client = Arc::new(
        MockClient::structured_ok(Provider::OpenAi, advice_json("x"))
            .with_deferred(Arc::clone(&deferred)),
    );
    let ctx = test_context(vec![client as Arc<dyn ProviderClient>]).await;

    let outcome = ctx
        .turns
        .run_turn("openai:gpt-5", None, "quick job", &turn_opts(30_000))
        .await
        .unwrap();
    let TurnResult::Completed { request_id, .. } = outcome.result else {
        panic!("expected completion");
    };

    let fetches_before = deferred.fetch_call_count();
    let checked = ctx.turns.check_or_wait(request_id, 5_000).await.unwrap();
    let TurnResult::Completed { text, .. } = checked.result else {
        panic!("expected completion from the row");
    };
    assert_eq!(text, "already done");
    assert_eq!(deferred.fetch_call_count(), fetches_before);
}

#[tokio::test]
async fn check_unknown_request_is_invalid_params() {
    let client = Arc::new(MockClient::structured_ok(Provider::OpenAi, advice_json("x")));
    let ctx = test_context(vec![client as Arc<dyn ProviderClient>]).await;

    match ctx.turns.check_or_wait(999, 1_000).await {
        Err(SibylError::InvalidParams(message)) => assert!(message.contains("request_id")),
        other => panic!("expected invalid params, got {other:?}"),
    }
}
