mod common;

use axum::http::StatusCode;
use serde_json::json;

use common::{
    ask_body, free_plan, get, post, test_gateway, CountingProvider, TestGateway, API_KEY,
    LANDLORD_ANSWER, USER_ID,
};
use counsel_internal::confidence::{MAX_CONFIDENCE, MIN_CONFIDENCE};
use counsel_internal::error::ErrorCode;
use counsel_internal::moderation::has_legal_disclaimer;
use counsel_internal::plan::PlanTier;
use counsel_internal::prompt::Category;
use counsel_internal::usage_log::Endpoint;

const LANDLORD_QUESTION: &str = "Can my landlord evict me without notice?";

#[tokio::test]
async fn test_landlord_question_then_repeat() {
    let TestGateway {
        router,
        provider,
        usage,
        ..
    } = test_gateway(CountingProvider::answering(LANDLORD_ANSWER), free_plan(10, 10));

    let first = post(
        &router,
        "/api/ai/ask",
        Some(API_KEY),
        &ask_body(LANDLORD_QUESTION, "rights"),
    )
    .await;
    assert_eq!(first.status, StatusCode::OK);
    let body = first.json();
    assert_eq!(body["question"], LANDLORD_QUESTION);
    let answer = body["answer"].as_str().unwrap();
    assert!(answer.starts_with(LANDLORD_ANSWER));
    assert!(has_legal_disclaimer(answer));
    let confidence = body["confidence"].as_f64().unwrap();
    assert!((MIN_CONFIDENCE..=MAX_CONFIDENCE).contains(&confidence));
    assert!(body["model"].as_str().is_some_and(|m| !m.is_empty()));
    assert_eq!(first.headers.get("X-RateLimit-Limit").unwrap(), "10");
    assert_eq!(first.headers.get("X-RateLimit-Remaining").unwrap(), "9");
    assert_eq!(provider.calls(), 1);

    let second = post(
        &router,
        "/api/ai/ask",
        Some(API_KEY),
        &ask_body(LANDLORD_QUESTION, "rights"),
    )
    .await;
    assert_eq!(second.status, StatusCode::OK);
    assert_eq!(second.json()["answer"], body["answer"]);
    assert_eq!(provider.calls(), 1);

    let records = usage.records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].user_id, USER_ID);
    assert_eq!(records[0].category, Category::Rights);
    assert!(!records[0].cached);
    assert_eq!((records[0].input_tokens, records[0].output_tokens), (40, 60));
    assert!(records[1].cached);
    assert_eq!((records[1].input_tokens, records[1].output_tokens), (0, 0));
}

#[tokio::test]
async fn test_whitespace_and_case_variants_share_cache_entry() {
    let TestGateway {
        router, provider, ..
    } = test_gateway(CountingProvider::answering(LANDLORD_ANSWER), free_plan(10, 10));

    let first = post(&router, "/api/ai/ask", Some(API_KEY), &ask_body(" Hello World ", "general")).await;
    let second = post(&router, "/api/ai/ask", Some(API_KEY), &ask_body("hello world", "general")).await;
    assert_eq!(first.status, StatusCode::OK);
    assert_eq!(second.status, StatusCode::OK);
    assert_eq!(first.json()["answer"], second.json()["answer"]);
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn test_quota_allows_n_then_rejects() {
    let TestGateway {
        router,
        pipeline,
        usage,
        ..
    } = test_gateway(CountingProvider::answering(LANDLORD_ANSWER), free_plan(2, 100));

    for question in ["First question?", "First question?"] {
        let response = post(&router, "/api/ai/ask", Some(API_KEY), &ask_body(question, "general")).await;
        assert_eq!(response.status, StatusCode::OK);
    }
    let response = post(
        &router,
        "/api/ai/ask",
        Some(API_KEY),
        &ask_body("Third question?", "general"),
    )
    .await;
    assert_eq!(response.status, StatusCode::TOO_MANY_REQUESTS);
    let body = response.json();
    assert_eq!(body["code"], "QUOTA_EXCEEDED");
    assert!(body["error"].as_str().is_some());

    let quota = pipeline.quota.usage(USER_ID, PlanTier::Free).await.unwrap();
    assert_eq!(quota.used, 2);
    assert_eq!(quota.remaining(), Some(0));
    assert_eq!(
        usage.records().last().unwrap().error_code,
        Some(ErrorCode::QuotaExceeded)
    );
}

#[tokio::test]
async fn test_rate_limit_sets_retry_after() {
    let TestGateway { router, .. } =
        test_gateway(CountingProvider::answering(LANDLORD_ANSWER), free_plan(100, 1));

    let ok = post(&router, "/api/ai/ask", Some(API_KEY), &ask_body("One?", "general")).await;
    assert_eq!(ok.status, StatusCode::OK);
    let limited = post(&router, "/api/ai/ask", Some(API_KEY), &ask_body("Two?", "general")).await;
    assert_eq!(limited.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(limited.json()["code"], "RATE_LIMITED");
    let retry_after: u64 = limited
        .headers
        .get("Retry-After")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after > 0);
    assert_eq!(limited.headers.get("X-RateLimit-Remaining").unwrap(), "0");
}

#[tokio::test]
async fn test_blocked_question_reaches_neither_cache_nor_upstream() {
    let TestGateway {
        router,
        pipeline,
        provider,
        ..
    } = test_gateway(CountingProvider::answering(LANDLORD_ANSWER), free_plan(10, 10));
    let question = "How can I forge a signature on my lease renewal?";

    let response = post(&router, "/api/ai/ask", Some(API_KEY), &ask_body(question, "contracts")).await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.json()["code"], "CONTENT_BLOCKED");
    assert_eq!(provider.calls(), 0);
    assert!(pipeline.cache.get(question, Category::Contracts).await.is_none());
}

#[tokio::test]
async fn test_invalid_questions_are_rejected() {
    let TestGateway {
        router, provider, ..
    } = test_gateway(CountingProvider::answering(LANDLORD_ANSWER), free_plan(10, 10));

    let too_long = "a".repeat(2001);
    for question in ["   ", too_long.as_str(), "<script>alert('x')</script>"] {
        let response = post(&router, "/api/ai/ask", Some(API_KEY), &ask_body(question, "general")).await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST, "{question:?}");
        assert_eq!(response.json()["code"], "INVALID_INPUT");
    }
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn test_missing_upstream_key_is_server_error_and_free() {
    let TestGateway {
        router,
        pipeline,
        provider,
        ..
    } = test_gateway(CountingProvider::without_credentials(), free_plan(10, 10));

    let response = post(
        &router,
        "/api/ai/ask",
        Some(API_KEY),
        &ask_body(LANDLORD_QUESTION, "rights"),
    )
    .await;
    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(response.json()["code"], "MISSING_API_KEY");
    assert_eq!(provider.calls(), 0);
    let quota = pipeline.quota.usage(USER_ID, PlanTier::Free).await.unwrap();
    assert_eq!(quota.used, 0);
}

#[tokio::test]
async fn test_unauthenticated_requests_are_rejected_without_record() {
    let TestGateway {
        router,
        provider,
        usage,
        ..
    } = test_gateway(CountingProvider::answering(LANDLORD_ANSWER), free_plan(10, 10));

    for api_key in [None, Some("sk-wrong")] {
        let response = post(&router, "/api/ai/ask", api_key, &ask_body(LANDLORD_QUESTION, "rights")).await;
        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
        assert_eq!(response.json()["code"], "UNAUTHORIZED");
    }
    // Authentication runs before the body is looked at
    let response = post(&router, "/api/ai/ask", None, "{not json").await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);

    assert_eq!(provider.calls(), 0);
    assert!(usage.records().is_empty());
}

#[tokio::test]
async fn test_malformed_body_is_invalid_input() {
    let TestGateway { router, usage, .. } =
        test_gateway(CountingProvider::answering(LANDLORD_ANSWER), free_plan(10, 10));

    for body in ["{not json", r#"{"category":"rights"}"#, r#"{"question":"Hi?","category":"tax"}"#] {
        let response = post(&router, "/api/ai/ask", Some(API_KEY), body).await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST, "{body}");
        assert_eq!(response.json()["code"], "INVALID_INPUT");
    }
    let records = usage.records();
    assert_eq!(records.len(), 3);
    assert!(records
        .iter()
        .all(|r| r.error_code == Some(ErrorCode::InvalidInput)));
}

#[tokio::test]
async fn test_upstream_rejection_keeps_status_code() {
    let TestGateway {
        router, provider, ..
    } = test_gateway(
        CountingProvider::failing_with(StatusCode::UNPROCESSABLE_ENTITY),
        free_plan(10, 10),
    );

    let response = post(&router, "/api/ai/ask", Some(API_KEY), &ask_body("Anything?", "general")).await;
    assert_eq!(response.status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(response.json()["code"], "API_ERROR");
    // 4xx other than 429 is not retried
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn test_chat_answers_without_caching() {
    let TestGateway {
        router,
        provider,
        usage,
        ..
    } = test_gateway(CountingProvider::answering(LANDLORD_ANSWER), free_plan(10, 10));
    let body = json!({
        "messages": [
            { "role": "user", "content": "I rent an apartment." },
            { "role": "assistant", "content": "Renters have specific protections." },
            { "role": "user", "content": LANDLORD_QUESTION },
        ],
        "category": "rights",
    })
    .to_string();

    for _ in 0..2 {
        let response = post(&router, "/api/ai/chat", Some(API_KEY), &body).await;
        assert_eq!(response.status, StatusCode::OK);
        let json = response.json();
        assert!(has_legal_disclaimer(json["answer"].as_str().unwrap()));
        assert!(json.get("question").is_none());
    }
    assert_eq!(provider.calls(), 2);
    assert!(usage.records().iter().all(|r| r.endpoint == Endpoint::Chat));

    let ends_with_assistant = json!({
        "messages": [{ "role": "assistant", "content": "Hello" }],
    })
    .to_string();
    let response = post(&router, "/api/ai/chat", Some(API_KEY), &ends_with_assistant).await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.json()["code"], "INVALID_INPUT");
}

#[tokio::test]
async fn test_blocked_earlier_chat_turn_is_rejected() {
    let TestGateway {
        router,
        pipeline,
        provider,
        ..
    } = test_gateway(CountingProvider::answering(LANDLORD_ANSWER), free_plan(10, 10));
    let body = json!({
        "messages": [
            { "role": "user", "content": "How can I forge a signature on my lease renewal?" },
            { "role": "assistant", "content": "Let me think." },
            { "role": "user", "content": "Please go on." },
        ],
        "category": "contracts",
    })
    .to_string();

    let response = post(&router, "/api/ai/chat", Some(API_KEY), &body).await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.json()["code"], "CONTENT_BLOCKED");
    assert_eq!(provider.calls(), 0);
    let quota = pipeline.quota.usage(USER_ID, PlanTier::Free).await.unwrap();
    assert_eq!(quota.used, 0);
}

#[tokio::test]
async fn test_stream_emits_deltas_then_done() {
    let TestGateway {
        router, provider, ..
    } = test_gateway(CountingProvider::answering(LANDLORD_ANSWER), free_plan(10, 10));

    let response = post(
        &router,
        "/api/ai/stream",
        Some(API_KEY),
        &ask_body(LANDLORD_QUESTION, "rights"),
    )
    .await;
    assert_eq!(response.status, StatusCode::OK);
    assert!(response
        .headers
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));
    let events = event_names(&response.body);
    assert!(events.len() >= 2);
    assert!(events[..events.len() - 1].iter().all(|name| name == "delta"));
    assert_eq!(events.last().map(String::as_str), Some("done"));
    assert!(response.body.contains(r#""cached":false"#));
    assert_eq!(provider.calls(), 1);

    // Same question again is replayed from the cache
    let response = post(
        &router,
        "/api/ai/stream",
        Some(API_KEY),
        &ask_body(LANDLORD_QUESTION, "rights"),
    )
    .await;
    assert!(response.body.contains(r#""cached":true"#));
    assert_eq!(provider.calls(), 1);
}

fn event_names(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| line.strip_prefix("event:"))
        .map(|name| name.trim().to_string())
        .collect()
}

#[tokio::test]
async fn test_stream_rejection_is_plain_json() {
    let TestGateway { router, .. } =
        test_gateway(CountingProvider::answering(LANDLORD_ANSWER), free_plan(10, 10));

    let response = post(&router, "/api/ai/stream", None, &ask_body(LANDLORD_QUESTION, "rights")).await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(response.json()["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn test_health_status_and_unknown_route() {
    let TestGateway { router, .. } =
        test_gateway(CountingProvider::answering(LANDLORD_ANSWER), free_plan(10, 10));

    let health = get(&router, "/health", None).await;
    assert_eq!(health.status, StatusCode::OK);
    assert_eq!(health.json(), json!({ "status": "ok" }));

    let status = get(&router, "/status", None).await;
    assert_eq!(status.status, StatusCode::OK);
    assert!(status.json()["version"].as_str().is_some());
    assert!(status.json().get("usage").is_none());

    let missing = get(&router, "/api/ai/unknown", None).await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
    assert_eq!(missing.json()["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_status_reports_usage_to_signed_in_callers() {
    let TestGateway { router, .. } =
        test_gateway(CountingProvider::answering(LANDLORD_ANSWER), free_plan(10, 10));
    let answered = post(&router, "/api/ai/ask", Some(API_KEY), &ask_body(LANDLORD_QUESTION, "rights")).await;
    assert_eq!(answered.status, StatusCode::OK);

    let status = get(&router, "/status", Some(API_KEY)).await;
    assert_eq!(status.status, StatusCode::OK);
    assert_eq!(
        status.json()["usage"],
        json!({ "plan": "free", "used": 1, "limit": 10, "remaining": 9 })
    );

    let rejected = get(&router, "/status", Some("not-a-real-key")).await;
    assert_eq!(rejected.status, StatusCode::UNAUTHORIZED);
    assert_eq!(rejected.json()["code"], "UNAUTHORIZED");
}
