mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::util::ServiceExt;

use dispatch_llm::gateway::channel::ChannelType;
use dispatch_llm::gateway::http::router;
use dispatch_llm::gateway::Gateway;

use common::{
    base_config, body_string, chat_request, completion_json, make_channel, Behavior, ManualClock,
    ScriptedDispatcher, TEST_TOKEN,
};

const T0_MS: u64 = 1_700_000_000_000;

#[tokio::test]
async fn health_based_selection_prefers_the_healthier_channel() {
    let config = base_config(vec![
        make_channel(7, ChannelType::Openai, "gpt-4o-mini", "default"),
        make_channel(11, ChannelType::Openai, "gpt-4o-mini", "default"),
    ]);
    let dispatcher = Arc::new(ScriptedDispatcher::new());
    dispatcher.set_behavior(11, Behavior::Json(completion_json("hello there", 20)));
    dispatcher.set_behavior(7, Behavior::Json(completion_json("hello there", 20)));

    let gateway = Gateway::builder(config)
        .with_dispatcher(dispatcher.clone())
        .with_clock(Arc::new(ManualClock::new(T0_MS)))
        .build();

    // Channel 11 is strictly healthier than channel 7.
    for _ in 0..10 {
        gateway.health.observe(11, 50, true, T0_MS);
        gateway.health.observe(7, 500, false, T0_MS);
    }

    let app = router(gateway.clone());
    let response = app
        .oneshot(chat_request("gpt-4o-mini", "hi"))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    // Not a virtual model: no auto headers.
    assert!(response.headers().get("x-auto-requested-model").is_none());
    assert_eq!(dispatcher.calls(), vec![11]);

    gateway.shutdown().await;
}

#[tokio::test]
async fn auto_cheap_resolves_to_the_cheapest_model() {
    let mut config = base_config(vec![
        make_channel(1, ChannelType::Openai, "gpt-4o", "default"),
        make_channel(2, ChannelType::Openai, "gpt-4o-mini", "default"),
        make_channel(3, ChannelType::OpenaiCompatible, "deepseek-v3", "default"),
    ]);
    config.auto_model.enabled = true;

    let dispatcher = Arc::new(ScriptedDispatcher::new());
    dispatcher.set_behavior(3, Behavior::Json(completion_json("cheap answer", 30)));

    let gateway = Gateway::builder(config)
        .with_dispatcher(dispatcher.clone())
        .with_clock(Arc::new(ManualClock::new(T0_MS)))
        .build();
    let app = router(gateway.clone());

    let response = app
        .oneshot(chat_request("auto-cheap", "hi"))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(
        headers.get("x-auto-requested-model").unwrap(),
        "auto-cheap"
    );
    assert_eq!(
        headers.get("x-auto-selected-model").unwrap(),
        "deepseek-v3"
    );
    assert_eq!(
        headers.get("x-auto-selection-reason").unwrap(),
        "Selected for cost efficiency"
    );
    assert!(headers.get("x-auto-selection-score").is_some());
    assert_eq!(dispatcher.calls(), vec![3]);

    gateway.shutdown().await;
}

#[tokio::test]
async fn auto_vi_detects_vietnamese_and_picks_a_strong_model() {
    let mut config = base_config(vec![
        make_channel(1, ChannelType::Openai, "gpt-4o", "default"),
        make_channel(2, ChannelType::Openai, "gpt-4-turbo", "default"),
    ]);
    config.auto_model.enabled = true;

    let dispatcher = Arc::new(ScriptedDispatcher::new());
    dispatcher.set_behavior(1, Behavior::Json(completion_json("xin chào", 25)));

    let gateway = Gateway::builder(config)
        .with_dispatcher(dispatcher.clone())
        .with_clock(Arc::new(ManualClock::new(T0_MS)))
        .build();
    let app = router(gateway.clone());

    let response = app
        .oneshot(chat_request("auto-vi", "Xin chào, bạn khỏe không?"))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("x-auto-selected-model").unwrap(),
        "gpt-4o"
    );
    assert_eq!(
        response.headers().get("x-auto-selection-reason").unwrap(),
        "Selected for Vietnamese language support"
    );
    assert_eq!(dispatcher.calls(), vec![1]);

    gateway.shutdown().await;
}

#[tokio::test]
async fn global_rate_limit_sets_headers_and_denies_the_fourth_request() {
    let mut config = base_config(vec![make_channel(
        1,
        ChannelType::Openai,
        "gpt-4o-mini",
        "default",
    )]);
    config.rate_limit.global_api_limit = 3;
    config.rate_limit.global_api_window_seconds = 60;

    let dispatcher = Arc::new(ScriptedDispatcher::new());
    dispatcher.set_behavior(1, Behavior::Json(completion_json("ok", 10)));

    let gateway = Gateway::builder(config)
        .with_dispatcher(dispatcher.clone())
        .with_clock(Arc::new(ManualClock::new(T0_MS)))
        .build();
    let app = router(gateway.clone());

    let mut seen_remaining = Vec::new();
    for _ in 0..3 {
        let response = app
            .clone()
            .oneshot(chat_request("gpt-4o-mini", "hi"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        seen_remaining.push(
            response
                .headers()
                .get("x-ratelimit-remaining")
                .unwrap()
                .to_str()
                .unwrap()
                .to_string(),
        );
    }
    assert_eq!(seen_remaining, vec!["2", "1", "0"]);

    let denied = app
        .clone()
        .oneshot(chat_request("gpt-4o-mini", "hi"))
        .await
        .expect("response");
    assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(
        denied.headers().get("x-ratelimit-remaining").unwrap(),
        "0"
    );
    let retry_after: u64 = denied
        .headers()
        .get("retry-after")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after >= 59, "retry-after was {retry_after}");

    gateway.shutdown().await;
}

#[tokio::test]
async fn missing_or_unknown_tokens_are_unauthorized() {
    let config = base_config(vec![make_channel(
        1,
        ChannelType::Openai,
        "gpt-4o-mini",
        "default",
    )]);
    let gateway = Gateway::builder(config)
        .with_dispatcher(Arc::new(ScriptedDispatcher::new()))
        .build();
    let app = router(gateway.clone());

    let no_auth = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(common::chat_body("gpt-4o-mini", "hi")))
        .unwrap();
    let response = app.clone().oneshot(no_auth).await.expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let bad_auth = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", "Bearer sk-wrong")
        .header("content-type", "application/json")
        .body(Body::from(common::chat_body("gpt-4o-mini", "hi")))
        .unwrap();
    let response = app.clone().oneshot(bad_auth).await.expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    gateway.shutdown().await;
}

#[tokio::test]
async fn malformed_bodies_and_bad_channel_overrides_are_rejected() {
    let config = base_config(vec![make_channel(
        1,
        ChannelType::Openai,
        "gpt-4o-mini",
        "default",
    )]);
    let gateway = Gateway::builder(config)
        .with_dispatcher(Arc::new(ScriptedDispatcher::new()))
        .build();
    let app = router(gateway.clone());

    let broken = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", format!("Bearer {TEST_TOKEN}"))
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.clone().oneshot(broken).await.expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let unknown_channel = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", format!("Bearer {TEST_TOKEN}"))
        .header("content-type", "application/json")
        .header("specific-channel-id", "999")
        .body(Body::from(common::chat_body("gpt-4o-mini", "hi")))
        .unwrap();
    let response = app.clone().oneshot(unknown_channel).await.expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = body_string(response.into_body()).await;
    assert!(body.contains("unknown channel id"));

    gateway.shutdown().await;
}

#[tokio::test]
async fn unknown_model_returns_service_unavailable() {
    let config = base_config(vec![make_channel(
        1,
        ChannelType::Openai,
        "gpt-4o-mini",
        "default",
    )]);
    let gateway = Gateway::builder(config)
        .with_dispatcher(Arc::new(ScriptedDispatcher::new()))
        .build();
    let app = router(gateway.clone());

    let response = app
        .oneshot(chat_request("model-nobody-serves", "hi"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    gateway.shutdown().await;
}

#[tokio::test]
async fn metrics_endpoint_renders_prometheus_text() {
    let config = base_config(vec![make_channel(
        1,
        ChannelType::Openai,
        "gpt-4o-mini",
        "default",
    )]);
    let dispatcher = Arc::new(ScriptedDispatcher::new());
    dispatcher.set_behavior(1, Behavior::Json(completion_json("ok", 10)));

    let gateway = Gateway::builder(config)
        .with_dispatcher(dispatcher)
        .build();
    let app = router(gateway.clone());

    let response = app
        .clone()
        .oneshot(chat_request("gpt-4o-mini", "hi"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let metrics = app
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .expect("response");
    assert_eq!(metrics.status(), StatusCode::OK);
    let text = body_string(metrics.into_body()).await;
    assert!(text.contains("requests_total 1"));
    assert!(text.contains("channel_requests_total{channel=\"1\"} 1"));
    assert!(text.contains("# TYPE request_duration_seconds histogram"));

    gateway.shutdown().await;
}

#[tokio::test]
async fn health_endpoints_expose_channel_and_cache_state() {
    let config = base_config(vec![make_channel(
        1,
        ChannelType::Openai,
        "gpt-4o-mini",
        "default",
    )]);
    let gateway = Gateway::builder(config)
        .with_dispatcher(Arc::new(ScriptedDispatcher::new()))
        .build();
    gateway.health.observe(1, 42, true, T0_MS);
    let app = router(gateway.clone());

    let health = app
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .expect("response");
    assert_eq!(health.status(), StatusCode::OK);
    let body = body_string(health.into_body()).await;
    assert!(body.contains("\"status\":\"ok\""));

    let channels = app
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/health/channels")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .expect("response");
    let body = body_string(channels.into_body()).await;
    assert!(body.contains("\"successes\":1"));

    gateway.shutdown().await;
}
