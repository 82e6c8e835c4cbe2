use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use httpmock::Method::POST;
use httpmock::{Mock, MockServer};
use serde_json::{Value, json};
use tollgate::gateway::http::{ErrorResponse, GatewayHttpState, router};
use tollgate::gateway::{
    ApiKeyRecord, AzureOpenAiUpstream, Environment, Gateway, GatewayConfig, KeyDirectory,
    Ledger, MemoryStore, Money, RateLimitConfig, StoreError, UpstreamConfig,
};
use tower::util::ServiceExt;

const KEY: &str = "tg-test-key";
const ACCOUNT: &str = "acct-http";
const ADMIN: &str = "admin-secret";

struct TestApp {
    app: Router,
    store: Arc<MemoryStore>,
}

async fn test_app(upstream: &MockServer, environment: Environment, admin: Option<&str>) -> TestApp {
    let mut config = GatewayConfig::new(UpstreamConfig::new(upstream.base_url(), "azure-key"));
    config.environment = environment;
    config.rate_limit = RateLimitConfig::default();

    let store = Arc::new(MemoryStore::new());
    store
        .insert_key(ApiKeyRecord {
            key: KEY.to_string(),
            account_id: ACCOUNT.to_string(),
            created_at_ms: 0,
        })
        .await
        .expect("seed key");

    let azure = AzureOpenAiUpstream::new(upstream.base_url(), "azure-key", Duration::from_secs(5))
        .expect("upstream client");
    let gateway = Gateway::new(&config, store.clone(), store.clone(), Arc::new(azure))
        .expect("gateway");
    let mut state = GatewayHttpState::new(gateway);
    if let Some(token) = admin {
        state = state.with_admin_token(token);
    }
    TestApp {
        app: router(state),
        store,
    }
}

fn mock_completion<'a>(upstream: &'a MockServer, total_tokens: u64) -> Mock<'a> {
    upstream.mock(|when, then| {
        when.method(POST)
            .path("/openai/deployments/gpt-4o/chat/completions")
            .query_param("api-version", "2023-05-15")
            .header("api-key", "azure-key");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!({
                "id": "chatcmpl-upstream",
                "object": "chat.completion",
                "created": 1,
                "model": "gpt-4o-2024-05-13",
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": "hello there"},
                    "finish_reason": "stop"
                }],
                "usage": {
                    "prompt_tokens": total_tokens / 2,
                    "completion_tokens": total_tokens - total_tokens / 2,
                    "total_tokens": total_tokens
                },
                "system_fingerprint": "fp_abc"
            }));
    })
}

fn chat_body() -> String {
    json!({
        "model": "gpt-4o",
        "messages": [{"role": "user", "content": "hi"}]
    })
    .to_string()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, value)
}

fn chat_request(uri: &str, auth: Option<(&str, &str)>, body: String) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some((name, value)) = auth {
        builder = builder.header(name, value);
    }
    builder.body(Body::from(body)).unwrap()
}

fn admin_request(method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("x-admin-token", token);
    }
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

#[tokio::test]
async fn chat_completion_returns_cost_and_remaining_balance() {
    let upstream = MockServer::start();
    let mock = mock_completion(&upstream, 1000);
    let t = test_app(&upstream, Environment::Production, None).await;
    t.store
        .credit(ACCOUNT, Money::from_millis(5_000), "top-up")
        .await
        .expect("credit");

    let (status, value) = send(
        &t.app,
        chat_request("/v1/chat/completions", Some(("x-api-key", KEY)), chat_body()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["object"], "chat.completion");
    assert_eq!(value["model"], "gpt-4o-2024-05-13");
    assert_eq!(value["choices"][0]["message"]["content"], "hello there");
    assert_eq!(value["usage"]["total_tokens"], 1000);
    assert_eq!(value["cost"].as_f64(), Some(0.5));
    assert_eq!(value["remaining_balance"].as_f64(), Some(4.5));
    assert_eq!(value["system_fingerprint"], "fp_abc");
    assert!(value["id"].as_str().unwrap_or_default().starts_with("chatcmpl-"));

    // Bearer auth on the alternate path reaches the same pipeline.
    let (status, value) = send(
        &t.app,
        chat_request(
            "/api/chat",
            Some(("authorization", format!("Bearer {KEY}").as_str())),
            chat_body(),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["remaining_balance"].as_f64(), Some(4.0));
    mock.assert_calls(2);
}

#[tokio::test]
async fn errors_use_one_envelope() {
    let upstream = MockServer::start();
    let mock = mock_completion(&upstream, 1000);
    let t = test_app(&upstream, Environment::Production, None).await;

    let (status, value) = send(&t.app, chat_request("/v1/chat/completions", None, chat_body())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let err: ErrorResponse = serde_json::from_value(value).expect("error envelope");
    assert_eq!(err.error.kind, "authentication_error");
    assert_eq!(err.error.code, "MISSING_API_KEY");
    assert!(err.error.details.is_none());

    let (status, value) = send(
        &t.app,
        chat_request("/v1/chat/completions", Some(("x-api-key", "nope")), chat_body()),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(value["error"]["code"], "INVALID_API_KEY");

    let (status, value) = send(
        &t.app,
        chat_request(
            "/v1/chat/completions",
            Some(("x-api-key", KEY)),
            json!({"model": "gpt-5-unreleased", "messages": [{"role": "user", "content": "hi"}]})
                .to_string(),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(value["error"]["type"], "invalid_model");
    assert_eq!(value["error"]["code"], "UNSUPPORTED_MODEL");
    assert!(
        value["error"]["message"]
            .as_str()
            .unwrap_or_default()
            .starts_with("Unsupported model: gpt-5-unreleased.")
    );

    let (status, value) = send(
        &t.app,
        chat_request("/v1/chat/completions", Some(("x-api-key", KEY)), "{not json".to_string()),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(value["error"]["code"], "INVALID_REQUEST");

    let (status, value) =
        send(&t.app, chat_request("/v1/chat/completions", None, "{not json".to_string())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(value["error"]["code"], "MISSING_API_KEY");

    // Unfunded account: the upstream is called, the charge is refused.
    let (status, value) = send(
        &t.app,
        chat_request("/v1/chat/completions", Some(("x-api-key", KEY)), chat_body()),
    )
    .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(value["error"]["type"], "insufficient_funds");
    assert_eq!(value["error"]["code"], "INSUFFICIENT_FUNDS");
    mock.assert_calls(1);
}

#[tokio::test]
async fn upstream_error_status_and_message_pass_through() {
    let upstream = MockServer::start();
    let mock = upstream.mock(|when, then| {
        when.method(POST)
            .path("/openai/deployments/gpt-4o/chat/completions");
        then.status(429)
            .header("content-type", "application/json")
            .json_body(json!({"error": {"code": "429", "message": "Requests to the deployment are throttled"}}));
    });
    let t = test_app(&upstream, Environment::Production, None).await;
    t.store
        .credit(ACCOUNT, Money::from_millis(1_000), "top-up")
        .await
        .expect("credit");

    let (status, value) = send(
        &t.app,
        chat_request("/v1/chat/completions", Some(("x-api-key", KEY)), chat_body()),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(value["error"]["type"], "upstream_api_error");
    assert_eq!(value["error"]["code"], "UPSTREAM_ERROR");
    assert_eq!(
        value["error"]["message"],
        "Requests to the deployment are throttled"
    );
    mock.assert();

    let account = t.store.get_or_create(ACCOUNT).await.expect("account");
    assert_eq!(account.balance, Money::from_millis(1_000));
}

#[tokio::test]
async fn internal_details_only_in_development() {
    let upstream = MockServer::start();
    let broken = Arc::new(BrokenKeys);
    for (environment, expect_details) in [
        (Environment::Production, false),
        (Environment::Development, true),
    ] {
        let mut config = GatewayConfig::new(UpstreamConfig::new(upstream.base_url(), "azure-key"));
        config.environment = environment;
        let azure =
            AzureOpenAiUpstream::new(upstream.base_url(), "azure-key", Duration::from_secs(5))
                .expect("upstream client");
        let gateway = Gateway::new(
            &config,
            broken.clone(),
            Arc::new(MemoryStore::new()),
            Arc::new(azure),
        )
        .expect("gateway");
        let app = router(GatewayHttpState::new(gateway));

        let (status, value) = send(
            &app,
            chat_request("/v1/chat/completions", Some(("x-api-key", KEY)), chat_body()),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(value["error"]["code"], "INTERNAL_ERROR");
        assert_eq!(value["error"]["message"], "An internal error occurred");
        assert_eq!(value["error"]["details"].is_string(), expect_details);
        if expect_details {
            assert!(
                value["error"]["details"]
                    .as_str()
                    .unwrap_or_default()
                    .contains("connection refused")
            );
        }
    }
}

struct BrokenKeys;

#[async_trait::async_trait]
impl KeyDirectory for BrokenKeys {
    async fn resolve(
        &self,
        _key: &str,
    ) -> Result<Option<ApiKeyRecord>, StoreError> {
        Err(StoreError::Backend(
            "connection refused".to_string(),
        ))
    }

    async fn create_key(
        &self,
        _account_id: &str,
        _max_keys: usize,
    ) -> Result<ApiKeyRecord, StoreError> {
        Err(StoreError::Backend(
            "connection refused".to_string(),
        ))
    }

    async fn insert_key(&self, _record: ApiKeyRecord) -> Result<(), StoreError> {
        Ok(())
    }

    async fn list_keys(
        &self,
        _account_id: &str,
    ) -> Result<Vec<ApiKeyRecord>, StoreError> {
        Ok(Vec::new())
    }

    async fn delete_key(
        &self,
        _account_id: &str,
        _key: &str,
    ) -> Result<bool, StoreError> {
        Ok(false)
    }
}

#[tokio::test]
async fn health_and_metrics() {
    let upstream = MockServer::start();
    let _mock = mock_completion(&upstream, 10);
    let t = test_app(&upstream, Environment::Production, None).await;
    t.store
        .credit(ACCOUNT, Money::from_millis(1_000), "top-up")
        .await
        .expect("credit");

    let (status, value) = send(&t.app, admin_request("GET", "/health", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["status"], "ok");

    send(
        &t.app,
        chat_request("/v1/chat/completions", Some(("x-api-key", KEY)), chat_body()),
    )
    .await;
    send(
        &t.app,
        chat_request("/v1/chat/completions", Some(("x-api-key", "bad")), chat_body()),
    )
    .await;

    let (status, value) = send(&t.app, admin_request("GET", "/metrics", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["requests"], 2);
    assert_eq!(value["invalid_keys"], 1);
    assert_eq!(value["upstream_calls"], 1);
    assert_eq!(value["debits"], 1);
}

#[tokio::test]
async fn admin_routes_require_a_configured_token() {
    let upstream = MockServer::start();
    let t = test_app(&upstream, Environment::Production, None).await;
    let (status, value) = send(
        &t.app,
        admin_request("GET", &format!("/admin/accounts/{ACCOUNT}"), Some(ADMIN), None),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(value["error"]["code"], "NOT_CONFIGURED");

    let t = test_app(&upstream, Environment::Production, Some(ADMIN)).await;
    let (status, value) = send(
        &t.app,
        admin_request("GET", &format!("/admin/accounts/{ACCOUNT}"), Some("wrong"), None),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(value["error"]["code"], "INVALID_ADMIN_TOKEN");

    let request = Request::builder()
        .method("GET")
        .uri(format!("/admin/accounts/{ACCOUNT}"))
        .header("authorization", format!("Bearer {ADMIN}"))
        .body(Body::empty())
        .unwrap();
    let (status, value) = send(&t.app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["account_id"], ACCOUNT);
    assert_eq!(value["balance"].as_f64(), Some(0.0));
}

#[tokio::test]
async fn admin_credit_then_paginate_history() {
    let upstream = MockServer::start();
    let _mock = mock_completion(&upstream, 1000);
    let t = test_app(&upstream, Environment::Production, Some(ADMIN)).await;
    let base = format!("/admin/accounts/{ACCOUNT}");

    let (status, value) = send(
        &t.app,
        admin_request(
            "POST",
            &format!("{base}/credit"),
            Some(ADMIN),
            Some(json!({"amount": 5.0, "description": "Initial deposit"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["balance"].as_f64(), Some(5.0));

    let (status, value) = send(
        &t.app,
        admin_request(
            "POST",
            &format!("{base}/credit"),
            Some(ADMIN),
            Some(json!({"amount": 0})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(value["error"]["code"], "INVALID_AMOUNT");

    let (status, _) = send(
        &t.app,
        chat_request("/v1/chat/completions", Some(("x-api-key", KEY)), chat_body()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, value) = send(
        &t.app,
        admin_request("GET", &format!("{base}/transactions"), Some(ADMIN), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["total_count"], 2);
    assert_eq!(value["page"], 1);
    assert_eq!(value["limit"], 10);
    let transactions = value["transactions"].as_array().expect("transactions");
    assert_eq!(transactions.len(), 2);
    assert_eq!(transactions[0]["amount"].as_f64(), Some(-0.5));
    assert_eq!(
        transactions[0]["description"],
        "Chat completion (gpt-4o) - 1000 tokens"
    );
    assert_eq!(transactions[1]["description"], "Initial deposit");

    let (status, value) = send(
        &t.app,
        admin_request(
            "GET",
            &format!("{base}/transactions?page=2&limit=1"),
            Some(ADMIN),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["total_count"], 2);
    assert_eq!(value["transactions"].as_array().map(Vec::len), Some(1));
    assert_eq!(value["transactions"][0]["amount"].as_f64(), Some(5.0));

    let (_, value) = send(&t.app, admin_request("GET", &base, Some(ADMIN), None)).await;
    assert_eq!(value["balance"].as_f64(), Some(4.5));
}

#[tokio::test]
async fn malformed_credit_body_uses_the_error_envelope() {
    let upstream = MockServer::start();
    let t = test_app(&upstream, Environment::Production, Some(ADMIN)).await;
    let uri = format!("/admin/accounts/{ACCOUNT}/credit");

    let (status, value) = send(
        &t.app,
        admin_request("POST", &uri, Some(ADMIN), Some(json!({"amount": "lots"}))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(value["error"]["type"], "invalid_request_error");
    assert_eq!(value["error"]["code"], "INVALID_REQUEST");

    let request = Request::builder()
        .method("POST")
        .uri(&uri)
        .header("authorization", format!("Bearer {ADMIN}"))
        .body(Body::from("amount=5"))
        .unwrap();
    let (status, value) = send(&t.app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(value["error"]["code"], "INVALID_REQUEST");

    let (_, value) = send(
        &t.app,
        admin_request("GET", &format!("/admin/accounts/{ACCOUNT}"), Some(ADMIN), None),
    )
    .await;
    assert_eq!(value["balance"].as_f64(), Some(0.0));
}

#[tokio::test]
async fn admin_key_lifecycle() {
    let upstream = MockServer::start();
    let t = test_app(&upstream, Environment::Production, Some(ADMIN)).await;
    let keys = format!("/admin/accounts/{ACCOUNT}/keys");

    let (status, value) = send(&t.app, admin_request("POST", &keys, Some(ADMIN), None)).await;
    assert_eq!(status, StatusCode::CREATED);
    let created = value["api_key"].as_str().expect("api_key").to_string();
    assert_eq!(created.len(), 64);
    assert_eq!(value["account_id"], ACCOUNT);

    // The seeded key plus this one hit the default cap of two.
    let (status, value) = send(&t.app, admin_request("POST", &keys, Some(ADMIN), None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(value["error"]["code"], "KEY_LIMIT_REACHED");

    let (status, value) = send(&t.app, admin_request("GET", &keys, Some(ADMIN), None)).await;
    assert_eq!(status, StatusCode::OK);
    let listed = value.as_array().expect("keys");
    assert_eq!(listed.len(), 2);
    assert!(listed.iter().all(|key| key["key"] == "redacted"));

    let (_, value) = send(
        &t.app,
        admin_request("GET", &format!("{keys}?include_keys=true"), Some(ADMIN), None),
    )
    .await;
    let listed: Vec<&str> = value
        .as_array()
        .expect("keys")
        .iter()
        .filter_map(|key| key["key"].as_str())
        .collect();
    assert!(listed.contains(&created.as_str()));
    assert!(listed.contains(&KEY));

    let (status, value) = send(
        &t.app,
        admin_request("DELETE", &format!("{keys}/{created}"), Some(ADMIN), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["deleted"], true);

    let (status, value) = send(
        &t.app,
        admin_request("DELETE", &format!("{keys}/{created}"), Some(ADMIN), None),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(value["error"]["code"], "KEY_NOT_FOUND");

    // Another account cannot delete this account's key.
    let (status, _) = send(
        &t.app,
        admin_request(
            "DELETE",
            &format!("/admin/accounts/someone-else/keys/{KEY}"),
            Some(ADMIN),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &t.app,
        chat_request("/v1/chat/completions", Some(("x-api-key", created.as_str())), chat_body()),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}
