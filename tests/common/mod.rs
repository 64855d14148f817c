#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::{routing::post, Json, Router};
use serde_json::json;

use palisade::gates::rate_limit::QuotaPolicy;
use palisade::{app, AppConfig, AppState, PatternConfig, RotationConfig};

/// Baseline configuration for integration tests: no access gates armed,
/// a permissive quota so unrelated tests never trip the limiter, and the
/// persona supplied inline.  Tests override the pieces they exercise.
pub fn base_config(upstream_url: &str) -> AppConfig {
    AppConfig {
        patterns: PatternConfig::default(),
        gate_order: vec![
            "origin".to_string(),
            "signature".to_string(),
            "rate_limit".to_string(),
        ],
        allowed_origins: Vec::new(),
        edge_api_key: None,
        signing_secret: None,
        signature_max_age_secs: 300,
        quota: QuotaPolicy {
            max_requests: 100,
            ..QuotaPolicy::default()
        },
        upstream_url: upstream_url.to_string(),
        upstream_api_key: Some("test-key".to_string()),
        upstream_model: "test-model".to_string(),
        upstream_timeout_ms: 2_000,
        persona: "You are a portfolio assistant used in tests.".to_string(),
        challenge: None,
        max_request_bytes: None,
        log_file: None,
        rotation: RotationConfig {
            max_bytes: None,
            keep: 1,
            compress: false,
        },
    }
}

/// Bind the app on an ephemeral port and serve it for the duration of the
/// test process.
pub async fn spawn_app(state: AppState) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app(state)).await.unwrap();
    });
    format!("http://{}", addr)
}

/// A mock completion API that records how often it was called and the
/// last request body it received.
pub struct MockUpstream {
    pub url: String,
    pub hits: Arc<AtomicUsize>,
    pub last_body: Arc<Mutex<Option<serde_json::Value>>>,
}

impl MockUpstream {
    pub fn hit_count(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

pub async fn start_mock_upstream(reply_text: &str) -> MockUpstream {
    let hits = Arc::new(AtomicUsize::new(0));
    let last_body: Arc<Mutex<Option<serde_json::Value>>> = Arc::new(Mutex::new(None));
    let reply = reply_text.to_string();
    let hits_handler = hits.clone();
    let body_handler = last_body.clone();
    let app = Router::new().route(
        "/v1/chat/completions",
        post(move |Json(v): Json<serde_json::Value>| {
            let hits = hits_handler.clone();
            let body = body_handler.clone();
            let reply = reply.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                *body.lock().unwrap() = Some(v);
                Json(json!({
                    "choices": [{"message": {"role": "assistant", "content": reply}}]
                }))
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    MockUpstream {
        url: format!("http://{}/v1/chat/completions", addr),
        hits,
        last_body,
    }
}

/// A mock completion API that always fails with a 500.
pub async fn start_failing_upstream() -> String {
    async fn fail() -> (axum::http::StatusCode, &'static str) {
        (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "boom")
    }
    let app = Router::new().route("/v1/chat/completions", post(fail));
    let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/v1/chat/completions", addr)
}

/// A mock challenge assessment service: the token picks the verdict.
pub async fn start_mock_assessor() -> String {
    async fn assess(Json(v): Json<serde_json::Value>) -> Json<serde_json::Value> {
        let token = v["event"]["token"].as_str().unwrap_or("");
        let reply = match token {
            "human" => json!({
                "tokenProperties": {"valid": true, "action": "chatbot"},
                "riskAnalysis": {"score": 0.9, "reasons": []}
            }),
            "robot" => json!({
                "tokenProperties": {"valid": true, "action": "chatbot"},
                "riskAnalysis": {"score": 0.1, "reasons": ["AUTOMATION"]}
            }),
            _ => json!({
                "tokenProperties": {"valid": false, "invalidReason": "EXPIRED"}
            }),
        };
        Json(reply)
    }
    let app = Router::new().route("/assess", post(assess));
    let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/assess", addr)
}
