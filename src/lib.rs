//! Core library for Palisade.  This module wires together the access-gate
//! pipeline, the relay orchestration, request/response structures and the
//! HTTP handlers.

mod config;
pub mod challenge;
pub mod filter;
pub mod gates;
pub mod message;
pub mod relay;
pub mod telemetry;
pub mod util;

pub use config::{AppConfig, ChallengeConfig, RotationConfig};
pub use filter::{FilterReason, FilterVerdict, PatternConfig, PatternFilter, SYSTEM_DELIMITER};
pub use gates::{ClientIdentity, GateContext, GatePipeline, GateSet, Rejection};
pub use relay::{UpstreamClient, APOLOGY};

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{
    routing::{get, post},
    Json, Router,
};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::challenge::ChallengeVerifier;
use crate::gates::origin::OriginGate;
use crate::gates::rate_limit::{MemoryStore, RateLimitGate};
use crate::gates::signature::SignatureGate;
use crate::telemetry::{DecisionLog, RotatingWriter};

/// Inbound chat payload.  Unknown fields are ignored.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub recaptcha_token: Option<String>,
}

/// Successful relay reply.
#[derive(Debug, Serialize)]
pub struct ChatReply {
    pub response: String,
}

/// Uniform rejection body.  `error` is machine-readable; `message` is a
/// randomized human-readable companion so repeated errors do not read
/// identically; `retryAfter` accompanies 429s only.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(rename = "retryAfter", skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

const CLIENT_ERROR_MESSAGES: &[&str] = &[
    "That message didn't look right - please try rephrasing it.",
    "The request was missing something we needed.",
    "We couldn't read that one. Mind trying again?",
];

const AUTH_ERROR_MESSAGES: &[&str] = &[
    "That request couldn't be verified.",
    "We couldn't confirm this request came from the site.",
    "Verification didn't check out this time.",
];

const RATE_LIMIT_MESSAGES: &[&str] = &[
    "You're sending messages a little too quickly. Give it a moment.",
    "Let's slow down a touch and try again shortly.",
    "Too many messages at once. A short pause and you're back.",
];

const SERVER_ERROR_MESSAGES: &[&str] = &[
    "Something went wrong on our side. Please try again.",
    "A hiccup on our end. Give it another go.",
    "We hit a snag processing that.",
];

fn friendly_message(status: StatusCode) -> Option<String> {
    let pool = if status == StatusCode::TOO_MANY_REQUESTS {
        RATE_LIMIT_MESSAGES
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        AUTH_ERROR_MESSAGES
    } else if status.is_client_error() {
        CLIENT_ERROR_MESSAGES
    } else if status.is_server_error() {
        SERVER_ERROR_MESSAGES
    } else {
        return None;
    };
    pool.choose(&mut rand::thread_rng())
        .map(|s| (*s).to_string())
}

/// Internal application state shared across handlers.  Contains the
/// preconstructed gate pipeline, the pattern filter, the upstream client
/// and the metric counters.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: GatePipeline,
    pub filter: PatternFilter,
    pub upstream: Arc<UpstreamClient>,
    pub challenge: Option<Arc<ChallengeVerifier>>,
    pub decisions: DecisionLog,
    /// Maximum accepted raw request body size in bytes (None => unlimited)
    pub max_request_bytes: Option<usize>,
    // Metrics counters
    pub metric_requests_total: Arc<AtomicU64>,
    pub metric_relayed_total: Arc<AtomicU64>,
    pub metric_rejections_total: Arc<AtomicU64>,
    pub metric_masked_replies_total: Arc<AtomicU64>,
    // Per-gate rejection counters, index aligned with gate order
    pub gate_metric_indices: Arc<HashMap<String, usize>>,
    pub gate_rejections: Arc<Vec<AtomicU64>>,
    // Upstream latency histogram (bucket upper bounds in ms) and counts
    pub hist_buckets: Arc<Vec<u64>>,
    pub hist_counts: Arc<Vec<AtomicU64>>,
    pub hist_sum_ms: Arc<AtomicU64>,
    pub hist_count: Arc<AtomicU64>,
    // Process start time (epoch secs) and instant for uptime computation
    pub process_start_epoch: f64,
    pub process_start_instant: Instant,
}

/// Build state from a parsed configuration.  Gates whose configuration is
/// absent are left out of the set; the pipeline then skips them with a
/// warning if they are named in the order list.
pub fn build_state(config: AppConfig) -> anyhow::Result<AppState> {
    let filter = PatternFilter::new(&config.patterns);

    let origin = if !config.allowed_origins.is_empty() || config.edge_api_key.is_some() {
        Some(Arc::new(OriginGate::new(
            config.allowed_origins.clone(),
            config.edge_api_key.clone(),
            &config.patterns.agent_signatures,
        )))
    } else {
        None
    };
    let signature = config
        .signing_secret
        .as_ref()
        .map(|secret| {
            Arc::new(SignatureGate::new(
                secret.clone(),
                config.signature_max_age_secs,
            ))
        });
    let rate_limit = Some(Arc::new(RateLimitGate::new(
        Arc::new(MemoryStore::new()),
        config.quota,
    )));

    let pipeline = GatePipeline::new(
        &config.gate_order,
        GateSet {
            origin,
            signature,
            rate_limit,
        },
    );

    if config.upstream_api_key.is_none() {
        tracing::warn!("UPSTREAM_API_KEY not set; upstream calls will be unauthenticated");
    }
    let upstream = Arc::new(UpstreamClient::new(
        config.upstream_url,
        config.upstream_api_key,
        config.upstream_model,
        &config.persona,
        config.upstream_timeout_ms,
    ));

    let challenge = config.challenge.map(|c| {
        Arc::new(ChallengeVerifier::new(
            c.url,
            c.site_key,
            c.min_score,
            c.timeout_ms,
        ))
    });

    let writer = match config.log_file.as_deref() {
        Some(path) => match RotatingWriter::open(
            path,
            config.rotation.max_bytes,
            config.rotation.keep,
            config.rotation.compress,
        ) {
            Ok(w) => Some(Arc::new(Mutex::new(w))),
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "Failed to open LOG_FILE; decision log disabled");
                None
            }
        },
        None => None,
    };
    let decisions = DecisionLog::new(writer);

    let buckets: Vec<u64> = vec![50, 100, 200, 500, 1000, 2000, 5000, 10_000, 20_000];

    let mut index_map = HashMap::new();
    let mut gate_rejections = Vec::new();
    for (i, name) in pipeline.names().iter().enumerate() {
        index_map.insert(name.clone(), i);
        gate_rejections.push(AtomicU64::new(0));
    }

    let start_time = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();

    Ok(AppState {
        pipeline,
        filter,
        upstream,
        challenge,
        decisions,
        max_request_bytes: config.max_request_bytes,
        metric_requests_total: Arc::new(AtomicU64::new(0)),
        metric_relayed_total: Arc::new(AtomicU64::new(0)),
        metric_rejections_total: Arc::new(AtomicU64::new(0)),
        metric_masked_replies_total: Arc::new(AtomicU64::new(0)),
        gate_metric_indices: Arc::new(index_map),
        gate_rejections: Arc::new(gate_rejections),
        hist_counts: Arc::new(buckets.iter().map(|_| AtomicU64::new(0)).collect()),
        hist_buckets: Arc::new(buckets),
        hist_sum_ms: Arc::new(AtomicU64::new(0)),
        hist_count: Arc::new(AtomicU64::new(0)),
        process_start_epoch: start_time.as_secs_f64(),
        process_start_instant: Instant::now(),
    })
}

/// Build state from environment variables.  See `AppConfig::from_env` for
/// the variables read.
pub async fn build_state_from_env() -> anyhow::Result<AppState> {
    build_state(AppConfig::from_env()?)
}

/// Build the Axum router and attach handlers.  Routing rejects non-POST
/// methods on the chat and gate endpoints with 405.
pub fn app(state: AppState) -> Router {
    let max_request_bytes = state.max_request_bytes;

    let router = Router::new()
        .route("/chat", post(chat_handler))
        .route("/gate", post(gate_handler))
        .route("/healthz", get(healthz_handler))
        .route("/metrics", get(metrics_handler));

    let router = if let Some(limit) = max_request_bytes {
        router.layer(DefaultBodyLimit::max(limit))
    } else {
        router
    };

    router.with_state(state)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn build_gate_context(headers: &HeaderMap, raw_body: Bytes) -> GateContext {
    let user_agent = header_str(headers, "user-agent").unwrap_or("").to_string();
    let identity = ClientIdentity::from_parts(header_str(headers, "x-forwarded-for"), &user_agent);
    GateContext {
        identity,
        origin: header_str(headers, "origin").map(str::to_string),
        api_key: header_str(headers, "x-api-key").map(str::to_string),
        signature: header_str(headers, "x-signature").map(str::to_string),
        timestamp: header_str(headers, "x-timestamp").map(str::to_string),
        user_agent,
        raw_body,
        now_ms: util::now_ms(),
    }
}

/// Map a rejection to the uniform JSON error response, record metrics and
/// the decision, and attach the `Retry-After` header when present.
fn respond_with_rejection(
    state: &AppState,
    endpoint: &str,
    stage: &str,
    rejection: &Rejection,
    identity: &ClientIdentity,
) -> Response {
    state.metric_rejections_total.fetch_add(1, Ordering::Relaxed);
    if let Some(idx) = state.gate_metric_indices.get(stage) {
        if let Some(counter) = state.gate_rejections.get(*idx) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }
    state.decisions.emit(&serde_json::json!({
        "ts": chrono::Utc::now().to_rfc3339(),
        "endpoint": endpoint,
        "outcome": "rejected",
        "stage": stage,
        "status": rejection.status,
        "error": rejection.error.as_str(),
        "ip": identity.ip.as_str(),
    }));

    let status =
        StatusCode::from_u16(rejection.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = ErrorResponse {
        error: rejection.error.clone(),
        message: friendly_message(status),
        retry_after: rejection.retry_after,
    };
    let mut response = (status, Json(body)).into_response();
    if let Some(secs) = rejection.retry_after {
        if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
    }
    response
}

fn stage_rejection(
    state: &AppState,
    endpoint: &str,
    stage: &str,
    identity: &ClientIdentity,
    status: u16,
    error: impl Into<String>,
) -> Response {
    let rejection = Rejection::new(status, error);
    respond_with_rejection(state, endpoint, stage, &rejection, identity)
}

/// Handler for the `/chat` endpoint: the full relay pipeline.  Gates run
/// on the raw request parts before the body is parsed; the remaining
/// stages run in fixed order and terminate at the first failure.
async fn chat_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.metric_requests_total.fetch_add(1, Ordering::Relaxed);
    let ctx = build_gate_context(&headers, body);

    let (decision, gate_timings) = state.pipeline.evaluate_with_timings(&ctx).await;
    if let Some(rejection) = decision {
        let stage = rejection.rejected_by.clone().unwrap_or_default();
        return respond_with_rejection(&state, "chat", &stage, &rejection, &ctx.identity);
    }

    let request: ChatRequest = match serde_json::from_slice(&ctx.raw_body) {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::info!(error = %err, "rejecting malformed request body");
            return stage_rejection(
                &state,
                "chat",
                "parse",
                &ctx.identity,
                400,
                "Invalid JSON in request body",
            );
        }
    };

    let challenge_required = state.challenge.is_some();
    let message = request.message.as_deref().unwrap_or("");
    if message.is_empty() || (challenge_required && request.recaptcha_token.is_none()) {
        let error = if challenge_required {
            "Missing 'message' or 'recaptchaToken' in request body"
        } else {
            "Missing 'message' in request body"
        };
        return stage_rejection(&state, "chat", "fields", &ctx.identity, 400, error);
    }

    if let Some(verifier) = &state.challenge {
        let token = request.recaptcha_token.as_deref().unwrap_or_default();
        match verifier.assess(token).await {
            Err(err) => {
                tracing::error!(error = %err, "challenge verification failed");
                return stage_rejection(
                    &state,
                    "chat",
                    "challenge",
                    &ctx.identity,
                    500,
                    "Failed to verify reCAPTCHA",
                );
            }
            Ok(None) => {
                return stage_rejection(
                    &state,
                    "chat",
                    "challenge",
                    &ctx.identity,
                    401,
                    "Invalid reCAPTCHA token",
                );
            }
            Ok(Some(score)) if score < verifier.min_score() => {
                tracing::info!(score, "low challenge score, rejecting as automation");
                return stage_rejection(
                    &state,
                    "chat",
                    "challenge",
                    &ctx.identity,
                    403,
                    "reCAPTCHA score too low - suspected bot/spam",
                );
            }
            Ok(Some(score)) => {
                tracing::debug!(score, "challenge passed");
            }
        }
    }

    if !message::is_valid_message(message) {
        return stage_rejection(
            &state,
            "chat",
            "validate",
            &ctx.identity,
            400,
            "Invalid input format or length",
        );
    }

    let verdict = state.filter.check_content(message);
    if let Some(reason) = verdict.reason {
        return stage_rejection(
            &state,
            "chat",
            "filter_input",
            &ctx.identity,
            403,
            format!("Content filtered: {}", reason.as_str()),
        );
    }

    let sanitized = message::sanitize_message(message);
    let upstream_start = Instant::now();
    let reply = match state.upstream.complete(&sanitized).await {
        Ok(text) => text,
        Err(err) => {
            tracing::error!(error = %err, "upstream completion failed");
            return stage_rejection(
                &state,
                "chat",
                "upstream",
                &ctx.identity,
                500,
                "Failed to process request",
            );
        }
    };
    let latency_ms = upstream_start.elapsed().as_millis() as u64;
    state.hist_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
    state.hist_count.fetch_add(1, Ordering::Relaxed);
    for (idx, upper) in state.hist_buckets.iter().enumerate() {
        if latency_ms <= *upper {
            state.hist_counts[idx].fetch_add(1, Ordering::Relaxed);
            break;
        }
    }

    let output_verdict = state.filter.check_content(&reply);
    if let Some(reason) = output_verdict.reason {
        // The filtered text and the reason stay server-side; the client
        // receives only the fixed apology.
        tracing::warn!(reason = reason.as_str(), "masking filtered upstream reply");
        state
            .metric_masked_replies_total
            .fetch_add(1, Ordering::Relaxed);
        state.decisions.emit(&serde_json::json!({
            "ts": chrono::Utc::now().to_rfc3339(),
            "endpoint": "chat",
            "outcome": "masked",
            "reason": reason.as_str(),
            "latencyMs": latency_ms,
            "ip": ctx.identity.ip.as_str(),
        }));
        return (
            StatusCode::OK,
            Json(ChatReply {
                response: APOLOGY.to_string(),
            }),
        )
            .into_response();
    }

    state.metric_relayed_total.fetch_add(1, Ordering::Relaxed);
    state.decisions.emit(&serde_json::json!({
        "ts": chrono::Utc::now().to_rfc3339(),
        "endpoint": "chat",
        "outcome": "relayed",
        "latencyMs": latency_ms,
        "ip": ctx.identity.ip.as_str(),
        "gateTimings": gate_timings
            .iter()
            .map(|(gate, ms)| serde_json::json!({"gate": gate, "ms": ms}))
            .collect::<Vec<_>>(),
    }));
    (StatusCode::OK, Json(ChatReply { response: reply })).into_response()
}

/// Handler for the `/gate` edge endpoint: runs only the access-gate
/// pipeline and returns a success marker when every gate passes, so an
/// edge layer can sit in front of the relay proper.
async fn gate_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.metric_requests_total.fetch_add(1, Ordering::Relaxed);
    let ctx = build_gate_context(&headers, body);

    let (decision, _timings) = state.pipeline.evaluate_with_timings(&ctx).await;
    if let Some(rejection) = decision {
        let stage = rejection.rejected_by.clone().unwrap_or_default();
        return respond_with_rejection(&state, "gate", &stage, &rejection, &ctx.identity);
    }

    state.decisions.emit(&serde_json::json!({
        "ts": chrono::Utc::now().to_rfc3339(),
        "endpoint": "gate",
        "outcome": "passed",
        "ip": ctx.identity.ip.as_str(),
    }));

    let mut response = (
        StatusCode::OK,
        Json(serde_json::json!({"success": "Request successful"})),
    )
        .into_response();
    if let Some(origin) = ctx.origin.as_deref() {
        if let Ok(value) = HeaderValue::from_str(origin) {
            response
                .headers_mut()
                .insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
            response.headers_mut().insert(
                header::ACCESS_CONTROL_ALLOW_METHODS,
                HeaderValue::from_static("POST, OPTIONS"),
            );
        }
    }
    response
}

/// Simple health endpoint for container readiness / liveness checks.
async fn healthz_handler(State(state): State<AppState>) -> Response {
    let json = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "gateCount": state.pipeline.len(),
        "challengeRequired": state.challenge.is_some(),
    });
    (StatusCode::OK, Json(json)).into_response()
}

/// Prometheus-style metrics exposition.  Text format with simple counters
/// and the upstream latency histogram.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    use std::fmt::Write as _;
    let mut buf = String::new();
    let requests = state.metric_requests_total.load(Ordering::Relaxed);
    let relayed = state.metric_relayed_total.load(Ordering::Relaxed);
    let rejections = state.metric_rejections_total.load(Ordering::Relaxed);
    let masked = state.metric_masked_replies_total.load(Ordering::Relaxed);
    let sum_ms = state.hist_sum_ms.load(Ordering::Relaxed);
    let count = state.hist_count.load(Ordering::Relaxed);
    let uptime_secs = state.process_start_instant.elapsed().as_secs_f64();

    writeln!(
        &mut buf,
        "# HELP palisade_requests_total Total requests received\n# TYPE palisade_requests_total counter"
    )
    .ok();
    writeln!(&mut buf, "palisade_requests_total {}", requests).ok();
    writeln!(
        &mut buf,
        "# HELP palisade_relayed_total Requests relayed upstream and answered\n# TYPE palisade_relayed_total counter"
    )
    .ok();
    writeln!(&mut buf, "palisade_relayed_total {}", relayed).ok();
    writeln!(
        &mut buf,
        "# HELP palisade_rejections_total Requests terminated by a gate or stage\n# TYPE palisade_rejections_total counter"
    )
    .ok();
    writeln!(&mut buf, "palisade_rejections_total {}", rejections).ok();
    writeln!(
        &mut buf,
        "# HELP palisade_masked_replies_total Upstream replies replaced by the fixed apology\n# TYPE palisade_masked_replies_total counter"
    )
    .ok();
    writeln!(&mut buf, "palisade_masked_replies_total {}", masked).ok();

    writeln!(
        &mut buf,
        "# HELP palisade_gate_rejections_total Rejections per access gate\n# TYPE palisade_gate_rejections_total counter"
    )
    .ok();
    for (name, idx) in state.gate_metric_indices.iter() {
        if let Some(counter) = state.gate_rejections.get(*idx) {
            writeln!(
                &mut buf,
                "palisade_gate_rejections_total{{gate=\"{}\"}} {}",
                name,
                counter.load(Ordering::Relaxed)
            )
            .ok();
        }
    }

    writeln!(
        &mut buf,
        "# HELP palisade_upstream_latency_ms Upstream completion latency histogram milliseconds\n# TYPE palisade_upstream_latency_ms histogram"
    )
    .ok();
    let mut cumulative: u64 = 0;
    for (i, upper) in state.hist_buckets.iter().enumerate() {
        cumulative += state.hist_counts[i].load(Ordering::Relaxed);
        writeln!(
            &mut buf,
            "palisade_upstream_latency_ms_bucket{{le=\"{}\"}} {}",
            upper, cumulative
        )
        .ok();
    }
    writeln!(
        &mut buf,
        "palisade_upstream_latency_ms_bucket{{le=\"+Inf\"}} {}",
        count
    )
    .ok();
    writeln!(&mut buf, "palisade_upstream_latency_ms_sum {}", sum_ms).ok();
    writeln!(&mut buf, "palisade_upstream_latency_ms_count {}", count).ok();

    writeln!(
        &mut buf,
        "# HELP palisade_decision_lines_total Decision records written\n# TYPE palisade_decision_lines_total counter"
    )
    .ok();
    writeln!(
        &mut buf,
        "palisade_decision_lines_total {}",
        state.decisions.lines_total()
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP palisade_decision_write_errors_total Decision record write failures\n# TYPE palisade_decision_write_errors_total counter"
    )
    .ok();
    writeln!(
        &mut buf,
        "palisade_decision_write_errors_total {}",
        state.decisions.write_errors_total()
    )
    .ok();

    writeln!(
        &mut buf,
        "# HELP palisade_build_info Build information\n# TYPE palisade_build_info gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "palisade_build_info{{version=\"{}\"}} 1",
        env!("CARGO_PKG_VERSION")
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP palisade_process_start_time_seconds Process start time (Unix epoch seconds)\n# TYPE palisade_process_start_time_seconds gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "palisade_process_start_time_seconds {}",
        state.process_start_epoch
    )
    .ok();
    writeln!(
        &mut buf,
        "# HELP palisade_process_uptime_seconds Process uptime seconds\n# TYPE palisade_process_uptime_seconds gauge"
    )
    .ok();
    writeln!(&mut buf, "palisade_process_uptime_seconds {}", uptime_secs).ok();

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        buf,
    )
        .into_response()
}
