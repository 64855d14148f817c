//! Access-gate infrastructure.
//!
//! Each gate encapsulates one pass/fail check that runs before the request
//! body is parsed: origin/bot guarding, request-signature verification and
//! rate limiting.  The `GatePipeline` evaluates the configured gates in
//! order and stops at the first rejection; later gates never run for a
//! rejected request.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;

pub mod origin;
pub mod rate_limit;
pub mod signature;

use self::origin::OriginGate;
use self::rate_limit::RateLimitGate;
use self::signature::SignatureGate;

/// Client identity used as the rate-limit partition key: source IP plus a
/// short user-agent fragment.  Derived per request and never persisted
/// beyond the rate-limit store entry.
#[derive(Clone, Debug)]
pub struct ClientIdentity {
    pub ip: String,
    pub agent_fragment: String,
}

impl ClientIdentity {
    /// Derive the identity from the `x-forwarded-for` header (first entry)
    /// and the user-agent.  Requests without a forwarded address share the
    /// `unknown` bucket.
    pub fn from_parts(forwarded_for: Option<&str>, user_agent: &str) -> Self {
        let ip = forwarded_for
            .and_then(|v| v.split(',').next())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "unknown".to_string());
        let agent_fragment: String = user_agent.chars().take(32).collect();
        ClientIdentity { ip, agent_fragment }
    }

    /// Key under which the rate-limit record for this identity is stored.
    pub fn store_key(&self) -> String {
        format!("ratelimit_{}_{}", self.ip, self.agent_fragment)
    }
}

/// Per-request data visible to access gates.  Built once from the raw
/// request parts; gates never see a parsed body.  The raw bytes are kept
/// exactly as received so signature verification covers what was signed.
#[derive(Clone, Debug)]
pub struct GateContext {
    pub identity: ClientIdentity,
    pub origin: Option<String>,
    pub api_key: Option<String>,
    pub user_agent: String,
    pub signature: Option<String>,
    pub timestamp: Option<String>,
    pub raw_body: Bytes,
    pub now_ms: u64,
}

/// A terminal gate decision.  `error` is the machine-readable string sent
/// to the client; the human-readable companion message is attached at the
/// response edge.  `rejected_by` names the gate that produced the decision.
#[derive(Clone, Debug)]
pub struct Rejection {
    pub status: u16,
    pub error: String,
    pub retry_after: Option<u64>,
    pub rejected_by: Option<String>,
}

impl Rejection {
    pub fn new(status: u16, error: impl Into<String>) -> Self {
        Rejection {
            status,
            error: error.into(),
            retry_after: None,
            rejected_by: None,
        }
    }
}

/// Trait implemented by all access gates.  Returning `Some(Rejection)`
/// terminates request processing; `None` passes control to the next gate.
#[async_trait::async_trait]
pub trait Gate: Send + Sync {
    fn name(&self) -> &str;
    async fn eval(&self, ctx: &GateContext) -> Option<Rejection>;
}

/// Gate instances available for pipeline assembly.  A gate is `None` when
/// its configuration is absent; naming it in the order list then only
/// logs a warning, matching how unknown names are handled.
pub struct GateSet {
    pub origin: Option<Arc<OriginGate>>,
    pub signature: Option<Arc<SignatureGate>>,
    pub rate_limit: Option<Arc<RateLimitGate>>,
}

/// The gate pipeline runs registered gates in order and stops after the
/// first rejection.
#[derive(Clone)]
pub struct GatePipeline {
    gates: Vec<Arc<dyn Gate>>,
}

impl GatePipeline {
    pub fn new(order: &[String], set: GateSet) -> Self {
        let mut gates: Vec<Arc<dyn Gate>> = Vec::new();
        for name in order {
            match name.as_str() {
                "origin" => match &set.origin {
                    Some(gate) => gates.push(gate.clone()),
                    None => tracing::warn!(gate = %name, "origin guard not configured, skipping"),
                },
                "signature" => match &set.signature {
                    Some(gate) => gates.push(gate.clone()),
                    None => {
                        tracing::warn!(gate = %name, "signature verifier not configured, skipping")
                    }
                },
                "rate_limit" => match &set.rate_limit {
                    Some(gate) => gates.push(gate.clone()),
                    None => tracing::warn!(gate = %name, "rate limiter not configured, skipping"),
                },
                _ => {
                    tracing::warn!(gate = %name, "unknown gate name, skipping");
                }
            }
        }
        GatePipeline { gates }
    }

    /// Evaluate the gates against the request context.  Returns the first
    /// rejection (if any) together with per-gate timings for telemetry.
    pub async fn evaluate_with_timings(
        &self,
        ctx: &GateContext,
    ) -> (Option<Rejection>, Vec<(String, u64)>) {
        let mut timings: Vec<(String, u64)> = Vec::new();
        for gate in &self.gates {
            let name = gate.name();
            let start = Instant::now();
            let decision = gate.eval(ctx).await;
            let elapsed_ms = start.elapsed().as_millis() as u64;
            timings.push((name.to_string(), elapsed_ms));
            if let Some(mut rejection) = decision {
                if rejection.rejected_by.is_none() {
                    rejection.rejected_by = Some(name.to_string());
                }
                tracing::info!(
                    gate = %name,
                    status = rejection.status,
                    error = %rejection.error,
                    ip = %ctx.identity.ip,
                    "gate rejected request"
                );
                return (Some(rejection), timings);
            }
            tracing::trace!(gate = %name, "gate passed");
        }
        (None, timings)
    }

    /// Number of registered gates.
    pub fn len(&self) -> usize {
        self.gates.len()
    }

    /// Returns true if the pipeline has no registered gates.
    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }

    /// Names of the registered gates in evaluation order.
    pub fn names(&self) -> Vec<String> {
        self.gates.iter().map(|g| g.name().to_string()).collect()
    }
}

/// Parse the ordered gate list from the environment.  If unset, the
/// default order is returned.  Strings are trimmed and lower-cased.
pub fn parse_gate_order() -> Vec<String> {
    if let Ok(var) = std::env::var("PALISADE_GATES") {
        var.split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect()
    } else {
        vec!["origin".into(), "signature".into(), "rate_limit".into()]
    }
}
