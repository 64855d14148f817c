//! Bot/origin guarding: allow-listed origins, a shared edge API key and
//! automation user-agent signatures.

use regex::RegexBuilder;

use super::{Gate, GateContext, Rejection};
use crate::util::constant_time_eq;

/// Rejects requests whose declared origin, shared API key or user-agent
/// fail the configured checks.  Each failure kind carries its own status
/// and error string.
pub struct OriginGate {
    allowed_origins: Vec<String>,
    api_key: Option<String>,
    agent_signatures: Vec<regex::Regex>,
}

impl OriginGate {
    /// `signature_patterns` are regex fragments matched case-insensitively
    /// against the user-agent; invalid patterns are skipped with a warning
    /// rather than failing startup.
    pub fn new(
        allowed_origins: Vec<String>,
        api_key: Option<String>,
        signature_patterns: &[String],
    ) -> Self {
        let agent_signatures = signature_patterns
            .iter()
            .filter_map(|p| {
                match RegexBuilder::new(p).case_insensitive(true).build() {
                    Ok(re) => Some(re),
                    Err(err) => {
                        tracing::warn!(pattern = %p, error = %err, "invalid agent signature, skipping");
                        None
                    }
                }
            })
            .collect();
        OriginGate {
            allowed_origins,
            api_key,
            agent_signatures,
        }
    }

    fn suspicious_agent(&self, user_agent: &str) -> bool {
        self.agent_signatures.iter().any(|re| re.is_match(user_agent))
    }
}

#[async_trait::async_trait]
impl Gate for OriginGate {
    fn name(&self) -> &str {
        "origin"
    }

    async fn eval(&self, ctx: &GateContext) -> Option<Rejection> {
        if !self.allowed_origins.is_empty() {
            let origin = ctx.origin.as_deref().unwrap_or("");
            if !self.allowed_origins.iter().any(|o| o == origin) {
                return Some(Rejection::new(403, "Access denied: Invalid origin"));
            }
        }
        if let Some(expected) = &self.api_key {
            let supplied = ctx.api_key.as_deref().unwrap_or("");
            if !constant_time_eq(supplied.as_bytes(), expected.as_bytes()) {
                return Some(Rejection::new(401, "Access denied: Invalid API key"));
            }
        }
        if self.suspicious_agent(&ctx.user_agent) {
            return Some(Rejection::new(403, "Access denied: Suspicious user agent"));
        }
        None
    }
}
