//! Bot-challenge verification against a reCAPTCHA-Enterprise-style
//! assessment service.
//!
//! The verifier posts the client-supplied token to the assessment endpoint
//! and interprets the result: an invalid token or a mismatched action is
//! reported as `None` (unauthenticated), otherwise the risk score in
//! `[0.0, 1.0]` is returned (0 = likely automated, 1 = likely human).
//! The score policy lives with the caller.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Action name expected on chat challenge tokens.
pub const EXPECTED_ACTION: &str = "chatbot";

/// Scores below this are treated as suspected automation.
pub const DEFAULT_MIN_SCORE: f32 = 0.3;

#[derive(Debug, Error)]
pub enum ChallengeError {
    #[error("challenge service request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("challenge service returned status {0}")]
    Status(reqwest::StatusCode),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AssessmentEvent<'a> {
    token: &'a str,
    site_key: &'a str,
    expected_action: &'a str,
}

#[derive(Serialize)]
struct AssessmentRequest<'a> {
    event: AssessmentEvent<'a>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct TokenProperties {
    valid: bool,
    invalid_reason: Option<String>,
    action: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RiskAnalysis {
    score: f32,
    reasons: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Assessment {
    token_properties: TokenProperties,
    risk_analysis: RiskAnalysis,
}

/// Client for the external assessment service.  The endpoint URL is
/// configurable so tests can stand in a local mock.
pub struct ChallengeVerifier {
    client: reqwest::Client,
    url: String,
    site_key: String,
    min_score: f32,
}

impl ChallengeVerifier {
    pub fn new(url: String, site_key: String, min_score: f32, timeout_ms: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .expect("failed to build reqwest client");
        ChallengeVerifier {
            client,
            url,
            site_key,
            min_score,
        }
    }

    /// Assessment endpoint for a Google project/API-key pair.
    pub fn assessment_url(project_id: &str, api_key: &str) -> String {
        format!(
            "https://recaptchaenterprise.googleapis.com/v1/projects/{project_id}/assessments?key={api_key}"
        )
    }

    /// Returns `None` when the service reports the token invalid or the
    /// action does not match; otherwise the risk score.  Transport and
    /// non-2xx failures surface as errors for the caller to map to 500.
    pub async fn assess(&self, token: &str) -> Result<Option<f32>, ChallengeError> {
        let request = AssessmentRequest {
            event: AssessmentEvent {
                token,
                site_key: &self.site_key,
                expected_action: EXPECTED_ACTION,
            },
        };
        let response = self.client.post(&self.url).json(&request).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ChallengeError::Status(status));
        }
        let assessment: Assessment = response.json().await?;
        if !assessment.token_properties.valid {
            tracing::info!(
                reason = ?assessment.token_properties.invalid_reason,
                "challenge token invalid"
            );
            return Ok(None);
        }
        if assessment.token_properties.action.as_deref() != Some(EXPECTED_ACTION) {
            tracing::info!(
                action = ?assessment.token_properties.action,
                expected = EXPECTED_ACTION,
                "challenge action does not match the expected action"
            );
            return Ok(None);
        }
        for reason in &assessment.risk_analysis.reasons {
            tracing::debug!(%reason, "challenge risk reason");
        }
        Ok(Some(assessment.risk_analysis.score))
    }

    pub fn min_score(&self) -> f32 {
        self.min_score
    }
}
