use std::env;
use std::fs;

use anyhow::{anyhow, Context, Result};

use crate::challenge::DEFAULT_MIN_SCORE;
use crate::filter::PatternConfig;
use crate::gates::parse_gate_order;
use crate::gates::rate_limit::QuotaPolicy;
use crate::gates::signature::DEFAULT_MAX_AGE_SECS;
use crate::relay::{DEFAULT_MODEL, DEFAULT_UPSTREAM_URL};

#[derive(Debug, Clone)]
pub struct RotationConfig {
    pub max_bytes: Option<u64>,
    pub keep: usize,
    pub compress: bool,
}

/// Challenge-verification settings.  Present only when the deployment
/// requires a challenge token on every chat request.
#[derive(Debug, Clone)]
pub struct ChallengeConfig {
    pub url: String,
    pub site_key: String,
    pub min_score: f32,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub patterns: PatternConfig,
    pub gate_order: Vec<String>,
    pub allowed_origins: Vec<String>,
    pub edge_api_key: Option<String>,
    pub signing_secret: Option<String>,
    pub signature_max_age_secs: u64,
    pub quota: QuotaPolicy,
    pub upstream_url: String,
    pub upstream_api_key: Option<String>,
    pub upstream_model: String,
    pub upstream_timeout_ms: u64,
    pub persona: String,
    pub challenge: Option<ChallengeConfig>,
    pub max_request_bytes: Option<usize>,
    pub log_file: Option<String>,
    pub rotation: RotationConfig,
}

impl AppConfig {
    /// Build the configuration from environment variables.  Reads, among
    /// others:
    ///
    /// * `PALISADE_FILTER_CONFIG` (optional) – path to a JSON file with the
    ///   pattern lists and agent signatures.
    /// * `PALISADE_GATES` (optional) – comma separated gate names in order.
    /// * `PERSONA_FILE` (required) – path to the persona configuration text.
    /// * `LOG_FILE` (optional) – path for newline-delimited decision records.
    pub fn from_env() -> Result<Self> {
        let patterns = if let Ok(path) = env::var("PALISADE_FILTER_CONFIG") {
            let content = fs::read_to_string(&path).with_context(|| {
                format!(
                    "Failed to read PALISADE_FILTER_CONFIG '{}': file unreadable",
                    path
                )
            })?;
            serde_json::from_str::<PatternConfig>(&content).with_context(|| {
                format!(
                    "Failed to parse PALISADE_FILTER_CONFIG '{}': invalid JSON configuration",
                    path
                )
            })?
        } else {
            PatternConfig::default()
        };

        let gate_order = parse_gate_order();

        let allowed_origins = env::var("ALLOWED_ORIGINS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim())
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let edge_api_key = env::var("EDGE_API_KEY").ok().filter(|s| !s.is_empty());
        let signing_secret = env::var("SIGNING_SECRET").ok().filter(|s| !s.is_empty());
        let signature_max_age_secs =
            parse_optional_u64("SIGNATURE_MAX_AGE_SECS")?.unwrap_or(DEFAULT_MAX_AGE_SECS);

        let defaults = QuotaPolicy::default();
        let quota = QuotaPolicy {
            window_ms: parse_optional_u64("RATE_WINDOW_SECS")?
                .map(|secs| secs * 1000)
                .unwrap_or(defaults.window_ms),
            max_requests: parse_optional_u64("RATE_MAX_REQUESTS")?
                .map(|v| v as u32)
                .unwrap_or(defaults.max_requests),
            strike_max_requests: parse_optional_u64("RATE_STRIKE_MAX_REQUESTS")?
                .map(|v| v as u32)
                .unwrap_or(defaults.strike_max_requests),
            strike_threshold: parse_optional_u64("RATE_STRIKE_THRESHOLD")?
                .map(|v| v as u32)
                .unwrap_or(defaults.strike_threshold),
            ..defaults
        };

        let upstream_url =
            env::var("UPSTREAM_URL").unwrap_or_else(|_| DEFAULT_UPSTREAM_URL.to_string());
        // GROQ_API_KEY is accepted as a fallback for deployments migrated
        // from the original functions.
        let upstream_api_key = env::var("UPSTREAM_API_KEY")
            .or_else(|_| env::var("GROQ_API_KEY"))
            .ok()
            .filter(|s| !s.is_empty());
        let upstream_model =
            env::var("UPSTREAM_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        let upstream_timeout_ms = parse_optional_u64("UPSTREAM_TIMEOUT_MS")?.unwrap_or(10_000);

        let persona_path = env::var("PERSONA_FILE")
            .map_err(|_| anyhow!("PERSONA_FILE must point to the persona configuration text"))?;
        let persona = fs::read_to_string(&persona_path)
            .with_context(|| format!("Failed to read PERSONA_FILE '{}'", persona_path))?;

        let challenge = challenge_from_env()?;

        let max_request_bytes =
            parse_optional_u64("PALISADE_MAX_REQUEST_BYTES")?.map(|v| v as usize);

        let log_file = env::var("LOG_FILE").ok();
        let rotation = RotationConfig {
            max_bytes: parse_optional_u64("LOG_MAX_BYTES")?,
            keep: parse_optional_u64("LOG_ROTATE_KEEP")?.unwrap_or(1) as usize,
            compress: parse_bool_env("LOG_ROTATE_COMPRESS")?.unwrap_or(false),
        };

        Ok(Self {
            patterns,
            gate_order,
            allowed_origins,
            edge_api_key,
            signing_secret,
            signature_max_age_secs,
            quota,
            upstream_url,
            upstream_api_key,
            upstream_model,
            upstream_timeout_ms,
            persona,
            challenge,
            max_request_bytes,
            log_file,
            rotation,
        })
    }
}

fn challenge_from_env() -> Result<Option<ChallengeConfig>> {
    let site_key = env::var("RECAPTCHA_SITE_KEY").ok().filter(|s| !s.is_empty());
    let url_override = env::var("RECAPTCHA_URL").ok().filter(|s| !s.is_empty());
    let project_id = env::var("RECAPTCHA_PROJECT_ID").ok().filter(|s| !s.is_empty());
    let api_key = env::var("RECAPTCHA_API_KEY").ok().filter(|s| !s.is_empty());

    let Some(site_key) = site_key else {
        if url_override.is_some() || project_id.is_some() {
            return Err(anyhow!(
                "RECAPTCHA_SITE_KEY is required when challenge verification is configured"
            ));
        }
        return Ok(None);
    };

    let url = match (url_override, project_id, api_key) {
        (Some(url), _, _) => url,
        (None, Some(project), Some(key)) => {
            crate::challenge::ChallengeVerifier::assessment_url(&project, &key)
        }
        _ => {
            return Err(anyhow!(
                "challenge verification needs RECAPTCHA_URL or RECAPTCHA_PROJECT_ID + RECAPTCHA_API_KEY"
            ))
        }
    };

    let min_score = parse_optional_f32("CHALLENGE_MIN_SCORE")?.unwrap_or(DEFAULT_MIN_SCORE);
    let timeout_ms = parse_optional_u64("CHALLENGE_TIMEOUT_MS")?.unwrap_or(5_000);

    Ok(Some(ChallengeConfig {
        url,
        site_key,
        min_score,
        timeout_ms,
    }))
}

fn parse_optional_u64(var: &str) -> Result<Option<u64>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a positive integer", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_optional_f32(var: &str) -> Result<Option<f32>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<f32>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a number", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool_env(var: &str) -> Result<Option<bool>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value)
            .map(Some)
            .ok_or_else(|| anyhow!("{} must be a boolean (true/false/1/0)", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
