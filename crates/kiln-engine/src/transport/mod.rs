//! HTTP transports for the hosted generation APIs.
//!
//! Each client speaks `anyhow` internally and is classified into a
//! [`ProviderError`] at the trait boundary.

mod luma;
mod openai;
mod replicate;
mod runway;

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use kiln_contracts::providers::Engine;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::Value;

pub use luma::LumaProvider;
pub use openai::OpenAiImageProvider;
pub use replicate::ReplicateProvider;
pub use runway::RunwayProvider;

use crate::provider::{ProviderError, ProviderRegistry};

/// Non-2xx answer from a provider API.
#[derive(Debug, thiserror::Error)]
#[error("{provider} request failed ({code}): {body}")]
pub struct HttpStatusError {
    pub provider: String,
    pub code: u16,
    pub body: String,
}

impl HttpStatusError {
    fn is_transient(&self) -> bool {
        self.code == 429 || self.code == 408 || self.code >= 500
    }
}

/// The provider accepted the request and then reported the generation as
/// failed.
#[derive(Debug, thiserror::Error)]
#[error("{provider} reported the generation failed: {reason}")]
pub struct ReportedFailure {
    pub provider: String,
    pub reason: String,
}

/// Gap left between a transport's own deadline and the outer bound applied by
/// `bounded_call`, so the HTTP layer gives up before the caller moves on.
const TRANSPORT_DEADLINE_SLACK: Duration = Duration::from_secs(2);

pub(crate) fn transport_deadline(bound: Duration) -> Duration {
    bound
        .checked_sub(TRANSPORT_DEADLINE_SLACK)
        .filter(|deadline| !deadline.is_zero())
        .unwrap_or(bound / 2)
}

/// Registry with every hosted transport, each finishing inside `timeout`.
pub fn default_registry(timeout: Duration) -> Result<ProviderRegistry> {
    let timeout = transport_deadline(timeout);
    let http = http_client(timeout)?;
    let mut providers = ProviderRegistry::new();
    providers.register_image(OpenAiImageProvider::new(http.clone()));
    providers.register_image(ReplicateProvider::new(Engine::Flux, http.clone(), timeout));
    providers.register_image(ReplicateProvider::new(
        Engine::StableDiffusion,
        http.clone(),
        timeout,
    ));
    providers.register_video(ReplicateProvider::new(Engine::Kling, http.clone(), timeout));
    providers.register_video(RunwayProvider::new(http.clone()));
    providers.register_video(LumaProvider::new(http));
    Ok(providers)
}

pub(crate) fn http_client(timeout: Duration) -> Result<HttpClient> {
    HttpClient::builder()
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(10)))
        .build()
        .context("failed to build provider HTTP client")
}

pub(crate) fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        return Err(HttpStatusError {
            provider: provider.to_string(),
            code,
            body: truncate_text(&body, 512),
        }
        .into());
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

/// Sorts a transport failure into the orchestrator's retry classes.
pub(crate) fn classify(engine: Engine, err: anyhow::Error) -> ProviderError {
    let message = error_chain_text(&err, 1024);
    if let Some(status) = err.downcast_ref::<HttpStatusError>() {
        if status.is_transient() {
            return ProviderError::Transient { engine, message };
        }
        return ProviderError::Rejected { engine, message };
    }
    if err.downcast_ref::<ReportedFailure>().is_some() {
        return ProviderError::Rejected { engine, message };
    }
    if is_retryable_transport_error(&err) {
        return ProviderError::Transient { engine, message };
    }
    ProviderError::Malformed { engine, message }
}

pub(crate) fn not_configured(engine: Engine, env_key: &str) -> ProviderError {
    ProviderError::NotConfigured {
        engine,
        message: format!("{env_key} not set"),
    }
}

fn is_retryable_transport_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<reqwest::Error>()
            .map(|reqwest_err| {
                reqwest_err.is_timeout() || reqwest_err.is_connect() || reqwest_err.is_request()
            })
            .unwrap_or(false)
    })
}

fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn api_base(env_key: &str, default: &str) -> String {
    non_empty_env(env_key)
        .map(|value| value.trim_end_matches('/').to_string())
        .unwrap_or_else(|| default.to_string())
}

pub(crate) fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

pub(crate) fn parse_dims(size: &str) -> Option<(u32, u32)> {
    let normalized = size.trim().to_ascii_lowercase();
    let (w, h) = normalized.split_once('x')?;
    let w = w.trim().parse::<u32>().ok()?;
    let h = h.trim().parse::<u32>().ok()?;
    Some((w.max(1), h.max(1)))
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    use super::*;

    fn status_error(code: u16) -> anyhow::Error {
        HttpStatusError {
            provider: "Luma".to_string(),
            code,
            body: "{}".to_string(),
        }
        .into()
    }

    #[test]
    fn server_errors_and_throttling_are_transient() {
        for code in [429, 500, 502, 503] {
            assert!(classify(Engine::Luma, status_error(code)).is_transient(), "{code}");
        }
    }

    #[test]
    fn client_errors_are_rejections() {
        let err = classify(Engine::Luma, status_error(400));
        assert_eq!(err.kind(), "rejected");
        assert!(err.to_string().contains("Luma request failed (400)"));
    }

    #[test]
    fn context_wrapped_status_is_still_classified() {
        let err = status_error(503).context("Luma status poll failed");
        assert!(classify(Engine::Luma, err).is_transient());
    }

    #[test]
    fn reported_failures_are_rejections() {
        let err = anyhow::Error::from(ReportedFailure {
            provider: "Replicate".to_string(),
            reason: "NSFW content detected".to_string(),
        });
        let classified = classify(Engine::Flux, err);
        assert_eq!(classified.kind(), "rejected");
        assert!(classified.to_string().contains("NSFW content detected"));
    }

    #[test]
    fn other_failures_are_malformed() {
        let err = classify(Engine::Runway, anyhow!("Runway response missing task id"));
        assert_eq!(err.kind(), "malformed");
    }

    #[test]
    fn parse_dims_reads_width_and_height() {
        assert_eq!(parse_dims("1024x1792"), Some((1024, 1792)));
        assert_eq!(parse_dims("square"), None);
    }

    #[test]
    fn transports_give_up_before_the_outer_bound() {
        assert_eq!(
            transport_deadline(Duration::from_secs(60)),
            Duration::from_secs(58)
        );
        assert_eq!(
            transport_deadline(Duration::from_secs(2)),
            Duration::from_secs(1)
        );
        assert_eq!(
            transport_deadline(Duration::from_millis(500)),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn truncate_marks_cut_text() {
        assert_eq!(truncate_text("abcdef", 3), "abc…");
        assert_eq!(truncate_text("abc", 3), "abc");
    }
}
