use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use kiln_contracts::content::ContentType;
use kiln_contracts::jobs::JobStatus;
use kiln_contracts::providers::Engine;
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Map, Value};

use super::{
    api_base, classify, non_empty_env, non_empty_str, not_configured, response_json_or_error,
    ReportedFailure,
};
use crate::provider::{
    GenerateRequest, GeneratedMedia, ImageProvider, ProviderError, TaskHandle, TaskSnapshot,
    VideoProvider,
};
use crate::vocab::replicate_status;

const API_KEY_ENV: &str = "REPLICATE_API_TOKEN";
const RESERVED_OPTIONS: &[&str] = &["replicate_model", "model", "poll_interval", "regenerate"];

/// Replicate predictions, serving Flux and SDXL synchronously and Kling as a
/// polled task.
pub struct ReplicateProvider {
    engine: Engine,
    api_base: String,
    http: HttpClient,
    poll_timeout: Duration,
}

impl ReplicateProvider {
    pub fn new(engine: Engine, http: HttpClient, poll_timeout: Duration) -> Self {
        Self {
            engine,
            api_base: api_base("REPLICATE_API_BASE", "https://api.replicate.com/v1"),
            http,
            poll_timeout,
        }
    }

    fn api_key(&self) -> Result<String, ProviderError> {
        non_empty_env(API_KEY_ENV)
            .or_else(|| non_empty_env("REPLICATE_API_KEY"))
            .ok_or_else(|| not_configured(self.engine, API_KEY_ENV))
    }

    fn resolve_model(&self, request: &GenerateRequest) -> String {
        if let Some(model) = request
            .option_str("replicate_model")
            .or_else(|| request.option_str("model"))
        {
            return model.to_string();
        }
        match self.engine {
            Engine::StableDiffusion => "stability-ai/sdxl",
            Engine::Kling => "kwaivgi/kling-v1.6-standard",
            _ => "black-forest-labs/flux-1.1-pro",
        }
        .to_string()
    }

    fn aspect_ratio(content_type: ContentType) -> &'static str {
        match content_type {
            ContentType::Story | ContentType::Reel => "9:16",
            ContentType::Video => "16:9",
            _ => "1:1",
        }
    }

    fn poll_interval(request: &GenerateRequest) -> Duration {
        let seconds = request
            .options
            .get("poll_interval")
            .and_then(Value::as_f64)
            .unwrap_or(1.0)
            .clamp(0.2, 5.0);
        Duration::from_secs_f64(seconds)
    }

    fn build_input(request: &GenerateRequest) -> Map<String, Value> {
        let mut input = Map::new();
        input.insert("prompt".to_string(), json!(request.prompt.trim()));
        input.insert(
            "aspect_ratio".to_string(),
            json!(Self::aspect_ratio(request.content_type)),
        );
        for (key, value) in &request.options {
            let normalized = key.trim().to_ascii_lowercase();
            if RESERVED_OPTIONS.contains(&normalized.as_str()) || input.contains_key(key) {
                continue;
            }
            input.insert(key.clone(), value.clone());
        }
        input
    }

    fn create_prediction(
        &self,
        api_key: &str,
        request: &GenerateRequest,
        wait: bool,
    ) -> Result<Value> {
        let endpoint = format!("{}/predictions", self.api_base);
        let payload = json!({
            "model": self.resolve_model(request),
            "input": Value::Object(Self::build_input(request)),
        });
        let mut call = self.http.post(&endpoint).bearer_auth(api_key);
        if wait {
            call = call.header("Prefer", "wait");
        }
        let response = call
            .json(&payload)
            .send()
            .with_context(|| format!("Replicate request failed ({endpoint})"))?;
        response_json_or_error("Replicate", response)
    }

    fn get_prediction(&self, api_key: &str, prediction_id: &str) -> Result<Value> {
        let endpoint = format!("{}/predictions/{}", self.api_base, prediction_id);
        let response = self
            .http
            .get(&endpoint)
            .bearer_auth(api_key)
            .send()
            .with_context(|| format!("Replicate poll request failed ({endpoint})"))?;
        response_json_or_error("Replicate poll", response)
    }

    fn poll_prediction(
        &self,
        api_key: &str,
        prediction_id: &str,
        poll_interval: Duration,
    ) -> Result<Value> {
        let started = Instant::now();
        loop {
            let payload = self.get_prediction(api_key, prediction_id)?;
            match replicate_status(&prediction_status(&payload)) {
                Some(JobStatus::Completed) => return Ok(payload),
                Some(JobStatus::Failed) => return Err(prediction_failure(&payload)),
                _ => {}
            }
            if started.elapsed() + poll_interval >= self.poll_timeout {
                bail!(
                    "Replicate polling timed out after {:.1}s",
                    self.poll_timeout.as_secs_f64()
                );
            }
            thread::sleep(poll_interval);
        }
    }

    fn generate_image(&self, api_key: &str, request: &GenerateRequest) -> Result<GeneratedMedia> {
        let mut prediction = self.create_prediction(api_key, request, true)?;
        match replicate_status(&prediction_status(&prediction)) {
            Some(JobStatus::Completed) => {}
            Some(JobStatus::Queued) | Some(JobStatus::Processing) => {
                let prediction_id = non_empty_str(prediction.get("id"))
                    .ok_or_else(|| anyhow!("Replicate prediction missing id"))?;
                prediction =
                    self.poll_prediction(api_key, &prediction_id, Self::poll_interval(request))?;
            }
            _ => return Err(prediction_failure(&prediction)),
        }

        let mut urls = Vec::new();
        if let Some(output) = prediction.get("output") {
            extract_output_urls(output, &mut urls);
        }
        let mut provider_response = Map::new();
        if let Some(id) = prediction.get("id") {
            provider_response.insert("prediction_id".to_string(), id.clone());
        }
        if let Some(metrics) = prediction.get("metrics") {
            provider_response.insert("metrics".to_string(), metrics.clone());
        }
        let mut urls = urls.into_iter();
        Ok(GeneratedMedia {
            media_url: urls.next().unwrap_or_default(),
            thumbnail_url: None,
            width: None,
            height: None,
            provider_response,
        })
    }
}

fn prediction_status(payload: &Value) -> String {
    payload
        .get("status")
        .and_then(Value::as_str)
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default()
}

fn prediction_failure(payload: &Value) -> anyhow::Error {
    let reason = non_empty_str(payload.get("error"))
        .unwrap_or_else(|| format!("prediction ended with status '{}'", prediction_status(payload)));
    ReportedFailure {
        provider: "Replicate".to_string(),
        reason,
    }
    .into()
}

fn extract_output_urls(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(url) => {
            let trimmed = url.trim();
            if !trimmed.is_empty()
                && trimmed.starts_with("http")
                && !out.iter().any(|existing| existing == trimmed)
            {
                out.push(trimmed.to_string());
            }
        }
        Value::Array(rows) => {
            for row in rows {
                extract_output_urls(row, out);
            }
        }
        Value::Object(obj) => {
            for key in ["url", "urls", "output"] {
                if let Some(nested) = obj.get(key) {
                    extract_output_urls(nested, out);
                }
            }
        }
        _ => {}
    }
}

fn snapshot_from_prediction(payload: &Value) -> TaskSnapshot {
    let mut urls = Vec::new();
    if let Some(output) = payload.get("output") {
        extract_output_urls(output, &mut urls);
    }
    let mut urls = urls.into_iter();
    TaskSnapshot {
        raw_status: prediction_status(payload),
        progress: None,
        eta_seconds: None,
        media_url: urls.next(),
        thumbnail_url: urls.next(),
        error: payload.get("error").and_then(|error| match error {
            Value::Null => None,
            Value::String(text) => Some(text.clone()),
            other => Some(other.to_string()),
        }),
    }
}

impl ImageProvider for ReplicateProvider {
    fn engine(&self) -> Engine {
        self.engine
    }

    fn generate(&self, request: &GenerateRequest) -> Result<GeneratedMedia, ProviderError> {
        let api_key = self.api_key()?;
        self.generate_image(&api_key, request)
            .map_err(|err| classify(self.engine, err))
    }
}

impl VideoProvider for ReplicateProvider {
    fn engine(&self) -> Engine {
        self.engine
    }

    fn create_task(&self, request: &GenerateRequest) -> Result<TaskHandle, ProviderError> {
        let api_key = self.api_key()?;
        let prediction = self
            .create_prediction(&api_key, request, false)
            .map_err(|err| classify(self.engine, err))?;
        let external_task_id =
            non_empty_str(prediction.get("id")).ok_or_else(|| ProviderError::Malformed {
                engine: self.engine,
                message: "Replicate prediction missing id".to_string(),
            })?;
        Ok(TaskHandle {
            external_task_id,
            raw_status: prediction_status(&prediction),
        })
    }

    fn task_status(&self, external_task_id: &str) -> Result<TaskSnapshot, ProviderError> {
        let api_key = self.api_key()?;
        let prediction = self
            .get_prediction(&api_key, external_task_id)
            .map_err(|err| classify(self.engine, err))?;
        Ok(snapshot_from_prediction(&prediction))
    }

    fn normalize_status(&self, raw: &str) -> Option<JobStatus> {
        replicate_status(raw)
    }
}
