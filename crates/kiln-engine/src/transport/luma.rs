use anyhow::{Context, Result};
use kiln_contracts::content::ContentType;
use kiln_contracts::jobs::JobStatus;
use kiln_contracts::providers::Engine;
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Map, Value};

use super::{api_base, classify, non_empty_env, non_empty_str, not_configured, response_json_or_error};
use crate::provider::{GenerateRequest, ProviderError, TaskHandle, TaskSnapshot, VideoProvider};
use crate::vocab::luma_status;

const API_KEY_ENV: &str = "LUMA_API_KEY";

/// Luma Dream Machine generations.
pub struct LumaProvider {
    api_base: String,
    http: HttpClient,
}

impl LumaProvider {
    pub fn new(http: HttpClient) -> Self {
        Self {
            api_base: api_base("LUMA_API_BASE", "https://api.lumalabs.ai/dream-machine/v1"),
            http,
        }
    }

    fn api_key() -> Result<String, ProviderError> {
        non_empty_env(API_KEY_ENV).ok_or_else(|| not_configured(Engine::Luma, API_KEY_ENV))
    }

    fn build_payload(request: &GenerateRequest) -> Map<String, Value> {
        let mut payload = Map::new();
        payload.insert("prompt".to_string(), json!(request.prompt.trim()));
        let aspect = match request.content_type {
            ContentType::Reel | ContentType::Story => "9:16",
            _ => "16:9",
        };
        payload.insert(
            "aspect_ratio".to_string(),
            json!(request.option_str("aspect_ratio").unwrap_or(aspect)),
        );
        payload.insert(
            "model".to_string(),
            json!(request.option_str("model").unwrap_or("ray-2")),
        );
        if let Some(looped) = request.options.get("loop").and_then(Value::as_bool) {
            payload.insert("loop".to_string(), json!(looped));
        }
        payload
    }

    fn post_generation(&self, api_key: &str, request: &GenerateRequest) -> Result<Value> {
        let endpoint = format!("{}/generations", self.api_base);
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(api_key)
            .json(&Value::Object(Self::build_payload(request)))
            .send()
            .with_context(|| format!("Luma request failed ({endpoint})"))?;
        response_json_or_error("Luma", response)
    }

    fn get_generation(&self, api_key: &str, generation_id: &str) -> Result<Value> {
        let endpoint = format!("{}/generations/{}", self.api_base, generation_id);
        let response = self
            .http
            .get(&endpoint)
            .bearer_auth(api_key)
            .send()
            .with_context(|| format!("Luma status request failed ({endpoint})"))?;
        response_json_or_error("Luma status", response)
    }
}

fn snapshot_from_generation(payload: &Value) -> TaskSnapshot {
    let assets = payload.get("assets");
    TaskSnapshot {
        raw_status: non_empty_str(payload.get("state")).unwrap_or_default(),
        progress: None,
        eta_seconds: None,
        media_url: non_empty_str(assets.and_then(|assets| assets.get("video"))),
        thumbnail_url: non_empty_str(assets.and_then(|assets| assets.get("image"))),
        error: non_empty_str(payload.get("failure_reason")),
    }
}

impl VideoProvider for LumaProvider {
    fn engine(&self) -> Engine {
        Engine::Luma
    }

    fn create_task(&self, request: &GenerateRequest) -> Result<TaskHandle, ProviderError> {
        let api_key = Self::api_key()?;
        let generation = self
            .post_generation(&api_key, request)
            .map_err(|err| classify(Engine::Luma, err))?;
        let external_task_id =
            non_empty_str(generation.get("id")).ok_or_else(|| ProviderError::Malformed {
                engine: Engine::Luma,
                message: "Luma response missing generation id".to_string(),
            })?;
        Ok(TaskHandle {
            external_task_id,
            raw_status: non_empty_str(generation.get("state"))
                .unwrap_or_else(|| "queued".to_string()),
        })
    }

    fn task_status(&self, external_task_id: &str) -> Result<TaskSnapshot, ProviderError> {
        let api_key = Self::api_key()?;
        let generation = self
            .get_generation(&api_key, external_task_id)
            .map_err(|err| classify(Engine::Luma, err))?;
        Ok(snapshot_from_generation(&generation))
    }

    fn normalize_status(&self, raw: &str) -> Option<JobStatus> {
        luma_status(raw)
    }
}
