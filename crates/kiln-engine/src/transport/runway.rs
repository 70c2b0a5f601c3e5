use anyhow::{Context, Result};
use kiln_contracts::content::ContentType;
use kiln_contracts::jobs::JobStatus;
use kiln_contracts::providers::Engine;
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Map, Value};

use super::{api_base, classify, non_empty_env, non_empty_str, not_configured, response_json_or_error};
use crate::provider::{GenerateRequest, ProviderError, TaskHandle, TaskSnapshot, VideoProvider};
use crate::vocab::runway_status;

const API_KEY_ENV: &str = "RUNWAY_API_KEY";
const API_VERSION: &str = "2024-11-06";

/// Runway Gen-3/Gen-4 tasks.
pub struct RunwayProvider {
    api_base: String,
    http: HttpClient,
}

impl RunwayProvider {
    pub fn new(http: HttpClient) -> Self {
        Self {
            api_base: api_base("RUNWAY_API_BASE", "https://api.dev.runwayml.com"),
            http,
        }
    }

    fn api_key() -> Result<String, ProviderError> {
        non_empty_env(API_KEY_ENV).ok_or_else(|| not_configured(Engine::Runway, API_KEY_ENV))
    }

    fn ratio(content_type: ContentType) -> &'static str {
        match content_type {
            ContentType::Reel | ContentType::Story => "720:1280",
            _ => "1280:720",
        }
    }

    /// Image-to-video when the request carries a `prompt_image`, text-to-video
    /// otherwise.
    fn build_payload(request: &GenerateRequest) -> (&'static str, Map<String, Value>) {
        let mut payload = Map::new();
        payload.insert("promptText".to_string(), json!(request.prompt.trim()));
        payload.insert("ratio".to_string(), json!(Self::ratio(request.content_type)));
        payload.insert(
            "duration".to_string(),
            request
                .options
                .get("duration")
                .cloned()
                .unwrap_or_else(|| json!(5)),
        );
        payload.insert(
            "model".to_string(),
            json!(request.option_str("model").unwrap_or("gen4_turbo")),
        );
        match request.option_str("prompt_image") {
            Some(image) => {
                payload.insert("promptImage".to_string(), json!(image));
                ("image_to_video", payload)
            }
            None => ("text_to_video", payload),
        }
    }

    fn post_task(&self, api_key: &str, request: &GenerateRequest) -> Result<Value> {
        let (route, payload) = Self::build_payload(request);
        let endpoint = format!("{}/v1/{}", self.api_base, route);
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(api_key)
            .header("X-Runway-Version", API_VERSION)
            .json(&Value::Object(payload))
            .send()
            .with_context(|| format!("Runway request failed ({endpoint})"))?;
        response_json_or_error("Runway", response)
    }

    fn get_task(&self, api_key: &str, task_id: &str) -> Result<Value> {
        let endpoint = format!("{}/v1/tasks/{}", self.api_base, task_id);
        let response = self
            .http
            .get(&endpoint)
            .bearer_auth(api_key)
            .header("X-Runway-Version", API_VERSION)
            .send()
            .with_context(|| format!("Runway status request failed ({endpoint})"))?;
        response_json_or_error("Runway status", response)
    }
}

fn snapshot_from_task(payload: &Value) -> TaskSnapshot {
    let output = payload.get("output").and_then(Value::as_array);
    let first_output = output.and_then(|rows| non_empty_str(rows.first()));
    // Runway reports progress as a 0..1 fraction.
    let progress = payload
        .get("progress")
        .and_then(Value::as_f64)
        .map(|fraction| (fraction.clamp(0.0, 1.0) * 100.0).round() as u8);
    TaskSnapshot {
        raw_status: non_empty_str(payload.get("status")).unwrap_or_default(),
        progress,
        eta_seconds: None,
        media_url: first_output,
        thumbnail_url: None,
        error: non_empty_str(payload.get("failure")),
    }
}

impl VideoProvider for RunwayProvider {
    fn engine(&self) -> Engine {
        Engine::Runway
    }

    fn create_task(&self, request: &GenerateRequest) -> Result<TaskHandle, ProviderError> {
        let api_key = Self::api_key()?;
        let task = self
            .post_task(&api_key, request)
            .map_err(|err| classify(Engine::Runway, err))?;
        let external_task_id =
            non_empty_str(task.get("id")).ok_or_else(|| ProviderError::Malformed {
                engine: Engine::Runway,
                message: "Runway response missing task id".to_string(),
            })?;
        Ok(TaskHandle {
            external_task_id,
            raw_status: non_empty_str(task.get("status")).unwrap_or_else(|| "PENDING".to_string()),
        })
    }

    fn task_status(&self, external_task_id: &str) -> Result<TaskSnapshot, ProviderError> {
        let api_key = Self::api_key()?;
        let task = self
            .get_task(&api_key, external_task_id)
            .map_err(|err| classify(Engine::Runway, err))?;
        Ok(snapshot_from_task(&task))
    }

    fn normalize_status(&self, raw: &str) -> Option<JobStatus> {
        runway_status(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(options: Map<String, Value>) -> GenerateRequest {
        GenerateRequest {
            content_draft_id: "draft".to_string(),
            content_type: ContentType::Reel,
            prompt: "city timelapse".to_string(),
            tone: None,
            goal: None,
            options,
        }
    }

    #[test]
    fn text_prompt_routes_to_text_to_video() {
        let (route, payload) = RunwayProvider::build_payload(&request(Map::new()));
        assert_eq!(route, "text_to_video");
        assert_eq!(payload.get("ratio"), Some(&json!("720:1280")));
        assert_eq!(payload.get("duration"), Some(&json!(5)));
    }

    #[test]
    fn prompt_image_routes_to_image_to_video() {
        let mut options = Map::new();
        options.insert("prompt_image".to_string(), json!("https://cdn.example/seed.png"));
        let (route, payload) = RunwayProvider::build_payload(&request(options));
        assert_eq!(route, "image_to_video");
        assert_eq!(
            payload.get("promptImage"),
            Some(&json!("https://cdn.example/seed.png"))
        );
    }

    #[test]
    fn snapshot_scales_progress_fraction() {
        let snapshot = snapshot_from_task(&json!({
            "id": "t1",
            "status": "RUNNING",
            "progress": 0.42
        }));
        assert_eq!(snapshot.raw_status, "RUNNING");
        assert_eq!(snapshot.progress, Some(42));
        assert_eq!(snapshot.media_url, None);

        let done = snapshot_from_task(&json!({
            "status": "SUCCEEDED",
            "output": ["https://cdn.example/out.mp4"]
        }));
        assert_eq!(done.media_url.as_deref(), Some("https://cdn.example/out.mp4"));
    }
}
