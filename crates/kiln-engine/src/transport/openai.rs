use anyhow::{anyhow, Context, Result};
use kiln_contracts::content::ContentType;
use kiln_contracts::providers::Engine;
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Map, Value};

use super::{
    api_base, classify, non_empty_env, non_empty_str, not_configured, parse_dims,
    response_json_or_error,
};
use crate::provider::{GenerateRequest, GeneratedMedia, ImageProvider, ProviderError};

const API_KEY_ENV: &str = "OPENAI_API_KEY";

/// DALL-E 3 through the OpenAI images endpoint.
pub struct OpenAiImageProvider {
    api_base: String,
    http: HttpClient,
}

impl OpenAiImageProvider {
    pub fn new(http: HttpClient) -> Self {
        Self {
            api_base: api_base("OPENAI_API_BASE", "https://api.openai.com/v1"),
            http,
        }
    }

    fn size_for(request: &GenerateRequest) -> String {
        if let Some(size) = request.option_str("size") {
            return size.to_string();
        }
        match request.content_type {
            ContentType::Story | ContentType::Reel => "1024x1792".to_string(),
            _ => "1024x1024".to_string(),
        }
    }

    fn build_prompt(request: &GenerateRequest) -> String {
        let mut prompt = request.prompt.trim().to_string();
        if let Some(tone) = request.tone.as_deref().filter(|tone| !tone.trim().is_empty()) {
            prompt.push_str(&format!("\nTone: {}", tone.trim()));
        }
        if let Some(goal) = request.goal.as_deref().filter(|goal| !goal.trim().is_empty()) {
            prompt.push_str(&format!("\nGoal: {}", goal.trim()));
        }
        prompt
    }

    fn request_image(&self, api_key: &str, request: &GenerateRequest) -> Result<GeneratedMedia> {
        let size = Self::size_for(request);
        let mut payload = Map::new();
        payload.insert("model".to_string(), json!("dall-e-3"));
        payload.insert("prompt".to_string(), json!(Self::build_prompt(request)));
        payload.insert("n".to_string(), json!(1));
        payload.insert("size".to_string(), json!(size));
        payload.insert(
            "quality".to_string(),
            json!(request.option_str("quality").unwrap_or("standard")),
        );
        if let Some(style) = request.option_str("style") {
            payload.insert("style".to_string(), json!(style));
        }

        let endpoint = format!("{}/images/generations", self.api_base);
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(api_key)
            .json(&Value::Object(payload))
            .send()
            .with_context(|| format!("OpenAI images request failed ({endpoint})"))?;
        let body = response_json_or_error("OpenAI images", response)?;
        let first = body
            .get("data")
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .ok_or_else(|| anyhow!("OpenAI images response returned no data"))?;
        let media_url = non_empty_str(first.get("url")).unwrap_or_default();
        let (width, height) = parse_dims(&size).unzip();

        let mut provider_response = Map::new();
        if let Some(revised) = first.get("revised_prompt") {
            provider_response.insert("revised_prompt".to_string(), revised.clone());
        }
        if let Some(created) = body.get("created") {
            provider_response.insert("created".to_string(), created.clone());
        }
        Ok(GeneratedMedia {
            media_url,
            thumbnail_url: None,
            width,
            height,
            provider_response,
        })
    }
}

impl ImageProvider for OpenAiImageProvider {
    fn engine(&self) -> Engine {
        Engine::Dalle3
    }

    fn generate(&self, request: &GenerateRequest) -> Result<GeneratedMedia, ProviderError> {
        let api_key =
            non_empty_env(API_KEY_ENV).ok_or_else(|| not_configured(Engine::Dalle3, API_KEY_ENV))?;
        self.request_image(&api_key, request)
            .map_err(|err| classify(Engine::Dalle3, err))
    }
}
