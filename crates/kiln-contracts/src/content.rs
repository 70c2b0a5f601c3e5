use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ParseError;
use crate::providers::Engine;

/// Kind of media a content draft asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Image,
    Carousel,
    Story,
    Video,
    Reel,
}

/// Image-class content is generated inline; video-class content becomes a
/// tracked job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaClass {
    Image,
    Video,
}

impl ContentType {
    pub const ALL: [ContentType; 5] = [
        ContentType::Image,
        ContentType::Carousel,
        ContentType::Story,
        ContentType::Video,
        ContentType::Reel,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Image => "image",
            ContentType::Carousel => "carousel",
            ContentType::Story => "story",
            ContentType::Video => "video",
            ContentType::Reel => "reel",
        }
    }

    pub fn media_class(&self) -> MediaClass {
        match self {
            ContentType::Image | ContentType::Carousel | ContentType::Story => MediaClass::Image,
            ContentType::Video | ContentType::Reel => MediaClass::Video,
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = ParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        ContentType::ALL
            .into_iter()
            .find(|candidate| candidate.as_str() == normalized)
            .ok_or_else(|| ParseError::new("content type", raw))
    }
}

/// Hint for the selector when no engine is forced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Speed,
    Quality,
    Cost,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Speed => "speed",
            Priority::Quality => "quality",
            Priority::Cost => "cost",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = ParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "speed" | "fast" => Ok(Priority::Speed),
            "quality" => Ok(Priority::Quality),
            "cost" | "cheap" => Ok(Priority::Cost),
            _ => Err(ParseError::new("priority", raw)),
        }
    }
}

/// One generation request as handed over by the drafting layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentRequest {
    pub content_draft_id: String,
    pub content_type: ContentType,
    pub prompt: String,
    #[serde(default)]
    pub options: Map<String, Value>,
    pub tone: Option<String>,
    pub goal: Option<String>,
    pub engine_override: Option<Engine>,
    pub priority: Option<Priority>,
    /// Engines that already failed for this draft in an earlier dispatch.
    #[serde(default)]
    pub attempted: Vec<Engine>,
}

impl ContentRequest {
    pub fn new(
        content_draft_id: impl Into<String>,
        content_type: ContentType,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            content_draft_id: content_draft_id.into(),
            content_type,
            prompt: prompt.into(),
            options: Map::new(),
            tone: None,
            goal: None,
            engine_override: None,
            priority: None,
            attempted: Vec::new(),
        }
    }

    pub fn with_override(mut self, engine: Engine) -> Self {
        self.engine_override = Some(engine);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_option(mut self, key: &str, value: Value) -> Self {
        self.options.insert(key.to_string(), value);
        self
    }

    pub fn media_class(&self) -> MediaClass {
        self.content_type.media_class()
    }

    /// Records a failed engine so later dispatches skip it.
    pub fn mark_attempted(&mut self, engine: Engine) {
        if !self.attempted.contains(&engine) {
            self.attempted.push(engine);
        }
    }
}
