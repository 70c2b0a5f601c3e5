//! Provider seams: what the dispatcher and tracker need from a generation
//! backend, independent of its wire protocol.

use std::collections::BTreeMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use kiln_contracts::content::{ContentRequest, ContentType};
use kiln_contracts::jobs::JobStatus;
use kiln_contracts::providers::Engine;
use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    pub content_draft_id: String,
    pub content_type: ContentType,
    pub prompt: String,
    pub tone: Option<String>,
    pub goal: Option<String>,
    pub options: Map<String, Value>,
}

impl GenerateRequest {
    pub fn from_content(request: &ContentRequest) -> Self {
        Self {
            content_draft_id: request.content_draft_id.clone(),
            content_type: request.content_type,
            prompt: request.prompt.clone(),
            tone: request.tone.clone(),
            goal: request.goal.clone(),
            options: request.options.clone(),
        }
    }

    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

/// Media returned by a synchronous image provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneratedMedia {
    pub media_url: String,
    pub thumbnail_url: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub provider_response: Map<String, Value>,
}

/// Accepted asynchronous task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHandle {
    pub external_task_id: String,
    pub raw_status: String,
}

/// Provider-reported task state, still in the provider's own vocabulary.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TaskSnapshot {
    pub raw_status: String,
    pub progress: Option<u8>,
    pub eta_seconds: Option<u32>,
    pub media_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("{engine} transient failure: {message}")]
    Transient { engine: Engine, message: String },
    #[error("{engine} did not answer within {timeout_ms}ms")]
    Timeout { engine: Engine, timeout_ms: u64 },
    #[error("{engine} rejected the request: {message}")]
    Rejected { engine: Engine, message: String },
    #[error("{engine} returned a malformed response: {message}")]
    Malformed { engine: Engine, message: String },
    #[error("{engine} is not configured: {message}")]
    NotConfigured { engine: Engine, message: String },
}

impl ProviderError {
    pub fn engine(&self) -> Engine {
        match self {
            ProviderError::Transient { engine, .. }
            | ProviderError::Timeout { engine, .. }
            | ProviderError::Rejected { engine, .. }
            | ProviderError::Malformed { engine, .. }
            | ProviderError::NotConfigured { engine, .. } => *engine,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::Transient { .. } => "transient",
            ProviderError::Timeout { .. } => "timeout",
            ProviderError::Rejected { .. } => "rejected",
            ProviderError::Malformed { .. } => "malformed",
            ProviderError::NotConfigured { .. } => "not_configured",
        }
    }

    /// Network-class failures worth retrying later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Transient { .. } | ProviderError::Timeout { .. }
        )
    }
}

pub trait ImageProvider: Send + Sync {
    fn engine(&self) -> Engine;
    fn generate(&self, request: &GenerateRequest) -> Result<GeneratedMedia, ProviderError>;
}

pub trait VideoProvider: Send + Sync {
    fn engine(&self) -> Engine;
    fn create_task(&self, request: &GenerateRequest) -> Result<TaskHandle, ProviderError>;
    fn task_status(&self, external_task_id: &str) -> Result<TaskSnapshot, ProviderError>;
    /// Maps the provider's status word onto the job lifecycle; `None` for
    /// vocabulary it does not recognise.
    fn normalize_status(&self, raw: &str) -> Option<JobStatus>;
}

#[derive(Clone, Default)]
pub struct ProviderRegistry {
    images: BTreeMap<Engine, Arc<dyn ImageProvider>>,
    videos: BTreeMap<Engine, Arc<dyn VideoProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_image<P: ImageProvider + 'static>(&mut self, provider: P) {
        self.images.insert(provider.engine(), Arc::new(provider));
    }

    pub fn register_video<P: VideoProvider + 'static>(&mut self, provider: P) {
        self.videos.insert(provider.engine(), Arc::new(provider));
    }

    pub fn register_shared_image(&mut self, provider: Arc<dyn ImageProvider>) {
        self.images.insert(provider.engine(), provider);
    }

    pub fn register_shared_video(&mut self, provider: Arc<dyn VideoProvider>) {
        self.videos.insert(provider.engine(), provider);
    }

    pub fn image(&self, engine: Engine) -> Option<Arc<dyn ImageProvider>> {
        self.images.get(&engine).cloned()
    }

    pub fn video(&self, engine: Engine) -> Option<Arc<dyn VideoProvider>> {
        self.videos.get(&engine).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.images
            .keys()
            .chain(self.videos.keys())
            .map(|engine| engine.to_string())
            .collect()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("images", &self.images.keys().collect::<Vec<_>>())
            .field("videos", &self.videos.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Runs one provider call on a helper thread and stops waiting after
/// `timeout`.
///
/// A thread cannot be cancelled, so an abandoned call keeps running in the
/// background and its result is dropped. If it was a generation it may still
/// complete and be billed while the image loop has already moved to the next
/// engine. The hosted transports are built with a shorter deadline than this
/// bound (see `transport::default_registry`), so in practice their HTTP
/// request fails first and the timeout here only catches a transport that
/// ignores its own deadline.
pub fn bounded_call<T, F>(engine: Engine, timeout: Duration, call: F) -> Result<T, ProviderError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ProviderError> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let spawned = thread::Builder::new()
        .name(format!("provider-{engine}"))
        .spawn(move || {
            let _ = tx.send(call());
        });
    if let Err(err) = spawned {
        return Err(ProviderError::Transient {
            engine,
            message: format!("could not start provider call: {err}"),
        });
    }
    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(ProviderError::Timeout {
            engine,
            timeout_ms: timeout.as_millis() as u64,
        }),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(ProviderError::Transient {
            engine,
            message: "provider call aborted".to_string(),
        }),
    }
}
