#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use kiln_contracts::jobs::JobStatus;
use kiln_contracts::providers::{Engine, ProviderCatalog};
use kiln_contracts::store::InMemoryJobStore;
use kiln_engine::{
    GenerateRequest, GeneratedMedia, ImageProvider, ManualClock, Orchestrator,
    OrchestratorConfig, ProviderError, ProviderRegistry, TaskHandle, TaskSnapshot, VideoProvider,
};
use serde_json::Map;

pub fn media(url: &str) -> GeneratedMedia {
    GeneratedMedia {
        media_url: url.to_string(),
        thumbnail_url: None,
        width: Some(1024),
        height: Some(1024),
        provider_response: Map::new(),
    }
}

pub fn transient(engine: Engine) -> ProviderError {
    ProviderError::Transient {
        engine,
        message: "503 service unavailable".to_string(),
    }
}

pub fn rejected(engine: Engine) -> ProviderError {
    ProviderError::Rejected {
        engine,
        message: "400 content policy".to_string(),
    }
}

pub fn snapshot(raw_status: &str) -> TaskSnapshot {
    TaskSnapshot {
        raw_status: raw_status.to_string(),
        ..TaskSnapshot::default()
    }
}

/// Image provider answering from a script; an empty script succeeds.
pub struct ScriptedImage {
    engine: Engine,
    script: Mutex<VecDeque<Result<GeneratedMedia, ProviderError>>>,
    calls: AtomicUsize,
}

impl ScriptedImage {
    pub fn new(engine: Engine) -> Arc<Self> {
        Arc::new(Self {
            engine,
            script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn push(&self, outcome: Result<GeneratedMedia, ProviderError>) {
        self.script.lock().unwrap().push_back(outcome);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ImageProvider for ScriptedImage {
    fn engine(&self) -> Engine {
        self.engine
    }

    fn generate(&self, _request: &GenerateRequest) -> Result<GeneratedMedia, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(media(&format!("https://cdn.example/{}.png", self.engine))))
    }
}

type StatusHook = Box<dyn Fn() + Send + Sync>;

/// Video provider with scripted status answers. Once the script runs dry the
/// last answer repeats.
pub struct ScriptedVideo {
    engine: Engine,
    normalize: fn(&str) -> Option<JobStatus>,
    create_failures: Mutex<VecDeque<ProviderError>>,
    statuses: Mutex<VecDeque<Result<TaskSnapshot, ProviderError>>>,
    last: Mutex<Option<Result<TaskSnapshot, ProviderError>>>,
    status_delay: Mutex<Duration>,
    status_hook: Mutex<Option<StatusHook>>,
    creates: AtomicUsize,
    polls: AtomicUsize,
}

impl ScriptedVideo {
    pub fn new(engine: Engine, normalize: fn(&str) -> Option<JobStatus>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            normalize,
            create_failures: Mutex::new(VecDeque::new()),
            statuses: Mutex::new(VecDeque::new()),
            last: Mutex::new(None),
            status_delay: Mutex::new(Duration::ZERO),
            status_hook: Mutex::new(None),
            creates: AtomicUsize::new(0),
            polls: AtomicUsize::new(0),
        })
    }

    pub fn fail_next_create(&self, err: ProviderError) {
        self.create_failures.lock().unwrap().push_back(err);
    }

    pub fn push_status(&self, outcome: Result<TaskSnapshot, ProviderError>) {
        self.statuses.lock().unwrap().push_back(outcome);
    }

    pub fn slow_status(&self, delay: Duration) {
        *self.status_delay.lock().unwrap() = delay;
    }

    /// Runs `hook` inside every status call, before the answer is returned.
    pub fn on_status(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.status_hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

impl VideoProvider for ScriptedVideo {
    fn engine(&self) -> Engine {
        self.engine
    }

    fn create_task(&self, _request: &GenerateRequest) -> Result<TaskHandle, ProviderError> {
        let n = self.creates.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.create_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(TaskHandle {
            external_task_id: format!("{}-task-{n}", self.engine),
            raw_status: "queued".to_string(),
        })
    }

    fn task_status(&self, _external_task_id: &str) -> Result<TaskSnapshot, ProviderError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.status_delay.lock().unwrap();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        if let Some(hook) = self.status_hook.lock().unwrap().as_ref() {
            hook();
        }
        let next = self.statuses.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        if let Some(next) = next {
            *last = Some(next);
        }
        last.clone()
            .unwrap_or_else(|| Ok(snapshot("unknown")))
    }

    fn normalize_status(&self, raw: &str) -> Option<JobStatus> {
        (self.normalize)(raw)
    }
}

/// Orchestrator wired to scripted providers, an in-memory store and a manual
/// clock.
pub struct Harness {
    pub orchestrator: Orchestrator,
    pub store: Arc<InMemoryJobStore>,
    pub clock: Arc<ManualClock>,
    registry: ProviderRegistry,
    config: OrchestratorConfig,
    catalog: Option<ProviderCatalog>,
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder {
            registry: ProviderRegistry::new(),
            config: OrchestratorConfig::default(),
            catalog: None,
        }
    }

    pub fn advance_secs(&self, seconds: u64) {
        self.clock.advance(Duration::from_secs(seconds));
    }

    /// Independent orchestrator (own single-flight, own caches) over the same
    /// store, clock and providers, like a second server process.
    pub fn sibling(&self) -> anyhow::Result<Orchestrator> {
        orchestrator(
            self.store.clone(),
            self.clock.clone(),
            self.registry.clone(),
            self.config.clone(),
            self.catalog.clone(),
        )
    }
}

fn orchestrator(
    store: Arc<InMemoryJobStore>,
    clock: Arc<ManualClock>,
    registry: ProviderRegistry,
    config: OrchestratorConfig,
    catalog: Option<ProviderCatalog>,
) -> anyhow::Result<Orchestrator> {
    let mut builder = Orchestrator::builder(store)
        .config(config)
        .providers(registry)
        .clock(clock);
    if let Some(catalog) = catalog {
        builder = builder.catalog(catalog);
    }
    builder.build()
}

pub struct HarnessBuilder {
    registry: ProviderRegistry,
    config: OrchestratorConfig,
    catalog: Option<ProviderCatalog>,
}

impl HarnessBuilder {
    pub fn image(mut self, provider: &Arc<ScriptedImage>) -> Self {
        self.registry.register_shared_image(provider.clone());
        self
    }

    pub fn video(mut self, provider: &Arc<ScriptedVideo>) -> Self {
        self.registry.register_shared_video(provider.clone());
        self
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn catalog(mut self, catalog: ProviderCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn build(self) -> anyhow::Result<Harness> {
        let store = InMemoryJobStore::arc();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap(),
        ));
        let orchestrator = orchestrator(
            store.clone(),
            clock.clone(),
            self.registry.clone(),
            self.config.clone(),
            self.catalog.clone(),
        )?;
        Ok(Harness {
            orchestrator,
            store,
            clock,
            registry: self.registry,
            config: self.config,
            catalog: self.catalog,
        })
    }
}
