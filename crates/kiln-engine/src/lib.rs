//! Generation job orchestration: engine selection, image fallback, video job
//! registration and rate-limited status polling.

pub mod cache;
pub mod clock;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod provider;
pub mod ratelimit;
pub mod singleflight;
pub mod tracker;
pub mod transport;
pub mod vocab;

use std::sync::Arc;

use anyhow::{Context, Result};
use kiln_contracts::content::ContentRequest;
use kiln_contracts::events::EventWriter;
use kiln_contracts::jobs::{JobId, JobStatusView};
use kiln_contracts::providers::ProviderCatalog;
use kiln_contracts::store::JobStore;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{OrchestratorConfig, PollPolicy};
pub use context::EngineContext;
pub use dispatcher::{DispatchOutcome, Dispatcher, JobHandle, MediaResult};
pub use error::{AttemptFailure, OrchestratorError};
pub use provider::{
    GenerateRequest, GeneratedMedia, ImageProvider, ProviderError, ProviderRegistry, TaskHandle,
    TaskSnapshot, VideoProvider,
};
pub use tracker::StatusTracker;

const EVENT_SOURCE: &str = "kiln-engine";

/// Entry point for the drafting layer: `dispatch` a request, then poll video
/// jobs with `get_status`.
#[derive(Debug)]
pub struct Orchestrator {
    ctx: EngineContext,
    dispatcher: Dispatcher,
    tracker: StatusTracker,
}

impl Orchestrator {
    pub fn builder(store: Arc<dyn JobStore>) -> OrchestratorBuilder {
        OrchestratorBuilder::new(store)
    }

    /// Environment-configured orchestrator with the hosted HTTP transports.
    pub fn from_env(store: Arc<dyn JobStore>) -> Result<Self> {
        Self::builder(store)
            .config(OrchestratorConfig::from_env())
            .build()
    }

    pub fn dispatch(&self, request: &ContentRequest) -> Result<DispatchOutcome, OrchestratorError> {
        self.dispatcher.dispatch(request)
    }

    pub fn get_status(&self, job_id: JobId) -> Result<JobStatusView, OrchestratorError> {
        self.tracker.get_status(job_id)
    }

    pub fn redispatch(
        &self,
        job_id: JobId,
        request: &ContentRequest,
    ) -> Result<DispatchOutcome, OrchestratorError> {
        self.dispatcher.redispatch(job_id, request)
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }
}

pub struct OrchestratorBuilder {
    store: Arc<dyn JobStore>,
    config: OrchestratorConfig,
    catalog: Option<ProviderCatalog>,
    providers: Option<ProviderRegistry>,
    clock: Option<Arc<dyn Clock>>,
    events: Option<EventWriter>,
}

impl OrchestratorBuilder {
    fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            config: OrchestratorConfig::default(),
            catalog: None,
            providers: None,
            clock: None,
            events: None,
        }
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn catalog(mut self, catalog: ProviderCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Replaces the hosted transports.
    pub fn providers(mut self, providers: ProviderRegistry) -> Self {
        self.providers = Some(providers);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        let catalog = match self.catalog {
            Some(catalog) => catalog,
            None => ProviderCatalog::load(self.config.providers_path.as_deref())
                .context("failed to load provider catalog")?,
        };
        let providers = match self.providers {
            Some(providers) => providers,
            None => transport::default_registry(self.config.provider_timeout)?,
        };
        let events = self.events.unwrap_or_else(|| match &self.config.events_path {
            Some(path) => EventWriter::new(path.clone(), EVENT_SOURCE),
            None => EventWriter::disabled(),
        });
        let ctx = EngineContext {
            catalog: Arc::new(catalog),
            providers: Arc::new(providers),
            store: self.store,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            events,
            config: self.config,
        };
        tracing::debug!(providers = ?ctx.providers.names(), "orchestrator ready");
        Ok(Orchestrator {
            dispatcher: Dispatcher::new(ctx.clone()),
            tracker: StatusTracker::new(ctx.clone()),
            ctx,
        })
    }
}
