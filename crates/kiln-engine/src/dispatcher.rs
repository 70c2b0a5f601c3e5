//! Generation Dispatcher: synchronous image generation with provider fallback,
//! asynchronous video task registration.

use chrono::{DateTime, Utc};
use kiln_contracts::content::{ContentRequest, ContentType, MediaClass};
use kiln_contracts::jobs::{GenerationJob, JobId, JobStatus};
use kiln_contracts::providers::{Engine, EngineSelection, EngineSelector, SelectionReason};
use kiln_contracts::store::DraftMedia;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::cache::{cache_key, ResultCache};
use crate::context::EngineContext;
use crate::error::{AttemptFailure, OrchestratorError};
use crate::provider::{bounded_call, GenerateRequest, GeneratedMedia};
use crate::ratelimit::RateLimiter;

/// Finished image-class generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaResult {
    pub content_draft_id: String,
    /// Engine that actually produced the media.
    pub engine: Engine,
    pub media_url: String,
    pub thumbnail_url: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub estimated_cost: f64,
    /// Engines tried and failed before `engine` succeeded, in order.
    pub failed_attempts: Vec<AttemptFailure>,
    pub cached: bool,
}

/// Accepted video-class task; poll it through the tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_id: JobId,
    pub content_draft_id: String,
    pub engine: Engine,
    pub external_task_id: String,
    pub status: JobStatus,
    pub estimated_cost: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Media(MediaResult),
    Job(JobHandle),
}

impl DispatchOutcome {
    pub fn engine(&self) -> Engine {
        match self {
            DispatchOutcome::Media(result) => result.engine,
            DispatchOutcome::Job(handle) => handle.engine,
        }
    }

    pub fn media(&self) -> Option<&MediaResult> {
        match self {
            DispatchOutcome::Media(result) => Some(result),
            DispatchOutcome::Job(_) => None,
        }
    }

    pub fn job(&self) -> Option<&JobHandle> {
        match self {
            DispatchOutcome::Job(handle) => Some(handle),
            DispatchOutcome::Media(_) => None,
        }
    }
}

#[derive(Debug)]
pub struct Dispatcher {
    ctx: EngineContext,
    selector: EngineSelector,
    limiter: RateLimiter,
    cache: ResultCache,
}

impl Dispatcher {
    pub fn new(ctx: EngineContext) -> Self {
        let selector = EngineSelector::new(std::sync::Arc::new(ctx.catalog.table.clone()));
        let cache = ResultCache::with_capacity(ctx.config.image_cache_capacity);
        Self {
            ctx,
            selector,
            limiter: RateLimiter::new(),
            cache,
        }
    }

    pub fn dispatch(&self, request: &ContentRequest) -> Result<DispatchOutcome, OrchestratorError> {
        match request.media_class() {
            MediaClass::Image => self.generate_image(request).map(DispatchOutcome::Media),
            MediaClass::Video => self.start_video(request).map(DispatchOutcome::Job),
        }
    }

    /// Retries a finished video job. A failed or timed-out job's engine joins
    /// the request's attempted set so the fallback chain moves past it.
    pub fn redispatch(
        &self,
        job_id: JobId,
        request: &ContentRequest,
    ) -> Result<DispatchOutcome, OrchestratorError> {
        let job = self
            .ctx
            .store
            .load_job(job_id)?
            .ok_or(OrchestratorError::JobNotFound(job_id))?;
        if !job.is_terminal() {
            return Err(OrchestratorError::JobStillActive(job_id));
        }
        let mut request = request.clone();
        request.content_draft_id = job.content_draft_id.clone();
        if job.status != JobStatus::Completed {
            request.mark_attempted(job.engine);
        }
        info!(
            job_id = %job_id,
            engine = %job.engine,
            status = %job.status,
            attempted = ?request.attempted,
            "re-dispatching generation"
        );
        self.dispatch(&request)
    }

    pub fn cached_results(&self) -> usize {
        self.cache.len()
    }

    fn select(&self, request: &ContentRequest) -> Result<EngineSelection, OrchestratorError> {
        let selection = self.selector.select(
            request.content_type,
            request.engine_override,
            request.priority,
        )?;
        debug!(
            engine = %selection.engine,
            content_type = %request.content_type,
            reason = ?selection.reason,
            "engine selected"
        );
        Ok(selection)
    }

    /// `[selected] + fallbacks`, minus engines that already failed for this
    /// draft.
    fn candidate_chain(&self, selected: Engine, request: &ContentRequest) -> Vec<Engine> {
        let mut chain = Vec::new();
        if !request.attempted.contains(&selected) {
            chain.push(selected);
        }
        chain.extend(self.ctx.catalog.fallbacks.fallbacks_for(
            selected,
            request.content_type,
            self.ctx.table(),
            &request.attempted,
        ));
        chain
    }

    fn estimated_cost(&self, engine: Engine) -> f64 {
        self.ctx
            .table()
            .get(engine)
            .map(|profile| profile.cost_per_unit)
            .unwrap_or(0.0)
    }

    fn generate_image(&self, request: &ContentRequest) -> Result<MediaResult, OrchestratorError> {
        let selection = self.select(request)?;
        let key = cache_key(request);
        if let Some(hit) = key.as_deref().and_then(|key| self.cache.get(key)) {
            return self.serve_cached(request, hit);
        }

        let chain = self.candidate_chain(selection.engine, request);
        if chain.is_empty() {
            return Err(already_attempted(request.content_type, selection.engine));
        }

        let generate = GenerateRequest::from_content(request);
        let mut failures: Vec<AttemptFailure> = Vec::new();
        for engine in chain {
            let media = match self.attempt_image(engine, &generate) {
                Ok(media) => media,
                Err(failure) => {
                    warn!(
                        engine = %engine,
                        content_draft_id = %request.content_draft_id,
                        kind = %failure.kind,
                        error = %failure.message,
                        "image generation attempt failed"
                    );
                    self.ctx.record(
                        "generation_attempt_failed",
                        json!({
                            "content_draft_id": request.content_draft_id,
                            "content_type": request.content_type,
                            "engine": engine,
                            "kind": failure.kind,
                            "error": failure.message,
                        }),
                    );
                    failures.push(failure);
                    continue;
                }
            };

            let result = MediaResult {
                content_draft_id: request.content_draft_id.clone(),
                engine,
                media_url: media.media_url,
                thumbnail_url: media.thumbnail_url,
                width: media.width,
                height: media.height,
                estimated_cost: self.estimated_cost(engine),
                failed_attempts: failures,
                cached: false,
            };
            if let Some(key) = key {
                self.cache.set(key, &result);
            }
            self.write_draft(&result)?;
            info!(
                engine = %engine,
                content_draft_id = %result.content_draft_id,
                fallback = selection.engine != engine,
                failed_attempts = result.failed_attempts.len(),
                "image generated"
            );
            self.ctx.record(
                "generation_succeeded",
                json!({
                    "content_draft_id": result.content_draft_id,
                    "content_type": request.content_type,
                    "engine": engine,
                    "selected_engine": selection.engine,
                    "media_url": result.media_url,
                    "estimated_cost": result.estimated_cost,
                    "failed_attempts": result.failed_attempts,
                }),
            );
            return Ok(result);
        }

        let Some(last) = failures.last().cloned() else {
            return Err(already_attempted(request.content_type, selection.engine));
        };
        Err(OrchestratorError::AllProvidersExhausted {
            content_type: request.content_type,
            attempts: failures,
            last,
        })
    }

    fn serve_cached(
        &self,
        request: &ContentRequest,
        hit: MediaResult,
    ) -> Result<MediaResult, OrchestratorError> {
        let result = MediaResult {
            content_draft_id: request.content_draft_id.clone(),
            estimated_cost: 0.0,
            failed_attempts: Vec::new(),
            cached: true,
            ..hit
        };
        self.write_draft(&result)?;
        debug!(engine = %result.engine, content_draft_id = %result.content_draft_id, "image cache hit");
        self.ctx.record(
            "generation_cache_hit",
            json!({
                "content_draft_id": result.content_draft_id,
                "engine": result.engine,
                "media_url": result.media_url,
            }),
        );
        Ok(result)
    }

    fn attempt_image(
        &self,
        engine: Engine,
        request: &GenerateRequest,
    ) -> Result<GeneratedMedia, AttemptFailure> {
        let profile = self.ctx.table().get(engine).ok_or_else(|| {
            AttemptFailure::new(engine, "not_registered", "engine missing from capability table")
        })?;
        if let Err(wait) = self.limiter.try_acquire(profile, self.ctx.now()) {
            return Err(AttemptFailure::new(
                engine,
                "rate_limited",
                format!("request budget exhausted; retry in {}s", wait.as_secs().max(1)),
            ));
        }
        let provider = self.ctx.providers.image(engine).ok_or_else(|| {
            AttemptFailure::new(engine, "not_registered", "no image transport registered")
        })?;

        let call_request = request.clone();
        let media = bounded_call(engine, self.ctx.config.provider_timeout, move || {
            provider.generate(&call_request)
        })
        .map_err(|err| AttemptFailure::from(&err))?;
        if media.media_url.trim().is_empty() {
            return Err(AttemptFailure::new(
                engine,
                "malformed",
                "provider returned no media URL",
            ));
        }
        Ok(media)
    }

    fn write_draft(&self, result: &MediaResult) -> Result<(), OrchestratorError> {
        self.ctx.store.update_content_draft_media(
            &result.content_draft_id,
            &DraftMedia {
                media_url: result.media_url.clone(),
                thumbnail_url: result.thumbnail_url.clone(),
                job_id: None,
                updated_at: self.ctx.now(),
            },
        )?;
        Ok(())
    }

    /// Creates the provider task exactly once; no automatic fallback.
    fn start_video(&self, request: &ContentRequest) -> Result<JobHandle, OrchestratorError> {
        let selection = self.select(request)?;
        let engine = self
            .candidate_chain(selection.engine, request)
            .first()
            .copied()
            .ok_or_else(|| already_attempted(request.content_type, selection.engine))?;
        if engine != selection.engine {
            info!(
                selected = %selection.engine,
                engine = %engine,
                "selected engine already attempted; using fallback"
            );
        }

        let profile = self
            .ctx
            .table()
            .get(engine)
            .ok_or(OrchestratorError::NoEngine {
                content_type: request.content_type,
            })?;
        if let Err(wait) = self.limiter.try_acquire(profile, self.ctx.now()) {
            return Err(OrchestratorError::RateLimited {
                engine,
                retry_after_seconds: wait.as_secs().max(1),
            });
        }
        let provider =
            self.ctx
                .providers
                .video(engine)
                .ok_or_else(|| OrchestratorError::ProviderUnavailable {
                    engine,
                    message: "no video transport registered".to_string(),
                })?;

        let generate = GenerateRequest::from_content(request);
        let handle = bounded_call(engine, self.ctx.config.provider_timeout, move || {
            provider.create_task(&generate)
        })
        .map_err(|err| {
            warn!(engine = %engine, kind = err.kind(), error = %err, "video task creation failed");
            self.ctx.record(
                "generation_attempt_failed",
                json!({
                    "content_draft_id": request.content_draft_id,
                    "content_type": request.content_type,
                    "engine": engine,
                    "kind": err.kind(),
                    "error": err.to_string(),
                }),
            );
            OrchestratorError::ProviderUnavailable {
                engine,
                message: err.to_string(),
            }
        })?;
        let external_task_id = handle.external_task_id.trim().to_string();
        if external_task_id.is_empty() {
            return Err(OrchestratorError::ProviderUnavailable {
                engine,
                message: "provider returned an empty task id".to_string(),
            });
        }

        let mut job = GenerationJob::queued(
            request.content_draft_id.clone(),
            request.content_type,
            engine,
            external_task_id,
            self.ctx.now(),
        );
        job.revision = self.ctx.store.create_job(&job)?;
        let handle = JobHandle {
            job_id: job.id,
            content_draft_id: job.content_draft_id.clone(),
            engine,
            external_task_id: job.external_task_id.clone(),
            status: job.status,
            estimated_cost: profile.cost_per_unit,
            created_at: job.created_at,
        };
        info!(
            job_id = %handle.job_id,
            engine = %engine,
            external_task_id = %handle.external_task_id,
            user_override = matches!(selection.reason, SelectionReason::Override),
            "video job created"
        );
        self.ctx.record(
            "job_created",
            json!({
                "job_id": handle.job_id,
                "content_draft_id": handle.content_draft_id,
                "content_type": request.content_type,
                "engine": engine,
                "external_task_id": handle.external_task_id,
                "estimated_cost": handle.estimated_cost,
            }),
        );
        Ok(handle)
    }
}

/// Every engine the chain could offer already failed for this draft.
fn already_attempted(content_type: ContentType, engine: Engine) -> OrchestratorError {
    let last = AttemptFailure::new(
        engine,
        "already_attempted",
        "engine and its fallbacks already failed for this draft",
    );
    OrchestratorError::AllProvidersExhausted {
        content_type,
        attempts: Vec::new(),
        last,
    }
}
