//! Job Status Tracker: answers status requests for video jobs, deciding per
//! request whether the provider may be contacted.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kiln_contracts::error::StoreError;
use kiln_contracts::jobs::{GenerationJob, JobId, JobStatus, JobStatusView};
use kiln_contracts::store::DraftMedia;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::clock::elapsed;
use crate::context::EngineContext;
use crate::error::OrchestratorError;
use crate::provider::{bounded_call, TaskSnapshot, VideoProvider};
use crate::singleflight::SingleFlight;

/// Upper bound for progress derived from average latency; only the provider
/// can report a finished job.
const ESTIMATED_PROGRESS_CAP: u8 = 95;

type StatusResult = Result<JobStatusView, OrchestratorError>;

enum Claim {
    Won(GenerationJob),
    Lost(JobStatusView),
}

#[derive(Debug)]
pub struct StatusTracker {
    ctx: EngineContext,
    flights: SingleFlight<JobId, StatusResult>,
}

impl StatusTracker {
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            ctx,
            flights: SingleFlight::new(),
        }
    }

    pub fn get_status(&self, job_id: JobId) -> StatusResult {
        let job = self.load(job_id)?;
        if let Some(view) = self.answer_from_store(&job, self.ctx.now()) {
            return Ok(view);
        }
        self.flights.run(job_id, || self.refresh(job_id))
    }

    /// Provider calls currently running on behalf of status requests.
    pub fn in_flight(&self) -> usize {
        self.flights.in_flight()
    }

    fn load(&self, job_id: JobId) -> Result<GenerationJob, OrchestratorError> {
        self.ctx
            .store
            .load_job(job_id)?
            .ok_or(OrchestratorError::JobNotFound(job_id))
    }

    /// Terminal jobs and jobs polled within the minimum interval never reach
    /// the provider.
    fn answer_from_store(&self, job: &GenerationJob, now: DateTime<Utc>) -> Option<JobStatusView> {
        if job.is_terminal() {
            return Some(JobStatusView {
                cached: true,
                ..JobStatusView::from_job(job)
            });
        }
        let min_interval = self.ctx.config.poll.min_poll_interval;
        let since_poll = elapsed(job.poll_anchor(), now);
        if since_poll < min_interval {
            debug!(job_id = %job.id, since_poll_ms = since_poll.as_millis() as u64, "serving cached job status");
            return Some(JobStatusView::cached(job, min_interval - since_poll));
        }
        None
    }

    fn refresh(&self, job_id: JobId) -> StatusResult {
        // Another request may have finished a poll between our first read and
        // winning the flight.
        let mut job = self.load(job_id)?;
        let now = self.ctx.now();
        if let Some(view) = self.answer_from_store(&job, now) {
            return Ok(view);
        }

        let policy = self.ctx.config.poll;
        let age = elapsed(job.created_at, now);
        if age > policy.job_timeout {
            let message = format!(
                "generation did not finish within {}s",
                policy.job_timeout.as_secs()
            );
            job.time_out(message)?;
            warn!(job_id = %job.id, engine = %job.engine, age_secs = age.as_secs(), "job timed out");
            return self.persist(job);
        }

        let Some(provider) = self.ctx.providers.video(job.engine) else {
            job.fail(format!("no video transport registered for '{}'", job.engine))?;
            return self.persist(job);
        };

        let mut job = match self.claim(job, now)? {
            Claim::Won(job) => job,
            Claim::Lost(view) => return Ok(view),
        };

        let task_id = job.external_task_id.clone();
        let call_provider = Arc::clone(&provider);
        let polled = bounded_call(job.engine, self.ctx.config.provider_timeout, move || {
            call_provider.task_status(&task_id)
        });
        match polled {
            Ok(snapshot) => {
                self.apply_snapshot(&mut job, provider.as_ref(), snapshot, now)?;
                self.persist(job)
            }
            Err(err) if err.is_transient() => {
                let retries = job.record_transient_error(now);
                warn!(
                    job_id = %job.id,
                    engine = %job.engine,
                    retry_count = retries,
                    error = %err,
                    "transient status check failure"
                );
                if retries > policy.max_poll_retries {
                    job.fail(format!(
                        "status check failed {retries} times; last error: {err}"
                    ))?;
                    return self.persist(job);
                }
                let view = self.persist(job)?;
                Ok(JobStatusView {
                    cached: true,
                    ..view.with_retry_after(policy.min_poll_interval)
                })
            }
            Err(err) => {
                warn!(job_id = %job.id, engine = %job.engine, kind = err.kind(), error = %err, "status check rejected");
                job.fail(err.to_string())?;
                self.persist(job)
            }
        }
    }

    fn apply_snapshot(
        &self,
        job: &mut GenerationJob,
        provider: &dyn VideoProvider,
        snapshot: TaskSnapshot,
        now: DateTime<Utc>,
    ) -> Result<(), OrchestratorError> {
        job.record_contact(now);
        let normalized = provider.normalize_status(&snapshot.raw_status);
        self.ctx.record(
            "job_polled",
            json!({
                "job_id": job.id,
                "engine": job.engine,
                "raw_status": snapshot.raw_status,
                "status": normalized,
                "progress": snapshot.progress,
            }),
        );

        match normalized {
            Some(JobStatus::Completed) => {
                let media_url = snapshot
                    .media_url
                    .as_deref()
                    .map(str::trim)
                    .filter(|url| !url.is_empty());
                match media_url {
                    Some(media_url) => job.complete(media_url, snapshot.thumbnail_url, now)?,
                    None => job.fail("provider reported completion without a media URL")?,
                }
                return Ok(());
            }
            Some(JobStatus::Failed) | Some(JobStatus::Timeout) => {
                let message = snapshot
                    .error
                    .filter(|error| !error.trim().is_empty())
                    .unwrap_or_else(|| format!("{} reported the generation failed", job.engine));
                job.fail(message)?;
                return Ok(());
            }
            Some(JobStatus::Processing) => {
                if job.status == JobStatus::Queued {
                    job.mark_processing()?;
                }
            }
            Some(JobStatus::Queued) => {}
            None => {
                warn!(
                    job_id = %job.id,
                    engine = %job.engine,
                    raw_status = %snapshot.raw_status,
                    "unrecognised provider status; keeping current state"
                );
            }
        }

        let (estimated_progress, estimated_eta) = self.estimate(job, now);
        job.record_progress(
            snapshot.progress.or(estimated_progress),
            snapshot.eta_seconds.or(estimated_eta),
        );
        Ok(())
    }

    /// Progress and ETA from the engine's average latency, for providers that
    /// report neither.
    fn estimate(&self, job: &GenerationJob, now: DateTime<Utc>) -> (Option<u8>, Option<u32>) {
        if job.status != JobStatus::Processing {
            return (None, None);
        }
        let Some(profile) = self.ctx.table().get(job.engine) else {
            return (None, None);
        };
        if !profile.avg_latency_seconds.is_finite() || profile.avg_latency_seconds <= 0.0 {
            return (None, None);
        }
        let expected = Duration::from_secs_f64(profile.avg_latency_seconds);
        let age = elapsed(job.created_at, now);
        let ratio = age.as_secs_f64() / expected.as_secs_f64();
        let progress = ((ratio * 100.0).floor() as u64).min(ESTIMATED_PROGRESS_CAP as u64) as u8;
        let eta = expected.saturating_sub(age).as_secs() as u32;
        (Some(progress), Some(eta))
    }

    /// Stamps the status check into the store before the provider is called.
    /// Whoever saves the stamp first polls; everyone else serves the stored
    /// row, including other processes sharing the store.
    fn claim(&self, mut job: GenerationJob, now: DateTime<Utc>) -> Result<Claim, OrchestratorError> {
        job.claim_poll(now);
        match self.ctx.store.save_job(&job) {
            Ok(revision) => {
                job.revision = revision;
                Ok(Claim::Won(job))
            }
            Err(StoreError::Conflict { found, .. }) => {
                debug!(job_id = %job.id, found, "status check already claimed");
                let current = self.load(job.id)?;
                let view = self.answer_from_store(&current, now).unwrap_or_else(|| {
                    JobStatusView::cached(&current, self.ctx.config.poll.min_poll_interval)
                });
                Ok(Claim::Lost(view))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Conditional save; the loser of a race reports the winner's state and
    /// leaves the draft alone.
    fn persist(&self, mut job: GenerationJob) -> StatusResult {
        match self.ctx.store.save_job(&job) {
            Ok(revision) => {
                job.revision = revision;
                if job.status == JobStatus::Completed {
                    self.write_draft_media(&job)?;
                }
                self.announce_terminal(&job);
                Ok(JobStatusView::from_job(&job))
            }
            Err(StoreError::Conflict { found, .. }) => {
                debug!(job_id = %job.id, found, "status update lost a race; reading winner");
                let winner = self.load(job.id)?;
                Ok(JobStatusView::from_job(&winner))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn write_draft_media(&self, job: &GenerationJob) -> Result<(), OrchestratorError> {
        let Some(media_url) = job.media_url.clone() else {
            return Ok(());
        };
        self.ctx.store.update_content_draft_media(
            &job.content_draft_id,
            &DraftMedia {
                media_url,
                thumbnail_url: job.thumbnail_url.clone(),
                job_id: Some(job.id),
                updated_at: job.completed_at.unwrap_or_else(|| self.ctx.now()),
            },
        )?;
        Ok(())
    }

    fn announce_terminal(&self, job: &GenerationJob) {
        let event_type = match job.status {
            JobStatus::Completed => "job_completed",
            JobStatus::Failed => "job_failed",
            JobStatus::Timeout => "job_timeout",
            JobStatus::Queued | JobStatus::Processing => return,
        };
        info!(
            job_id = %job.id,
            engine = %job.engine,
            status = %job.status,
            retry_count = job.retry_count,
            error = job.error_message.as_deref().unwrap_or(""),
            "job finished"
        );
        self.ctx.record(
            event_type,
            json!({
                "job_id": job.id,
                "content_draft_id": job.content_draft_id,
                "engine": job.engine,
                "status": job.status,
                "media_url": job.media_url,
                "error": job.error_message,
                "retry_count": job.retry_count,
            }),
        );
    }
}
