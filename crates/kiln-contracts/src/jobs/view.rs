use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{GenerationJob, JobId, JobStatus};
use crate::providers::Engine;

/// Unified status payload returned to callers of `get_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job_id: JobId,
    pub content_draft_id: String,
    pub engine: Engine,
    pub status: JobStatus,
    pub progress: u8,
    pub eta_seconds: Option<u32>,
    pub media_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    /// Served from persisted state without contacting the provider.
    pub cached: bool,
    pub retry_after_seconds: Option<u64>,
}

impl JobStatusView {
    pub fn from_job(job: &GenerationJob) -> Self {
        Self {
            job_id: job.id,
            content_draft_id: job.content_draft_id.clone(),
            engine: job.engine,
            status: job.status,
            progress: job.progress,
            eta_seconds: job.eta_seconds,
            media_url: job.media_url.clone(),
            thumbnail_url: job.thumbnail_url.clone(),
            error_message: job.error_message.clone(),
            retry_count: job.retry_count,
            cached: false,
            retry_after_seconds: None,
        }
    }

    pub fn cached(job: &GenerationJob, retry_after: Duration) -> Self {
        Self {
            cached: true,
            retry_after_seconds: Some(retry_after.as_millis().div_ceil(1000) as u64),
            ..Self::from_job(job)
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_seconds = Some(retry_after.as_millis().div_ceil(1000) as u64);
        self
    }
}
