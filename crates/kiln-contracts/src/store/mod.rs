//! Persistence contract for generation jobs.
//!
//! `save_job` is a conditional update: it only succeeds when the stored
//! revision equals `job.revision`, which is how two overlapping status
//! requests for the same job are serialized across processes.

mod file;
mod memory;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use file::JsonFileJobStore;
pub use memory::InMemoryJobStore;

use crate::error::StoreError;
use crate::jobs::{GenerationJob, JobId};

/// Final media written back onto a content draft.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftMedia {
    pub media_url: String,
    pub thumbnail_url: Option<String>,
    pub job_id: Option<JobId>,
    pub updated_at: DateTime<Utc>,
}

pub trait JobStore: Send + Sync {
    /// Persists a new job at revision 1.
    fn create_job(&self, job: &GenerationJob) -> Result<u64, StoreError>;

    fn load_job(&self, id: JobId) -> Result<Option<GenerationJob>, StoreError>;

    /// Conditional update; returns the new revision or `StoreError::Conflict`
    /// when someone else saved first.
    fn save_job(&self, job: &GenerationJob) -> Result<u64, StoreError>;

    /// The single write outside the job entity.
    fn update_content_draft_media(
        &self,
        content_draft_id: &str,
        media: &DraftMedia,
    ) -> Result<(), StoreError>;
}

pub(crate) fn check_revision(stored: &GenerationJob, job: &GenerationJob) -> Result<(), StoreError> {
    if stored.revision != job.revision {
        return Err(StoreError::Conflict {
            id: job.id,
            expected: job.revision,
            found: stored.revision,
        });
    }
    Ok(())
}
