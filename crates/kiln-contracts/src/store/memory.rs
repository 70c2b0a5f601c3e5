use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::{check_revision, DraftMedia, JobStore};
use crate::error::StoreError;
use crate::jobs::{GenerationJob, JobId};

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, GenerationJob>>,
    drafts: RwLock<HashMap<String, DraftMedia>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn draft_media(&self, content_draft_id: &str) -> Option<DraftMedia> {
        self.drafts
            .read()
            .ok()
            .and_then(|drafts| drafts.get(content_draft_id).cloned())
    }

    pub fn job_count(&self) -> usize {
        self.jobs.read().map(|jobs| jobs.len()).unwrap_or(0)
    }
}

impl JobStore for InMemoryJobStore {
    fn create_job(&self, job: &GenerationJob) -> Result<u64, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        if jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id));
        }
        let mut stored = job.clone();
        stored.revision = 1;
        jobs.insert(job.id, stored);
        Ok(1)
    }

    fn load_job(&self, id: JobId) -> Result<Option<GenerationJob>, StoreError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        Ok(jobs.get(&id).cloned())
    }

    fn save_job(&self, job: &GenerationJob) -> Result<u64, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        let Some(stored) = jobs.get_mut(&job.id) else {
            return Err(StoreError::NotFound(job.id));
        };
        check_revision(stored, job)?;
        let revision = job.revision + 1;
        *stored = GenerationJob {
            revision,
            ..job.clone()
        };
        Ok(revision)
    }

    fn update_content_draft_media(
        &self,
        content_draft_id: &str,
        media: &DraftMedia,
    ) -> Result<(), StoreError> {
        let mut drafts = self.drafts.write().map_err(|_| poisoned())?;
        drafts.insert(content_draft_id.to_string(), media.clone());
        Ok(())
    }
}

fn poisoned() -> StoreError {
    StoreError::Storage("job store lock poisoned".to_string())
}
