//! Asynchronous generation jobs and their lifecycle rules.
//!
//! A job moves `queued -> processing -> {completed, failed, timeout}` and never
//! leaves a terminal state. At any time exactly one of these holds: a media
//! URL is present, the job is still running, or an error message is present.
//! The mutating methods below are the only sanctioned way to change a job.

mod view;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use view::JobStatusView;

use crate::content::ContentType;
use crate::error::{ParseError, TransitionError};
use crate::providers::Engine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = ParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(raw.trim())
            .map(Self)
            .map_err(|_| ParseError::new("job id", raw))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Timeout,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Timeout => "timeout",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Timeout
        )
    }

    /// Edges of the lifecycle graph. Self-loops are only legal while running.
    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        match (self, to) {
            (JobStatus::Queued, JobStatus::Queued) => true,
            (JobStatus::Queued, JobStatus::Processing) => true,
            (JobStatus::Processing, JobStatus::Processing) => true,
            (JobStatus::Processing, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationJob {
    pub id: JobId,
    pub content_draft_id: String,
    pub content_type: ContentType,
    pub engine: Engine,
    pub external_task_id: String,
    pub status: JobStatus,
    pub progress: u8,
    pub eta_seconds: Option<u32>,
    pub retry_count: u32,
    /// Last successful contact with the provider, not the last client read.
    pub last_polled_at: Option<DateTime<Utc>>,
    /// Start of the latest status check, whatever its outcome. Stamped
    /// before the provider is called so other instances back off.
    #[serde(default)]
    pub last_attempted_at: Option<DateTime<Utc>>,
    pub media_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency token, bumped by the store on every save.
    #[serde(default)]
    pub revision: u64,
}

impl GenerationJob {
    /// A freshly accepted provider task. Task creation counts as provider
    /// contact.
    pub fn queued(
        content_draft_id: impl Into<String>,
        content_type: ContentType,
        engine: Engine,
        external_task_id: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            content_draft_id: content_draft_id.into(),
            content_type,
            engine,
            external_task_id: external_task_id.into(),
            status: JobStatus::Queued,
            progress: 0,
            eta_seconds: None,
            retry_count: 0,
            last_polled_at: Some(created_at),
            last_attempted_at: None,
            media_url: None,
            thumbnail_url: None,
            error_message: None,
            created_at,
            completed_at: None,
            revision: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn mark_processing(&mut self) -> Result<(), TransitionError> {
        self.transition(JobStatus::Processing)
    }

    /// Progress never moves backwards while the job runs.
    pub fn record_progress(&mut self, progress: Option<u8>, eta_seconds: Option<u32>) {
        if self.is_terminal() {
            return;
        }
        if let Some(progress) = progress {
            self.progress = self.progress.max(progress.min(100));
        }
        self.eta_seconds = eta_seconds;
    }

    pub fn record_contact(&mut self, at: DateTime<Utc>) {
        self.last_polled_at = Some(at);
    }

    /// Marks a status check as started.
    pub fn claim_poll(&mut self, at: DateTime<Utc>) {
        self.last_attempted_at = Some(at);
    }

    /// Counts a network-class polling failure and returns the new total.
    pub fn record_transient_error(&mut self, at: DateTime<Utc>) -> u32 {
        self.last_attempted_at = Some(at);
        self.retry_count = self.retry_count.saturating_add(1);
        self.retry_count
    }

    /// Most recent provider round trip of any outcome; the poll interval is
    /// measured from here.
    pub fn poll_anchor(&self) -> DateTime<Utc> {
        [self.last_polled_at, self.last_attempted_at]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(self.created_at)
    }

    pub fn complete(
        &mut self,
        media_url: impl Into<String>,
        thumbnail_url: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.finish(JobStatus::Completed)?;
        self.progress = 100;
        self.eta_seconds = Some(0);
        self.media_url = Some(media_url.into());
        self.thumbnail_url = thumbnail_url;
        self.error_message = None;
        self.completed_at = Some(at);
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), TransitionError> {
        self.finish(JobStatus::Failed)?;
        self.set_error(message.into());
        Ok(())
    }

    pub fn time_out(&mut self, message: impl Into<String>) -> Result<(), TransitionError> {
        self.finish(JobStatus::Timeout)?;
        self.set_error(message.into());
        Ok(())
    }

    /// Exactly one of: media present, still running, error present.
    pub fn invariant_holds(&self) -> bool {
        let held = [
            self.media_url.is_some(),
            !self.is_terminal(),
            self.error_message.is_some(),
        ];
        held.iter().filter(|flag| **flag).count() == 1
    }

    fn set_error(&mut self, message: String) {
        self.media_url = None;
        self.thumbnail_url = None;
        self.eta_seconds = None;
        self.error_message = Some(message);
    }

    /// Terminal outcomes are only reachable from `processing`; a queued job is
    /// walked through it first.
    fn finish(&mut self, to: JobStatus) -> Result<(), TransitionError> {
        if self.status == JobStatus::Queued {
            self.transition(JobStatus::Processing)?;
        }
        self.transition(to)
    }

    fn transition(&mut self, to: JobStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn job() -> GenerationJob {
        let created = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        GenerationJob::queued("draft-1", ContentType::Video, Engine::Runway, "task-1", created)
    }

    #[test]
    fn new_job_is_queued_and_consistent() {
        let job = job();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.last_polled_at, Some(job.created_at));
        assert!(job.invariant_holds());
    }

    #[test]
    fn legal_graph_edges() {
        use JobStatus::*;
        let all = [Queued, Processing, Completed, Failed, Timeout];
        for from in all {
            for to in all {
                let expected = matches!(
                    (from, to),
                    (Queued, Queued)
                        | (Queued, Processing)
                        | (Processing, Processing)
                        | (Processing, Completed)
                        | (Processing, Failed)
                        | (Processing, Timeout)
                );
                assert_eq!(from.can_transition_to(to), expected, "{from} -> {to}");
            }
        }
    }

    #[test]
    fn completion_forces_full_progress() {
        let mut job = job();
        job.mark_processing().unwrap();
        job.record_progress(Some(40), Some(30));
        let at = job.created_at;
        job.complete("https://cdn/v.mp4", Some("https://cdn/t.jpg".to_string()), at)
            .unwrap();
        assert_eq!(job.progress, 100);
        assert_eq!(job.completed_at, Some(at));
        assert!(job.invariant_holds());
    }

    #[test]
    fn queued_job_fails_through_processing() {
        let mut job = job();
        job.fail("content policy").unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("content policy"));
        assert!(job.invariant_holds());
    }

    #[test]
    fn terminal_states_are_sticky() {
        let mut job = job();
        let at = job.created_at;
        job.complete("https://cdn/v.mp4", None, at).unwrap();
        assert_eq!(
            job.mark_processing(),
            Err(TransitionError {
                from: JobStatus::Completed,
                to: JobStatus::Processing,
            })
        );
        assert!(job.fail("late failure").is_err());
        assert!(job.time_out("late timeout").is_err());
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.media_url.as_deref(), Some("https://cdn/v.mp4"));
    }

    #[test]
    fn progress_is_monotonic_and_clamped() {
        let mut job = job();
        job.record_progress(Some(60), None);
        job.record_progress(Some(20), Some(10));
        assert_eq!(job.progress, 60);
        assert_eq!(job.eta_seconds, Some(10));
        job.record_progress(Some(250), None);
        assert_eq!(job.progress, 100);
    }

    #[test]
    fn transient_errors_count_and_move_the_poll_anchor() {
        let mut job = job();
        let later = job.created_at + chrono::Duration::seconds(7);
        assert_eq!(job.poll_anchor(), job.created_at);
        assert_eq!(job.record_transient_error(later), 1);
        assert_eq!(job.poll_anchor(), later);
        assert_eq!(job.last_polled_at, Some(job.created_at));
        assert_eq!(job.status, JobStatus::Queued);
    }

    #[test]
    fn claimed_poll_moves_the_anchor_without_counting_a_retry() {
        let mut job = job();
        let later = job.created_at + chrono::Duration::seconds(6);
        job.claim_poll(later);
        assert_eq!(job.poll_anchor(), later);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.last_polled_at, Some(job.created_at));
    }

    #[test]
    fn job_id_round_trips_through_display() {
        let id = JobId::new();
        assert_eq!(id.to_string().parse::<JobId>(), Ok(id));
        assert!("not-a-uuid".parse::<JobId>().is_err());
    }
}
