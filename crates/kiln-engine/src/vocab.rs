//! Provider status vocabularies mapped onto the job lifecycle.

use kiln_contracts::jobs::JobStatus;

/// Replicate predictions: `starting`, `processing`, `succeeded`, `failed`,
/// `canceled`.
pub fn replicate_status(raw: &str) -> Option<JobStatus> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "starting" => Some(JobStatus::Queued),
        "processing" => Some(JobStatus::Processing),
        "succeeded" => Some(JobStatus::Completed),
        "failed" | "canceled" | "cancelled" => Some(JobStatus::Failed),
        _ => None,
    }
}

/// Runway tasks: `PENDING`, `THROTTLED`, `RUNNING`, `SUCCEEDED`, `FAILED`,
/// `CANCELLED`.
pub fn runway_status(raw: &str) -> Option<JobStatus> {
    match raw.trim().to_ascii_uppercase().as_str() {
        "PENDING" | "THROTTLED" => Some(JobStatus::Queued),
        "RUNNING" => Some(JobStatus::Processing),
        "SUCCEEDED" => Some(JobStatus::Completed),
        "FAILED" | "CANCELLED" | "CANCELED" => Some(JobStatus::Failed),
        _ => None,
    }
}

/// Luma generations: `queued`, `dreaming`, `completed`, `failed`.
pub fn luma_status(raw: &str) -> Option<JobStatus> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "queued" | "pending" => Some(JobStatus::Queued),
        "dreaming" => Some(JobStatus::Processing),
        "completed" => Some(JobStatus::Completed),
        "failed" => Some(JobStatus::Failed),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vocabularies_normalize() {
        assert_eq!(replicate_status("starting"), Some(JobStatus::Queued));
        assert_eq!(replicate_status(" Succeeded "), Some(JobStatus::Completed));
        assert_eq!(replicate_status("canceled"), Some(JobStatus::Failed));
        assert_eq!(runway_status("throttled"), Some(JobStatus::Queued));
        assert_eq!(runway_status("RUNNING"), Some(JobStatus::Processing));
        assert_eq!(runway_status("CANCELLED"), Some(JobStatus::Failed));
        assert_eq!(luma_status("dreaming"), Some(JobStatus::Processing));
        assert_eq!(luma_status("completed"), Some(JobStatus::Completed));
    }

    #[test]
    fn unknown_words_are_not_guessed() {
        assert_eq!(replicate_status("dreaming"), None);
        assert_eq!(runway_status("completed"), None);
        assert_eq!(luma_status(""), None);
    }
}
