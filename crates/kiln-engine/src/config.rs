use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::cache;

pub const DEFAULT_MIN_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_POLL_RETRIES: u32 = 3;
pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(60);

/// Server-side polling rules for asynchronous jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Status requests closer together than this are answered from storage.
    pub min_poll_interval: Duration,
    /// Wall-clock ceiling measured from job creation.
    pub job_timeout: Duration,
    /// Transient status-check failures tolerated before a job is failed.
    pub max_poll_retries: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            min_poll_interval: DEFAULT_MIN_POLL_INTERVAL,
            job_timeout: DEFAULT_JOB_TIMEOUT,
            max_poll_retries: DEFAULT_MAX_POLL_RETRIES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub poll: PollPolicy,
    /// Upper bound on any single provider call.
    pub provider_timeout: Duration,
    /// Capability/fallback overrides merged over the built-in catalog.
    pub providers_path: Option<PathBuf>,
    /// Lifecycle journal location; `None` disables the journal.
    pub events_path: Option<PathBuf>,
    /// Image results kept for identical requests; 0 disables the cache.
    pub image_cache_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll: PollPolicy::default(),
            provider_timeout: DEFAULT_PROVIDER_TIMEOUT,
            providers_path: None,
            events_path: None,
            image_cache_capacity: cache::DEFAULT_CAPACITY,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| {
            env::var(key)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        })
    }

    /// Unparseable values keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let seconds = |key: &str, fallback: Duration| {
            lookup(key)
                .and_then(|raw| raw.parse::<f64>().ok())
                .filter(|value| value.is_finite() && *value > 0.0)
                .map(Duration::from_secs_f64)
                .unwrap_or(fallback)
        };
        Self {
            poll: PollPolicy {
                min_poll_interval: seconds(
                    "KILN_MIN_POLL_INTERVAL_SECS",
                    defaults.poll.min_poll_interval,
                ),
                job_timeout: seconds("KILN_JOB_TIMEOUT_SECS", defaults.poll.job_timeout),
                max_poll_retries: lookup("KILN_MAX_POLL_RETRIES")
                    .and_then(|raw| raw.parse::<u32>().ok())
                    .unwrap_or(defaults.poll.max_poll_retries),
            },
            provider_timeout: seconds("KILN_PROVIDER_TIMEOUT_SECS", defaults.provider_timeout),
            providers_path: lookup("KILN_PROVIDERS_PATH").map(PathBuf::from),
            events_path: lookup("KILN_EVENTS_PATH").map(PathBuf::from),
            image_cache_capacity: lookup("KILN_IMAGE_CACHE_CAPACITY")
                .and_then(|raw| raw.parse::<usize>().ok())
                .unwrap_or(defaults.image_cache_capacity),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_uses_defaults() {
        assert_eq!(
            OrchestratorConfig::from_lookup(lookup(&[])),
            OrchestratorConfig::default()
        );
    }

    #[test]
    fn overrides_are_parsed() {
        let config = OrchestratorConfig::from_lookup(lookup(&[
            ("KILN_MIN_POLL_INTERVAL_SECS", "2.5"),
            ("KILN_JOB_TIMEOUT_SECS", "600"),
            ("KILN_MAX_POLL_RETRIES", "5"),
            ("KILN_PROVIDERS_PATH", "/etc/kiln/providers.json"),
            ("KILN_IMAGE_CACHE_CAPACITY", "0"),
        ]));
        assert_eq!(config.poll.min_poll_interval, Duration::from_millis(2_500));
        assert_eq!(config.poll.job_timeout, Duration::from_secs(600));
        assert_eq!(config.poll.max_poll_retries, 5);
        assert_eq!(
            config.providers_path,
            Some(PathBuf::from("/etc/kiln/providers.json"))
        );
        assert_eq!(config.provider_timeout, DEFAULT_PROVIDER_TIMEOUT);
        assert_eq!(config.image_cache_capacity, 0);
    }

    #[test]
    fn invalid_values_fall_back() {
        let config = OrchestratorConfig::from_lookup(lookup(&[
            ("KILN_MIN_POLL_INTERVAL_SECS", "soon"),
            ("KILN_JOB_TIMEOUT_SECS", "-3"),
            ("KILN_MAX_POLL_RETRIES", "many"),
        ]));
        assert_eq!(config.poll, PollPolicy::default());
    }
}
