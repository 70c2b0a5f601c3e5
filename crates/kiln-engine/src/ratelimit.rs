//! Per-engine request budgets taken from the capability table.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use kiln_contracts::providers::{Engine, ProviderProfile};

use crate::clock::elapsed;

const MINUTE: Duration = Duration::from_secs(60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Default)]
struct Window {
    minute: VecDeque<DateTime<Utc>>,
    day: VecDeque<DateTime<Utc>>,
}

impl Window {
    fn prune(&mut self, now: DateTime<Utc>) {
        while self
            .minute
            .front()
            .is_some_and(|at| elapsed(*at, now) >= MINUTE)
        {
            self.minute.pop_front();
        }
        while self.day.front().is_some_and(|at| elapsed(*at, now) >= DAY) {
            self.day.pop_front();
        }
    }
}

/// Sliding-window limiter keyed by engine. A limit of zero means unlimited.
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<Engine, Window>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes one request from the engine's budget, or reports how long until
    /// one frees up.
    pub fn try_acquire(&self, profile: &ProviderProfile, now: DateTime<Utc>) -> Result<(), Duration> {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let window = windows.entry(profile.engine).or_default();
        window.prune(now);

        let per_minute = profile.rate_limit.requests_per_minute as usize;
        if per_minute > 0 && window.minute.len() >= per_minute {
            return Err(wait_for(window.minute.front(), MINUTE, now));
        }
        let per_day = profile.rate_limit.requests_per_day as usize;
        if per_day > 0 && window.day.len() >= per_day {
            return Err(wait_for(window.day.front(), DAY, now));
        }

        window.minute.push_back(now);
        window.day.push_back(now);
        Ok(())
    }
}

fn wait_for(oldest: Option<&DateTime<Utc>>, span: Duration, now: DateTime<Utc>) -> Duration {
    oldest
        .map(|at| span.saturating_sub(elapsed(*at, now)))
        .unwrap_or(span)
}
