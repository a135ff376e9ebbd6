use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

pub const CACHE_HITS: &str = "authorization_cache_hits";
pub const CACHE_MISSES: &str = "authorization_cache_misses";
pub const STACK_RELOAD: &str = "authorization_stack_reload";
pub const ALLOWED: &str = "authorization_allowed";
pub const DENIED: &str = "authorization_denied";
pub const PLUGIN_LOAD_FAILURES: &str = "authorization_plugin_load_failures";
pub const SECURITY_VIOLATIONS: &str = "authorization_security_violations";
pub const TIMINGS_DROPPED: &str = "authorization_timings_dropped";
pub const TIMING: &str = "authorization";

/// Default number of distinct timing names kept. Per-entity timings are
/// keyed by project or group name, so the set is bounded by this instead
/// of by the callers.
pub const DEFAULT_TIMING_LIMIT: usize = 4096;

/// Aggregated durations for one timing name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timing {
    pub count: u64,
    pub total_micros: u64,
    pub min_micros: u64,
    pub max_micros: u64,
}

impl Timing {
    fn record(&mut self, micros: u64) {
        if self.count == 0 {
            self.min_micros = micros;
            self.max_micros = micros;
        } else {
            self.min_micros = self.min_micros.min(micros);
            self.max_micros = self.max_micros.max(micros);
        }
        self.count += 1;
        self.total_micros = self.total_micros.saturating_add(micros);
    }

    pub fn average_micros(&self) -> u64 {
        self.total_micros.checked_div(self.count).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub requests: BTreeMap<String, u64>,
    pub timings: BTreeMap<String, Timing>,
}

impl StatisticsSnapshot {
    pub fn requests(&self, name: &str) -> u64 {
        self.requests.get(name).copied().unwrap_or_default()
    }

    pub fn timing(&self, name: &str) -> Option<&Timing> {
        self.timings.get(name)
    }
}

/// Named request counters and timings, safe to share between threads.
///
/// Once `timing_limit` names are tracked, samples for new names are counted
/// under [`TIMINGS_DROPPED`] instead; known names keep aggregating.
#[derive(Debug)]
pub struct Statistics {
    inner: Mutex<StatisticsSnapshot>,
    timing_limit: usize,
}

impl Default for Statistics {
    fn default() -> Self {
        Self::with_timing_limit(DEFAULT_TIMING_LIMIT)
    }
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timing_limit(timing_limit: usize) -> Self {
        Self {
            inner: Mutex::new(StatisticsSnapshot::default()),
            timing_limit,
        }
    }

    pub fn add_request(&self, name: &str) {
        self.add_requests(name, 1);
    }

    pub fn add_requests(&self, name: &str, count: u64) {
        if count == 0 {
            return;
        }
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        *inner.requests.entry(name.to_string()).or_default() += count;
    }

    pub fn add_request_time(&self, name: &str, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(timing) = inner.timings.get_mut(name) {
            timing.record(micros);
        } else if inner.timings.len() < self.timing_limit {
            inner.timings.entry(name.to_string()).or_default().record(micros);
        } else {
            debug!(timing = name, limit = self.timing_limit, "timing limit reached, sample dropped");
            *inner.requests.entry(TIMINGS_DROPPED.to_string()).or_default() += 1;
        }
    }

    pub fn requests(&self, name: &str) -> u64 {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .requests(name)
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn reset(&self) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = StatisticsSnapshot::default();
    }
}
