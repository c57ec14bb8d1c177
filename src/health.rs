//! Mutable per-provider health: rolling metrics, disablements, last errors and usage totals
use crate::breaker::FamilyBreakers;
use crate::errors::ProviderCallError;
use std::collections::HashMap;
use tracing::debug;

/// Latency assumed for providers that have never been measured.
pub const DEFAULT_LATENCY_MS: f64 = 1500.0;

const SUCCESS_WEIGHT: f64 = 0.7;
const LATENCY_WEIGHT: f64 = 0.3;
const EWMA_KEEP: f64 = 0.7;

/// Rolling outcome counters for one provider.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Metric {
    pub successes: u64,
    pub failures: u64,
    /// EWMA of observed latency. Zero, negative or non-finite means "not measured yet".
    pub avg_latency_ms: f64,
}

impl Metric {
    fn first(ok: bool, latency_ms: f64) -> Self {
        let mut metric = Self {
            successes: 0,
            failures: 0,
            avg_latency_ms: 0.0,
        };
        metric.record(ok, latency_ms);
        metric
    }

    pub fn record(&mut self, ok: bool, latency_ms: f64) {
        if ok {
            self.successes = self.successes.saturating_add(1);
        } else {
            self.failures = self.failures.saturating_add(1);
        }

        if self.latency().is_none() {
            self.avg_latency_ms = latency_ms;
        } else {
            self.avg_latency_ms = self.avg_latency_ms * EWMA_KEEP + latency_ms * (1.0 - EWMA_KEEP);
        }
    }

    pub fn latency(&self) -> Option<f64> {
        (self.avg_latency_ms.is_finite() && self.avg_latency_ms > 0.0)
            .then_some(self.avg_latency_ms)
    }

    pub fn total(&self) -> u64 {
        self.successes.saturating_add(self.failures)
    }

    pub fn success_rate(&self) -> Option<f64> {
        let total = self.total();
        (total > 0).then(|| self.successes as f64 / total as f64)
    }

    pub fn score(&self) -> f64 {
        score(
            self.successes,
            self.failures,
            self.latency().unwrap_or(DEFAULT_LATENCY_MS),
        )
    }
}

/// Blend of success rate and speed used to rank providers inside a cost tier.
pub fn score(successes: u64, failures: u64, avg_latency_ms: f64) -> f64 {
    let trials = match successes.saturating_add(failures) {
        0 => 1,
        n => n,
    };
    let success_rate = successes as f64 / trials as f64;
    let latency_score = 1.0 / avg_latency_ms.max(1.0);
    success_rate * SUCCESS_WEIGHT + latency_score * LATENCY_WEIGHT
}

/// Score for a provider with no recorded interactions.
pub fn untested_score() -> f64 {
    score(0, 0, DEFAULT_LATENCY_MS)
}

/// The last failure seen from a provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorRecord {
    pub message: String,
    pub status: Option<u16>,
    pub timestamp_ms: u64,
}

/// Process-wide request and token counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UsageTotals {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

/// Everything the router learns about its providers at runtime.
///
/// Not synchronized on its own; the router keeps it behind a single mutex so updates to one
/// provider's metric, disablement and error land together.
#[derive(Debug, Clone, Default)]
pub struct HealthStore {
    pub(crate) metrics: HashMap<String, Metric>,
    pub(crate) disabled: HashMap<String, u64>,
    pub(crate) errors: HashMap<String, ErrorRecord>,
    pub(crate) breakers: FamilyBreakers,
    pub(crate) usage: UsageTotals,
}

impl HealthStore {
    pub fn new(breakers: FamilyBreakers) -> Self {
        Self {
            breakers,
            ..Default::default()
        }
    }

    pub fn metric(&self, name: &str) -> Option<&Metric> {
        self.metrics.get(name)
    }

    pub fn error(&self, name: &str) -> Option<&ErrorRecord> {
        self.errors.get(name)
    }

    pub fn breakers(&self) -> &FamilyBreakers {
        &self.breakers
    }

    pub fn breakers_mut(&mut self) -> &mut FamilyBreakers {
        &mut self.breakers
    }

    pub fn usage(&self) -> UsageTotals {
        self.usage
    }

    /// Ranking score, using defaults for providers never seen.
    pub fn score(&self, name: &str) -> f64 {
        self.metrics
            .get(name)
            .map_or_else(untested_score, Metric::score)
    }

    pub fn record_metric(&mut self, name: &str, ok: bool, latency_ms: f64) {
        self.metrics
            .entry(name.to_string())
            .and_modify(|m| m.record(ok, latency_ms))
            .or_insert_with(|| Metric::first(ok, latency_ms));
    }

    pub fn record_success(
        &mut self,
        name: &str,
        latency_ms: f64,
        tokens_in: Option<u64>,
        tokens_out: Option<u64>,
    ) {
        self.record_metric(name, true, latency_ms);
        self.errors.remove(name);
        self.usage.total_requests = self.usage.total_requests.saturating_add(1);
        self.usage.successful_requests = self.usage.successful_requests.saturating_add(1);
        self.usage.tokens_in = self.usage.tokens_in.saturating_add(tokens_in.unwrap_or(0));
        self.usage.tokens_out = self.usage.tokens_out.saturating_add(tokens_out.unwrap_or(0));
    }

    pub fn record_failure(
        &mut self,
        name: &str,
        latency_ms: f64,
        error: &ProviderCallError,
        now_ms: u64,
    ) {
        self.record_metric(name, false, latency_ms);
        self.errors.insert(
            name.to_string(),
            ErrorRecord {
                message: error.message.clone(),
                status: error.status,
                timestamp_ms: now_ms,
            },
        );
        self.usage.total_requests = self.usage.total_requests.saturating_add(1);
        self.usage.failed_requests = self.usage.failed_requests.saturating_add(1);
    }

    /// Excludes a provider until `until_ms`. Deadlines in the past are ignored.
    pub fn disable(&mut self, name: &str, until_ms: u64, now_ms: u64) {
        if until_ms > now_ms {
            self.disabled.insert(name.to_string(), until_ms);
        }
    }

    pub fn disabled_until(&self, name: &str) -> Option<u64> {
        self.disabled.get(name).copied()
    }

    pub fn is_disabled(&self, name: &str, now_ms: u64) -> bool {
        self.disabled.get(name).is_some_and(|&until| until > now_ms)
    }

    /// Drops errors older than `max_error_age_ms`, expired disablements and expired breakers.
    /// Returns how many entries were removed.
    pub fn sweep(&mut self, now_ms: u64, max_error_age_ms: u64) -> usize {
        let before = self.errors.len() + self.disabled.len();
        self.errors
            .retain(|_, e| now_ms.saturating_sub(e.timestamp_ms) <= max_error_age_ms);
        self.disabled.retain(|_, &mut until| until > now_ms);
        let reopened = self.breakers.clear_expired(now_ms);
        let removed = before - (self.errors.len() + self.disabled.len()) + reopened.len();
        if removed > 0 {
            debug!("Swept {} stale provider health entries", removed);
        }
        removed
    }

    /// Forgets everything except which families are tracked.
    pub fn clear(&mut self) {
        self.metrics.clear();
        self.disabled.clear();
        self.errors.clear();
        self.breakers.clear();
        self.usage = UsageTotals::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_metric_seeded_by_first_latency_then_ewma() {
        let mut store = HealthStore::default();
        store.record_metric("a", true, 1000.0);
        assert_eq!(store.metric("a").unwrap().avg_latency_ms, 1000.0);

        store.record_metric("a", false, 2000.0);
        let metric = store.metric("a").unwrap();
        assert!((metric.avg_latency_ms - 1300.0).abs() < 1e-9);
        assert_eq!(metric.successes, 1);
        assert_eq!(metric.failures, 1);
    }

    #[rstest]
    #[case(0.0)]
    #[case(-5.0)]
    #[case(f64::NAN)]
    #[case(f64::INFINITY)]
    fn test_unset_latency_is_reseeded(#[case] bad: f64) {
        let mut metric = Metric {
            successes: 3,
            failures: 0,
            avg_latency_ms: bad,
        };
        assert_eq!(metric.latency(), None);
        metric.record(true, 420.0);
        assert_eq!(metric.avg_latency_ms, 420.0);
    }

    #[test]
    fn test_metric_never_created_without_interaction() {
        let store = HealthStore::default();
        assert!(store.metric("a").is_none());
        assert_eq!(store.score("a"), untested_score());
    }

    #[test]
    fn test_untested_score_value() {
        let expected = (1.0 / DEFAULT_LATENCY_MS) * 0.3;
        assert!((untested_score() - expected).abs() < 1e-12);
    }

    #[rstest]
    #[case((9, 1), (5, 5))]
    #[case((1, 0), (0, 1))]
    #[case((3, 1), (0, 0))]
    fn test_score_monotonic_in_success_rate(
        #[case] better: (u64, u64),
        #[case] worse: (u64, u64),
    ) {
        for latency in [1.0, 250.0, 1500.0, 10_000.0] {
            assert!(score(better.0, better.1, latency) >= score(worse.0, worse.1, latency));
        }
    }

    #[test]
    fn test_score_monotonic_in_latency() {
        for (s, f) in [(0, 0), (1, 1), (10, 0), (0, 10)] {
            assert!(score(s, f, 200.0) >= score(s, f, 800.0));
            assert!(score(s, f, 0.5) >= score(s, f, 1.0));
        }
    }

    #[test]
    fn test_success_clears_error_and_counts_tokens() {
        let mut store = HealthStore::default();
        store.record_failure("a", 10.0, &ProviderCallError::with_status("boom", 500), 1);
        assert_eq!(store.error("a").unwrap().status, Some(500));

        store.record_success("a", 20.0, Some(7), Some(3));
        assert!(store.error("a").is_none());

        let usage = store.usage();
        assert_eq!(usage.total_requests, 2);
        assert_eq!(usage.successful_requests, 1);
        assert_eq!(usage.failed_requests, 1);
        assert_eq!(usage.tokens_in, 7);
        assert_eq!(usage.tokens_out, 3);
    }

    #[test]
    fn test_disablement_only_active_before_deadline() {
        let mut store = HealthStore::default();
        store.disable("a", 100, 50);
        assert!(store.is_disabled("a", 99));
        assert!(!store.is_disabled("a", 100));

        // Past deadlines are never inserted.
        store.disable("b", 10, 50);
        assert_eq!(store.disabled_until("b"), None);
    }

    #[test]
    fn test_sweep_drops_old_errors_and_expired_disablements() {
        let day = 24 * 60 * 60 * 1000;
        let mut store = HealthStore::default();
        store.record_failure("old", 1.0, &ProviderCallError::new("x"), 0);
        store.record_failure("new", 1.0, &ProviderCallError::new("y"), day);
        store.disable("expired", 10, 0);
        store.disable("active", 3 * day, 0);

        let removed = store.sweep(day + 10, day);
        assert_eq!(removed, 2);
        assert!(store.error("old").is_none());
        assert!(store.error("new").is_some());
        assert_eq!(store.disabled_until("expired"), None);
        assert!(store.is_disabled("active", day + 10));
    }
}
