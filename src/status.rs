//! Read-only projections of router state for operators and dashboards
use crate::health::HealthStore;
use crate::registry::{CostTier, Registry};
use crate::selection::{self, ProviderTypeFilter};
use serde::Serialize;
use std::cmp::Ordering;

pub const REDACTED: &str = "[REDACTED]";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusMetrics {
    pub successes: u64,
    pub failures: u64,
    pub total_requests: u64,
    /// Fraction in `0.0..=1.0`; `None` before the first request.
    pub success_rate: Option<f64>,
    pub avg_latency_ms: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderStatus {
    pub name: String,
    pub model: String,
    pub family: String,
    pub cost_tier: CostTier,
    pub priority: u8,
    pub has_error: bool,
    pub last_error: Option<String>,
    pub disabled_until: Option<u64>,
    pub is_disabled: bool,
    pub metrics: StatusMetrics,
}

impl ProviderStatus {
    /// Hides identifying details, keeping the numbers.
    pub fn redacted(self) -> Self {
        Self {
            name: REDACTED.to_string(),
            model: REDACTED.to_string(),
            last_error: self.last_error.map(|_| REDACTED.to_string()),
            ..self
        }
    }
}

/// Per-provider view with the success rate as a percentage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderAnalytics {
    pub name: String,
    pub model: String,
    pub family: String,
    pub cost_tier: CostTier,
    pub successes: u64,
    pub failures: u64,
    pub total_requests: u64,
    pub success_rate_pct: Option<f64>,
    pub avg_latency_ms: Option<f64>,
    pub is_disabled: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthSummary {
    pub total: usize,
    pub active: usize,
    pub disabled: usize,
    pub has_providers: bool,
    pub tripped_families: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageStats {
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub total_tokens: u64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub success_rate_pct: f64,
    pub providers: usize,
    pub active_providers: usize,
}

/// Ascending, with unmeasured values after measured ones.
fn none_last(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn percentage(fraction: f64) -> f64 {
    (fraction * 1000.0).round() / 10.0
}

/// Every provider, best first: priority, then success rate, then latency.
pub fn provider_statuses(registry: &Registry, health: &HealthStore, now_ms: u64) -> Vec<ProviderStatus> {
    let mut statuses: Vec<ProviderStatus> = registry
        .providers()
        .iter()
        .map(|p| {
            let metric = health.metric(&p.name);
            let error = health.error(&p.name);
            ProviderStatus {
                name: p.name.clone(),
                model: p.model.clone(),
                family: p.family.clone(),
                cost_tier: p.cost_tier,
                priority: p.cost_tier.priority(),
                has_error: error.is_some(),
                last_error: error.map(|e| e.message.clone()),
                disabled_until: health.disabled_until(&p.name),
                is_disabled: health.is_disabled(&p.name, now_ms),
                metrics: StatusMetrics {
                    successes: metric.map_or(0, |m| m.successes),
                    failures: metric.map_or(0, |m| m.failures),
                    total_requests: metric.map_or(0, |m| m.total()),
                    success_rate: metric.and_then(|m| m.success_rate()),
                    avg_latency_ms: metric.and_then(|m| m.latency()),
                },
            }
        })
        .collect();

    statuses.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| {
                none_last(
                    a.metrics.success_rate.map(|r| -r),
                    b.metrics.success_rate.map(|r| -r),
                )
            })
            .then_with(|| none_last(a.metrics.avg_latency_ms, b.metrics.avg_latency_ms))
    });
    statuses
}

pub fn redacted_statuses(registry: &Registry, health: &HealthStore, now_ms: u64) -> Vec<ProviderStatus> {
    provider_statuses(registry, health, now_ms)
        .into_iter()
        .map(ProviderStatus::redacted)
        .collect()
}

pub fn analytics(registry: &Registry, health: &HealthStore, now_ms: u64) -> Vec<ProviderAnalytics> {
    provider_statuses(registry, health, now_ms)
        .into_iter()
        .map(|s| ProviderAnalytics {
            name: s.name,
            model: s.model,
            family: s.family,
            cost_tier: s.cost_tier,
            successes: s.metrics.successes,
            failures: s.metrics.failures,
            total_requests: s.metrics.total_requests,
            success_rate_pct: s.metrics.success_rate.map(percentage),
            avg_latency_ms: s.metrics.avg_latency_ms.map(f64::round),
            is_disabled: s.is_disabled,
            last_error: s.last_error,
        })
        .collect()
}

/// Counts providers a request could reach right now, ignoring the provider-type filter.
fn active_count(registry: &Registry, health: &HealthStore, now_ms: u64) -> usize {
    selection::available(registry.providers(), health, &ProviderTypeFilter::Auto, now_ms).len()
}

pub fn health_summary(registry: &Registry, health: &HealthStore, now_ms: u64) -> HealthSummary {
    let total = registry.len();
    let active = active_count(registry, health, now_ms);
    HealthSummary {
        total,
        active,
        disabled: total - active,
        has_providers: total > 0,
        tripped_families: health.breakers().tripped_families(now_ms),
    }
}

pub fn usage_stats(registry: &Registry, health: &HealthStore, now_ms: u64) -> UsageStats {
    let usage = health.usage();
    let success_rate_pct = match usage.total_requests {
        0 => 0.0,
        n => percentage(usage.successful_requests as f64 / n as f64),
    };
    UsageStats {
        tokens_in: usage.tokens_in,
        tokens_out: usage.tokens_out,
        total_tokens: usage.tokens_in.saturating_add(usage.tokens_out),
        total_requests: usage.total_requests,
        successful_requests: usage.successful_requests,
        failed_requests: usage.failed_requests,
        success_rate_pct,
        providers: registry.len(),
        active_providers: active_count(registry, health, now_ms),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::FamilyBreakers;
    use crate::errors::ProviderCallError;
    use crate::registry::Provider;
    use crate::test_utils::ScriptedBackend;
    use std::sync::Arc;

    fn provider(name: &str, family: &str, tier: CostTier) -> Provider {
        Provider::builder()
            .name(name)
            .model(format!("{name}-model"))
            .family(family)
            .cost_tier(tier)
            .backend(Arc::new(ScriptedBackend::always_ok("ok")))
            .build()
    }

    fn fixture() -> (Registry, HealthStore) {
        let registry = Registry::new(vec![
            provider("paid", "openai", CostTier::Paid),
            provider("untested", "groq", CostTier::Free),
            provider("flaky", "groq", CostTier::Free),
            provider("solid-slow", "openrouter", CostTier::Free),
            provider("solid-fast", "openrouter", CostTier::Free),
        ])
        .unwrap();

        let mut health = HealthStore::new(FamilyBreakers::new(["openrouter"]));
        health.record_success("solid-slow", 900.0, Some(10), Some(5));
        health.record_success("solid-fast", 100.0, None, None);
        health.record_success("flaky", 50.0, None, None);
        health.record_failure("flaky", 50.0, &ProviderCallError::with_status("rate limited", 429), 0);
        health.disable("flaky", 10_000, 0);
        (registry, health)
    }

    fn names(statuses: &[ProviderStatus]) -> Vec<&str> {
        statuses.iter().map(|s| s.name.as_str()).collect()
    }

    #[test]
    fn test_status_order() {
        let (registry, health) = fixture();
        let statuses = provider_statuses(&registry, &health, 1);
        assert_eq!(
            names(&statuses),
            vec!["solid-fast", "solid-slow", "flaky", "untested", "paid"]
        );

        let flaky = &statuses[2];
        assert!(flaky.has_error);
        assert!(flaky.is_disabled);
        assert_eq!(flaky.disabled_until, Some(10_000));
        assert_eq!(flaky.last_error.as_deref(), Some("rate limited"));
        assert_eq!(flaky.metrics.success_rate, Some(0.5));
        assert_eq!(flaky.metrics.total_requests, 2);

        let untested = &statuses[3];
        assert_eq!(untested.metrics.success_rate, None);
        assert_eq!(untested.metrics.avg_latency_ms, None);
        assert!(!untested.is_disabled);
    }

    #[test]
    fn test_redacted_keeps_numbers_only() {
        let (registry, health) = fixture();
        let raw = provider_statuses(&registry, &health, 1);
        let redacted = redacted_statuses(&registry, &health, 1);

        for (raw, red) in raw.iter().zip(&redacted) {
            assert_eq!(red.name, REDACTED);
            assert_eq!(red.model, REDACTED);
            assert_eq!(red.metrics, raw.metrics);
            assert_eq!(red.has_error, raw.has_error);
            assert_eq!(red.last_error.is_some(), raw.last_error.is_some());
        }
        let json = serde_json::to_string(&redacted).unwrap();
        assert!(!json.contains("rate limited"));
        assert!(!json.contains("flaky"));
    }

    #[test]
    fn test_analytics_reports_percentages() {
        let (registry, health) = fixture();
        let rows = analytics(&registry, &health, 1);
        let flaky = rows.iter().find(|r| r.name == "flaky").unwrap();
        assert_eq!(flaky.success_rate_pct, Some(50.0));
        let fast = rows.iter().find(|r| r.name == "solid-fast").unwrap();
        assert_eq!(fast.success_rate_pct, Some(100.0));
    }

    #[test]
    fn test_summary_and_usage() {
        let (registry, mut health) = fixture();
        health.breakers_mut().record_empty_failure("openrouter", 0, 1_000);
        health.breakers_mut().record_empty_failure("openrouter", 0, 1_000);

        let summary = health_summary(&registry, &health, 1);
        assert_eq!(summary.total, 5);
        // flaky is disabled, both openrouter providers are behind the breaker.
        assert_eq!(summary.active, 2);
        assert_eq!(summary.disabled, 3);
        assert!(summary.has_providers);
        assert_eq!(summary.tripped_families, vec!["openrouter".to_string()]);

        let usage = usage_stats(&registry, &health, 1);
        assert_eq!(usage.total_requests, 4);
        assert_eq!(usage.successful_requests, 3);
        assert_eq!(usage.failed_requests, 1);
        assert_eq!(usage.success_rate_pct, 75.0);
        assert_eq!(usage.total_tokens, 15);
        assert_eq!(usage.providers, 5);
        assert_eq!(usage.active_providers, 2);
    }

    #[test]
    fn test_empty_registry_summary() {
        let summary = health_summary(&Registry::default(), &HealthStore::default(), 0);
        assert!(!summary.has_providers);
        assert_eq!(summary.active, 0);
        let usage = usage_stats(&Registry::default(), &HealthStore::default(), 0);
        assert_eq!(usage.success_rate_pct, 0.0);
    }
}
