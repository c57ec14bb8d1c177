//! The request executor and the shared router handle
//!
//! A [`Router`] owns the registry, the health store and the persistence scheduler. It is cheap to
//! clone; every clone shares the same state.
use crate::backend::{Completion, CompletionRequest};
use crate::breaker::{FamilyBreakers, TRIP_COOLDOWN_MS};
use crate::clock::{Clock, SystemClock};
use crate::errors::{ProviderCallError, RouterError};
use crate::health::{HealthStore, Metric};
use crate::persistence::{
    DEFAULT_SAVE_DEBOUNCE, MemorySnapshotStore, SaveScheduler, Snapshot, SnapshotSource,
    SnapshotStore,
};
use crate::registry::{Provider, Registry};
use crate::sanitizer::sanitize_reply;
use crate::selection::{self, ProviderTypeFilter, SelectionMode};
use crate::status::{self, HealthSummary, ProviderAnalytics, ProviderStatus, UsageStats};
use crate::{lock, read_lock, write_lock};
use bon::Builder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

const HOUR_MS: u64 = 60 * 60 * 1000;

/// How long a provider is skipped after an empty response. Also the family breaker cooldown.
pub const EMPTY_RESPONSE_DISABLE_MS: u64 = TRIP_COOLDOWN_MS;
/// How long a provider is skipped after any other failure.
pub const FAILURE_DISABLE_MS: u64 = 12 * HOUR_MS;
/// Errors older than this are dropped by [`Router::sweep`].
pub const ERROR_RETENTION_MS: u64 = 24 * HOUR_MS;

pub const EMPTY_RESPONSE_MESSAGE: &str = "empty response from provider";

fn default_temperature() -> f32 {
    0.7
}

fn default_tracked_families() -> Vec<String> {
    vec!["openrouter".to_string()]
}

fn default_provider_type() -> String {
    "auto".to_string()
}

fn default_save_debounce_ms() -> u64 {
    DEFAULT_SAVE_DEBOUNCE.as_millis() as u64
}

/// Router tuning, read from the `router` section of the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[serde(default)]
pub struct RouterSettings {
    #[builder(default = default_temperature())]
    pub temperature: f32,
    /// Families whose providers fail together and get a shared breaker.
    #[builder(default = default_tracked_families())]
    pub tracked_families: Vec<String>,
    #[builder(default)]
    pub selection_mode: SelectionMode,
    /// `auto` or a family name.
    #[builder(default = default_provider_type())]
    pub provider_type: String,
    #[builder(default = default_save_debounce_ms())]
    pub save_debounce_ms: u64,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// A successful route: the cleaned reply and who produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Routed {
    pub content: String,
    pub provider: String,
}

#[derive(Debug, Clone)]
struct Controls {
    mode: SelectionMode,
    filter: ProviderTypeFilter,
}

#[derive(Debug)]
struct Inner {
    registry: Arc<Registry>,
    health: Mutex<HealthStore>,
    controls: RwLock<Controls>,
    saver: Arc<SaveScheduler>,
    clock: Arc<dyn Clock>,
    temperature: f32,
    breaker_tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl SnapshotSource for Inner {
    fn snapshot(&self) -> Snapshot {
        let now = self.clock.now_ms();
        Snapshot::capture(&lock(&self.health), now)
    }
}

/// Routes completion requests across the registry's providers.
#[derive(Debug, Clone)]
pub struct Router {
    inner: Arc<Inner>,
}

#[bon::bon]
impl Router {
    /// Without a `store`, state is kept in memory only. Without a `clock`, system time is used.
    #[builder]
    pub fn new(
        registry: Registry,
        #[builder(default)] settings: RouterSettings,
        store: Option<Arc<dyn SnapshotStore>>,
        clock: Option<Arc<dyn Clock>>,
    ) -> Self {
        let store = store.unwrap_or_else(|| Arc::new(MemorySnapshotStore::new()));
        let clock = clock.unwrap_or_else(|| Arc::new(SystemClock));
        let filter = resolve_provider_type(&registry, &settings.provider_type);
        let breakers = FamilyBreakers::new(&settings.tracked_families);

        Self {
            inner: Arc::new(Inner {
                registry: Arc::new(registry),
                health: Mutex::new(HealthStore::new(breakers)),
                controls: RwLock::new(Controls {
                    mode: settings.selection_mode,
                    filter,
                }),
                saver: Arc::new(SaveScheduler::new(
                    store,
                    Duration::from_millis(settings.save_debounce_ms),
                )),
                clock,
                temperature: settings.temperature,
                breaker_tasks: Mutex::new(HashMap::new()),
            }),
        }
    }
}

/// `auto` or one of the registry's families, case-insensitively.
fn parse_provider_type(registry: &Registry, kind: &str) -> Option<ProviderTypeFilter> {
    let normalized = kind.trim().to_lowercase();
    if normalized == "auto" {
        Some(ProviderTypeFilter::Auto)
    } else if registry.families().contains(&normalized) {
        Some(ProviderTypeFilter::Family(normalized))
    } else {
        None
    }
}

fn resolve_provider_type(registry: &Registry, configured: &str) -> ProviderTypeFilter {
    parse_provider_type(registry, configured).unwrap_or_else(|| {
        warn!(
            "Configured provider type '{}' matches no provider family, using auto",
            configured
        );
        ProviderTypeFilter::Auto
    })
}

impl Router {
    fn now(&self) -> u64 {
        self.inner.clock.now_ms()
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Sends one completion request, trying providers in candidate order until one answers.
    ///
    /// Each failing provider is disabled for a while, so a second call after an
    /// [`RouterError::AllProvidersFailed`] sees a different candidate list. Callers that want a
    /// retry should make it themselves.
    #[instrument(skip_all, fields(max_tokens = max_tokens))]
    pub async fn route(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        max_tokens: u32,
    ) -> Result<Routed, RouterError> {
        let registry = &self.inner.registry;
        if registry.is_empty() {
            return Err(RouterError::NoProvidersConfigured);
        }

        let (mode, filter) = {
            let controls = read_lock(&self.inner.controls);
            (controls.mode, controls.filter.clone())
        };
        let candidates: Vec<&Provider> = {
            let health = lock(&self.inner.health);
            let mut rng = rand::rng();
            selection::candidates(
                registry.providers(),
                &health,
                &filter,
                mode,
                self.now(),
                &mut rng,
            )
        };
        debug!(
            "Routing across {} candidates ({} mode)",
            candidates.len(),
            mode
        );

        let mut last_error: Option<String> = None;
        for provider in candidates {
            let started = self.now();
            let request = CompletionRequest {
                model: &provider.model,
                system_prompt,
                user_prompt,
                max_tokens,
                temperature: self.inner.temperature,
            };

            let outcome = provider
                .backend
                .complete(&request)
                .await
                .and_then(|completion| {
                    let content = sanitize_reply(&completion.content);
                    if content.is_empty() {
                        Err(ProviderCallError::new(EMPTY_RESPONSE_MESSAGE))
                    } else {
                        Ok(Completion {
                            content,
                            ..completion
                        })
                    }
                });
            let latency_ms = self.now().saturating_sub(started) as f64;

            match outcome {
                Ok(completion) => {
                    self.record_success(provider, latency_ms, &completion);
                    info!(
                        "Request served by {} ({}) in {}ms",
                        provider.name, provider.model, latency_ms
                    );
                    return Ok(Routed {
                        content: completion.content,
                        provider: provider.name.clone(),
                    });
                }
                Err(err) => {
                    warn!(
                        "Failed with {} ({}) after {}ms: {}{}",
                        provider.name,
                        provider.model,
                        latency_ms,
                        err.message,
                        err.status
                            .map(|s| format!(" (Status: {s})"))
                            .unwrap_or_default()
                    );
                    self.record_failure(provider, latency_ms, &err);
                    last_error = Some(err.message);
                }
            }
        }

        Err(RouterError::AllProvidersFailed(
            last_error.unwrap_or_else(|| "no providers available".to_string()),
        ))
    }

    fn record_success(&self, provider: &Provider, latency_ms: f64, completion: &Completion) {
        {
            let mut health = lock(&self.inner.health);
            health.record_success(
                &provider.name,
                latency_ms,
                completion.tokens_in,
                completion.tokens_out,
            );
            health.breakers_mut().record_success(&provider.family);
        }
        self.schedule_save();
    }

    fn record_failure(&self, provider: &Provider, latency_ms: f64, err: &ProviderCallError) {
        let now = self.now();
        let empty = err.is_empty_response();
        let until = now
            + if empty {
                EMPTY_RESPONSE_DISABLE_MS
            } else {
                FAILURE_DISABLE_MS
            };

        let tripped = {
            let mut health = lock(&self.inner.health);
            health.record_failure(&provider.name, latency_ms, err, now);
            health.disable(&provider.name, until, now);
            if empty {
                health.breakers_mut().record_empty_failure(
                    &provider.family,
                    now,
                    EMPTY_RESPONSE_DISABLE_MS,
                )
            } else {
                None
            }
        };
        info!("{} disabled until {}", provider.name, until);

        if let Some(reopen_at) = tripped {
            self.schedule_reopen(provider.family.clone(), reopen_at);
        }
        self.schedule_save();
    }

    fn schedule_save(&self) {
        let source: Weak<Inner> = Arc::downgrade(&self.inner);
        self.inner.saver.schedule(source);
    }

    /// Starts (or replaces) the task that closes `family`'s breaker at `reopen_at_ms`.
    fn schedule_reopen(&self, family: String, reopen_at_ms: u64) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let delay = Duration::from_millis(reopen_at_ms.saturating_sub(self.now()));
        let inner = Arc::downgrade(&self.inner);
        let task_family = family.clone();
        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = inner.upgrade() {
                Router { inner }.reopen_family(&task_family, reopen_at_ms);
            }
        });

        if let Some(previous) = lock(&self.inner.breaker_tasks).insert(family, task) {
            previous.abort();
        }
    }

    fn reopen_family(&self, family: &str, reopen_at_ms: u64) {
        let changed = lock(&self.inner.health)
            .breakers_mut()
            .reopen(family, reopen_at_ms);
        if changed {
            self.schedule_save();
        }
    }

    fn abort_breaker_tasks(&self) {
        for (_, task) in lock(&self.inner.breaker_tasks).drain() {
            task.abort();
        }
    }

    pub fn set_selection_mode(&self, mode: SelectionMode) {
        write_lock(&self.inner.controls).mode = mode;
        info!("AI provider selection mode set to {}", mode);
    }

    pub fn selection_mode(&self) -> SelectionMode {
        read_lock(&self.inner.controls).mode
    }

    /// Restricts routing to one family, or `auto` for all of them. Case-insensitive.
    pub fn set_provider_type(&self, kind: &str) -> Result<(), RouterError> {
        let Some(filter) = parse_provider_type(&self.inner.registry, kind) else {
            return Err(RouterError::InvalidProviderType {
                given: kind.to_string(),
                valid: self.available_provider_types(),
            });
        };

        info!("AI provider type set to {}", filter.as_str());
        write_lock(&self.inner.controls).filter = filter;
        Ok(())
    }

    pub fn provider_type(&self) -> String {
        read_lock(&self.inner.controls).filter.as_str().to_string()
    }

    /// `auto` followed by every configured family, sorted.
    pub fn available_provider_types(&self) -> Vec<String> {
        std::iter::once("auto".to_string())
            .chain(self.inner.registry.families())
            .collect()
    }

    pub fn status(&self) -> Vec<ProviderStatus> {
        let health = lock(&self.inner.health);
        status::provider_statuses(&self.inner.registry, &health, self.now())
    }

    pub fn redacted_status(&self) -> Vec<ProviderStatus> {
        let health = lock(&self.inner.health);
        status::redacted_statuses(&self.inner.registry, &health, self.now())
    }

    pub fn analytics(&self) -> Vec<ProviderAnalytics> {
        let health = lock(&self.inner.health);
        status::analytics(&self.inner.registry, &health, self.now())
    }

    pub fn health_summary(&self) -> HealthSummary {
        let health = lock(&self.inner.health);
        status::health_summary(&self.inner.registry, &health, self.now())
    }

    pub fn usage_stats(&self) -> UsageStats {
        let health = lock(&self.inner.health);
        status::usage_stats(&self.inner.registry, &health, self.now())
    }

    pub fn metric(&self, name: &str) -> Option<Metric> {
        lock(&self.inner.health).metric(name).copied()
    }

    /// The disablement deadline for `name`, if it's currently disabled.
    pub fn disabled_until(&self, name: &str) -> Option<u64> {
        let now = self.now();
        let health = lock(&self.inner.health);
        health
            .is_disabled(name, now)
            .then(|| health.disabled_until(name))
            .flatten()
    }

    pub fn is_family_tripped(&self, family: &str) -> bool {
        let now = self.now();
        lock(&self.inner.health).breakers().is_tripped(family, now)
    }

    /// Drops old errors and expired disablements and breakers. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.now();
        let removed = lock(&self.inner.health).sweep(now, ERROR_RETENTION_MS);
        if removed > 0 {
            self.schedule_save();
        }
        removed
    }

    /// Forgets all learned health and usage.
    pub fn reset(&self) {
        lock(&self.inner.health).clear();
        self.abort_breaker_tasks();
        info!("AI provider health data has been reset");
        self.schedule_save();
    }

    /// Merges the stored snapshot into the live state. Missing or unreadable snapshots leave the
    /// router cold.
    pub async fn load_state(&self) {
        let Some(snapshot) = self.inner.saver.load().await else {
            return;
        };
        let now = self.now();
        let (report, pending_reopens) = {
            let mut health = lock(&self.inner.health);
            let report = snapshot.restore_into(&self.inner.registry, &mut health, now);
            let pending: Vec<(String, u64)> = health
                .breakers()
                .states()
                .iter()
                .filter(|(_, state)| state.tripped)
                .filter_map(|(family, state)| state.reopen_at_ms.map(|at| (family.clone(), at)))
                .collect();
            (report, pending)
        };
        info!(
            "Loaded state for {} providers ({} disabled, {} errors, {} breakers)",
            report.metrics, report.disabled, report.errors, report.breakers
        );

        for (family, reopen_at) in pending_reopens {
            self.schedule_reopen(family, reopen_at);
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        self.inner.snapshot()
    }

    /// Writes the current state immediately.
    pub async fn flush(&self) {
        let snapshot = self.snapshot();
        self.inner.saver.flush(&snapshot).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::registry::CostTier;
    use crate::test_utils::ScriptedBackend;
    use rstest::*;

    const START: u64 = 1_700_000_000_000;

    fn provider(name: &str, family: &str, tier: CostTier, backend: &Arc<ScriptedBackend>) -> Provider {
        Provider::builder()
            .name(name)
            .model(format!("{name}-model"))
            .family(family)
            .cost_tier(tier)
            .backend(backend.clone())
            .build()
    }

    #[fixture]
    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(START))
    }

    fn router(providers: Vec<Provider>, clock: &Arc<ManualClock>, mode: SelectionMode) -> Router {
        Router::builder()
            .registry(Registry::new(providers).unwrap())
            .settings(RouterSettings::builder().selection_mode(mode).build())
            .clock(clock.clone())
            .build()
    }

    #[rstest]
    #[tokio::test]
    async fn test_empty_failure_disables_for_six_hours(clock: Arc<ManualClock>) {
        let a = Arc::new(ScriptedBackend::always_ok("   "));
        let b = Arc::new(ScriptedBackend::always_ok("from b"));
        let router = router(
            vec![
                provider("A", "groq", CostTier::Free, &a),
                provider("B", "openai", CostTier::Paid, &b),
            ],
            &clock,
            SelectionMode::Ranked,
        );

        let routed = router.route("sys", "hi", 100).await.unwrap();
        assert_eq!(routed.provider, "B");
        assert_eq!(router.disabled_until("A"), Some(START + EMPTY_RESPONSE_DISABLE_MS));
        assert_eq!(
            router.status().iter().find(|s| s.name == "A").unwrap().last_error.as_deref(),
            Some(EMPTY_RESPONSE_MESSAGE)
        );
    }

    #[rstest]
    #[tokio::test]
    async fn test_other_failure_disables_for_twelve_hours(clock: Arc<ManualClock>) {
        let a = Arc::new(ScriptedBackend::always_err(ProviderCallError::with_status("boom", 500)));
        let b = Arc::new(ScriptedBackend::always_ok("from b"));
        let router = router(
            vec![
                provider("A", "groq", CostTier::Free, &a),
                provider("B", "openai", CostTier::Paid, &b),
            ],
            &clock,
            SelectionMode::Ranked,
        );

        router.route("sys", "hi", 100).await.unwrap();
        assert_eq!(router.disabled_until("A"), Some(START + FAILURE_DISABLE_MS));

        clock.advance(Duration::from_millis(FAILURE_DISABLE_MS));
        assert_eq!(router.disabled_until("A"), None);
    }

    #[rstest]
    #[tokio::test]
    async fn test_fallback_then_disabled_provider_skipped(clock: Arc<ManualClock>) {
        let a = Arc::new(ScriptedBackend::always_ok(""));
        let b = Arc::new(ScriptedBackend::always_ok("B says hi"));
        let router = router(
            vec![
                provider("A", "groq", CostTier::Free, &a),
                provider("B", "openai", CostTier::Paid, &b),
            ],
            &clock,
            SelectionMode::Exploration,
        );

        for _ in 0..2 {
            let routed = router.route("sys", "hi", 100).await.unwrap();
            assert_eq!(routed.content, "B says hi");
            assert_eq!(routed.provider, "B");
        }
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 2);
    }

    #[rstest]
    #[tokio::test]
    async fn test_tracked_family_trips_and_blocks_healthy_sibling(clock: Arc<ManualClock>) {
        let empty = Arc::new(ScriptedBackend::always_ok(""));
        let sibling = Arc::new(ScriptedBackend::always_ok("sibling"));
        let other = Arc::new(ScriptedBackend::always_ok("other"));
        let router = router(
            vec![
                provider("OR-A", "openrouter", CostTier::Free, &empty),
                provider("OR-C", "openrouter", CostTier::Free, &empty),
                provider("OR-S", "openrouter", CostTier::Paid, &sibling),
                provider("Other", "openai", CostTier::Paid, &other),
            ],
            &clock,
            SelectionMode::Ranked,
        );

        // The candidate list is fixed per call, so the sibling still serves this one.
        assert_eq!(router.route("s", "u", 10).await.unwrap().provider, "OR-S");
        assert!(router.is_family_tripped("openrouter"));
        assert_eq!(router.disabled_until("OR-S"), None);

        assert_eq!(router.route("s", "u", 10).await.unwrap().provider, "Other");
        assert_eq!(sibling.calls(), 1);

        // Cooldown over: the family is back.
        clock.advance(Duration::from_millis(EMPTY_RESPONSE_DISABLE_MS));
        assert!(!router.is_family_tripped("openrouter"));
        assert_eq!(router.route("s", "u", 10).await.unwrap().provider, "OR-S");
    }

    #[rstest]
    #[tokio::test]
    async fn test_tripped_family_fails_every_call(clock: Arc<ManualClock>) {
        let empty = Arc::new(ScriptedBackend::always_ok(""));
        let router = router(
            vec![
                provider("A", "openrouter", CostTier::Free, &empty),
                provider("C", "openrouter", CostTier::Free, &empty),
            ],
            &clock,
            SelectionMode::Exploration,
        );

        let first = router.route("s", "u", 10).await.unwrap_err();
        assert_eq!(
            first,
            RouterError::AllProvidersFailed(EMPTY_RESPONSE_MESSAGE.to_string())
        );
        assert!(router.is_family_tripped("openrouter"));

        let second = router.route("s", "u", 10).await.unwrap_err();
        assert!(matches!(second, RouterError::AllProvidersFailed(_)));
        assert_eq!(empty.calls(), 2);
    }

    #[tokio::test]
    async fn test_no_providers_configured() {
        let router = Router::builder().registry(Registry::default()).build();
        assert_eq!(
            router.route("s", "u", 10).await.unwrap_err(),
            RouterError::NoProvidersConfigured
        );
    }

    #[rstest]
    #[tokio::test]
    async fn test_reply_is_sanitized_and_tokens_counted(clock: Arc<ManualClock>) {
        let a = Arc::new(ScriptedBackend::sequence(
            vec![Ok(Completion {
                content: "<think>hmm</think>\"Hello there\"".into(),
                tokens_in: Some(12),
                tokens_out: Some(4),
            })],
            Ok(Completion::text("again")),
        ));
        let router = router(
            vec![provider("A", "groq", CostTier::Free, &a)],
            &clock,
            SelectionMode::Ranked,
        );

        let routed = router.route("s", "u", 10).await.unwrap();
        assert_eq!(routed.content, "Hello there");
        let usage = router.usage_stats();
        assert_eq!(usage.tokens_in, 12);
        assert_eq!(usage.tokens_out, 4);
        assert_eq!(usage.successful_requests, 1);
    }

    #[rstest]
    #[tokio::test]
    async fn test_provider_type_filter(clock: Arc<ManualClock>) {
        let a = Arc::new(ScriptedBackend::always_ok("groq"));
        let b = Arc::new(ScriptedBackend::always_ok("openai"));
        let router = router(
            vec![
                provider("A", "groq", CostTier::Free, &a),
                provider("B", "openai", CostTier::Paid, &b),
            ],
            &clock,
            SelectionMode::Ranked,
        );

        assert_eq!(
            router.available_provider_types(),
            vec!["auto", "groq", "openai"]
        );
        router.set_provider_type("OpenAI").unwrap();
        assert_eq!(router.provider_type(), "openai");
        assert_eq!(router.route("s", "u", 10).await.unwrap().provider, "B");

        let err = router.set_provider_type("bogus").unwrap_err();
        assert!(matches!(err, RouterError::InvalidProviderType { .. }));
        assert_eq!(router.provider_type(), "openai");

        router.set_provider_type("auto").unwrap();
        assert_eq!(router.route("s", "u", 10).await.unwrap().provider, "A");
    }

    #[rstest]
    #[tokio::test]
    async fn test_reset_clears_everything(clock: Arc<ManualClock>) {
        let empty = Arc::new(ScriptedBackend::always_ok(""));
        let router = router(
            vec![
                provider("A", "openrouter", CostTier::Free, &empty),
                provider("C", "openrouter", CostTier::Free, &empty),
            ],
            &clock,
            SelectionMode::Ranked,
        );
        let _ = router.route("s", "u", 10).await;
        assert!(router.is_family_tripped("openrouter"));

        router.reset();
        assert!(!router.is_family_tripped("openrouter"));
        assert_eq!(router.disabled_until("A"), None);
        assert!(router.metric("A").is_none());
        assert_eq!(router.usage_stats().total_requests, 0);
        assert_eq!(router.health_summary().active, 2);
    }

    #[rstest]
    #[tokio::test]
    async fn test_sweep_drops_day_old_errors(clock: Arc<ManualClock>) {
        let a = Arc::new(ScriptedBackend::always_err(ProviderCallError::new("down")));
        let router = router(
            vec![provider("A", "groq", CostTier::Free, &a)],
            &clock,
            SelectionMode::Ranked,
        );
        let _ = router.route("s", "u", 10).await;

        clock.advance(Duration::from_millis(ERROR_RETENTION_MS + 1));
        // Error and the (expired) disablement.
        assert_eq!(router.sweep(), 2);
        assert!(!router.status()[0].has_error);
        assert_eq!(router.sweep(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutations_are_persisted_after_debounce() {
        let store = Arc::new(MemorySnapshotStore::new());
        let backend = Arc::new(ScriptedBackend::always_ok("hello"));
        let router = Router::builder()
            .registry(
                Registry::new(vec![provider("A", "groq", CostTier::Free, &backend)]).unwrap(),
            )
            .store(store.clone())
            .build();

        for _ in 0..5 {
            router.route("s", "u", 10).await.unwrap();
        }
        assert_eq!(store.writes(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert_eq!(store.writes(), 1);
        let saved = store.latest().unwrap();
        assert_eq!(saved.metrics["A"].successes, 5);
    }

    #[rstest]
    #[tokio::test]
    async fn test_state_survives_restart(clock: Arc<ManualClock>) {
        let store: Arc<MemorySnapshotStore> = Arc::new(MemorySnapshotStore::new());
        let empty = Arc::new(ScriptedBackend::always_ok(""));
        let build = |store: Arc<MemorySnapshotStore>| {
            Router::builder()
                .registry(
                    Registry::new(vec![
                        provider("A", "openrouter", CostTier::Free, &empty),
                        provider("C", "openrouter", CostTier::Free, &empty),
                    ])
                    .unwrap(),
                )
                .store(store)
                .clock(clock.clone())
                .build()
        };

        let first = build(store.clone());
        let _ = first.route("s", "u", 10).await;
        first.flush().await;

        let second = build(store.clone());
        second.load_state().await;
        assert!(second.is_family_tripped("openrouter"));
        assert_eq!(second.disabled_until("A"), Some(START + EMPTY_RESPONSE_DISABLE_MS));
        assert_eq!(second.metric("A"), first.metric("A"));
        assert_eq!(second.usage_stats().failed_requests, 2);
    }

    #[rstest]
    #[tokio::test]
    async fn test_restored_trip_without_deadline_expires(clock: Arc<ManualClock>) {
        let mut snapshot = Snapshot::default();
        snapshot.family_breakers.insert(
            "openrouter".to_string(),
            crate::persistence::PersistedBreaker {
                consecutive_empty_failures: 0,
                tripped: true,
                reopen_at: None,
            },
        );
        let backend = Arc::new(ScriptedBackend::always_ok("ok"));
        let router = Router::builder()
            .registry(
                Registry::new(vec![provider("A", "openrouter", CostTier::Free, &backend)]).unwrap(),
            )
            .store(Arc::new(MemorySnapshotStore::with_snapshot(snapshot)))
            .clock(clock.clone())
            .build();

        router.load_state().await;
        assert!(router.is_family_tripped("openrouter"));

        clock.advance(Duration::from_millis(EMPTY_RESPONSE_DISABLE_MS));
        assert!(!router.is_family_tripped("openrouter"));
        assert_eq!(router.route("s", "u", 10).await.unwrap().provider, "A");
    }
}
