//! Crash-resilient provider state
//!
//! The health store is mirrored to a JSON snapshot so a restart comes back with its metrics,
//! disablements and breaker state intact. The snapshot is only ever a cache: the registry decides
//! which providers exist, and anything the snapshot says about other names is ignored.
//!
//! Writes are debounced by [`SaveScheduler`]: a burst of mutations produces one write.
use crate::breaker::FamilyCircuitState;
use crate::errors::PersistenceError;
use crate::health::{ErrorRecord, HealthStore, Metric, UsageTotals};
use crate::lock;
use crate::registry::Registry;
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default quiet period before a scheduled save is written.
pub const DEFAULT_SAVE_DEBOUNCE: Duration = Duration::from_millis(1500);

/// The persisted form of the health store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Snapshot {
    pub metrics: HashMap<String, PersistedMetric>,
    #[serde(deserialize_with = "lenient_deadlines")]
    pub disabled_providers: HashMap<String, u64>,
    pub provider_errors: HashMap<String, PersistedError>,
    pub family_breakers: HashMap<String, PersistedBreaker>,
    pub usage: PersistedUsage,
    /// Informational only.
    #[serde(skip_deserializing)]
    pub saved_at: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistedMetric {
    #[serde(deserialize_with = "lenient_count")]
    pub successes: u64,
    #[serde(deserialize_with = "lenient_count")]
    pub failures: u64,
    #[serde(deserialize_with = "lenient_latency")]
    pub avg_latency_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedError {
    pub error: String,
    #[serde(deserialize_with = "lenient_count")]
    pub timestamp: u64,
    #[serde(deserialize_with = "lenient_status")]
    pub status: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistedBreaker {
    #[serde(deserialize_with = "lenient_count")]
    pub consecutive_empty_failures: u64,
    pub tripped: bool,
    pub reopen_at: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistedUsage {
    #[serde(deserialize_with = "lenient_count")]
    pub total_requests: u64,
    #[serde(deserialize_with = "lenient_count")]
    pub successful_requests: u64,
    #[serde(deserialize_with = "lenient_count")]
    pub failed_requests: u64,
    #[serde(deserialize_with = "lenient_count")]
    pub total_tokens_in: u64,
    #[serde(deserialize_with = "lenient_count")]
    pub total_tokens_out: u64,
}

fn finite_number(value: &serde_json::Value) -> Option<f64> {
    let number = match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.filter(|n| n.is_finite())
}

fn lenient_count<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(finite_number(&value)
        .filter(|n| *n >= 0.0)
        .map(|n| n as u64)
        .unwrap_or(0))
}

fn lenient_latency<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(finite_number(&value).filter(|n| *n > 0.0).unwrap_or(0.0))
}

fn lenient_status<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u16>, D::Error> {
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(finite_number(&value)
        .filter(|n| (100.0..1000.0).contains(n))
        .map(|n| n as u16))
}

fn lenient_deadlines<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<HashMap<String, u64>, D::Error> {
    let raw = HashMap::<String, serde_json::Value>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .filter_map(|(name, value)| {
            finite_number(&value)
                .filter(|n| *n > 0.0)
                .map(|n| (name, n as u64))
        })
        .collect())
}

/// What a load merged into the health store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub metrics: usize,
    pub disabled: usize,
    pub errors: usize,
    pub breakers: usize,
}

impl Snapshot {
    pub fn capture(health: &HealthStore, now_ms: u64) -> Self {
        let metrics = health
            .metrics
            .iter()
            .map(|(name, m)| {
                (
                    name.clone(),
                    PersistedMetric {
                        successes: m.successes,
                        failures: m.failures,
                        avg_latency_ms: m.latency().unwrap_or(0.0),
                    },
                )
            })
            .collect();

        let provider_errors = health
            .errors
            .iter()
            .map(|(name, e)| {
                (
                    name.clone(),
                    PersistedError {
                        error: e.message.clone(),
                        timestamp: e.timestamp_ms,
                        status: e.status,
                    },
                )
            })
            .collect();

        let family_breakers = health
            .breakers
            .states()
            .iter()
            .map(|(family, state)| {
                (
                    family.clone(),
                    PersistedBreaker {
                        consecutive_empty_failures: u64::from(state.consecutive_empty_failures),
                        tripped: state.tripped,
                        reopen_at: state.reopen_at_ms,
                    },
                )
            })
            .collect();

        let usage = health.usage;
        Self {
            metrics,
            disabled_providers: health.disabled.clone(),
            provider_errors,
            family_breakers,
            usage: PersistedUsage {
                total_requests: usage.total_requests,
                successful_requests: usage.successful_requests,
                failed_requests: usage.failed_requests,
                total_tokens_in: usage.tokens_in,
                total_tokens_out: usage.tokens_out,
            },
            saved_at: chrono::DateTime::from_timestamp_millis(now_ms as i64)
                .map(|t| t.to_rfc3339())
                .unwrap_or_default(),
        }
    }

    /// Merges this snapshot into `health`, keeping only providers and families the registry
    /// knows about and disablements that are still in the future.
    pub fn restore_into(
        self,
        registry: &Registry,
        health: &mut HealthStore,
        now_ms: u64,
    ) -> RestoreReport {
        let mut report = RestoreReport::default();

        for (name, m) in self.metrics {
            if !registry.contains(&name) || m.successes.saturating_add(m.failures) == 0 {
                continue;
            }
            health.metrics.insert(
                name,
                Metric {
                    successes: m.successes,
                    failures: m.failures,
                    avg_latency_ms: m.avg_latency_ms,
                },
            );
            report.metrics += 1;
        }

        for (name, until) in self.disabled_providers {
            if until > now_ms && registry.contains(&name) {
                health.disabled.insert(name, until);
                report.disabled += 1;
            }
        }

        for (name, e) in self.provider_errors {
            if registry.contains(&name) {
                health.errors.insert(
                    name,
                    ErrorRecord {
                        message: e.error,
                        status: e.status,
                        timestamp_ms: e.timestamp,
                    },
                );
                report.errors += 1;
            }
        }

        let families = registry.families();
        for (family, b) in self.family_breakers {
            if !families.contains(&family) || !health.breakers.is_tracked(&family) {
                continue;
            }
            health.breakers.restore(
                &family,
                FamilyCircuitState {
                    consecutive_empty_failures: u32::try_from(b.consecutive_empty_failures)
                        .unwrap_or(u32::MAX),
                    tripped: b.tripped,
                    reopen_at_ms: b.reopen_at,
                },
                now_ms,
            );
            report.breakers += 1;
        }

        let u = self.usage;
        health.usage = UsageTotals {
            total_requests: u.total_requests,
            successful_requests: u.successful_requests,
            failed_requests: u.failed_requests,
            tokens_in: u.total_tokens_in,
            tokens_out: u.total_tokens_out,
        };

        report
    }
}

/// Somewhere to keep snapshots.
#[async_trait]
pub trait SnapshotStore: Send + Sync + std::fmt::Debug {
    /// `Ok(None)` when nothing has been saved yet.
    async fn load(&self) -> Result<Option<Snapshot>, PersistenceError>;

    async fn save(&self, snapshot: &Snapshot) -> Result<(), PersistenceError>;
}

/// Pretty-printed JSON file, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_error(&self, reason: impl ToString) -> PersistenceError {
        PersistenceError::Load {
            path: self.path.clone(),
            reason: reason.to_string(),
        }
    }

    fn write_error(&self, reason: impl ToString) -> PersistenceError {
        PersistenceError::Write {
            path: self.path.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn load(&self) -> Result<Option<Snapshot>, PersistenceError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.load_error(e)),
        };
        if contents.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|e| self.load_error(e))
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<(), PersistenceError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| self.write_error(e))?;
        }
        let payload = serde_json::to_vec_pretty(snapshot).map_err(|e| self.write_error(e))?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, payload)
            .await
            .map_err(|e| self.write_error(e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.write_error(e))
    }
}

/// Keeps the latest snapshot in memory. Used when no state file is configured, and in tests.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    latest: Mutex<Option<Snapshot>>,
    writes: AtomicUsize,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        Self {
            latest: Mutex::new(Some(snapshot)),
            writes: AtomicUsize::new(0),
        }
    }

    /// How many times `save` has been called.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn latest(&self) -> Option<Snapshot> {
        lock(&self.latest).clone()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load(&self) -> Result<Option<Snapshot>, PersistenceError> {
        Ok(lock(&self.latest).clone())
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<(), PersistenceError> {
        *lock(&self.latest) = Some(snapshot.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Produces the snapshot to write when a debounced save fires.
pub trait SnapshotSource: Send + Sync {
    fn snapshot(&self) -> Snapshot;
}

#[derive(Debug, Default)]
struct PendingSave {
    dirty: bool,
    timer_pending: bool,
}

/// Coalesces state mutations into at most one write per debounce window.
#[derive(Debug)]
pub struct SaveScheduler {
    store: Arc<dyn SnapshotStore>,
    delay: Duration,
    pending: Mutex<PendingSave>,
}

impl SaveScheduler {
    pub fn new(store: Arc<dyn SnapshotStore>, delay: Duration) -> Self {
        Self {
            store,
            delay,
            pending: Mutex::new(PendingSave::default()),
        }
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.store
    }

    pub fn is_dirty(&self) -> bool {
        lock(&self.pending).dirty
    }

    /// Marks state dirty and starts the debounce timer unless one is already pending.
    pub fn schedule(self: &Arc<Self>, source: Weak<dyn SnapshotSource>) {
        let mut pending = lock(&self.pending);
        pending.dirty = true;
        if pending.timer_pending {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No async runtime available, provider state save deferred until flush");
            return;
        };
        pending.timer_pending = true;
        drop(pending);

        let this = Arc::clone(self);
        runtime.spawn(async move {
            tokio::time::sleep(this.delay).await;
            this.fire(source).await;
        });
    }

    async fn fire(&self, source: Weak<dyn SnapshotSource>) {
        let dirty = {
            let mut pending = lock(&self.pending);
            pending.timer_pending = false;
            std::mem::take(&mut pending.dirty)
        };
        if !dirty {
            return;
        }
        let Some(source) = source.upgrade() else {
            return;
        };
        let snapshot = source.snapshot();
        drop(source);
        self.write(&snapshot).await;
    }

    /// Writes `snapshot` now, absorbing any pending dirty state.
    pub async fn flush(&self, snapshot: &Snapshot) {
        lock(&self.pending).dirty = false;
        self.write(snapshot).await;
    }

    async fn write(&self, snapshot: &Snapshot) {
        match self.store.save(snapshot).await {
            Ok(()) => debug!("Persisted provider state"),
            Err(e) => warn!("{}", e),
        }
    }

    /// Loads the stored snapshot. Failures are logged and treated as "nothing stored".
    pub async fn load(&self) -> Option<Snapshot> {
        match self.store.load().await {
            Ok(Some(snapshot)) => {
                info!("Restored AI provider state");
                Some(snapshot)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("{}", e);
                None
            }
        }
    }
}
