//! Family-level circuit breaking
//!
//! Some backend families fail together: when one of their providers starts answering with empty
//! content the rest usually follow. For tracked families, consecutive empty-response failures are
//! counted and, once the threshold is hit, the whole family is suppressed until a cooldown ends.
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::info;

/// Consecutive empty responses that trip a family.
pub const TRIP_THRESHOLD: u32 = 2;
/// How long a tripped family stays suppressed.
pub const TRIP_COOLDOWN_MS: u64 = 6 * 60 * 60 * 1000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FamilyCircuitState {
    pub consecutive_empty_failures: u32,
    pub tripped: bool,
    /// When the scheduled un-trip is due (epoch ms).
    pub reopen_at_ms: Option<u64>,
}

impl FamilyCircuitState {
    fn is_open(&self, now_ms: u64) -> bool {
        self.tripped && self.reopen_at_ms.is_none_or(|at| now_ms < at)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FamilyBreakers {
    tracked: BTreeSet<String>,
    states: HashMap<String, FamilyCircuitState>,
}

impl FamilyBreakers {
    pub fn new<I, S>(tracked: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            tracked: tracked
                .into_iter()
                .map(|f| f.as_ref().to_lowercase())
                .collect(),
            states: HashMap::new(),
        }
    }

    pub fn is_tracked(&self, family: &str) -> bool {
        self.tracked.contains(family)
    }

    pub fn tracked(&self) -> impl Iterator<Item = &str> {
        self.tracked.iter().map(String::as_str)
    }

    /// Whether every provider in `family` should currently be skipped.
    pub fn is_tripped(&self, family: &str, now_ms: u64) -> bool {
        self.states
            .get(family)
            .is_some_and(|state| state.is_open(now_ms))
    }

    pub fn state(&self, family: &str) -> Option<&FamilyCircuitState> {
        self.states.get(family)
    }

    pub fn states(&self) -> &HashMap<String, FamilyCircuitState> {
        &self.states
    }

    /// Families whose breaker is open at `now_ms`.
    pub fn tripped_families(&self, now_ms: u64) -> Vec<String> {
        let mut families: Vec<String> = self
            .states
            .iter()
            .filter(|(_, state)| state.is_open(now_ms))
            .map(|(family, _)| family.clone())
            .collect();
        families.sort();
        families
    }

    /// Counts an empty-response failure. Returns the reopen deadline when this failure trips the
    /// family. Failures while already tripped don't extend the cooldown.
    pub fn record_empty_failure(
        &mut self,
        family: &str,
        now_ms: u64,
        cooldown_ms: u64,
    ) -> Option<u64> {
        if !self.is_tracked(family) {
            return None;
        }
        let state = self.states.entry(family.to_string()).or_default();
        if state.is_open(now_ms) {
            return None;
        }

        state.consecutive_empty_failures = state.consecutive_empty_failures.saturating_add(1);
        if state.consecutive_empty_failures < TRIP_THRESHOLD {
            return None;
        }

        let reopen_at = now_ms.saturating_add(cooldown_ms);
        state.tripped = true;
        state.consecutive_empty_failures = 0;
        state.reopen_at_ms = Some(reopen_at);
        info!(
            "{} global failure detected - disabling all {} providers until {}",
            family, family, reopen_at
        );
        Some(reopen_at)
    }

    /// A success resets the counter; it never closes an open breaker early.
    pub fn record_success(&mut self, family: &str) {
        if let Some(state) = self.states.get_mut(family) {
            state.consecutive_empty_failures = 0;
        }
    }

    /// Clears the breaker that was scheduled to reopen at `reopen_at_ms`. A newer trip (with a
    /// different deadline) is left alone. Returns whether anything changed.
    pub fn reopen(&mut self, family: &str, reopen_at_ms: u64) -> bool {
        match self.states.get_mut(family) {
            Some(state) if state.tripped && state.reopen_at_ms == Some(reopen_at_ms) => {
                state.tripped = false;
                state.consecutive_empty_failures = 0;
                state.reopen_at_ms = None;
                info!("{} global failure cleared - re-enabling {} providers", family, family);
                true
            }
            _ => false,
        }
    }

    /// Clears every breaker whose cooldown has passed. Returns the families that reopened.
    pub fn clear_expired(&mut self, now_ms: u64) -> Vec<String> {
        let expired: Vec<(String, u64)> = self
            .states
            .iter()
            .filter_map(|(family, state)| match state.reopen_at_ms {
                Some(at) if state.tripped && at <= now_ms => Some((family.clone(), at)),
                _ => None,
            })
            .collect();
        expired
            .into_iter()
            .filter(|(family, at)| self.reopen(family, *at))
            .map(|(family, _)| family)
            .collect()
    }

    /// Restores a persisted state. A breaker whose cooldown already ended comes back closed, and a
    /// trip saved without a deadline gets a full cooldown from `now_ms`.
    pub fn restore(&mut self, family: &str, mut state: FamilyCircuitState, now_ms: u64) {
        if state.tripped && state.reopen_at_ms.is_none() {
            state.reopen_at_ms = Some(now_ms.saturating_add(TRIP_COOLDOWN_MS));
        }
        if state.tripped && !state.is_open(now_ms) {
            state.tripped = false;
            state.reopen_at_ms = None;
        }
        if !state.tripped {
            state.reopen_at_ms = None;
        }
        self.states.insert(family.to_string(), state);
    }

    pub fn clear(&mut self) {
        self.states.clear();
    }
}
