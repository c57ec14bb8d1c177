//! Candidate selection: which providers a request will try, and in what order
use crate::health::HealthStore;
use crate::registry::Provider;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::str::FromStr;

/// How the head of the candidate list is chosen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionMode {
    /// Cost tier, then score. Deterministic.
    Ranked,
    /// A random provider from the cheapest available tier first, then the ranked list.
    #[default]
    Exploration,
}

impl std::fmt::Display for SelectionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SelectionMode::Ranked => "ranked",
            SelectionMode::Exploration => "exploration",
        })
    }
}

impl FromStr for SelectionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ranked" => Ok(SelectionMode::Ranked),
            "exploration" | "random" => Ok(SelectionMode::Exploration),
            other => Err(format!(
                "Unknown selection mode '{other}'. Valid options: ranked, exploration"
            )),
        }
    }
}

/// Restricts routing to one backend family, or allows all of them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ProviderTypeFilter {
    #[default]
    Auto,
    Family(String),
}

impl ProviderTypeFilter {
    pub fn allows(&self, provider: &Provider) -> bool {
        match self {
            ProviderTypeFilter::Auto => true,
            ProviderTypeFilter::Family(family) => &provider.family == family,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ProviderTypeFilter::Auto => "auto",
            ProviderTypeFilter::Family(family) => family,
        }
    }
}

/// Why a provider was left out of a candidate list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exclusion {
    Disabled { until_ms: u64 },
    FamilyTripped,
    FilteredByType,
}

pub fn exclusion(
    provider: &Provider,
    health: &HealthStore,
    filter: &ProviderTypeFilter,
    now_ms: u64,
) -> Option<Exclusion> {
    if !filter.allows(provider) {
        return Some(Exclusion::FilteredByType);
    }
    if health.breakers().is_tripped(&provider.family, now_ms) {
        return Some(Exclusion::FamilyTripped);
    }
    if health.is_disabled(&provider.name, now_ms) {
        return Some(Exclusion::Disabled {
            until_ms: health.disabled_until(&provider.name).unwrap_or(now_ms),
        });
    }
    None
}

/// Providers not excluded at `now_ms`, in registry order.
pub fn available<'a>(
    providers: &'a [Provider],
    health: &HealthStore,
    filter: &ProviderTypeFilter,
    now_ms: u64,
) -> Vec<&'a Provider> {
    providers
        .iter()
        .filter(|p| match exclusion(p, health, filter, now_ms) {
            Some(reason) => {
                tracing::debug!("Skipping provider {}: {:?}", p.name, reason);
                false
            }
            None => true,
        })
        .collect()
}

/// Sorts by cost tier, then by score (best first). The sort is stable, so exact ties keep
/// registry order.
pub fn rank<'a>(mut providers: Vec<&'a Provider>, health: &HealthStore) -> Vec<&'a Provider> {
    providers.sort_by(|a, b| {
        a.cost_tier.cmp(&b.cost_tier).then_with(|| {
            health
                .score(&b.name)
                .partial_cmp(&health.score(&a.name))
                .unwrap_or(Ordering::Equal)
        })
    });
    providers
}

/// Picks uniformly among the available providers in the cheapest tier present.
pub fn exploration_pick<'a, R: Rng + ?Sized>(
    available: &[&'a Provider],
    rng: &mut R,
) -> Option<&'a Provider> {
    let cheapest = available.iter().map(|p| p.cost_tier).min()?;
    let pool: Vec<&'a Provider> = available
        .iter()
        .copied()
        .filter(|p| p.cost_tier == cheapest)
        .collect();
    let idx = rng.random_range(0..pool.len());
    Some(pool[idx])
}

/// Builds the ordered candidate list for one request. Empty when everything is excluded.
pub fn candidates<'a, R: Rng + ?Sized>(
    providers: &'a [Provider],
    health: &HealthStore,
    filter: &ProviderTypeFilter,
    mode: SelectionMode,
    now_ms: u64,
    rng: &mut R,
) -> Vec<&'a Provider> {
    let available = available(providers, health, filter, now_ms);

    match mode {
        SelectionMode::Ranked => rank(available, health),
        SelectionMode::Exploration => {
            let Some(first) = exploration_pick(&available, rng) else {
                return Vec::new();
            };
            let tail = rank(
                available
                    .into_iter()
                    .filter(|p| p.name != first.name)
                    .collect(),
                health,
            );
            std::iter::once(first).chain(tail).collect()
        }
    }
}
