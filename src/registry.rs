//! The provider registry: which backends exist, what they cost, and how to call them
//!
//! Providers are read once at startup from a JSON config file and never change afterwards. The
//! registry keeps them ordered cheapest tier first; ranking refines that order per request but the
//! base order is what breaks exact ties.
use crate::backend::{AdapterKind, ChatBackend};
use crate::client::HttpClient;
use crate::errors::RegistryError;
use crate::router::RouterSettings;
use anyhow::anyhow;
use bon::Builder;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Coarse pricing class. Cheaper tiers are always tried before more expensive ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostTier {
    Free,
    Freemium,
    #[default]
    Paid,
}

impl CostTier {
    /// The numeric priority reported in status output (lower is preferred).
    pub fn priority(self) -> u8 {
        match self {
            CostTier::Free => 0,
            CostTier::Freemium => 1,
            CostTier::Paid => 2,
        }
    }
}

impl std::fmt::Display for CostTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CostTier::Free => "free",
            CostTier::Freemium => "freemium",
            CostTier::Paid => "paid",
        })
    }
}

/// A routable backend.
#[derive(Debug, Clone, Builder)]
pub struct Provider {
    #[builder(into)]
    pub name: String,
    /// The model string passed to the backend.
    #[builder(into)]
    pub model: String,
    #[builder(into)]
    pub family: String,
    #[builder(default)]
    pub cost_tier: CostTier,
    pub backend: Arc<dyn ChatBackend>,
}

/// One provider entry in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub model: String,
    pub family: String,
    #[serde(default)]
    pub cost_tier: CostTier,
    /// Wire format; defaults from the family when absent.
    #[serde(default)]
    pub adapter: Option<AdapterKind>,
    pub url: Url,
    #[serde(default)]
    pub key: Option<String>,
    /// Name of an environment variable holding the key. Takes precedence over `key`.
    #[serde(default)]
    pub key_env: Option<String>,
}

/// The config file: the providers plus router tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub router: RouterSettings,
}

impl ConfigFile {
    pub async fn from_path(config_path: &Path) -> Result<Self, anyhow::Error> {
        let contents = tokio::fs::read_to_string(config_path).await.map_err(|e| {
            anyhow!(
                "Failed to read config file {}: {}",
                config_path.display(),
                e
            )
        })?;

        serde_json::from_str(&contents).map_err(|e| {
            anyhow!(
                "Failed to parse config file {}: {}",
                config_path.display(),
                e
            )
        })
    }
}

/// The fixed, tier-ordered list of providers.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    providers: Vec<Provider>,
}

impl Registry {
    pub fn new(mut providers: Vec<Provider>) -> Result<Self, RegistryError> {
        let mut seen = HashSet::new();
        for provider in &providers {
            if !seen.insert(provider.name.as_str()) {
                return Err(RegistryError::DuplicateProvider(provider.name.clone()));
            }
        }
        // Stable: within a tier the configured order is kept.
        providers.sort_by_key(|p| p.cost_tier);
        Ok(Self { providers })
    }

    /// Builds backends for every configured provider.
    ///
    /// Entries naming a `key_env` that isn't set are skipped, so a deployment can list every
    /// provider it might use and only enable the ones it has keys for.
    pub fn from_configs<T>(
        configs: &[ProviderConfig],
        client: T,
        timeout: Duration,
    ) -> Result<Self, RegistryError>
    where
        T: HttpClient + Clone + 'static,
    {
        let mut providers = Vec::with_capacity(configs.len());
        for config in configs {
            let key = match &config.key_env {
                Some(var) => match std::env::var(var) {
                    Ok(value) if !value.trim().is_empty() => Some(value),
                    _ => {
                        warn!(
                            "Skipping provider {}: environment variable {} is not set",
                            config.name, var
                        );
                        continue;
                    }
                },
                None => config.key.clone(),
            };

            if config.url.cannot_be_a_base() {
                return Err(RegistryError::InvalidUrl {
                    name: config.name.clone(),
                    reason: "url cannot be used as a base".into(),
                });
            }

            let family = config.family.to_lowercase();
            let adapter = config
                .adapter
                .unwrap_or_else(|| AdapterKind::for_family(&family));
            debug!(
                "Provider {} ({}) family={} tier={} adapter={:?}",
                config.name, config.model, family, config.cost_tier, adapter
            );

            providers.push(
                Provider::builder()
                    .name(config.name.clone())
                    .model(config.model.clone())
                    .family(family)
                    .cost_tier(config.cost_tier)
                    .backend(adapter.build(client.clone(), config.url.clone(), key, timeout))
                    .build(),
            );
        }

        let registry = Self::new(providers)?;
        info!("Initialized {} AI providers", registry.len());
        Ok(registry)
    }

    pub fn providers(&self) -> &[Provider] {
        &self.providers
    }

    pub fn by_family(&self, family: &str) -> Vec<&Provider> {
        self.providers
            .iter()
            .filter(|p| p.family == family)
            .collect()
    }

    pub fn families(&self) -> BTreeSet<String> {
        self.providers.iter().map(|p| p.family.clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&Provider> {
        self.providers.iter().find(|p| p.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockHttpClient, ScriptedBackend};
    use axum::http::StatusCode;

    fn provider(name: &str, family: &str, tier: CostTier) -> Provider {
        Provider::builder()
            .name(name)
            .model(format!("{name}-model"))
            .family(family)
            .cost_tier(tier)
            .backend(Arc::new(ScriptedBackend::always_ok("ok")))
            .build()
    }

    #[test]
    fn test_registry_sorted_by_tier_and_stable_within_tier() {
        let registry = Registry::new(vec![
            provider("paid-1", "openai", CostTier::Paid),
            provider("free-1", "groq", CostTier::Free),
            provider("freemium-1", "deepseek", CostTier::Freemium),
            provider("free-2", "openrouter", CostTier::Free),
        ])
        .unwrap();

        let names: Vec<&str> = registry.providers().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["free-1", "free-2", "freemium-1", "paid-1"]);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let err = Registry::new(vec![
            provider("a", "groq", CostTier::Free),
            provider("a", "openai", CostTier::Paid),
        ])
        .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateProvider(name) if name == "a"));
    }

    #[test]
    fn test_family_queries() {
        let registry = Registry::new(vec![
            provider("or-1", "openrouter", CostTier::Free),
            provider("or-2", "openrouter", CostTier::Free),
            provider("gpt", "openai", CostTier::Paid),
        ])
        .unwrap();

        assert_eq!(registry.by_family("openrouter").len(), 2);
        assert!(registry.by_family("google").is_empty());
        assert_eq!(
            registry.families().into_iter().collect::<Vec<_>>(),
            vec!["openai".to_string(), "openrouter".to_string()]
        );
        assert!(registry.contains("gpt"));
        assert!(!registry.contains("nope"));
    }

    #[test]
    fn test_cost_tier_order_and_default() {
        assert!(CostTier::Free < CostTier::Freemium);
        assert!(CostTier::Freemium < CostTier::Paid);
        assert_eq!(CostTier::default(), CostTier::Paid);
        assert_eq!(CostTier::Freemium.priority(), 1);
    }

    #[test]
    fn test_config_file_parsing_and_build() {
        let config: ConfigFile = serde_json::from_str(
            r#"{
                "providers": [
                    {"name": "GPT", "model": "gpt-4o-mini", "family": "OpenAI",
                     "url": "https://api.openai.com/v1", "key": "sk-1"},
                    {"name": "Gemini1", "model": "gemini-2.5-flash", "family": "google",
                     "cost_tier": "free", "url": "https://generativelanguage.googleapis.com/v1beta"},
                    {"name": "Skipped", "model": "m", "family": "groq", "cost_tier": "free",
                     "url": "https://api.groq.com/openai/v1",
                     "key_env": "SWITCHYARD_TEST_KEY_THAT_IS_NOT_SET"}
                ],
                "router": {"tracked_families": ["google"]}
            }"#,
        )
        .unwrap();

        assert_eq!(config.router.tracked_families, vec!["google".to_string()]);

        let client = MockHttpClient::new(StatusCode::OK, "{}");
        let registry =
            Registry::from_configs(&config.providers, client, Duration::from_secs(1)).unwrap();

        assert_eq!(registry.len(), 2);
        // Free tier first, family normalized to lowercase, missing tier means paid.
        assert_eq!(registry.providers()[0].name, "Gemini1");
        let gpt = registry.get("GPT").unwrap();
        assert_eq!(gpt.family, "openai");
        assert_eq!(gpt.cost_tier, CostTier::Paid);
    }

    #[test]
    fn test_unknown_cost_tier_rejected() {
        let result: Result<ProviderConfig, _> = serde_json::from_str(
            r#"{"name": "x", "model": "m", "family": "f", "cost_tier": "cheap",
                "url": "https://example.com"}"#,
        );
        assert!(result.is_err());
    }
}
