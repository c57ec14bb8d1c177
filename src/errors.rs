/// Error types surfaced by the router, its backends and its persistence layer
use std::path::PathBuf;

/// Errors returned from [`Router::route`](crate::router::Router::route) and the runtime controls.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RouterError {
    #[error("No AI providers configured")]
    NoProvidersConfigured,
    #[error("All AI providers failed: {0}")]
    AllProvidersFailed(String),
    #[error("Invalid provider type '{given}'. Valid options: {}", valid.join(", "))]
    InvalidProviderType { given: String, valid: Vec<String> },
}

/// A single backend call failing. Recorded against the provider, then the router moves on.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct ProviderCallError {
    pub message: String,
    pub status: Option<u16>,
}

impl ProviderCallError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(message: impl Into<String>, status: u16) -> Self {
        Self {
            message: message.into(),
            status: Some(status),
        }
    }

    /// Whether this failure means the backend answered with nothing usable.
    pub fn is_empty_response(&self) -> bool {
        self.message.to_lowercase().contains("empty")
    }
}

/// Snapshot I/O failures. These are logged and never fail a route call.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Failed to load provider state from {path}: {reason}")]
    Load { path: PathBuf, reason: String },
    #[error("Failed to persist provider state to {path}: {reason}")]
    Write { path: PathBuf, reason: String },
}

/// Problems building the provider registry from configuration.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Duplicate provider name: {0}")]
    DuplicateProvider(String),
    #[error("Provider {name} has an invalid url: {reason}")]
    InvalidUrl { name: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_response_classification_is_case_insensitive() {
        assert!(ProviderCallError::new("Empty response from provider").is_empty_response());
        assert!(ProviderCallError::new("model returned EMPTY content").is_empty_response());
        assert!(!ProviderCallError::with_status("rate limited", 429).is_empty_response());
    }

    #[test]
    fn test_invalid_provider_type_lists_options() {
        let err = RouterError::InvalidProviderType {
            given: "bogus".into(),
            valid: vec!["auto".into(), "groq".into()],
        };
        assert_eq!(
            err.to_string(),
            "Invalid provider type 'bogus'. Valid options: auto, groq"
        );
    }

    #[test]
    fn test_all_failed_carries_last_message() {
        let err = RouterError::AllProvidersFailed("upstream 503".into());
        assert_eq!(err.to_string(), "All AI providers failed: upstream 503");
    }
}
