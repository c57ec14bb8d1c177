/// Request and response bodies for the HTTP endpoints.
use crate::selection::SelectionMode;
use serde::{Deserialize, Serialize};

pub(crate) const DEFAULT_MAX_TOKENS: u32 = 1024;

/// Body of `POST /v1/generate`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GenerateRequest {
    /// The system prompt. May be empty.
    #[serde(default)]
    pub system: String,
    pub prompt: String,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct GenerateResponse {
    pub content: String,
    pub provider: String,
}

/// Every error body: `{"error": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub(crate) fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct SelectionModeBody {
    pub mode: SelectionMode,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderTypeBody {
    #[serde(rename = "type")]
    pub provider_type: String,
}

/// Current controls, returned from the control endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ControlsResponse {
    pub selection_mode: SelectionMode,
    pub provider_type: String,
    pub available_provider_types: Vec<String>,
}
