/// Axum handlers for the router's HTTP surface
use crate::AppState;
use crate::auth;
use crate::errors::RouterError;
use crate::models::{
    ControlsResponse, DEFAULT_MAX_TOKENS, ErrorResponse, GenerateRequest, GenerateResponse,
    ProviderTypeBody, SelectionModeBody,
};
use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::{debug, info, instrument, warn};

/// Errors a handler can answer with.
#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    BadRequest(String),
    Router(RouterError),
}

impl From<RouterError> for ApiError {
    fn from(err: RouterError) -> Self {
        ApiError::Router(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Router(err) => {
                let status = match err {
                    RouterError::NoProvidersConfigured => StatusCode::INTERNAL_SERVER_ERROR,
                    RouterError::AllProvidersFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
                    RouterError::InvalidProviderType { .. } => StatusCode::BAD_REQUEST,
                };
                (status, err.to_string())
            }
        };
        (status, Json(ErrorResponse::new(message))).into_response()
    }
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    if auth::is_authorized(state.admin_keys.as_deref(), headers) {
        Ok(())
    } else {
        debug!("Rejected admin request with missing or invalid key");
        Err(ApiError::Unauthorized)
    }
}

fn controls(state: &AppState) -> ControlsResponse {
    ControlsResponse {
        selection_mode: state.router.selection_mode(),
        provider_type: state.router.provider_type(),
        available_provider_types: state.router.available_provider_types(),
    }
}

/// Routes one prompt. A total failure is retried once, since the failed providers are now
/// disabled and the second pass tries whoever is left.
#[instrument(skip(state, request))]
pub async fn generate(
    State(state): State<AppState>,
    Json(request): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, ApiError> {
    if request.prompt.trim().is_empty() {
        return Err(ApiError::BadRequest("prompt must not be empty".into()));
    }
    let max_tokens = request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);

    let routed = match state
        .router
        .route(&request.system, &request.prompt, max_tokens)
        .await
    {
        Err(RouterError::AllProvidersFailed(reason)) => {
            warn!("All providers failed ({}), retrying once", reason);
            state
                .router
                .route(&request.system, &request.prompt, max_tokens)
                .await
        }
        other => other,
    }?;

    Ok(Json(GenerateResponse {
        content: routed.content,
        provider: routed.provider,
    }))
}

#[instrument(skip(state))]
pub async fn providers(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.router.redacted_status())
}

#[instrument(skip(state, headers))]
pub async fn status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers)?;
    Ok(Json(state.router.status()))
}

#[instrument(skip(state, headers))]
pub async fn analytics(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers)?;
    Ok(Json(state.router.analytics()))
}

#[instrument(skip(state, headers))]
pub async fn health(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers)?;
    Ok(Json(state.router.health_summary()))
}

#[instrument(skip(state, headers))]
pub async fn stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers)?;
    Ok(Json(state.router.usage_stats()))
}

#[instrument(skip(state, headers))]
pub async fn set_selection_mode(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SelectionModeBody>,
) -> Result<Json<ControlsResponse>, ApiError> {
    authorize(&state, &headers)?;
    state.router.set_selection_mode(body.mode);
    Ok(Json(controls(&state)))
}

#[instrument(skip(state, headers))]
pub async fn set_provider_type(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ProviderTypeBody>,
) -> Result<Json<ControlsResponse>, ApiError> {
    authorize(&state, &headers)?;
    state.router.set_provider_type(&body.provider_type)?;
    Ok(Json(controls(&state)))
}

#[instrument(skip(state, headers))]
pub async fn reset(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    authorize(&state, &headers)?;
    state.router.reset();
    info!("Provider health reset by admin request");
    Ok(StatusCode::NO_CONTENT)
}
