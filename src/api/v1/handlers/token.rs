//! Token lifecycle endpoints: refresh rotation and key-based recovery.

use axum::{
    Json,
    extract::{OriginalUri, State},
    http::{HeaderMap, Method},
};
use tracing::warn;

use crate::api::v1::dto::tokens::{RefreshRequest, TokenResponse};
use crate::error::AppError;
use crate::services::auth::enrollment::EnrollError;
use crate::services::auth::rotation::RotateError;
use crate::services::auth::token_issuer::hash_refresh_token;
use crate::state::AppState;

pub async fn refresh(
    State(state): State<AppState>,
    Json(req): Json<RefreshRequest>,
) -> Result<Json<TokenResponse>, AppError> {
    if req.refresh_token.is_empty() {
        return Err(AppError::InvalidRequest(
            "refresh_token is required".to_string(),
        ));
    }

    // Keyed by token hash so one hammered token cannot starve the rest of
    // the fleet, and the plaintext never reaches the limiter.
    let limiter_key = format!("refresh:{}", hash_refresh_token(&req.refresh_token));
    if !state.rate_limiter.allow(&limiter_key).await {
        return Err(AppError::RateLimited);
    }

    let pair = state
        .rotation
        .rotate(&req.refresh_token)
        .await
        .map_err(|err| match err {
            RotateError::Storage => AppError::Internal,
            err => {
                warn!(error = ?err, "refresh rotation refused");
                AppError::Unauthenticated
            }
        })?;

    Ok(Json(pair.into()))
}

/// Recovery for a device holding its key but no usable refresh token. The
/// DPoP proof alone authenticates; there is no bearer token to present.
pub async fn recover(
    State(state): State<AppState>,
    OriginalUri(original_uri): OriginalUri,
    method: Method,
    headers: HeaderMap,
) -> Result<Json<TokenResponse>, AppError> {
    let proof = state
        .dpop
        .verify_proof(&headers, &method, &original_uri)
        .await
        .map_err(|err| {
            warn!(error = ?err, "recovery DPoP proof rejected");
            AppError::Unauthenticated
        })?;

    if !state
        .rate_limiter
        .allow(&format!("recover:{}", proof.jkt))
        .await
    {
        return Err(AppError::RateLimited);
    }

    let pair = state
        .enrollment
        .recover(&proof.jkt)
        .await
        .map_err(|err| match err {
            EnrollError::UnknownKey => AppError::NotFound,
            EnrollError::Storage => AppError::Internal,
            _ => AppError::Unauthenticated,
        })?;

    Ok(Json(pair.into()))
}
