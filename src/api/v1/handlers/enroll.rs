//! Enrollment endpoints: status probe and one-time registration.

use axum::{
    Json,
    extract::{OriginalUri, Path, State},
    http::{HeaderMap, Method, StatusCode},
};
use tracing::warn;

use crate::api::v1::dto::enroll::{EnrollRequest, EnrollStatusResponse};
use crate::api::v1::dto::tokens::TokenResponse;
use crate::error::AppError;
use crate::services::auth::enrollment::EnrollError;
use crate::state::AppState;

pub async fn enroll_status(
    State(state): State<AppState>,
    Path(fingerprint_hash): Path<String>,
) -> Result<Json<EnrollStatusResponse>, AppError> {
    let enrolled = state
        .enrollment
        .is_enrolled(&fingerprint_hash)
        .await
        .map_err(|_| AppError::Internal)?;

    Ok(Json(EnrollStatusResponse { enrolled }))
}

pub async fn enroll(
    State(state): State<AppState>,
    OriginalUri(original_uri): OriginalUri,
    method: Method,
    headers: HeaderMap,
    Json(req): Json<EnrollRequest>,
) -> Result<(StatusCode, Json<TokenResponse>), AppError> {
    if req.fingerprint_hash.is_empty() {
        return Err(AppError::InvalidRequest(
            "fingerprint_hash is required".to_string(),
        ));
    }
    if req.enrollment_token.is_empty() {
        return Err(AppError::InvalidRequest(
            "enrollment_token is required".to_string(),
        ));
    }

    if !state
        .rate_limiter
        .allow(&format!("enroll:{}", req.fingerprint_hash))
        .await
    {
        return Err(AppError::RateLimited);
    }

    // Key binding is optional at enrollment. When the device attaches a
    // DPoP proof, its thumbprint becomes the device's bound key; a proof
    // that fails to verify fails the whole request.
    let jkt = match headers.get("DPoP") {
        Some(_) => {
            let proof = state
                .dpop
                .verify_proof(&headers, &method, &original_uri)
                .await
                .map_err(|err| {
                    warn!(error = ?err, "enrollment DPoP proof rejected");
                    AppError::Unauthenticated
                })?;
            Some(proof.jkt)
        }
        None => None,
    };

    let pair = state
        .enrollment
        .enroll(
            &req.enrollment_token,
            &req.fingerprint_hash,
            req.name.as_deref(),
            jkt.as_deref(),
        )
        .await
        .map_err(|err| match err {
            EnrollError::AlreadyEnrolled => AppError::Conflict("already enrolled"),
            EnrollError::TokenInvalid => {
                warn!("enrollment token rejected");
                AppError::Unauthenticated
            }
            EnrollError::UnknownKey => AppError::NotFound,
            EnrollError::Storage => AppError::Internal,
        })?;

    Ok((StatusCode::CREATED, Json(pair.into())))
}
