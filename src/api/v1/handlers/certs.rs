//! Client-certificate endpoints. Available only when CA material is
//! configured; otherwise the routes answer 404.

use axum::{Extension, Json, extract::State, http::StatusCode};
use tracing::warn;

use crate::api::v1::dto::certs::{CertRequest, CertResponse};
use crate::api::v1::extractors::DeviceCtxExtractor;
use crate::error::AppError;
use crate::middleware::mtls::MtlsIdentity;
use crate::services::ca::CaError;
use crate::state::AppState;

pub async fn enroll_cert(
    State(state): State<AppState>,
    DeviceCtxExtractor(ctx): DeviceCtxExtractor,
    Json(req): Json<CertRequest>,
) -> Result<(StatusCode, Json<CertResponse>), AppError> {
    let ca = state.ca.as_ref().ok_or(AppError::NotFound)?;

    let issued = ca
        .sign_csr_for(ctx.device_id, &req.csr_pem)
        .await
        .map_err(map_ca_error)?;

    Ok((StatusCode::CREATED, Json(issued.into())))
}

/// Replace the certificate presented as the caller's mTLS identity. The
/// presented serial is revoked as part of issuing the successor.
pub async fn rotate_cert(
    State(state): State<AppState>,
    DeviceCtxExtractor(ctx): DeviceCtxExtractor,
    identity: Option<Extension<MtlsIdentity>>,
    Json(req): Json<CertRequest>,
) -> Result<Json<CertResponse>, AppError> {
    let ca = state.ca.as_ref().ok_or(AppError::NotFound)?;
    let Extension(identity) = identity.ok_or(AppError::Unauthenticated)?;

    if identity.device_id != ctx.device_id {
        warn!(
            token_device = %ctx.device_id,
            cert_device = %identity.device_id,
            "mTLS identity does not match the access token"
        );
        return Err(AppError::Unauthenticated);
    }

    let issued = ca
        .rotate(identity.device_id, &identity.serial, &req.csr_pem)
        .await
        .map_err(map_ca_error)?;

    Ok(Json(issued.into()))
}

fn map_ca_error(err: CaError) -> AppError {
    match err {
        CaError::InvalidCsr | CaError::UnsupportedKeyType | CaError::MissingDeviceSan => {
            AppError::InvalidRequest(err.to_string())
        }
        CaError::CsrDeviceMismatch => {
            warn!("CSR identity rejected");
            AppError::Unauthenticated
        }
        CaError::KeyMaterial | CaError::Signing | CaError::Storage => AppError::Internal,
    }
}
