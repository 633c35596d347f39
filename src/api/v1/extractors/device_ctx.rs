use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

/// Authenticated device identity, set by the DPoP middleware.
#[derive(Clone, Copy, Debug)]
pub struct DeviceCtx {
    pub device_id: Uuid,
}

/// Handler-side extractor for `DeviceCtx`. Missing means the route was not
/// wrapped by the auth middleware; refuse rather than run unauthenticated.
pub struct DeviceCtxExtractor(pub DeviceCtx);

impl FromRequestParts<AppState> for DeviceCtxExtractor
where
    AppState: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<DeviceCtx>()
            .copied()
            .map(DeviceCtxExtractor)
            .ok_or(AppError::Unauthenticated)
    }
}
