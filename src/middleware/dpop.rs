//! DPoP-bound access token gate for protected routes.
//!
//! Verification itself lives in `services::auth::dpop`; this layer extracts
//! the request pieces, runs the gate, and hands the authenticated device to
//! handlers through a request extension.

use axum::{
    Router,
    body::Body,
    extract::{OriginalUri, State},
    http::Request,
    middleware::{self, Next},
    response::Response,
};
use tracing::warn;

use crate::api::v1::extractors::DeviceCtx;
use crate::error::AppError;
use crate::state::AppState;

/// Wrap `router` so every route requires a valid bearer + DPoP pair.
pub fn apply(router: Router<AppState>, state: AppState) -> Router<AppState> {
    // axum 0.8's from_fn cannot take a State extractor; from_fn_with_state
    // passes it explicitly.
    router.layer(middleware::from_fn_with_state(state, dpop_middleware))
}

async fn dpop_middleware(
    State(state): State<AppState>,
    OriginalUri(original_uri): OriginalUri,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    let device_id = state
        .dpop
        .validate(req.headers(), req.method(), &original_uri)
        .await
        .map_err(|err| {
            // Detail stays in the logs; the caller sees one uniform denial.
            warn!(error = ?err, "request authentication failed");
            AppError::Unauthenticated
        })?;

    req.extensions_mut().insert(DeviceCtx { device_id });

    Ok(next.run(req).await)
}
