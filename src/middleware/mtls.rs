//! Forwarded client-certificate handling.
//!
//! TLS is terminated ahead of this service; the proxy forwards the peer
//! certificate as base64 DER in `x-client-cert`. When present it is verified
//! against the certificate directory and the resulting identity is attached
//! to the request. When `MTLS_REQUIRED` is set, requests without it are
//! refused outright.

use axum::{
    Router,
    body::Body,
    extract::State,
    http::Request,
    middleware::{self, Next},
    response::Response,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use tracing::warn;
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

pub const CLIENT_CERT_HEADER: &str = "x-client-cert";

/// Identity established by the verified client certificate.
#[derive(Clone, Debug)]
pub struct MtlsIdentity {
    pub device_id: Uuid,
    /// Serial of the certificate the peer presented; rotation revokes it.
    pub serial: String,
}

pub fn apply(router: Router<AppState>, state: AppState) -> Router<AppState> {
    router.layer(middleware::from_fn_with_state(state, mtls_middleware))
}

async fn mtls_middleware(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    match req.headers().get(CLIENT_CERT_HEADER) {
        Some(value) => {
            let der = value
                .to_str()
                .ok()
                .and_then(|v| BASE64_STANDARD.decode(v).ok())
                .ok_or_else(|| {
                    warn!("unreadable forwarded client certificate");
                    AppError::Unauthenticated
                })?;

            let identity = state
                .cert_verifier
                .verify_device_cert(&der)
                .await
                .map_err(|err| {
                    warn!(error = ?err, "client certificate verification failed");
                    AppError::Unauthenticated
                })?;

            req.extensions_mut().insert(MtlsIdentity {
                device_id: identity.device_id,
                serial: identity.serial,
            });
        }
        None if state.mtls_required => {
            warn!("client certificate required but absent");
            return Err(AppError::Unauthenticated);
        }
        None => {}
    }

    Ok(next.run(req).await)
}
