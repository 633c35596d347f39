/*
 * Responsibility
 * - v1 URL structure
 * - which ranges require the DPoP gate and the forwarded-cert check
 */
use axum::{
    Router,
    routing::{get, post},
};

use crate::api::v1::handlers::{certs, device, enroll, token};
use crate::middleware;
use crate::state::AppState;

pub fn routes(state: AppState) -> Router<AppState> {
    // Credential acquisition: nothing here can require an access token.
    let public = Router::new()
        .route("/enroll/{fingerprint_hash}", get(enroll::enroll_status))
        .route("/enroll", post(enroll::enroll))
        .route("/auth/refresh", post(token::refresh))
        .route("/auth/recover", post(token::recover));

    let protected = Router::new()
        .route("/whoami", get(device::whoami))
        .route("/certs/enroll", post(certs::enroll_cert));
    let protected = middleware::dpop::apply(protected, state.clone());

    // Rotation additionally consumes the forwarded client certificate as
    // the identity being replaced.
    let rotate = Router::new().route("/certs/rotate", post(certs::rotate_cert));
    let rotate = middleware::mtls::apply(
        middleware::dpop::apply(rotate, state.clone()),
        state,
    );

    public.merge(protected).merge(rotate)
}
