use std::sync::Arc;

use crate::services::auth::dpop::DpopValidator;
use crate::services::auth::enrollment::EnrollmentService;
use crate::services::auth::rate_limit::RateLimiter;
use crate::services::auth::rotation::RotationService;
use crate::services::ca::{CertVerifier, CertificateAuthority};

/// Shared application state. Every service is built once at startup and
/// injected; handlers never reach for globals.
#[derive(Clone)]
pub struct AppState {
    pub enrollment: Arc<EnrollmentService>,
    pub rotation: Arc<RotationService>,
    pub dpop: Arc<DpopValidator>,
    pub rate_limiter: Arc<RateLimiter>,
    /// Present only when CA material is configured.
    pub ca: Option<Arc<CertificateAuthority>>,
    pub cert_verifier: Arc<CertVerifier>,
    pub mtls_required: bool,
}
