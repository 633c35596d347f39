//! Startup: tracing, config, dependency construction, router, serve.

use std::sync::Arc;
use std::time::Duration;
use std::{panic, process};

use axum::{Router, routing::get};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::api;
use crate::config::Config;
use crate::error::AppError;
use crate::middleware;
use crate::repos::directory::{
    CertificateDirectory, DeviceDirectory, EnrollmentTokenDirectory, RefreshTokenDirectory,
};
use crate::repos::memory::MemoryDirectory;
use crate::repos::postgres::PgDirectory;
use crate::services::auth::dpop::{DpopPolicy, DpopValidator};
use crate::services::auth::enrollment::EnrollmentService;
use crate::services::auth::jwt::JwtSigner;
use crate::services::auth::rate_limit::RateLimiter;
use crate::services::auth::replay::ReplayStore;
use crate::services::auth::rotation::RotationService;
use crate::services::auth::token_issuer::TokenService;
use crate::services::ca::{CertVerifier, CertificateAuthority};
use crate::services::cache::{CacheClient, MemoryCache, ValkeyClient};
use crate::state::AppState;

fn init_tracing() {
    // Prefer RUST_LOG if set; otherwise use a sensible default.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,tower_http=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn init_panic_hook(abort_on_panic: bool) {
    let default_hook = panic::take_hook();

    panic::set_hook(Box::new(move |info| {
        // Surface panics via tracing so they don't get lost when stderr is
        // hidden by the launcher.
        tracing::error!(?info, "panic");

        // In development, fail fast. In production, keep the server up and
        // rely on the default hook's stderr output.
        if abort_on_panic {
            process::abort();
        } else {
            default_hook(info);
        }
    }))
}

pub async fn run() -> Result<(), AppError> {
    init_tracing();
    let config = Config::from_env()?;

    let abort_on_panic = !config.app_env.is_production();
    init_panic_hook(abort_on_panic);

    tracing::info!(
        "starting credential API in {:?} mode on {}",
        config.app_env,
        config.addr
    );

    let state = build_state(&config).await?;
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(config.addr)
        .await
        .map_err(|_| AppError::Internal)?;
    axum::serve(listener, app)
        .await
        .map_err(|_| AppError::Internal)?;

    Ok(())
}

async fn build_state(config: &Config) -> Result<AppState, AppError> {
    type Directories = (
        Arc<dyn DeviceDirectory>,
        Arc<dyn EnrollmentTokenDirectory>,
        Arc<dyn RefreshTokenDirectory>,
        Arc<dyn CertificateDirectory>,
    );

    let (devices, enrollment_tokens, refresh_tokens, certificates): Directories =
        match &config.database_url {
            Some(url) => {
                let pool = PgPoolOptions::new()
                    .max_connections(10)
                    .connect(url)
                    .await
                    .map_err(|e| {
                        tracing::error!(error = %e, "failed to connect to Postgres");
                        AppError::Internal
                    })?;
                let dir = Arc::new(PgDirectory::new(pool));
                (dir.clone(), dir.clone(), dir.clone(), dir)
            }
            None => {
                tracing::warn!("DATABASE_URL not set; using the in-memory directory");
                let dir = Arc::new(MemoryDirectory::new());
                // Local development needs at least one way in.
                if let Ok(token) = std::env::var("DEV_ENROLLMENT_TOKEN") {
                    dir.add_enrollment_token(&token, -1);
                }
                (dir.clone(), dir.clone(), dir.clone(), dir)
            }
        };

    let cache: Arc<dyn CacheClient> = match &config.redis_url {
        Some(url) => Arc::new(ValkeyClient::new(url).await.map_err(|e| {
            tracing::error!(error = %e, "failed to connect to the replay cache backend");
            AppError::Internal
        })?),
        None => {
            tracing::warn!("REDIS_URL not set; replay cache is in-process only");
            Arc::new(MemoryCache::new())
        }
    };
    tracing::info!(backend = cache.backend_name(), "replay cache ready");

    let jwt = Arc::new(JwtSigner::from_config(config).map_err(|e| {
        tracing::error!(error = %e, "access token signer unavailable");
        AppError::Internal
    })?);

    let tokens = Arc::new(TokenService::new(
        jwt.clone(),
        refresh_tokens.clone(),
        config.refresh_token_ttl_seconds,
    ));
    let rotation = Arc::new(RotationService::new(
        refresh_tokens.clone(),
        tokens.clone(),
        config.refresh_grace_seconds,
    ));
    let enrollment = Arc::new(EnrollmentService::new(
        devices,
        enrollment_tokens,
        refresh_tokens,
        tokens,
    ));

    let replay = ReplayStore::new(cache, "dpop:jti");
    let dpop = Arc::new(
        DpopValidator::new(
            DpopPolicy {
                iat_leeway_seconds: config.dpop_iat_leeway_seconds,
                max_age_seconds: config.dpop_max_age_seconds,
            },
            jwt,
            replay,
            &config.external_url,
        )
        .map_err(|e| {
            tracing::error!(error = %e, "invalid API_EXTERNAL_URL");
            AppError::Internal
        })?,
    );

    let rate_limiter = Arc::new(RateLimiter::new(
        config.rate_limit_max,
        Duration::from_secs(config.rate_limit_window_seconds),
    ));

    let ca = match (&config.ca_cert_path, &config.ca_key_path) {
        (Some(cert_path), Some(key_path)) => Some(Arc::new(
            CertificateAuthority::from_files(
                cert_path,
                key_path,
                config.cert_validity_days as u32,
                certificates.clone(),
            )
            .map_err(|e| {
                tracing::error!(error = %e, "failed to load CA material");
                AppError::Internal
            })?,
        )),
        (None, None) => {
            tracing::warn!("CA material not configured; certificate endpoints disabled");
            None
        }
        _ => {
            tracing::error!("CERT_CA_CERT_PATH and CERT_CA_KEY_PATH must be set together");
            return Err(AppError::Internal);
        }
    };

    Ok(AppState {
        enrollment,
        rotation,
        dpop,
        rate_limiter,
        ca,
        cert_verifier: Arc::new(CertVerifier::new(certificates)),
        mtls_required: config.mtls_required,
    })
}

fn build_router(state: AppState) -> Router {
    async fn health() -> &'static str {
        "ok"
    }

    let router = Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api::v1::routes(state.clone()))
        .with_state(state);

    middleware::http::apply(router)
}
