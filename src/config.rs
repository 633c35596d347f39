/*
 * Responsibility
 * - Environment-sourced configuration (DATABASE_URL, signing keys, TTLs, CA paths)
 * - Validation at startup (missing/invalid config fails the boot)
 */
use std::net::SocketAddr;
use std::str::FromStr;
use std::{env, fmt};

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnv {
    Development,
    Production,
}

impl AppEnv {
    pub fn from_env() -> Self {
        match std::env::var("APP_ENV")
            .unwrap_or_else(|_| "development".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "production" | "prod" => Self::Production,
            _ => Self::Development,
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

/// Access-token signing algorithm. One of the two shapes the service supports;
/// everything else is rejected at startup rather than at verification time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningAlg {
    EdDsa,
    Hs256,
}

impl FromStr for SigningAlg {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EdDSA" => Ok(Self::EdDsa),
            "HS256" => Ok(Self::Hs256),
            _ => Err(()),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Missing(&'static str),
    Invalid(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Missing(key) => write!(f, "missing configuration: {}", key),
            ConfigError::Invalid(key) => write!(f, "invalid configuration: {}", key),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Clone, Debug)]
pub struct Config {
    pub addr: SocketAddr,
    pub app_env: AppEnv,

    /// Postgres directory. When unset the in-memory directory is used
    /// (development only; nothing survives a restart).
    pub database_url: Option<String>,
    /// Replay cache backend. When unset an in-process cache is used.
    pub redis_url: Option<String>,

    /// Externally visible base URL. Used as token issuer/audience and as the
    /// fallback origin for DPoP htu checks.
    pub external_url: String,

    pub signing_alg: SigningAlg,
    pub access_jwt_private_key_pem: Option<String>,
    pub access_jwt_public_key_pem: Option<String>,
    pub jwt_secret: Option<String>,

    // Token lifetimes (seconds)
    pub access_token_ttl_seconds: u64,
    pub refresh_token_ttl_seconds: u64,
    pub refresh_grace_seconds: i64,

    // DPoP proof windows (seconds)
    pub dpop_iat_leeway_seconds: i64,
    pub dpop_max_age_seconds: i64,

    pub rate_limit_max: usize,
    pub rate_limit_window_seconds: u64,

    // Client-certificate issuance. Both paths must be set to enable the CA.
    pub ca_cert_path: Option<String>,
    pub ca_key_path: Option<String>,
    pub cert_validity_days: i64,
    pub mtls_required: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let port: u16 = std::env::var("PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(8080);

        let addr: SocketAddr = SocketAddr::from_str(&format!("0.0.0.0:{}", port))
            .map_err(|_| ConfigError::Invalid("PORT"))?;

        let app_env = AppEnv::from_env();

        let database_url = env::var("DATABASE_URL").ok();
        let redis_url = env::var("REDIS_URL").ok();

        let external_url = env::var("API_EXTERNAL_URL")
            .map_err(|_| ConfigError::Missing("API_EXTERNAL_URL"))?
            .trim_end_matches('/')
            .to_string();

        let signing_alg = env::var("AUTH_SIGNING_ALG")
            .unwrap_or_else(|_| "EdDSA".to_string())
            .parse::<SigningAlg>()
            .map_err(|_| ConfigError::Invalid("AUTH_SIGNING_ALG"))?;

        let access_jwt_private_key_pem = env::var("ACCESS_JWT_PRIVATE_KEY_PEM")
            .ok()
            .map(|v| v.replace("\\n", "\n"));
        let access_jwt_public_key_pem = env::var("ACCESS_JWT_PUBLIC_KEY_PEM")
            .ok()
            .map(|v| v.replace("\\n", "\n"));
        let jwt_secret = env::var("JWT_SECRET").ok();

        match signing_alg {
            SigningAlg::EdDsa => {
                if access_jwt_private_key_pem.is_none() {
                    return Err(ConfigError::Missing("ACCESS_JWT_PRIVATE_KEY_PEM"));
                }
                if access_jwt_public_key_pem.is_none() {
                    return Err(ConfigError::Missing("ACCESS_JWT_PUBLIC_KEY_PEM"));
                }
            }
            SigningAlg::Hs256 => match &jwt_secret {
                None => return Err(ConfigError::Missing("JWT_SECRET")),
                Some(s) if s.len() < 32 => return Err(ConfigError::Invalid("JWT_SECRET")),
                Some(_) => {}
            },
        }

        let access_token_ttl_seconds = env_u64("ACCESS_TOKEN_TTL_SECONDS", 600);
        let refresh_token_ttl_seconds = env_u64("REFRESH_TOKEN_TTL_SECONDS", 2_592_000);
        let refresh_grace_seconds = env_u64("REFRESH_GRACE_SECONDS", 120) as i64;

        let dpop_iat_leeway_seconds = env_u64("DPOP_IAT_LEEWAY_SECONDS", 120) as i64;
        let dpop_max_age_seconds = env_u64("DPOP_MAX_AGE_SECONDS", 900) as i64;

        let rate_limit_max = env_u64("RATE_LIMIT_MAX", 60) as usize;
        let rate_limit_window_seconds = env_u64("RATE_LIMIT_WINDOW_SECONDS", 60);

        let ca_cert_path = env::var("CERT_CA_CERT_PATH").ok();
        let ca_key_path = env::var("CERT_CA_KEY_PATH").ok();
        let cert_validity_days = env_u64("CERT_VALIDITY_DAYS", 30) as i64;
        let mtls_required = env::var("MTLS_REQUIRED")
            .map(|v| v == "true")
            .unwrap_or(false);

        Ok(Config {
            addr,
            app_env,
            database_url,
            redis_url,
            external_url,
            signing_alg,
            access_jwt_private_key_pem,
            access_jwt_public_key_pem,
            jwt_secret,
            access_token_ttl_seconds,
            refresh_token_ttl_seconds,
            refresh_grace_seconds,
            dpop_iat_leeway_seconds,
            dpop_max_age_seconds,
            rate_limit_max,
            rate_limit_window_seconds,
            ca_cert_path,
            ca_key_path,
            cert_validity_days,
            mtls_required,
        })
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl From<ConfigError> for AppError {
    fn from(_: ConfigError) -> Self {
        AppError::Internal
    }
}
