//! Token pair issuance: signed access token + opaque refresh token.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::error;
use uuid::Uuid;

use crate::error::AppError;
use crate::repos::directory::RefreshTokenDirectory;
use crate::services::auth::jwt::{AccessTokenClaims, CnfClaim, JwtSigner, device_sub};

/// Service-level token pair; handlers map this onto the wire DTO.
#[derive(Clone, Debug, Serialize)]
pub struct IssuedTokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    pub expires_in: u64,
}

pub struct TokenService {
    jwt: Arc<JwtSigner>,
    refresh_tokens: Arc<dyn RefreshTokenDirectory>,
    refresh_ttl_seconds: u64,
}

impl TokenService {
    pub fn new(
        jwt: Arc<JwtSigner>,
        refresh_tokens: Arc<dyn RefreshTokenDirectory>,
        refresh_ttl_seconds: u64,
    ) -> Self {
        Self {
            jwt,
            refresh_tokens,
            refresh_ttl_seconds,
        }
    }

    /// Mint an access token bound to `jkt` and a fresh refresh token.
    ///
    /// Only the refresh token's hash is persisted; the plaintext crosses the
    /// wire exactly once, in the returned pair. If persistence fails the
    /// caller gets an error and no pair.
    pub async fn issue_pair(
        &self,
        device_id: Uuid,
        jkt: Option<&str>,
    ) -> Result<IssuedTokenPair, AppError> {
        let now = Utc::now();

        let claims = AccessTokenClaims {
            iss: self.jwt.issuer().to_string(),
            aud: self.jwt.issuer().to_string(),
            sub: device_sub(device_id),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: now.timestamp() + self.jwt.ttl_seconds() as i64,
            cnf: jkt.map(|jkt| CnfClaim {
                jkt: jkt.to_string(),
            }),
        };

        let access_token = self.jwt.sign(&claims).map_err(|e| {
            error!(device_id = %device_id, error = %e, "failed to sign access token");
            AppError::Internal
        })?;

        let refresh_token = generate_refresh_token();
        let token_hash = hash_refresh_token(&refresh_token);
        let expires_at = now + ChronoDuration::seconds(self.refresh_ttl_seconds as i64);

        self.refresh_tokens
            .insert(device_id, jkt, &token_hash, expires_at)
            .await
            .map_err(|e| {
                error!(device_id = %device_id, error = ?e, "failed to persist refresh token");
                AppError::Internal
            })?;

        Ok(IssuedTokenPair {
            access_token,
            refresh_token,
            token_type: "bearer",
            expires_in: self.jwt.ttl_seconds(),
        })
    }
}

/// 32..=48 bytes of entropy, URL-safe base64 without padding. The length is
/// itself random so token sizes carry no information.
fn generate_refresh_token() -> String {
    const MIN: usize = 32;
    const MAX: usize = 48;

    let mut len_byte = [0u8; 1];
    getrandom::fill(&mut len_byte).expect("getrandom failed");
    let n = MIN + (len_byte[0] as usize) % (MAX - MIN + 1);

    let mut bytes = vec![0u8; n];
    getrandom::fill(&mut bytes).expect("getrandom failed");

    URL_SAFE_NO_PAD.encode(bytes)
}

/// base64url(SHA-256(token)); the only representation that touches storage.
pub fn hash_refresh_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repos::directory::RecordStatus;
    use crate::repos::memory::MemoryDirectory;
    use crate::services::auth::jwt::{self, parse_device_sub};

    fn service(dir: Arc<MemoryDirectory>) -> TokenService {
        TokenService::new(Arc::new(jwt::test_signer(600)), dir, 3600)
    }

    #[tokio::test]
    async fn issue_pair_persists_only_the_hash() {
        let dir = Arc::new(MemoryDirectory::new());
        let svc = service(dir.clone());
        let device_id = Uuid::new_v4();

        let pair = svc.issue_pair(device_id, Some("thumb")).await.unwrap();

        assert_eq!(pair.token_type, "bearer");
        assert_eq!(pair.expires_in, 600);

        let record = dir
            .refresh_token_by_hash(&hash_refresh_token(&pair.refresh_token))
            .expect("refresh token record");
        assert_eq!(record.device_id, device_id);
        assert_eq!(record.jkt.as_deref(), Some("thumb"));
        assert_eq!(record.status, RecordStatus::Active);
        assert_ne!(record.token_hash, pair.refresh_token);
    }

    #[tokio::test]
    async fn access_token_carries_subject_and_cnf() {
        let dir = Arc::new(MemoryDirectory::new());
        let svc = service(dir);
        let device_id = Uuid::new_v4();

        let pair = svc.issue_pair(device_id, Some("thumb")).await.unwrap();

        let signer = jwt::test_signer(600);
        let claims = signer.verify(&pair.access_token).unwrap();
        assert_eq!(parse_device_sub(&claims.sub), Some(device_id));
        assert_eq!(claims.cnf.unwrap().jkt, "thumb");
    }

    #[test]
    fn refresh_tokens_vary_in_length() {
        let lengths: std::collections::HashSet<usize> =
            (0..64).map(|_| generate_refresh_token().len()).collect();
        // 64 samples over 17 possible byte lengths; a fixed length would
        // collapse this set to one entry.
        assert!(lengths.len() > 1);
    }
}
