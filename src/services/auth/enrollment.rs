//! Device enrollment and key-based recovery.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::repos::directory::{DeviceDirectory, EnrollmentTokenDirectory, RefreshTokenDirectory};
use crate::services::auth::token_issuer::{IssuedTokenPair, TokenService};

#[derive(Debug, Error)]
pub enum EnrollError {
    #[error("device already enrolled")]
    AlreadyEnrolled,
    #[error("enrollment token invalid")]
    TokenInvalid,
    #[error("no device bound to this key")]
    UnknownKey,
    #[error("storage failure")]
    Storage,
}

pub struct EnrollmentService {
    devices: Arc<dyn DeviceDirectory>,
    enrollment_tokens: Arc<dyn EnrollmentTokenDirectory>,
    refresh_tokens: Arc<dyn RefreshTokenDirectory>,
    tokens: Arc<TokenService>,
}

impl EnrollmentService {
    pub fn new(
        devices: Arc<dyn DeviceDirectory>,
        enrollment_tokens: Arc<dyn EnrollmentTokenDirectory>,
        refresh_tokens: Arc<dyn RefreshTokenDirectory>,
        tokens: Arc<TokenService>,
    ) -> Self {
        Self {
            devices,
            enrollment_tokens,
            refresh_tokens,
            tokens,
        }
    }

    /// One-time registration: consume an enrollment token, create the device
    /// record, issue the first token pair.
    ///
    /// If device creation succeeds and token issuance then fails, the device
    /// stays enrolled without credentials; `recover` gets it out of that
    /// state, so no compensating delete happens here.
    pub async fn enroll(
        &self,
        enrollment_token: &str,
        fingerprint_hash: &str,
        name: Option<&str>,
        jkt: Option<&str>,
    ) -> Result<IssuedTokenPair, EnrollError> {
        if self
            .devices
            .find_by_fingerprint(fingerprint_hash)
            .await
            .map_err(storage)?
            .is_some()
        {
            return Err(EnrollError::AlreadyEnrolled);
        }

        let token = self
            .enrollment_tokens
            .find(enrollment_token)
            .await
            .map_err(storage)?
            .ok_or(EnrollError::TokenInvalid)?;

        if token.disabled || token.remaining_uses == 0 {
            return Err(EnrollError::TokenInvalid);
        }
        if let Some(expires_at) = token.expires_at {
            if Utc::now() > expires_at {
                return Err(EnrollError::TokenInvalid);
            }
        }

        // -1 means unlimited; anything else is decremented conditionally so
        // two racing enrollments cannot both spend the last use.
        if token.remaining_uses != -1 {
            let consumed = self
                .enrollment_tokens
                .consume(enrollment_token)
                .await
                .map_err(storage)?;
            if !consumed {
                return Err(EnrollError::TokenInvalid);
            }
        }

        let device = self
            .devices
            .insert(name, fingerprint_hash, jkt)
            .await
            .map_err(storage)?;
        info!(device_id = %device.id, "device enrolled");

        self.tokens
            .issue_pair(device.id, jkt)
            .await
            .map_err(|_| EnrollError::Storage)
    }

    /// Whether a device with this fingerprint already exists.
    pub async fn is_enrolled(&self, fingerprint_hash: &str) -> Result<bool, EnrollError> {
        Ok(self
            .devices
            .find_by_fingerprint(fingerprint_hash)
            .await
            .map_err(storage)?
            .is_some())
    }

    /// Recovery for a device that lost its refresh token but kept its key:
    /// the caller already proved possession of the key behind `jkt`. Every
    /// ACTIVE refresh token the device holds is cut before the new pair is
    /// issued, so a thief holding the old tokens gains nothing from this
    /// path.
    pub async fn recover(&self, jkt: &str) -> Result<IssuedTokenPair, EnrollError> {
        let device = self
            .devices
            .find_by_jkt(jkt)
            .await
            .map_err(storage)?
            .ok_or(EnrollError::UnknownKey)?;

        let revoked = self
            .refresh_tokens
            .revoke_all_for_device(device.id)
            .await
            .map_err(storage)?;
        warn!(device_id = %device.id, revoked, "recovery requested, refresh tokens revoked");

        self.tokens
            .issue_pair(device.id, Some(jkt))
            .await
            .map_err(|_| EnrollError::Storage)
    }
}

fn storage(e: crate::repos::error::RepoError) -> EnrollError {
    error!(error = ?e, "directory failure during enrollment");
    EnrollError::Storage
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repos::memory::MemoryDirectory;
    use crate::services::auth::jwt;
    use chrono::Duration as ChronoDuration;

    fn service(dir: Arc<MemoryDirectory>) -> EnrollmentService {
        let tokens = Arc::new(TokenService::new(
            Arc::new(jwt::test_signer(600)),
            dir.clone(),
            3600,
        ));
        EnrollmentService::new(dir.clone(), dir.clone(), dir, tokens)
    }

    #[tokio::test]
    async fn single_use_token_enrolls_once_then_is_exhausted() {
        let dir = Arc::new(MemoryDirectory::new());
        dir.add_enrollment_token("tok-1", 1);
        let svc = service(dir.clone());

        let pair = svc
            .enroll("tok-1", "fp-a", Some("sensor-a"), Some("thumb-a"))
            .await
            .unwrap();
        assert!(!pair.access_token.is_empty());
        assert!(svc.is_enrolled("fp-a").await.unwrap());

        let err = svc.enroll("tok-1", "fp-b", None, None).await.unwrap_err();
        assert!(matches!(err, EnrollError::TokenInvalid));
        assert!(!svc.is_enrolled("fp-b").await.unwrap());
    }

    #[tokio::test]
    async fn unlimited_token_survives_repeated_enrollments() {
        let dir = Arc::new(MemoryDirectory::new());
        dir.add_enrollment_token("fleet", -1);
        let svc = service(dir);

        for i in 0..3 {
            svc.enroll("fleet", &format!("fp-{}", i), None, None)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn duplicate_fingerprint_conflicts_without_spending_the_token() {
        let dir = Arc::new(MemoryDirectory::new());
        dir.add_enrollment_token("tok", 2);
        let svc = service(dir.clone());

        svc.enroll("tok", "fp", None, None).await.unwrap();
        let err = svc.enroll("tok", "fp", None, None).await.unwrap_err();
        assert!(matches!(err, EnrollError::AlreadyEnrolled));

        // The conflict is checked before the token is touched.
        use crate::repos::directory::EnrollmentTokenDirectory;
        let record = dir.find("tok").await.unwrap().unwrap();
        assert_eq!(record.remaining_uses, 1);
    }

    #[tokio::test]
    async fn disabled_and_expired_tokens_are_invalid() {
        let dir = Arc::new(MemoryDirectory::new());
        dir.add_enrollment_token("off", 5);
        dir.disable_enrollment_token("off");
        dir.add_enrollment_token("late", 5);
        dir.set_enrollment_token_expiry("late", Some(Utc::now() - ChronoDuration::seconds(1)));
        let svc = service(dir);

        for token in ["off", "late", "never-created"] {
            let err = svc.enroll(token, "fp-x", None, None).await.unwrap_err();
            assert!(matches!(err, EnrollError::TokenInvalid), "token {}", token);
        }
    }

    #[tokio::test]
    async fn recover_revokes_old_tokens_and_issues_a_pair_for_the_bound_key() {
        let dir = Arc::new(MemoryDirectory::new());
        dir.add_enrollment_token("tok", -1);
        let svc = service(dir.clone());

        let first = svc
            .enroll("tok", "fp", None, Some("thumb"))
            .await
            .unwrap();

        let recovered = svc.recover("thumb").await.unwrap();
        assert_ne!(recovered.refresh_token, first.refresh_token);

        // Only the freshly issued token is ACTIVE.
        use crate::repos::directory::DeviceDirectory;
        let device = dir.find_by_fingerprint("fp").await.unwrap().unwrap();
        assert_eq!(dir.active_refresh_tokens(device.id), 1);
    }

    #[tokio::test]
    async fn recover_with_unknown_key_is_refused() {
        let dir = Arc::new(MemoryDirectory::new());
        let svc = service(dir);

        let err = svc.recover("nobody").await.unwrap_err();
        assert!(matches!(err, EnrollError::UnknownKey));
    }
}
