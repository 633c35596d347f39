//! Refresh-token rotation with reuse (breach) detection.
//!
//! State machine per record:
//! `ACTIVE -> (rotate) -> REVOKED with grace -> (grace use or expiry) -> terminal`.
//!
//! The grace window exists because rotation responses get lost: a client
//! that never saw its new pair retries with the old token. Exactly one such
//! retry is honored. A further use after that is a replay of a stolen
//! token; the whole device's refresh tokens are revoked in response.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use thiserror::Error;
use tracing::{error, warn};

use crate::repos::directory::{RecordStatus, RefreshTokenDirectory, RefreshTokenRecord};
use crate::services::auth::token_issuer::{IssuedTokenPair, TokenService, hash_refresh_token};

#[derive(Debug, Error)]
pub enum RotateError {
    #[error("invalid refresh token")]
    InvalidToken,
    #[error("refresh token expired")]
    TokenExpired,
    #[error("refresh token not in grace period")]
    TokenNotInGrace,
    #[error("refresh token reuse detected")]
    TokenReuseDetected,
    #[error("storage failure")]
    Storage,
}

pub struct RotationService {
    refresh_tokens: Arc<dyn RefreshTokenDirectory>,
    tokens: Arc<TokenService>,
    grace: ChronoDuration,
}

impl RotationService {
    pub fn new(
        refresh_tokens: Arc<dyn RefreshTokenDirectory>,
        tokens: Arc<TokenService>,
        grace_seconds: i64,
    ) -> Self {
        Self {
            refresh_tokens,
            tokens,
            grace: ChronoDuration::seconds(grace_seconds),
        }
    }

    /// Validate the presented token, rotate it, and issue a new pair bound
    /// to the same device and jkt.
    pub async fn rotate(&self, presented: &str) -> Result<IssuedTokenPair, RotateError> {
        let token_hash = hash_refresh_token(presented);
        let record = self
            .refresh_tokens
            .find_by_hash(&token_hash)
            .await
            .map_err(|e| {
                error!(error = ?e, "refresh token lookup failed");
                RotateError::Storage
            })?
            .ok_or(RotateError::InvalidToken)?;

        let now = Utc::now();

        match record.status {
            RecordStatus::Active => {
                if now > record.expires_at {
                    return Err(RotateError::TokenExpired);
                }

                let won = self
                    .refresh_tokens
                    .revoke_with_grace(record.id, now + self.grace)
                    .await
                    .map_err(|_| RotateError::Storage)?;

                if !won {
                    // A concurrent rotation got there first. Re-read and
                    // continue as the grace-path retry would.
                    let record = self
                        .refresh_tokens
                        .find_by_hash(&token_hash)
                        .await
                        .map_err(|_| RotateError::Storage)?
                        .ok_or(RotateError::InvalidToken)?;
                    self.use_grace(&record, now).await?;
                }
            }
            RecordStatus::Revoked => {
                self.use_grace(&record, now).await?;
            }
        }

        self.tokens
            .issue_pair(record.device_id, record.jkt.as_deref())
            .await
            .map_err(|_| RotateError::Storage)
    }

    /// The one tolerated retry of an already-rotated token.
    async fn use_grace(
        &self,
        record: &RefreshTokenRecord,
        now: DateTime<Utc>,
    ) -> Result<(), RotateError> {
        match record.grace_until {
            None => return Err(RotateError::TokenNotInGrace),
            Some(deadline) if now > deadline => return Err(RotateError::TokenNotInGrace),
            Some(_) => {}
        }

        if record.grace_used_at.is_some() {
            self.quarantine_device(record).await;
            return Err(RotateError::TokenReuseDetected);
        }

        let stamped = self
            .refresh_tokens
            .mark_grace_used(record.id, now)
            .await
            .map_err(|_| RotateError::Storage)?;
        if !stamped {
            // Lost the race for the single grace use: same treatment as an
            // observed reuse.
            self.quarantine_device(record).await;
            return Err(RotateError::TokenReuseDetected);
        }

        Ok(())
    }

    /// A token used more than twice after revocation means it leaked. Fail
    /// closed: cut every ACTIVE refresh token the device holds.
    async fn quarantine_device(&self, record: &RefreshTokenRecord) {
        warn!(
            device_id = %record.device_id,
            token_id = %record.id,
            "refresh token reuse detected, revoking all device refresh tokens"
        );
        match self
            .refresh_tokens
            .revoke_all_for_device(record.device_id)
            .await
        {
            Ok(revoked) => warn!(device_id = %record.device_id, revoked, "device refresh tokens revoked"),
            Err(e) => error!(device_id = %record.device_id, error = ?e, "failed to revoke device refresh tokens"),
        }
    }
}
