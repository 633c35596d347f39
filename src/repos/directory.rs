//! Credential directory interfaces.
//!
//! The relational store is an external collaborator; these traits are the
//! whole surface this service needs from it: primary-key and indexed lookups
//! plus a handful of compare-and-set updates. `PgDirectory` implements them
//! against Postgres, `MemoryDirectory` against process memory.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::repos::error::RepoError;

/// Lifecycle status shared by refresh tokens and client certificates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    Active,
    Revoked,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Active => "ACTIVE",
            RecordStatus::Revoked => "REVOKED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(RecordStatus::Active),
            "REVOKED" => Some(RecordStatus::Revoked),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub id: Uuid,
    pub name: Option<String>,
    pub fingerprint_hash: String,
    /// RFC 7638 thumbprint of the device's bound public key, set at
    /// enrollment (or first key-bound call) and matched on recovery.
    pub jkt: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RefreshTokenRecord {
    pub id: Uuid,
    pub device_id: Uuid,
    pub jkt: Option<String>,
    /// base64url(SHA-256) of the opaque token; the plaintext is never stored.
    pub token_hash: String,
    pub status: RecordStatus,
    pub expires_at: DateTime<Utc>,
    pub grace_until: Option<DateTime<Utc>>,
    pub grace_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct EnrollmentTokenRecord {
    pub token: String,
    /// -1 means unlimited, 0 means exhausted.
    pub remaining_uses: i32,
    pub disabled: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct CertificateRecord {
    /// Lowercase hex of the certificate serial, leading zero bytes stripped.
    pub serial: String,
    pub device_id: Uuid,
    pub status: RecordStatus,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn find_by_fingerprint(
        &self,
        fingerprint_hash: &str,
    ) -> Result<Option<DeviceRecord>, RepoError>;

    async fn find_by_jkt(&self, jkt: &str) -> Result<Option<DeviceRecord>, RepoError>;

    async fn insert(
        &self,
        name: Option<&str>,
        fingerprint_hash: &str,
        jkt: Option<&str>,
    ) -> Result<DeviceRecord, RepoError>;
}

#[async_trait]
pub trait RefreshTokenDirectory: Send + Sync {
    async fn insert(
        &self,
        device_id: Uuid,
        jkt: Option<&str>,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Uuid, RepoError>;

    async fn find_by_hash(&self, token_hash: &str)
    -> Result<Option<RefreshTokenRecord>, RepoError>;

    /// ACTIVE -> REVOKED with a grace deadline. Compare-and-set: returns
    /// false when the row was no longer ACTIVE (a concurrent rotation won).
    async fn revoke_with_grace(
        &self,
        id: Uuid,
        grace_until: DateTime<Utc>,
    ) -> Result<bool, RepoError>;

    /// Stamp the one permitted grace use. Compare-and-set: returns false
    /// when the stamp was already present.
    async fn mark_grace_used(&self, id: Uuid, used_at: DateTime<Utc>) -> Result<bool, RepoError>;

    /// Revoke every ACTIVE refresh token of a device. Returns the count.
    async fn revoke_all_for_device(&self, device_id: Uuid) -> Result<u64, RepoError>;
}

#[async_trait]
pub trait EnrollmentTokenDirectory: Send + Sync {
    async fn find(&self, token: &str) -> Result<Option<EnrollmentTokenRecord>, RepoError>;

    /// Decrement remaining_uses by one, conditional on uses being left.
    /// Returns false when the token was already exhausted. Unlimited tokens
    /// (-1) are not passed here.
    async fn consume(&self, token: &str) -> Result<bool, RepoError>;
}

#[async_trait]
pub trait CertificateDirectory: Send + Sync {
    async fn insert(&self, record: CertificateRecord) -> Result<(), RepoError>;

    async fn find_by_serial(&self, serial: &str) -> Result<Option<CertificateRecord>, RepoError>;

    /// ACTIVE -> REVOKED for one serial. Returns false when the row was
    /// missing or already revoked.
    async fn revoke_by_serial(&self, serial: &str, at: DateTime<Utc>) -> Result<bool, RepoError>;
}
