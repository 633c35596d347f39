//! In-memory credential directory.
//!
//! Used for development without a database and throughout the test suite.
//! All trait methods take one mutex, which gives the same serialization the
//! Postgres conditional updates provide.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::repos::directory::{
    CertificateDirectory, CertificateRecord, DeviceDirectory, DeviceRecord,
    EnrollmentTokenDirectory, EnrollmentTokenRecord, RecordStatus, RefreshTokenDirectory,
    RefreshTokenRecord,
};
use crate::repos::error::RepoError;

#[derive(Default)]
struct Inner {
    devices: Vec<DeviceRecord>,
    refresh_tokens: Vec<RefreshTokenRecord>,
    enrollment_tokens: HashMap<String, EnrollmentTokenRecord>,
    certificates: HashMap<String, CertificateRecord>,
}

#[derive(Default)]
pub struct MemoryDirectory {
    inner: Mutex<Inner>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an enrollment token (tests and local development).
    pub fn add_enrollment_token(&self, token: &str, remaining_uses: i32) {
        let mut inner = self.inner.lock().expect("directory lock poisoned");
        inner.enrollment_tokens.insert(
            token.to_string(),
            EnrollmentTokenRecord {
                token: token.to_string(),
                remaining_uses,
                disabled: false,
                expires_at: None,
            },
        );
    }

    #[cfg(test)]
    pub fn disable_enrollment_token(&self, token: &str) {
        let mut inner = self.inner.lock().expect("directory lock poisoned");
        if let Some(t) = inner.enrollment_tokens.get_mut(token) {
            t.disabled = true;
        }
    }

    #[cfg(test)]
    pub fn set_enrollment_token_expiry(&self, token: &str, expires_at: Option<DateTime<Utc>>) {
        let mut inner = self.inner.lock().expect("directory lock poisoned");
        if let Some(t) = inner.enrollment_tokens.get_mut(token) {
            t.expires_at = expires_at;
        }
    }

    #[cfg(test)]
    pub fn certificate_count(&self) -> usize {
        let inner = self.inner.lock().expect("directory lock poisoned");
        inner.certificates.len()
    }

    #[cfg(test)]
    pub fn refresh_token_by_hash(&self, token_hash: &str) -> Option<RefreshTokenRecord> {
        let inner = self.inner.lock().expect("directory lock poisoned");
        inner
            .refresh_tokens
            .iter()
            .find(|t| t.token_hash == token_hash)
            .cloned()
    }

    #[cfg(test)]
    pub fn active_refresh_tokens(&self, device_id: Uuid) -> usize {
        let inner = self.inner.lock().expect("directory lock poisoned");
        inner
            .refresh_tokens
            .iter()
            .filter(|t| t.device_id == device_id && t.status == RecordStatus::Active)
            .count()
    }

    #[cfg(test)]
    pub fn expire_refresh_token(&self, token_hash: &str, expires_at: DateTime<Utc>) {
        let mut inner = self.inner.lock().expect("directory lock poisoned");
        if let Some(t) = inner
            .refresh_tokens
            .iter_mut()
            .find(|t| t.token_hash == token_hash)
        {
            t.expires_at = expires_at;
        }
    }

    #[cfg(test)]
    pub fn set_grace_until(&self, token_hash: &str, grace_until: Option<DateTime<Utc>>) {
        let mut inner = self.inner.lock().expect("directory lock poisoned");
        if let Some(t) = inner
            .refresh_tokens
            .iter_mut()
            .find(|t| t.token_hash == token_hash)
        {
            t.grace_until = grace_until;
        }
    }
}

#[async_trait]
impl DeviceDirectory for MemoryDirectory {
    async fn find_by_fingerprint(
        &self,
        fingerprint_hash: &str,
    ) -> Result<Option<DeviceRecord>, RepoError> {
        let inner = self.inner.lock().expect("directory lock poisoned");
        Ok(inner
            .devices
            .iter()
            .find(|d| d.fingerprint_hash == fingerprint_hash)
            .cloned())
    }

    async fn find_by_jkt(&self, jkt: &str) -> Result<Option<DeviceRecord>, RepoError> {
        let inner = self.inner.lock().expect("directory lock poisoned");
        Ok(inner
            .devices
            .iter()
            .find(|d| d.jkt.as_deref() == Some(jkt))
            .cloned())
    }

    async fn insert(
        &self,
        name: Option<&str>,
        fingerprint_hash: &str,
        jkt: Option<&str>,
    ) -> Result<DeviceRecord, RepoError> {
        let mut inner = self.inner.lock().expect("directory lock poisoned");
        let record = DeviceRecord {
            id: Uuid::new_v4(),
            name: name.map(str::to_string),
            fingerprint_hash: fingerprint_hash.to_string(),
            jkt: jkt.map(str::to_string),
            created_at: Utc::now(),
        };
        inner.devices.push(record.clone());
        Ok(record)
    }
}

#[async_trait]
impl RefreshTokenDirectory for MemoryDirectory {
    async fn insert(
        &self,
        device_id: Uuid,
        jkt: Option<&str>,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Uuid, RepoError> {
        let mut inner = self.inner.lock().expect("directory lock poisoned");
        let id = Uuid::new_v4();
        inner.refresh_tokens.push(RefreshTokenRecord {
            id,
            device_id,
            jkt: jkt.map(str::to_string),
            token_hash: token_hash.to_string(),
            status: RecordStatus::Active,
            expires_at,
            grace_until: None,
            grace_used_at: None,
        });
        Ok(id)
    }

    async fn find_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshTokenRecord>, RepoError> {
        let inner = self.inner.lock().expect("directory lock poisoned");
        Ok(inner
            .refresh_tokens
            .iter()
            .find(|t| t.token_hash == token_hash)
            .cloned())
    }

    async fn revoke_with_grace(
        &self,
        id: Uuid,
        grace_until: DateTime<Utc>,
    ) -> Result<bool, RepoError> {
        let mut inner = self.inner.lock().expect("directory lock poisoned");
        match inner
            .refresh_tokens
            .iter_mut()
            .find(|t| t.id == id && t.status == RecordStatus::Active)
        {
            Some(t) => {
                t.status = RecordStatus::Revoked;
                t.grace_until = Some(grace_until);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_grace_used(&self, id: Uuid, used_at: DateTime<Utc>) -> Result<bool, RepoError> {
        let mut inner = self.inner.lock().expect("directory lock poisoned");
        match inner
            .refresh_tokens
            .iter_mut()
            .find(|t| t.id == id && t.grace_used_at.is_none())
        {
            Some(t) => {
                t.grace_used_at = Some(used_at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn revoke_all_for_device(&self, device_id: Uuid) -> Result<u64, RepoError> {
        let mut inner = self.inner.lock().expect("directory lock poisoned");
        let mut revoked = 0;
        for t in inner
            .refresh_tokens
            .iter_mut()
            .filter(|t| t.device_id == device_id && t.status == RecordStatus::Active)
        {
            t.status = RecordStatus::Revoked;
            revoked += 1;
        }
        Ok(revoked)
    }
}

#[async_trait]
impl EnrollmentTokenDirectory for MemoryDirectory {
    async fn find(&self, token: &str) -> Result<Option<EnrollmentTokenRecord>, RepoError> {
        let inner = self.inner.lock().expect("directory lock poisoned");
        Ok(inner.enrollment_tokens.get(token).cloned())
    }

    async fn consume(&self, token: &str) -> Result<bool, RepoError> {
        let mut inner = self.inner.lock().expect("directory lock poisoned");
        match inner.enrollment_tokens.get_mut(token) {
            Some(t) if t.remaining_uses > 0 => {
                t.remaining_uses -= 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl CertificateDirectory for MemoryDirectory {
    async fn insert(&self, record: CertificateRecord) -> Result<(), RepoError> {
        let mut inner = self.inner.lock().expect("directory lock poisoned");
        inner.certificates.insert(record.serial.clone(), record);
        Ok(())
    }

    async fn find_by_serial(&self, serial: &str) -> Result<Option<CertificateRecord>, RepoError> {
        let inner = self.inner.lock().expect("directory lock poisoned");
        Ok(inner.certificates.get(serial).cloned())
    }

    async fn revoke_by_serial(&self, serial: &str, _at: DateTime<Utc>) -> Result<bool, RepoError> {
        let mut inner = self.inner.lock().expect("directory lock poisoned");
        match inner.certificates.get_mut(serial) {
            Some(c) if c.status == RecordStatus::Active => {
                c.status = RecordStatus::Revoked;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
