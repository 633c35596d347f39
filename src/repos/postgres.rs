//! Postgres-backed credential directory.
//!
//! Schema lives in `migrations/`. Status transitions are plain conditional
//! UPDATEs (`WHERE status = 'ACTIVE'`, `WHERE grace_used_at IS NULL`) so two
//! racing requests serialize at the storage layer; the loser observes zero
//! rows affected.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::repos::directory::{
    CertificateDirectory, CertificateRecord, DeviceDirectory, DeviceRecord,
    EnrollmentTokenDirectory, EnrollmentTokenRecord, RecordStatus, RefreshTokenDirectory,
    RefreshTokenRecord,
};
use crate::repos::error::RepoError;

#[derive(Clone, Debug)]
pub struct PgDirectory {
    pool: PgPool,
}

impl PgDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct DeviceRow {
    id: Uuid,
    name: Option<String>,
    fingerprint_hash: String,
    jkt: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<DeviceRow> for DeviceRecord {
    fn from(r: DeviceRow) -> Self {
        DeviceRecord {
            id: r.id,
            name: r.name,
            fingerprint_hash: r.fingerprint_hash,
            jkt: r.jkt,
            created_at: r.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct RefreshTokenRow {
    id: Uuid,
    device_id: Uuid,
    jkt: Option<String>,
    token_hash: String,
    status: String,
    expires_at: DateTime<Utc>,
    grace_until: Option<DateTime<Utc>>,
    grace_used_at: Option<DateTime<Utc>>,
}

impl From<RefreshTokenRow> for RefreshTokenRecord {
    fn from(r: RefreshTokenRow) -> Self {
        RefreshTokenRecord {
            id: r.id,
            device_id: r.device_id,
            jkt: r.jkt,
            token_hash: r.token_hash,
            // Unknown status strings only appear if the schema drifted;
            // treating them as REVOKED fails closed.
            status: RecordStatus::parse(&r.status).unwrap_or(RecordStatus::Revoked),
            expires_at: r.expires_at,
            grace_until: r.grace_until,
            grace_used_at: r.grace_used_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct CertificateRow {
    serial: String,
    device_id: Uuid,
    status: String,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
}

impl From<CertificateRow> for CertificateRecord {
    fn from(r: CertificateRow) -> Self {
        CertificateRecord {
            serial: r.serial,
            device_id: r.device_id,
            status: RecordStatus::parse(&r.status).unwrap_or(RecordStatus::Revoked),
            not_before: r.not_before,
            not_after: r.not_after,
        }
    }
}

#[async_trait]
impl DeviceDirectory for PgDirectory {
    async fn find_by_fingerprint(
        &self,
        fingerprint_hash: &str,
    ) -> Result<Option<DeviceRecord>, RepoError> {
        let row = sqlx::query_as::<_, DeviceRow>(
            r#"
            SELECT id, name, fingerprint_hash, jkt, created_at
            FROM devices
            WHERE fingerprint_hash = $1
            LIMIT 1
            "#,
        )
        .bind(fingerprint_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn find_by_jkt(&self, jkt: &str) -> Result<Option<DeviceRecord>, RepoError> {
        let row = sqlx::query_as::<_, DeviceRow>(
            r#"
            SELECT id, name, fingerprint_hash, jkt, created_at
            FROM devices
            WHERE jkt = $1
            LIMIT 1
            "#,
        )
        .bind(jkt)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn insert(
        &self,
        name: Option<&str>,
        fingerprint_hash: &str,
        jkt: Option<&str>,
    ) -> Result<DeviceRecord, RepoError> {
        let row = sqlx::query_as::<_, DeviceRow>(
            r#"
            INSERT INTO devices (name, fingerprint_hash, jkt)
            VALUES ($1, $2, $3)
            RETURNING id, name, fingerprint_hash, jkt, created_at
            "#,
        )
        .bind(name)
        .bind(fingerprint_hash)
        .bind(jkt)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }
}

#[async_trait]
impl RefreshTokenDirectory for PgDirectory {
    async fn insert(
        &self,
        device_id: Uuid,
        jkt: Option<&str>,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Uuid, RepoError> {
        let id = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO refresh_tokens (device_id, jkt, token_hash, status, expires_at)
            VALUES ($1, $2, $3, 'ACTIVE', $4)
            RETURNING id
            "#,
        )
        .bind(device_id)
        .bind(jkt)
        .bind(token_hash)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn find_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshTokenRecord>, RepoError> {
        let row = sqlx::query_as::<_, RefreshTokenRow>(
            r#"
            SELECT id, device_id, jkt, token_hash, status, expires_at, grace_until, grace_used_at
            FROM refresh_tokens
            WHERE token_hash = $1
            LIMIT 1
            "#,
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn revoke_with_grace(
        &self,
        id: Uuid,
        grace_until: DateTime<Utc>,
    ) -> Result<bool, RepoError> {
        let done = sqlx::query(
            r#"
            UPDATE refresh_tokens
            SET status = 'REVOKED',
                grace_until = $2
            WHERE id = $1
                AND status = 'ACTIVE'
            "#,
        )
        .bind(id)
        .bind(grace_until)
        .execute(&self.pool)
        .await?;

        Ok(done.rows_affected() == 1)
    }

    async fn mark_grace_used(&self, id: Uuid, used_at: DateTime<Utc>) -> Result<bool, RepoError> {
        let done = sqlx::query(
            r#"
            UPDATE refresh_tokens
            SET grace_used_at = $2
            WHERE id = $1
                AND grace_used_at IS NULL
            "#,
        )
        .bind(id)
        .bind(used_at)
        .execute(&self.pool)
        .await?;

        Ok(done.rows_affected() == 1)
    }

    async fn revoke_all_for_device(&self, device_id: Uuid) -> Result<u64, RepoError> {
        let done = sqlx::query(
            r#"
            UPDATE refresh_tokens
            SET status = 'REVOKED'
            WHERE device_id = $1
                AND status = 'ACTIVE'
            "#,
        )
        .bind(device_id)
        .execute(&self.pool)
        .await?;

        Ok(done.rows_affected())
    }
}

#[async_trait]
impl EnrollmentTokenDirectory for PgDirectory {
    async fn find(&self, token: &str) -> Result<Option<EnrollmentTokenRecord>, RepoError> {
        let row = sqlx::query_as::<_, (String, i32, bool, Option<DateTime<Utc>>)>(
            r#"
            SELECT token, remaining_uses, disabled, expires_at
            FROM enrollment_tokens
            WHERE token = $1
            LIMIT 1
            "#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(
            |(token, remaining_uses, disabled, expires_at)| EnrollmentTokenRecord {
                token,
                remaining_uses,
                disabled,
                expires_at,
            },
        ))
    }

    async fn consume(&self, token: &str) -> Result<bool, RepoError> {
        let done = sqlx::query(
            r#"
            UPDATE enrollment_tokens
            SET remaining_uses = remaining_uses - 1,
                last_used_at = now()
            WHERE token = $1
                AND remaining_uses > 0
            "#,
        )
        .bind(token)
        .execute(&self.pool)
        .await?;

        Ok(done.rows_affected() == 1)
    }
}

#[async_trait]
impl CertificateDirectory for PgDirectory {
    async fn insert(&self, record: CertificateRecord) -> Result<(), RepoError> {
        sqlx::query(
            r#"
            INSERT INTO device_certs (serial, device_id, status, not_before, not_after)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&record.serial)
        .bind(record.device_id)
        .bind(record.status.as_str())
        .bind(record.not_before)
        .bind(record.not_after)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_by_serial(&self, serial: &str) -> Result<Option<CertificateRecord>, RepoError> {
        let row = sqlx::query_as::<_, CertificateRow>(
            r#"
            SELECT serial, device_id, status, not_before, not_after
            FROM device_certs
            WHERE serial = $1
            LIMIT 1
            "#,
        )
        .bind(serial)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn revoke_by_serial(&self, serial: &str, at: DateTime<Utc>) -> Result<bool, RepoError> {
        let done = sqlx::query(
            r#"
            UPDATE device_certs
            SET status = 'REVOKED',
                revoked_at = $2
            WHERE serial = $1
                AND status = 'ACTIVE'
            "#,
        )
        .bind(serial)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(done.rows_affected() == 1)
    }
}
