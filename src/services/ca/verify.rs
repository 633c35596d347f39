//! Peer-certificate verification for mTLS-presented identities.
//!
//! The certificate itself is not the source of truth; the persisted record
//! is. A certificate that parses, chains, and is inside its validity window
//! is still refused once its serial is REVOKED in the directory. This is
//! what closes the gap between issuing a replacement and the predecessor
//! actually dying.

use std::sync::Arc;

use thiserror::Error;
use tracing::{error, warn};
use uuid::Uuid;
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::{FromDer, GeneralName};

use super::{device_id_from_urn, serial_hex};
use crate::repos::directory::{CertificateDirectory, RecordStatus};

/// Upper bound on a single peer certificate.
const MAX_CERT_SIZE: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("certificate too large: {0} bytes")]
    TooLarge(usize),
    #[error("malformed certificate")]
    Malformed,
    #[error("certificate outside its validity window")]
    Expired,
    #[error("certificate has no urn:device SAN")]
    MissingDeviceSan,
    #[error("certificate serial unknown")]
    UnknownCertificate,
    #[error("certificate revoked")]
    Revoked,
    #[error("certificate does not belong to its device record")]
    DeviceMismatch,
    #[error("storage failure")]
    Storage,
}

/// Identity established by a verified client certificate.
#[derive(Debug, Clone)]
pub struct VerifiedCertIdentity {
    pub device_id: Uuid,
    pub serial: String,
}

pub struct CertVerifier {
    certificates: Arc<dyn CertificateDirectory>,
}

impl CertVerifier {
    pub fn new(certificates: Arc<dyn CertificateDirectory>) -> Self {
        Self { certificates }
    }

    /// Check a DER-encoded client certificate: validity window, device URN
    /// SAN, and an ACTIVE record for its serial.
    pub async fn verify_device_cert(
        &self,
        cert_der: &[u8],
    ) -> Result<VerifiedCertIdentity, VerifyError> {
        if cert_der.len() > MAX_CERT_SIZE {
            return Err(VerifyError::TooLarge(cert_der.len()));
        }

        let (_, cert) = X509Certificate::from_der(cert_der).map_err(|_| VerifyError::Malformed)?;

        if !cert.validity().is_valid() {
            return Err(VerifyError::Expired);
        }

        let device_id = cert
            .subject_alternative_name()
            .map_err(|_| VerifyError::Malformed)?
            .and_then(|san| {
                san.value.general_names.iter().find_map(|name| match name {
                    GeneralName::URI(uri) => device_id_from_urn(uri),
                    _ => None,
                })
            })
            .ok_or(VerifyError::MissingDeviceSan)?;

        let serial = serial_hex(cert.raw_serial());

        let record = self
            .certificates
            .find_by_serial(&serial)
            .await
            .map_err(|e| {
                error!(error = ?e, "certificate lookup failed");
                VerifyError::Storage
            })?
            .ok_or(VerifyError::UnknownCertificate)?;

        if record.status != RecordStatus::Active {
            warn!(serial = %serial, device_id = %device_id, "revoked certificate presented");
            return Err(VerifyError::Revoked);
        }
        if record.device_id != device_id {
            warn!(serial = %serial, "certificate SAN does not match its record");
            return Err(VerifyError::DeviceMismatch);
        }

        Ok(VerifiedCertIdentity { device_id, serial })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repos::directory::CertificateRecord;
    use crate::repos::memory::MemoryDirectory;
    use crate::services::ca::issuer::testkit::{device_csr, test_ca};
    use chrono::{Duration as ChronoDuration, Utc};
    use x509_parser::pem::parse_x509_pem;

    fn der_of(pem: &str) -> Vec<u8> {
        let (_, pem) = parse_x509_pem(pem.as_bytes()).unwrap();
        pem.contents
    }

    #[tokio::test]
    async fn freshly_issued_certificate_verifies() {
        let dir = Arc::new(MemoryDirectory::new());
        let ca = test_ca(dir.clone());
        let device_id = Uuid::new_v4();

        let issued = ca.sign_csr(&device_csr(device_id)).await.unwrap();
        let verifier = CertVerifier::new(dir);

        let identity = verifier
            .verify_device_cert(&der_of(&issued.certificate_pem))
            .await
            .unwrap();
        assert_eq!(identity.device_id, device_id);
        assert_eq!(identity.serial, issued.serial);
    }

    #[tokio::test]
    async fn revoked_serial_is_refused_even_with_a_valid_certificate() {
        let dir = Arc::new(MemoryDirectory::new());
        let ca = test_ca(dir.clone());
        let device_id = Uuid::new_v4();

        let issued = ca.sign_csr(&device_csr(device_id)).await.unwrap();
        dir.revoke_by_serial(&issued.serial, Utc::now()).await.unwrap();

        let verifier = CertVerifier::new(dir);
        let err = verifier
            .verify_device_cert(&der_of(&issued.certificate_pem))
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::Revoked));
    }

    #[tokio::test]
    async fn certificate_unknown_to_the_directory_is_refused() {
        let issuing_dir = Arc::new(MemoryDirectory::new());
        let ca = test_ca(issuing_dir);
        let issued = ca.sign_csr(&device_csr(Uuid::new_v4())).await.unwrap();

        // Verify against a directory that never saw the issuance.
        let verifier = CertVerifier::new(Arc::new(MemoryDirectory::new()));
        let err = verifier
            .verify_device_cert(&der_of(&issued.certificate_pem))
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::UnknownCertificate));
    }

    #[tokio::test]
    async fn expired_certificate_is_refused_before_any_lookup() {
        use rcgen::{CertificateParams, DistinguishedName, DnType, Ia5String, KeyPair, SanType};

        let device_id = Uuid::new_v4();
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::new()).unwrap();
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, "device");
        params.subject_alt_names.push(SanType::URI(
            Ia5String::try_from(format!("urn:device:{}", device_id)).unwrap(),
        ));
        params.not_before = time::OffsetDateTime::now_utc() - time::Duration::days(40);
        params.not_after = time::OffsetDateTime::now_utc() - time::Duration::days(10);
        let cert = params.self_signed(&key).unwrap();

        let dir = Arc::new(MemoryDirectory::new());
        let serial = super::super::serial_hex(
            X509Certificate::from_der(cert.der()).unwrap().1.raw_serial(),
        );
        dir.insert(CertificateRecord {
            serial,
            device_id,
            status: RecordStatus::Active,
            not_before: Utc::now() - ChronoDuration::days(40),
            not_after: Utc::now() - ChronoDuration::days(10),
        })
        .await
        .unwrap();

        let verifier = CertVerifier::new(dir);
        let err = verifier.verify_device_cert(cert.der()).await.unwrap_err();
        assert!(matches!(err, VerifyError::Expired));
    }

    #[tokio::test]
    async fn oversized_input_is_rejected_up_front() {
        let verifier = CertVerifier::new(Arc::new(MemoryDirectory::new()));
        let blob = vec![0u8; MAX_CERT_SIZE + 1];
        let err = verifier.verify_device_cert(&blob).await.unwrap_err();
        assert!(matches!(err, VerifyError::TooLarge(_)));
    }
}
