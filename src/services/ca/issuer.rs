//! CSR validation and signing.
//!
//! CSR checks run against the parsed request before anything is signed or
//! written, so a rejected request leaves no certificate record behind.
//! Accepted keys are EC only; one verification path, no RSA parameter
//! surprises.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rcgen::{
    CertificateParams, CertificateSigningRequestParams, ExtendedKeyUsagePurpose, Ia5String,
    KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::oid_registry::OID_KEY_TYPE_EC_PUBLIC_KEY;
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::{FromDer, GeneralName, ParsedExtension};

use super::{DEVICE_URN_PREFIX, device_id_from_urn, serial_hex};
use crate::repos::directory::{CertificateDirectory, CertificateRecord, RecordStatus};

/// Tolerated backward clock skew on the issued `NotBefore`.
const NOT_BEFORE_SKEW_SECONDS: i64 = 60;

#[derive(Debug, Error)]
pub enum CaError {
    #[error("malformed CSR")]
    InvalidCsr,
    #[error("CSR public key is not an EC key")]
    UnsupportedKeyType,
    #[error("CSR has no urn:device SAN")]
    MissingDeviceSan,
    #[error("CSR identity does not match the presented certificate")]
    CsrDeviceMismatch,
    #[error("CA key material unusable")]
    KeyMaterial,
    #[error("certificate signing failed")]
    Signing,
    #[error("storage failure")]
    Storage,
}

/// Everything the caller gets back from signing.
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub certificate_pem: String,
    pub ca_chain_pem: String,
    pub serial: String,
    pub device_id: Uuid,
    pub not_after: DateTime<Utc>,
}

pub struct CertificateAuthority {
    // The on-disk CA certificate, returned verbatim as the chain.
    ca_chain_pem: String,
    issuer: rcgen::Certificate,
    issuer_key: KeyPair,
    validity_days: u32,
    certificates: Arc<dyn CertificateDirectory>,
}

impl CertificateAuthority {
    pub fn from_pem(
        ca_cert_pem: &str,
        ca_key_pem: &str,
        validity_days: u32,
        certificates: Arc<dyn CertificateDirectory>,
    ) -> Result<Self, CaError> {
        let issuer_key = KeyPair::from_pem(ca_key_pem).map_err(|e| {
            error!(error = %e, "failed to parse CA private key PEM");
            CaError::KeyMaterial
        })?;
        // rcgen signs with an issuer built from the CA cert's subject and
        // the key; the original PEM stays untouched for chain responses.
        let params = CertificateParams::from_ca_cert_pem(ca_cert_pem).map_err(|e| {
            error!(error = %e, "failed to parse CA certificate PEM");
            CaError::KeyMaterial
        })?;
        let issuer = params
            .self_signed(&issuer_key)
            .map_err(|_| CaError::KeyMaterial)?;

        Ok(Self {
            ca_chain_pem: ca_cert_pem.to_string(),
            issuer,
            issuer_key,
            validity_days,
            certificates,
        })
    }

    pub fn from_files(
        cert_path: &str,
        key_path: &str,
        validity_days: u32,
        certificates: Arc<dyn CertificateDirectory>,
    ) -> Result<Self, CaError> {
        let cert_pem = std::fs::read_to_string(cert_path).map_err(|e| {
            error!(path = cert_path, error = %e, "failed to read CA certificate");
            CaError::KeyMaterial
        })?;
        let key_pem = std::fs::read_to_string(key_path).map_err(|e| {
            error!(path = key_path, error = %e, "failed to read CA private key");
            CaError::KeyMaterial
        })?;
        Self::from_pem(&cert_pem, &key_pem, validity_days, certificates)
    }

    /// Validate a PEM CSR and issue a client certificate for the device
    /// named in its `urn:device:<id>` SAN.
    pub async fn sign_csr(&self, csr_pem: &str) -> Result<IssuedCertificate, CaError> {
        let device_id = validate_csr(csr_pem)?;
        self.issue(device_id, csr_pem).await
    }

    /// Like `sign_csr`, but the CSR must name the device the caller already
    /// authenticated as. Checked before signing, so a mismatch has no side
    /// effect.
    pub async fn sign_csr_for(
        &self,
        expected_device_id: Uuid,
        csr_pem: &str,
    ) -> Result<IssuedCertificate, CaError> {
        let device_id = validate_csr(csr_pem)?;
        if device_id != expected_device_id {
            warn!(
                authenticated = %expected_device_id,
                requested = %device_id,
                "CSR identity mismatch"
            );
            return Err(CaError::CsrDeviceMismatch);
        }
        self.issue(device_id, csr_pem).await
    }

    /// Re-issue for a device that already holds a certificate. The identity
    /// in the new CSR must match the identity the caller authenticated
    /// with; the presented certificate's serial is revoked once the
    /// replacement exists.
    pub async fn rotate(
        &self,
        current_device_id: Uuid,
        presented_serial: &str,
        csr_pem: &str,
    ) -> Result<IssuedCertificate, CaError> {
        let issued = self.sign_csr_for(current_device_id, csr_pem).await?;

        // Issue-then-revoke is not atomic. A crash here leaves two ACTIVE
        // rows; the verification path resolves that by checking the record
        // at handshake time, so the stale one stops working as soon as it
        // is revoked out of band.
        let revoked = self
            .certificates
            .revoke_by_serial(presented_serial, Utc::now())
            .await
            .map_err(|e| {
                error!(error = ?e, "failed to revoke predecessor certificate");
                CaError::Storage
            })?;
        if !revoked {
            warn!(serial = presented_serial, "predecessor certificate was not ACTIVE");
        }

        Ok(issued)
    }

    async fn issue(&self, device_id: Uuid, csr_pem: &str) -> Result<IssuedCertificate, CaError> {
        let mut csr = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|_| CaError::InvalidCsr)?;

        let mut serial_bytes = [0u8; 16];
        getrandom::fill(&mut serial_bytes).expect("getrandom failed");
        let serial = serial_hex(&serial_bytes);

        let now = Utc::now();
        let not_before = now - ChronoDuration::seconds(NOT_BEFORE_SKEW_SECONDS);
        let not_after = now + ChronoDuration::days(self.validity_days as i64);

        csr.params.serial_number = Some(SerialNumber::from(serial_bytes.to_vec()));
        csr.params.not_before =
            time::OffsetDateTime::from_unix_timestamp(not_before.timestamp())
                .map_err(|_| CaError::Signing)?;
        csr.params.not_after = time::OffsetDateTime::from_unix_timestamp(not_after.timestamp())
            .map_err(|_| CaError::Signing)?;
        csr.params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        csr.params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];

        // URI SANs from the request are carried into the issued certificate;
        // every other SAN kind is dropped. The device URN is appended when
        // the parsed request did not already surface it.
        let urn = Ia5String::try_from(format!("{}{}", DEVICE_URN_PREFIX, device_id))
            .map_err(|_| CaError::Signing)?;
        let mut sans: Vec<SanType> = std::mem::take(&mut csr.params.subject_alt_names)
            .into_iter()
            .filter(|san| matches!(san, SanType::URI(_)))
            .collect();
        if !sans
            .iter()
            .any(|san| matches!(san, SanType::URI(uri) if *uri == urn))
        {
            sans.push(SanType::URI(urn));
        }
        csr.params.subject_alt_names = sans;

        let certificate = csr
            .signed_by(&self.issuer, &self.issuer_key)
            .map_err(|e| {
                error!(error = %e, "certificate signing failed");
                CaError::Signing
            })?;

        self.certificates
            .insert(CertificateRecord {
                serial: serial.clone(),
                device_id,
                status: RecordStatus::Active,
                not_before,
                not_after,
            })
            .await
            .map_err(|e| {
                error!(error = ?e, "failed to persist certificate record");
                CaError::Storage
            })?;

        info!(device_id = %device_id, serial = %serial, "client certificate issued");

        Ok(IssuedCertificate {
            certificate_pem: certificate.pem(),
            ca_chain_pem: self.ca_chain_pem.clone(),
            serial,
            device_id,
            not_after,
        })
    }
}

/// Structural checks on the CSR: PEM label, self-signature, EC key, device
/// URN SAN. Returns the device id the request claims.
fn validate_csr(csr_pem: &str) -> Result<Uuid, CaError> {
    let (_, pem) = parse_x509_pem(csr_pem.as_bytes()).map_err(|_| CaError::InvalidCsr)?;
    if pem.label != "CERTIFICATE REQUEST" {
        return Err(CaError::InvalidCsr);
    }

    let (_, csr) =
        X509CertificationRequest::from_der(&pem.contents).map_err(|_| CaError::InvalidCsr)?;

    csr.verify_signature().map_err(|_| CaError::InvalidCsr)?;

    let spki = &csr.certification_request_info.subject_pki;
    if spki.algorithm.algorithm != OID_KEY_TYPE_EC_PUBLIC_KEY {
        return Err(CaError::UnsupportedKeyType);
    }

    let device_id = csr
        .requested_extensions()
        .into_iter()
        .flatten()
        .find_map(|ext| match ext {
            ParsedExtension::SubjectAlternativeName(san) => {
                san.general_names.iter().find_map(|name| match name {
                    GeneralName::URI(uri) => device_id_from_urn(uri),
                    _ => None,
                })
            }
            _ => None,
        })
        .ok_or(CaError::MissingDeviceSan)?;

    Ok(device_id)
}

#[cfg(test)]
pub(crate) mod testkit {
    use super::*;
    use crate::repos::memory::MemoryDirectory;
    use rcgen::{BasicConstraints, DistinguishedName, DnType, IsCa};

    pub fn test_ca(dir: Arc<MemoryDirectory>) -> CertificateAuthority {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::new()).unwrap();
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, "Fleet Device CA");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let cert = params.self_signed(&key).unwrap();

        CertificateAuthority::from_pem(&cert.pem(), &key.serialize_pem(), 30, dir).unwrap()
    }

    /// P-256 CSR carrying the device URN SAN.
    pub fn device_csr(device_id: Uuid) -> String {
        csr_with_key(device_id, &KeyPair::generate().unwrap())
    }

    pub fn csr_with_key(device_id: Uuid, key: &KeyPair) -> String {
        let mut params = CertificateParams::new(Vec::new()).unwrap();
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, "device");
        params.subject_alt_names.push(SanType::URI(
            Ia5String::try_from(format!("{}{}", DEVICE_URN_PREFIX, device_id)).unwrap(),
        ));
        params.serialize_request(key).unwrap().pem().unwrap()
    }
}
