//! Device client-certificate authority: CSR signing, rotation, and the
//! peer-certificate check used when mTLS identities are presented.

pub mod issuer;
pub mod verify;

pub use issuer::{CaError, CertificateAuthority, IssuedCertificate};
pub use verify::{CertVerifier, VerifiedCertIdentity, VerifyError};

use uuid::Uuid;

/// URN SAN scheme carrying the device identity inside a certificate.
pub const DEVICE_URN_PREFIX: &str = "urn:device:";

/// Canonical storage form of a certificate serial: lowercase hex with
/// leading zero bytes stripped. Both the issuance and verification paths go
/// through this so DER re-encoding differences cannot split the two.
pub(crate) fn serial_hex(raw: &[u8]) -> String {
    let mut bytes = raw;
    while bytes.len() > 1 && bytes[0] == 0 {
        bytes = &bytes[1..];
    }
    hex::encode(bytes)
}

pub(crate) fn device_id_from_urn(uri: &str) -> Option<Uuid> {
    uri.strip_prefix(DEVICE_URN_PREFIX)
        .and_then(|id| Uuid::parse_str(id).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_hex_strips_leading_zero_bytes() {
        assert_eq!(serial_hex(&[0x00, 0x0a, 0xff]), "0aff");
        assert_eq!(serial_hex(&[0x0a, 0xff]), "0aff");
        assert_eq!(serial_hex(&[0x00]), "00");
    }

    #[test]
    fn device_urn_parses_only_the_expected_shape() {
        let id = Uuid::new_v4();
        assert_eq!(device_id_from_urn(&format!("urn:device:{}", id)), Some(id));
        assert_eq!(device_id_from_urn("urn:other:thing"), None);
        assert_eq!(device_id_from_urn("urn:device:not-a-uuid"), None);
    }
}
