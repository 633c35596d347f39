//! Access-token signing and verification.
//!
//! Claims are a concrete struct validated at the deserialization boundary;
//! a token missing a required claim fails to decode instead of surviving
//! until some later type probe.

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::config::{Config, SigningAlg};

#[derive(Debug, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    pub iss: String,
    pub aud: String,
    /// `device:<uuid>`
    pub sub: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cnf: Option<CnfClaim>,
}

/// Confirmation claim binding the token to a key thumbprint (RFC 7800).
#[derive(Debug, Serialize, Deserialize)]
pub struct CnfClaim {
    pub jkt: String,
}

#[derive(Debug, Error)]
pub enum JwtError {
    #[error("invalid access token")]
    Invalid,
    #[error("failed to sign access token")]
    Signing,
    #[error("signing key misconfigured")]
    KeyMaterial,
}

/// Signs and verifies access tokens with the service's configured algorithm.
/// Exactly one algorithm is accepted at verification time.
pub struct JwtSigner {
    alg: Algorithm,
    issuer: String,
    ttl_seconds: u64,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtSigner {
    pub fn from_config(config: &Config) -> Result<Self, JwtError> {
        let (alg, encoding_key, decoding_key) = match config.signing_alg {
            SigningAlg::EdDsa => {
                let private_pem = config
                    .access_jwt_private_key_pem
                    .as_deref()
                    .ok_or(JwtError::KeyMaterial)?;
                let public_pem = config
                    .access_jwt_public_key_pem
                    .as_deref()
                    .ok_or(JwtError::KeyMaterial)?;

                let encoding_key =
                    EncodingKey::from_ed_pem(private_pem.as_bytes()).map_err(|e| {
                        warn!(error = %e, "failed to parse access JWT private key PEM (expected Ed25519 PKCS#8 PEM)");
                        JwtError::KeyMaterial
                    })?;
                let decoding_key = DecodingKey::from_ed_pem(public_pem.as_bytes()).map_err(|e| {
                    warn!(error = %e, "failed to parse access JWT public key PEM");
                    JwtError::KeyMaterial
                })?;
                (Algorithm::EdDSA, encoding_key, decoding_key)
            }
            SigningAlg::Hs256 => {
                let secret = config.jwt_secret.as_deref().ok_or(JwtError::KeyMaterial)?;
                if secret.len() < 32 {
                    return Err(JwtError::KeyMaterial);
                }
                (
                    Algorithm::HS256,
                    EncodingKey::from_secret(secret.as_bytes()),
                    DecodingKey::from_secret(secret.as_bytes()),
                )
            }
        };

        Ok(Self {
            alg,
            issuer: config.external_url.clone(),
            ttl_seconds: config.access_token_ttl_seconds,
            encoding_key,
            decoding_key,
        })
    }

    /// Issuer doubles as audience: devices only talk back to this service.
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn ttl_seconds(&self) -> u64 {
        self.ttl_seconds
    }

    pub fn sign(&self, claims: &AccessTokenClaims) -> Result<String, JwtError> {
        let header = Header::new(self.alg);
        jsonwebtoken::encode(&header, claims, &self.encoding_key).map_err(|e| {
            warn!(error = %e, "failed to sign access token");
            JwtError::Signing
        })
    }

    /// Verify signature + iss/aud/exp/nbf with the configured algorithm only.
    pub fn verify(&self, token: &str) -> Result<AccessTokenClaims, JwtError> {
        let mut validation = Validation::new(self.alg);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.issuer]);
        validation.validate_nbf = true;

        let data = jsonwebtoken::decode::<AccessTokenClaims>(
            token,
            &self.decoding_key,
            &validation,
        )
        .map_err(|_| JwtError::Invalid)?;

        Ok(data.claims)
    }
}

/// `sub` claim for a device.
pub fn device_sub(device_id: Uuid) -> String {
    format!("device:{}", device_id)
}

pub fn parse_device_sub(sub: &str) -> Option<Uuid> {
    sub.strip_prefix("device:")
        .and_then(|id| Uuid::parse_str(id).ok())
}

/// HS256 signer with a fixed secret, shared by tests across the auth modules.
#[cfg(test)]
pub(crate) fn test_signer(ttl_seconds: u64) -> JwtSigner {
    JwtSigner {
        alg: Algorithm::HS256,
        issuer: "https://hub.example.com".to_string(),
        ttl_seconds,
        encoding_key: EncodingKey::from_secret(b"0123456789abcdef0123456789abcdef"),
        decoding_key: DecodingKey::from_secret(b"0123456789abcdef0123456789abcdef"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn claims_for(signer: &JwtSigner, device_id: Uuid, jkt: Option<&str>) -> AccessTokenClaims {
        let now = Utc::now().timestamp();
        AccessTokenClaims {
            iss: signer.issuer().to_string(),
            aud: signer.issuer().to_string(),
            sub: device_sub(device_id),
            iat: now,
            nbf: now,
            exp: now + signer.ttl_seconds() as i64,
            cnf: jkt.map(|jkt| CnfClaim {
                jkt: jkt.to_string(),
            }),
        }
    }

    #[test]
    fn sign_verify_round_trip_preserves_sub_and_cnf() {
        let signer = test_signer(600);
        let device_id = Uuid::new_v4();

        let token = signer
            .sign(&claims_for(&signer, device_id, Some("thumb")))
            .unwrap();
        let claims = signer.verify(&token).unwrap();

        assert_eq!(parse_device_sub(&claims.sub), Some(device_id));
        assert_eq!(claims.cnf.unwrap().jkt, "thumb");
    }

    #[test]
    fn token_signed_with_other_secret_is_rejected() {
        let signer = test_signer(600);
        let other = JwtSigner {
            encoding_key: EncodingKey::from_secret(b"ffffffffffffffffffffffffffffffff"),
            ..test_signer(600)
        };

        let token = other
            .sign(&claims_for(&other, Uuid::new_v4(), None))
            .unwrap();
        assert!(matches!(signer.verify(&token), Err(JwtError::Invalid)));
    }

    #[test]
    fn token_with_wrong_audience_is_rejected() {
        let signer = test_signer(600);
        let mut claims = claims_for(&signer, Uuid::new_v4(), None);
        claims.aud = "https://elsewhere.example.com".to_string();

        let token = signer.sign(&claims).unwrap();
        assert!(matches!(signer.verify(&token), Err(JwtError::Invalid)));
    }

    #[test]
    fn device_sub_parses_back() {
        let id = Uuid::new_v4();
        assert_eq!(parse_device_sub(&device_sub(id)), Some(id));
        assert_eq!(parse_device_sub("user:123"), None);
        assert_eq!(parse_device_sub("device:not-a-uuid"), None);
    }
}
