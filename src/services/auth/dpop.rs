//! DPoP proof validation (RFC 9449).
//!
//! A bearer access token alone is stealable; the DPoP proof demonstrates,
//! per request, possession of the private key the token was bound to at
//! issuance. Every step here is load-bearing: dropping the alg check, the
//! replay insert, or the thumbprint comparison each reopens a known
//! token-theft attack.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, Method, Uri, header};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::jwk::{AlgorithmParameters, EllipticCurve, Jwk};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::warn;
use uuid::Uuid;

use crate::services::auth::jwt::{JwtSigner, parse_device_sub};
use crate::services::auth::replay::ReplayStore;

/// Freshness windows for proofs.
#[derive(Debug, Clone, Copy)]
pub struct DpopPolicy {
    /// Allowed clock skew for `iat` in the future, seconds.
    pub iat_leeway_seconds: i64,
    /// Maximum acceptable proof age (now - iat), seconds. Also the replay
    /// guard TTL.
    pub max_age_seconds: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum DpopError {
    #[error("missing DPoP header")]
    MissingProof,
    #[error("invalid DPoP proof")]
    InvalidProof,
    #[error("invalid DPoP typ")]
    InvalidTyp,
    #[error("missing jwk in DPoP header")]
    MissingJwk,
    #[error("symmetric DPoP key rejected")]
    SymmetricKey,
    #[error("DPoP alg not allowed: {0:?}")]
    DisallowedAlg(Algorithm),
    #[error("unsupported DPoP jwk")]
    UnsupportedJwk,
    #[error("missing required claim: {0}")]
    MissingClaim(&'static str),
    #[error("htm mismatch")]
    MethodMismatch,
    #[error("htu mismatch")]
    UriMismatch,
    #[error("stale DPoP proof")]
    StaleProof,
    #[error("replayed DPoP proof")]
    ReplayedProof,
    #[error("replay guard unavailable")]
    ReplayUnavailable,
    #[error("missing bearer token")]
    MissingBearer,
    #[error("invalid access token")]
    InvalidAccessToken,
    #[error("cnf.jkt does not match proof key")]
    ProofKeyMismatch,
    #[error("ath mismatch")]
    AthMismatch,
}

#[derive(Debug, Deserialize)]
struct DpopProofClaims {
    htm: Option<String>,
    htu: Option<String>,
    iat: Option<i64>,
    jti: Option<String>,
    // base64url(SHA-256(access token)); optional binding to the bearer.
    ath: Option<String>,
}

/// Outcome of proof-only verification (steps up to the thumbprint).
#[derive(Debug, Clone)]
pub struct VerifiedProof {
    /// RFC 7638 SHA-256 thumbprint of the embedded public key.
    pub jkt: String,
    pub jti: String,
    pub iat: i64,
    pub ath: Option<String>,
}

pub struct DpopValidator {
    policy: DpopPolicy,
    jwt: Arc<JwtSigner>,
    replay: ReplayStore,
    // Fallback origin when no forwarded/host headers are present.
    fallback_scheme: String,
    fallback_host: String,
}

impl DpopValidator {
    pub fn new(
        policy: DpopPolicy,
        jwt: Arc<JwtSigner>,
        replay: ReplayStore,
        external_url: &str,
    ) -> Result<Self, url::ParseError> {
        let base = url::Url::parse(external_url)?;
        let mut fallback_host = base.host_str().unwrap_or("localhost").to_string();
        if let Some(port) = base.port() {
            fallback_host = format!("{}:{}", fallback_host, port);
        }

        Ok(Self {
            policy,
            jwt,
            replay,
            fallback_scheme: base.scheme().to_string(),
            fallback_host,
        })
    }

    /// Full request gate: proof verification plus bearer binding.
    /// Returns the device id carried in the access token's subject.
    pub async fn validate(
        &self,
        headers: &HeaderMap,
        method: &Method,
        uri: &Uri,
    ) -> Result<Uuid, DpopError> {
        let proof = self.verify_proof(headers, method, uri).await?;
        let access_token = bearer_token(headers)?;

        // Configured algorithm only; a token signed any other way is noise.
        let claims = self
            .jwt
            .verify(access_token)
            .map_err(|_| DpopError::InvalidAccessToken)?;

        let token_jkt = claims.cnf.ok_or(DpopError::ProofKeyMismatch)?.jkt;
        if token_jkt.is_empty() || token_jkt != proof.jkt {
            return Err(DpopError::ProofKeyMismatch);
        }

        if let Some(ath) = &proof.ath {
            let expected = sha256_b64url(access_token.as_bytes());
            if *ath != expected {
                return Err(DpopError::AthMismatch);
            }
        }

        parse_device_sub(&claims.sub).ok_or(DpopError::InvalidAccessToken)
    }

    /// Proof verification without a bearer token (recovery flow): signature,
    /// typ/alg/key checks, htm/htu binding, freshness, anti-replay, and the
    /// key thumbprint.
    pub async fn verify_proof(
        &self,
        headers: &HeaderMap,
        method: &Method,
        uri: &Uri,
    ) -> Result<VerifiedProof, DpopError> {
        let proof = headers
            .get("DPoP")
            .ok_or(DpopError::MissingProof)?
            .to_str()
            .map_err(|_| DpopError::InvalidProof)?;

        // 1) Header: typ, alg family, embedded public key.
        let header = jsonwebtoken::decode_header(proof).map_err(|e| {
            warn!(error = %e, "unparseable DPoP header");
            DpopError::InvalidProof
        })?;

        match header.typ.as_deref() {
            Some(typ) if typ.eq_ignore_ascii_case("dpop+jwt") => {}
            _ => return Err(DpopError::InvalidTyp),
        }

        if matches!(
            header.alg,
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512
        ) {
            return Err(DpopError::DisallowedAlg(header.alg));
        }

        let jwk: Jwk = header.jwk.ok_or(DpopError::MissingJwk)?;
        if matches!(jwk.algorithm, AlgorithmParameters::OctetKey(_)) {
            return Err(DpopError::SymmetricKey);
        }

        // 2) Signature over the proof with the embedded key.
        let decoding_key = DecodingKey::from_jwk(&jwk).map_err(|e| {
            warn!(error = %e, "invalid DPoP jwk");
            DpopError::InvalidProof
        })?;

        let mut validation = Validation::new(header.alg);
        // Proofs carry iat, not exp; freshness is checked below.
        validation.validate_exp = false;
        validation.required_spec_claims.remove("exp");
        validation.validate_aud = false;

        let token_data = jsonwebtoken::decode::<DpopProofClaims>(proof, &decoding_key, &validation)
            .map_err(|e| {
                warn!(error = %e, "invalid DPoP proof signature");
                DpopError::InvalidProof
            })?;

        // 3) Required claims.
        let claims = token_data.claims;
        let htm = claims.htm.ok_or(DpopError::MissingClaim("htm"))?;
        let htu = claims.htu.ok_or(DpopError::MissingClaim("htu"))?;
        let iat = claims.iat.ok_or(DpopError::MissingClaim("iat"))?;
        let jti = claims.jti.ok_or(DpopError::MissingClaim("jti"))?;

        // 4) Freshness window.
        let now = chrono::Utc::now().timestamp();
        if iat > now + self.policy.iat_leeway_seconds {
            return Err(DpopError::StaleProof);
        }
        if now - iat > self.policy.max_age_seconds {
            return Err(DpopError::StaleProof);
        }

        // 5) Method/URL binding.
        if !htm.eq_ignore_ascii_case(method.as_str()) {
            return Err(DpopError::MethodMismatch);
        }
        let expected_htu = self.expected_htu(headers, uri);
        if htu != expected_htu {
            return Err(DpopError::UriMismatch);
        }

        // 6) Anti-replay: atomic insert of jti, TTL = freshness window.
        let ttl = Duration::from_secs(self.policy.max_age_seconds.max(1) as u64);
        let first_use = self.replay.check_and_store(&jti, ttl).await.map_err(|e| {
            warn!(error = %e, "replay guard backend failure");
            DpopError::ReplayUnavailable
        })?;
        if !first_use {
            warn!(jti = %jti, "replayed DPoP proof");
            return Err(DpopError::ReplayedProof);
        }

        // 7) RFC 7638 thumbprint of the embedded key.
        let jkt = jwk_thumbprint(&jwk)?;

        Ok(VerifiedProof {
            jkt,
            jti,
            iat,
            ath: claims.ath,
        })
    }

    /// Externally visible request URL: scheme+host+path, no query. Forwarded
    /// headers win over Host; the configured external URL is the fallback.
    fn expected_htu(&self, headers: &HeaderMap, uri: &Uri) -> String {
        let scheme = headers
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .unwrap_or(&self.fallback_scheme);

        let host = headers
            .get("x-forwarded-host")
            .or_else(|| headers.get(header::HOST))
            .and_then(|v| v.to_str().ok())
            .unwrap_or(&self.fallback_host);

        format!("{}://{}{}", scheme, host, uri.path())
    }
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, DpopError> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(DpopError::MissingBearer)
}

fn sha256_b64url(input: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(input))
}

/// RFC 7638: SHA-256 over the canonical JSON of the key's required members,
/// lexicographic order, no whitespace.
fn jwk_thumbprint(jwk: &Jwk) -> Result<String, DpopError> {
    let canonical = match &jwk.algorithm {
        AlgorithmParameters::EllipticCurve(params) => {
            let crv = match params.curve {
                EllipticCurve::P256 => "P-256",
                EllipticCurve::P384 => "P-384",
                EllipticCurve::P521 => "P-521",
                _ => return Err(DpopError::UnsupportedJwk),
            };
            format!(
                "{{\"crv\":\"{}\",\"kty\":\"EC\",\"x\":\"{}\",\"y\":\"{}\"}}",
                crv, params.x, params.y
            )
        }
        AlgorithmParameters::OctetKeyPair(params) => match params.curve {
            EllipticCurve::Ed25519 => {
                format!("{{\"crv\":\"Ed25519\",\"kty\":\"OKP\",\"x\":\"{}\"}}", params.x)
            }
            _ => return Err(DpopError::UnsupportedJwk),
        },
        AlgorithmParameters::RSA(params) => {
            format!("{{\"e\":\"{}\",\"kty\":\"RSA\",\"n\":\"{}\"}}", params.e, params.n)
        }
        AlgorithmParameters::OctetKey(_) => return Err(DpopError::SymmetricKey),
    };

    Ok(sha256_b64url(canonical.as_bytes()))
}


#[cfg(test)]
mod tests {
    use super::testkit::*;
    use super::*;
    use crate::services::auth::jwt::{self, AccessTokenClaims, CnfClaim, device_sub};
    use crate::services::cache::MemoryCache;
    use ed25519_dalek::SigningKey;

    const URL: &str = "https://hub.example.com/api/v1/whoami";

    fn validator() -> DpopValidator {
        let jwt = Arc::new(jwt::test_signer(600));
        let replay = ReplayStore::new(Arc::new(MemoryCache::new()), "dpop:jti");
        DpopValidator::new(
            DpopPolicy {
                iat_leeway_seconds: 120,
                max_age_seconds: 900,
            },
            jwt,
            replay,
            "https://hub.example.com",
        )
        .unwrap()
    }

    fn access_token(device_id: Uuid, jkt: &str) -> String {
        let signer = jwt::test_signer(600);
        let now = chrono::Utc::now().timestamp();
        signer
            .sign(&AccessTokenClaims {
                iss: signer.issuer().to_string(),
                aud: signer.issuer().to_string(),
                sub: device_sub(device_id),
                iat: now,
                nbf: now,
                exp: now + 600,
                cnf: Some(CnfClaim {
                    jkt: jkt.to_string(),
                }),
            })
            .unwrap()
    }

    fn request_headers(proof: &str, bearer: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("DPoP", proof.parse().unwrap());
        if let Some(token) = bearer {
            headers.insert(
                header::AUTHORIZATION,
                format!("Bearer {}", token).parse().unwrap(),
            );
        }
        headers
    }

    fn uri() -> Uri {
        "/api/v1/whoami".parse().unwrap()
    }

    #[tokio::test]
    async fn valid_proof_and_bound_token_yield_device_id() {
        let v = validator();
        let key = ProofKey::generate();
        let device_id = Uuid::new_v4();
        let token = access_token(device_id, &key.jkt());

        let now = chrono::Utc::now().timestamp();
        let proof = key.proof("GET", URL, now, "jti-1");
        let headers = request_headers(&proof, Some(&token));

        let got = v.validate(&headers, &Method::GET, &uri()).await.unwrap();
        assert_eq!(got, device_id);
    }

    #[tokio::test]
    async fn ath_binding_is_enforced_when_present() {
        let v = validator();
        let key = ProofKey::generate();
        let device_id = Uuid::new_v4();
        let token = access_token(device_id, &key.jkt());
        let now = chrono::Utc::now().timestamp();

        let good = key.proof_with("GET", URL, now, "jti-ath-1", Some(&ath_of(&token)));
        let headers = request_headers(&good, Some(&token));
        assert!(v.validate(&headers, &Method::GET, &uri()).await.is_ok());

        let bad = key.proof_with("GET", URL, now, "jti-ath-2", Some(&ath_of("other-token")));
        let headers = request_headers(&bad, Some(&token));
        let err = v.validate(&headers, &Method::GET, &uri()).await.unwrap_err();
        assert!(matches!(err, DpopError::AthMismatch));
    }

    #[tokio::test]
    async fn stale_and_future_iat_are_rejected_despite_valid_signature() {
        let v = validator();
        let key = ProofKey::generate();
        let now = chrono::Utc::now().timestamp();

        let old = key.proof("GET", URL, now - 901, "jti-old");
        let headers = request_headers(&old, None);
        let err = v
            .verify_proof(&headers, &Method::GET, &uri())
            .await
            .unwrap_err();
        assert!(matches!(err, DpopError::StaleProof));

        let future = key.proof("GET", URL, now + 300, "jti-future");
        let headers = request_headers(&future, None);
        let err = v
            .verify_proof(&headers, &Method::GET, &uri())
            .await
            .unwrap_err();
        assert!(matches!(err, DpopError::StaleProof));
    }

    #[tokio::test]
    async fn same_jti_succeeds_once_then_replays() {
        let v = validator();
        let key = ProofKey::generate();
        let now = chrono::Utc::now().timestamp();

        let first = key.proof("GET", URL, now, "jti-replay");
        let headers = request_headers(&first, None);
        assert!(v.verify_proof(&headers, &Method::GET, &uri()).await.is_ok());

        // Fresh signature, same jti.
        let second = key.proof("GET", URL, now + 1, "jti-replay");
        let headers = request_headers(&second, None);
        let err = v
            .verify_proof(&headers, &Method::GET, &uri())
            .await
            .unwrap_err();
        assert!(matches!(err, DpopError::ReplayedProof));
    }

    #[tokio::test]
    async fn token_bound_to_another_key_is_rejected() {
        let v = validator();
        let proof_key = ProofKey::generate();
        let other_key = ProofKey::generate();
        let token = access_token(Uuid::new_v4(), &other_key.jkt());

        let now = chrono::Utc::now().timestamp();
        let proof = proof_key.proof("GET", URL, now, "jti-mismatch");
        let headers = request_headers(&proof, Some(&token));

        let err = v.validate(&headers, &Method::GET, &uri()).await.unwrap_err();
        assert!(matches!(err, DpopError::ProofKeyMismatch));
    }

    #[tokio::test]
    async fn htm_and_htu_must_match_the_request() {
        let v = validator();
        let key = ProofKey::generate();
        let now = chrono::Utc::now().timestamp();

        let wrong_method = key.proof("POST", URL, now, "jti-htm");
        let headers = request_headers(&wrong_method, None);
        let err = v
            .verify_proof(&headers, &Method::GET, &uri())
            .await
            .unwrap_err();
        assert!(matches!(err, DpopError::MethodMismatch));

        let wrong_url = key.proof("GET", "https://hub.example.com/api/v1/other", now, "jti-htu");
        let headers = request_headers(&wrong_url, None);
        let err = v
            .verify_proof(&headers, &Method::GET, &uri())
            .await
            .unwrap_err();
        assert!(matches!(err, DpopError::UriMismatch));
    }

    #[tokio::test]
    async fn hmac_family_algs_are_rejected() {
        let v = validator();
        let key = SigningKey::generate(&mut rand::rngs::OsRng);
        let now = chrono::Utc::now().timestamp();

        let header = serde_json::json!({
            "typ": "dpop+jwt",
            "alg": "HS256",
            "jwk": { "kty": "oct", "k": "c2VjcmV0" }
        });
        let claims = serde_json::json!({
            "htm": "GET", "htu": URL, "iat": now, "jti": "jti-hs",
        });
        let proof = sign_compact(&key, &header, &claims);
        let headers = request_headers(&proof, None);

        let err = v
            .verify_proof(&headers, &Method::GET, &uri())
            .await
            .unwrap_err();
        assert!(matches!(err, DpopError::DisallowedAlg(_)));
    }

    #[tokio::test]
    async fn symmetric_jwk_is_rejected_even_with_asymmetric_alg() {
        let v = validator();
        let key = SigningKey::generate(&mut rand::rngs::OsRng);
        let now = chrono::Utc::now().timestamp();

        let header = serde_json::json!({
            "typ": "dpop+jwt",
            "alg": "EdDSA",
            "jwk": { "kty": "oct", "k": "c2VjcmV0" }
        });
        let claims = serde_json::json!({
            "htm": "GET", "htu": URL, "iat": now, "jti": "jti-oct",
        });
        let proof = sign_compact(&key, &header, &claims);
        let headers = request_headers(&proof, None);

        let err = v
            .verify_proof(&headers, &Method::GET, &uri())
            .await
            .unwrap_err();
        assert!(matches!(err, DpopError::SymmetricKey));
    }

    #[tokio::test]
    async fn missing_typ_is_rejected() {
        let v = validator();
        let key = ProofKey::generate();
        let now = chrono::Utc::now().timestamp();

        // Same claims, but a bare "JWT" typ.
        let header = serde_json::json!({
            "typ": "JWT",
            "alg": "EdDSA",
            "jwk": { "kty": "OKP", "crv": "Ed25519", "x": key.x_b64 }
        });
        let claims = serde_json::json!({
            "htm": "GET", "htu": URL, "iat": now, "jti": "jti-typ",
        });
        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        let proof = sign_compact(&signing_key, &header, &claims);
        let headers = request_headers(&proof, None);

        let err = v
            .verify_proof(&headers, &Method::GET, &uri())
            .await
            .unwrap_err();
        assert!(matches!(err, DpopError::InvalidTyp));
    }

    #[tokio::test]
    async fn forwarded_headers_decide_the_expected_htu() {
        let v = validator();
        let key = ProofKey::generate();
        let now = chrono::Utc::now().timestamp();

        let proof = key.proof("GET", "https://edge.example.net/api/v1/whoami", now, "jti-fwd");
        let mut headers = request_headers(&proof, None);
        headers.insert("x-forwarded-proto", "https".parse().unwrap());
        headers.insert("x-forwarded-host", "edge.example.net".parse().unwrap());

        assert!(v.verify_proof(&headers, &Method::GET, &uri()).await.is_ok());
    }

    #[tokio::test]
    async fn missing_bearer_fails_the_full_gate() {
        let v = validator();
        let key = ProofKey::generate();
        let now = chrono::Utc::now().timestamp();

        let proof = key.proof("GET", URL, now, "jti-nobearer");
        let headers = request_headers(&proof, None);

        let err = v.validate(&headers, &Method::GET, &uri()).await.unwrap_err();
        assert!(matches!(err, DpopError::MissingBearer));
    }
}
