use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::services::ca::IssuedCertificate;

#[derive(Debug, Deserialize)]
pub struct CertRequest {
    pub csr_pem: String,
}

#[derive(Debug, Serialize)]
pub struct CertResponse {
    pub certificate_pem: String,
    pub ca_chain_pem: String,
    pub serial: String,
    pub not_after: DateTime<Utc>,
}

impl From<IssuedCertificate> for CertResponse {
    fn from(issued: IssuedCertificate) -> Self {
        Self {
            certificate_pem: issued.certificate_pem,
            ca_chain_pem: issued.ca_chain_pem,
            serial: issued.serial,
            not_after: issued.not_after,
        }
    }
}
