use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct EnrollRequest {
    pub enrollment_token: String,
    /// Stable hash of the device's hardware fingerprint, computed on-device.
    pub fingerprint_hash: String,
    pub name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EnrollStatusResponse {
    pub enrolled: bool,
}
