use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct WhoamiResponse {
    pub device_id: Uuid,
}
