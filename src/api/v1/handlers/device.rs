use axum::Json;

use crate::api::v1::dto::device::WhoamiResponse;
use crate::api::v1::extractors::DeviceCtxExtractor;

/// Smoke endpoint for devices to confirm their credentials work.
pub async fn whoami(DeviceCtxExtractor(ctx): DeviceCtxExtractor) -> Json<WhoamiResponse> {
    Json(WhoamiResponse {
        device_id: ctx.device_id,
    })
}
