mod device_ctx;

pub use device_ctx::{DeviceCtx, DeviceCtxExtractor};
