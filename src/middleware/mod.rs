pub mod dpop;
pub mod http;
pub mod mtls;
