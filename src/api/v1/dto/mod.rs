pub mod certs;
pub mod device;
pub mod enroll;
pub mod tokens;
