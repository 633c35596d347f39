pub mod auth;
pub mod ca;
pub mod cache;
