pub mod dpop;
pub mod enrollment;
pub mod jwt;
pub mod rate_limit;
pub mod replay;
pub mod rotation;
pub mod token_issuer;
