pub mod directory;
pub mod error;
pub mod memory;
pub mod postgres;
