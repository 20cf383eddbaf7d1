//! Operational HTTP API of the identity service.
pub mod error;
pub mod system;
pub mod types;
