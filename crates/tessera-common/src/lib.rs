//! # tessera-common
//!
//! Shared types, configuration, and error handling used across all Tessera crates.
//! This is the foundation layer: no business logic, just primitives and contracts.

pub mod config;
pub mod error;
pub mod models;

pub use error::{TesseraError, TesseraResult};
pub use models::ids::ServerName;
pub use models::room_version::RoomVersion;
