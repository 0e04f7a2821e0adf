//! # tessera-roomserver
//!
//! The authoritative room-state service: accepts membership and state changes
//! for rooms this server participates in, answers the authorization and
//! visibility queries other subsystems depend on, and hands accepted events to
//! federation delivery.

pub mod acls;
pub mod api;
pub mod auth;
pub mod authority;
pub mod federation_sender;
pub mod locks;
pub mod storage;
pub mod version_cache;

pub use acls::ServerAcls;
pub use api::RoomserverInternalApi;
pub use authority::RoomServerAuthority;
pub use federation_sender::FederationSender;
pub use storage::{MemoryRoomStore, RoomStorage, UnsentHandoff};
