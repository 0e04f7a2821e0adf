//! Domain models shared by the room server, the federation queue and the internal API.
//!
//! Identifiers follow the federation grammar: `@user:server`, `!room:server`, `$event:server`.

pub mod acl;
pub mod event;
pub mod ids;
pub mod membership;
pub mod room_version;

pub use acl::*;
pub use event::*;
pub use ids::*;
pub use membership::*;
pub use room_version::*;
