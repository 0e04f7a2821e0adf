//! The hand-off from the room server to federation delivery.

use std::collections::BTreeSet;

use async_trait::async_trait;
use tessera_common::models::RoomEvent;
use tessera_common::{ServerName, TesseraResult};

/// Accepts events that remote servers need to receive.
///
/// Injected into the authority after construction with
/// [`RoomServerAuthority::set_federation_sender`](crate::RoomServerAuthority::set_federation_sender),
/// because the sender itself queries the authority.
#[async_trait]
pub trait FederationSender: Send + Sync {
    async fn send_event(&self, event: &RoomEvent, destinations: &BTreeSet<ServerName>) -> TesseraResult<()>;
}
