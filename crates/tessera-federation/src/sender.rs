//! Federation sender backed by the outbound queue.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tessera_common::config::FederationConfig;
use tessera_common::models::{Edu, RoomEvent};
use tessera_common::{ServerName, TesseraResult};
use tessera_roomserver::api::QueryServerBannedFromRoomRequest;
use tessera_roomserver::{FederationSender, RoomserverInternalApi};

use crate::queue::{OutboundQueue, Receipt};

/// Queues accepted events for every destination the room's server ACL admits.
///
/// Blacklisted destinations are still queued; the delivery scheduler decides
/// whether to attempt them.
pub struct QueueingSender {
    queue: OutboundQueue,
    roomserver: Arc<dyn RoomserverInternalApi>,
    edu_ttls: BTreeMap<String, Duration>,
}

impl QueueingSender {
    pub fn new(queue: OutboundQueue, roomserver: Arc<dyn RoomserverInternalApi>, config: &FederationConfig) -> Self {
        let edu_ttls = config
            .edu_ttl_secs
            .iter()
            .map(|(edu_type, secs)| (edu_type.clone(), Duration::from_secs(*secs)))
            .collect();
        Self { queue, roomserver, edu_ttls }
    }

    /// Queue an EDU for `destinations`, expiring per its type's TTL.
    /// Returns `None` when there is nobody to send to.
    pub async fn send_edu(&self, edu: &Edu, destinations: &BTreeSet<ServerName>) -> TesseraResult<Option<Receipt>> {
        if destinations.is_empty() {
            return Ok(None);
        }
        let blob = serde_json::to_string(edu)?;
        let receipt = self.queue.store_json(&blob).await?;
        self.queue
            .associate_edu_with_destinations(destinations, receipt, &edu.edu_type, &self.edu_ttls)
            .await?;
        Ok(Some(receipt))
    }

    async fn admitted(&self, room_id: &str, destinations: &BTreeSet<ServerName>) -> TesseraResult<BTreeSet<ServerName>> {
        let mut admitted = BTreeSet::new();
        for destination in destinations {
            let banned = self
                .roomserver
                .query_server_banned_from_room(QueryServerBannedFromRoomRequest {
                    server_name: destination.clone(),
                    room_id: room_id.to_string(),
                })
                .await?
                .banned;
            if banned {
                tracing::debug!(room_id, server = %destination, "Skipping destination banned by server ACL");
            } else {
                admitted.insert(destination.clone());
            }
        }
        Ok(admitted)
    }
}

#[async_trait]
impl FederationSender for QueueingSender {
    async fn send_event(&self, event: &RoomEvent, destinations: &BTreeSet<ServerName>) -> TesseraResult<()> {
        let admitted = self.admitted(&event.room_id, destinations).await?;
        if admitted.is_empty() {
            return Ok(());
        }
        let blob = serde_json::to_string(event)?;
        let receipt = self.queue.store_json(&blob).await?;
        self.queue.associate_pdu_with_destinations(&admitted, receipt).await?;
        tracing::debug!(event_id = %event.event_id, destinations = admitted.len(), "Event queued for federation");
        Ok(())
    }
}
