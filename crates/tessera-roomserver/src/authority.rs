//! The room server authority.
//!
//! Owns the room version cache and compiled server ACLs, validates membership
//! and state changes against the room's auth rules, and hands accepted events
//! to the federation sender for every remote server that must see them.
//!
//! ## Concurrency
//!
//! Perform operations serialize per room through [`RoomLocks`]. Once the lock is
//! held the mutation runs on its own task, so a caller that gives up waiting
//! cannot leave a room half-updated. Queries take no lock.
//!
//! ## Federation handoff
//!
//! An event is appended to storage first and handed to the federation sender
//! second. Once appended it is accepted: a sender failure is logged, the event
//! is recorded as unsent alongside its room, and the Perform still succeeds.
//! Unsent events are handed off again, oldest first, at the start of the next
//! Perform that submits an event to the same room.

use std::collections::BTreeSet;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde_json::json;
use tessera_common::config::RoomServerConfig;
use tessera_common::models::{
    HistoryVisibility, Membership, RoomEvent, RoomVersionCapabilities, ServerAclContent, Visibility,
    event as event_types, new_room_id, server_name_of,
};
use tessera_common::{RoomVersion, ServerName, TesseraError, TesseraResult};

use crate::acls::ServerAcls;
use crate::api::*;
use crate::auth::{AuthContext, AuthRules, StandardAuthRules};
use crate::federation_sender::FederationSender;
use crate::locks::RoomLocks;
use crate::storage::{RoomInfo, RoomState, RoomStorage, UnsentHandoff};
use crate::version_cache::RoomVersionCache;

/// Authoritative room service. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct RoomServerAuthority {
    inner: Arc<Inner>,
}

struct Inner {
    server_name: ServerName,
    default_room_version: RoomVersion,
    storage: Arc<dyn RoomStorage>,
    auth_rules: Arc<dyn AuthRules>,
    acls: Option<Arc<ServerAcls>>,
    versions: RoomVersionCache,
    locks: RoomLocks,
    federation: OnceLock<Arc<dyn FederationSender>>,
}

impl RoomServerAuthority {
    pub fn new(
        server_name: ServerName,
        config: &RoomServerConfig,
        storage: Arc<dyn RoomStorage>,
        acls: Option<Arc<ServerAcls>>,
    ) -> Self {
        Self::with_auth_rules(server_name, config, storage, acls, Arc::new(StandardAuthRules))
    }

    pub fn with_auth_rules(
        server_name: ServerName,
        config: &RoomServerConfig,
        storage: Arc<dyn RoomStorage>,
        acls: Option<Arc<ServerAcls>>,
        auth_rules: Arc<dyn AuthRules>,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.room_version_cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(Inner {
                server_name,
                default_room_version: config.default_room_version.clone(),
                storage,
                auth_rules,
                acls,
                versions: RoomVersionCache::new(capacity),
                locks: RoomLocks::new(),
                federation: OnceLock::new(),
            }),
        }
    }

    /// Attach the federation sender. May be called once.
    pub fn set_federation_sender(&self, sender: Arc<dyn FederationSender>) -> TesseraResult<()> {
        self.inner
            .federation
            .set(sender)
            .map_err(|_| TesseraError::configuration("federation sender is already set"))?;
        tracing::info!("Federation sender attached to room server");
        Ok(())
    }

    pub fn server_name(&self) -> &ServerName {
        &self.inner.server_name
    }

    /// Run `op` with `room_id` locked, on a task of its own.
    async fn run_locked<T, F, Fut>(&self, room_id: &str, op: F) -> TesseraResult<T>
    where
        F: FnOnce(Arc<Inner>) -> Fut + Send + 'static,
        Fut: Future<Output = TesseraResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let guard = self.inner.locks.lock_owned(room_id).await;
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let _guard = guard;
            op(inner).await
        })
        .await?
    }

    async fn submit(&self, event: RoomEvent, extra_destination: Option<ServerName>) -> TesseraResult<PerformEventResponse> {
        let room_id = event.room_id.clone();
        self.run_locked(&room_id, move |inner| async move {
            inner.submit(event, extra_destination).await
        })
        .await
    }

    fn acls(&self) -> TesseraResult<&ServerAcls> {
        self.inner.acls()
    }
}

impl Inner {
    fn acls(&self) -> TesseraResult<&ServerAcls> {
        self.acls
            .as_deref()
            .ok_or_else(|| TesseraError::configuration("server ACLs are not initialised"))
    }

    async fn room_version(&self, room_id: &str) -> TesseraResult<RoomVersion> {
        if let Some(version) = self.versions.get(room_id) {
            return Ok(version);
        }
        let info = self
            .storage
            .room_info(room_id)
            .await?
            .ok_or_else(|| TesseraError::not_found(format!("Room {room_id}")))?;
        self.versions.store(room_id, info.room_version.clone());
        Ok(info.room_version)
    }

    async fn room_state(&self, room_id: &str) -> TesseraResult<RoomState> {
        self.storage
            .room_state(room_id)
            .await?
            .ok_or_else(|| TesseraError::not_found(format!("Room {room_id}")))
    }

    /// Remote servers owed `event`: those with joined users now, plus `extra`,
    /// minus this server and the server the event came from.
    async fn destinations(&self, event: &RoomEvent, extra: Option<ServerName>) -> TesseraResult<BTreeSet<ServerName>> {
        let mut destinations: BTreeSet<ServerName> = self
            .storage
            .joined_users(&event.room_id)
            .await?
            .iter()
            .filter_map(|user| server_name_of(user))
            .collect();
        destinations.extend(extra);
        destinations.remove(&self.server_name);
        if let Some(origin) = server_name_of(&event.sender) {
            destinations.remove(&origin);
        }
        Ok(destinations)
    }

    /// Give `handoff` to `federation`, keeping it as unsent if the sender fails.
    async fn hand_off(&self, federation: &dyn FederationSender, handoff: UnsentHandoff) {
        let Err(e) = federation.send_event(&handoff.event, &handoff.destinations).await else {
            return;
        };
        let event_id = handoff.event.event_id.clone();
        tracing::error!(event_id = %event_id, error = %e, "Federation handoff failed, event kept as unsent");
        if let Err(e) = self.storage.record_unsent(handoff).await {
            tracing::error!(event_id = %event_id, error = %e, "Failed to record unsent event");
        }
    }

    async fn retry_unsent(&self, room_id: &str) -> TesseraResult<()> {
        let Some(federation) = self.federation.get() else {
            return Ok(());
        };
        let unsent = self.storage.take_unsent(room_id).await?;
        if !unsent.is_empty() {
            tracing::info!(room_id, events = unsent.len(), "Retrying federation handoff");
        }
        for handoff in unsent {
            self.hand_off(&**federation, handoff).await;
        }
        Ok(())
    }

    async fn submit(&self, event: RoomEvent, extra: Option<ServerName>) -> TesseraResult<PerformEventResponse> {
        let room_id = event.room_id.as_str();
        let room_version = self.room_version(room_id).await?;
        self.retry_unsent(room_id).await?;
        let state = self.room_state(room_id).await?;
        let sender_membership = self.storage.membership(room_id, &event.sender).await?;
        let target_membership = match (event.event_type.as_str(), event.state_key.as_deref()) {
            (event_types::MEMBER, Some(target)) => self.storage.membership(room_id, target).await?,
            _ => None,
        };

        let ctx = AuthContext {
            room_version: &room_version,
            state: &state,
            sender_membership,
            target_membership,
        };
        self.auth_rules.check(&ctx, &event).inspect_err(|e| {
            tracing::debug!(room_id, event_type = %event.event_type, sender = %event.sender, reason = %e, "Event rejected");
        })?;

        let acl = if event.event_type == event_types::SERVER_ACL {
            let content: ServerAclContent = serde_json::from_value(event.content.clone())
                .map_err(|e| TesseraError::validation(format!("invalid m.room.server_acl content: {e}")))?;
            Some(content)
        } else {
            None
        };

        let destinations = self.destinations(&event, extra).await?;
        let federation = if destinations.is_empty() {
            None
        } else {
            let sender = self.federation.get().cloned().ok_or_else(|| {
                TesseraError::configuration("federation sender is not set but the event has remote destinations")
            })?;
            Some(sender)
        };

        self.storage.append_event(event.clone()).await?;
        if let (Some(content), Some(acls)) = (&acl, &self.acls) {
            acls.on_server_acl_updated(room_id, content);
        }

        tracing::info!(
            room_id,
            event_id = %event.event_id,
            event_type = %event.event_type,
            sender = %event.sender,
            destinations = destinations.len(),
            "Event accepted"
        );

        let event_id = event.event_id.clone();
        if let Some(federation) = federation {
            self.hand_off(&*federation, UnsentHandoff { event, destinations }).await;
        }

        Ok(PerformEventResponse { event_id })
    }

    async fn create_room(&self, room_id: String, room_version: RoomVersion, req: PerformCreateRoomRequest) -> TesseraResult<()> {
        let origin = &self.server_name;
        let creator = req.creator.as_str();
        let join_rule = req.join_rule.unwrap_or_default();
        let history_visibility = req.history_visibility.unwrap_or_default();

        let mut events = vec![
            RoomEvent::new(
                origin,
                &room_id,
                creator,
                event_types::CREATE,
                Some(String::new()),
                json!({ "creator": creator, "room_version": room_version }),
            ),
            RoomEvent::membership(origin, &room_id, creator, creator, Membership::Join),
        ];
        let join_rules = RoomEvent::new(
            origin,
            &room_id,
            creator,
            event_types::JOIN_RULES,
            Some(String::new()),
            json!({ "join_rule": join_rule }),
        );
        // The creator is joined by the time the remaining state is sent.
        let ctx = AuthContext {
            room_version: &room_version,
            state: &RoomState::default(),
            sender_membership: Some(Membership::Join),
            target_membership: None,
        };
        self.auth_rules.check(&ctx, &join_rules)?;
        events.push(join_rules);
        events.push(RoomEvent::new(
            origin,
            &room_id,
            creator,
            event_types::HISTORY_VISIBILITY,
            Some(String::new()),
            json!({ "history_visibility": history_visibility }),
        ));
        if let Some(acl) = &req.server_acl {
            events.push(RoomEvent::new(
                origin,
                &room_id,
                creator,
                event_types::SERVER_ACL,
                Some(String::new()),
                serde_json::to_value(acl)?,
            ));
        }

        let info = RoomInfo {
            room_id: room_id.clone(),
            room_version: room_version.clone(),
            creator: creator.to_string(),
        };
        self.storage.create_room(info, events).await?;
        self.versions.store(&room_id, room_version.clone());
        if let (Some(content), Some(acls)) = (&req.server_acl, &self.acls) {
            acls.on_server_acl_updated(&room_id, content);
        }
        if req.visibility == Some(Visibility::Public) {
            self.storage.set_published(&room_id, true).await?;
        }

        tracing::info!(room_id = %room_id, room_version = %room_version, creator, "Room created");
        Ok(())
    }

    async fn is_server_in_room(&self, server_name: &ServerName, room_id: &str) -> TesseraResult<bool> {
        let joined = self.storage.joined_users(room_id).await?;
        Ok(joined.iter().any(|user| server_name_of(user).as_ref() == Some(server_name)))
    }
}

#[async_trait]
impl RoomserverInternalApi for RoomServerAuthority {
    async fn perform_create_room(&self, req: PerformCreateRoomRequest) -> TesseraResult<PerformCreateRoomResponse> {
        let room_version = req
            .room_version
            .clone()
            .unwrap_or_else(|| self.inner.default_room_version.clone());
        if !room_version.is_supported() {
            return Err(TesseraError::validation(format!("room version {room_version} is not supported")));
        }
        if server_name_of(&req.creator).is_none() {
            return Err(TesseraError::validation(format!("invalid creator user ID {}", req.creator)));
        }

        let room_id = new_room_id(&self.inner.server_name);
        let response = PerformCreateRoomResponse {
            room_id: room_id.clone(),
            room_version: room_version.clone(),
        };
        self.run_locked(&room_id.clone(), move |inner| async move {
            inner.create_room(room_id, room_version, req).await
        })
        .await?;
        Ok(response)
    }

    async fn perform_join(&self, req: PerformJoinRequest) -> TesseraResult<PerformEventResponse> {
        let server = server_name_of(&req.user_id)
            .ok_or_else(|| TesseraError::validation(format!("invalid user ID {}", req.user_id)))?;
        let event = RoomEvent::membership(&self.inner.server_name, &req.room_id, &req.user_id, &req.user_id, Membership::Join);
        // The ban is checked under the room lock so an ACL change cannot slip in between.
        self.run_locked(&req.room_id, move |inner| async move {
            if inner.acls()?.is_server_banned_from_room(&server, &event.room_id) {
                tracing::debug!(room_id = %event.room_id, server = %server, "Join refused by server ACL");
                return Err(TesseraError::forbidden(format!("server {server} is banned from the room")));
            }
            inner.submit(event, None).await
        })
        .await
    }

    async fn perform_leave(&self, req: PerformLeaveRequest) -> TesseraResult<PerformEventResponse> {
        let event = RoomEvent::membership(&self.inner.server_name, &req.room_id, &req.user_id, &req.user_id, Membership::Leave);
        self.submit(event, None).await
    }

    async fn perform_invite(&self, req: PerformInviteRequest) -> TesseraResult<PerformEventResponse> {
        let invitee_server = server_name_of(&req.invitee)
            .ok_or_else(|| TesseraError::validation(format!("invalid user ID {}", req.invitee)))?;
        let event = RoomEvent::membership(&self.inner.server_name, &req.room_id, &req.inviter, &req.invitee, Membership::Invite);
        self.submit(event, Some(invitee_server)).await
    }

    async fn perform_peek(&self, req: PerformPeekRequest) -> TesseraResult<PerformAck> {
        let room_id = req.room_id.clone();
        self.run_locked(&room_id, move |inner| async move {
            let state = inner.room_state(&req.room_id).await?;
            if state.history_visibility != HistoryVisibility::WorldReadable {
                return Err(TesseraError::forbidden("room is not world readable"));
            }
            inner.storage.add_peek(&req.room_id, &req.user_id).await?;
            tracing::debug!(room_id = %req.room_id, user_id = %req.user_id, "Peek started");
            Ok(PerformAck {})
        })
        .await
    }

    async fn perform_publish(&self, req: PerformPublishRequest) -> TesseraResult<PerformAck> {
        let room_id = req.room_id.clone();
        self.run_locked(&room_id, move |inner| async move {
            inner.room_version(&req.room_id).await?;
            let published = req.visibility == Visibility::Public;
            inner.storage.set_published(&req.room_id, published).await?;
            tracing::info!(room_id = %req.room_id, published, "Room directory visibility changed");
            Ok(PerformAck {})
        })
        .await
    }

    async fn perform_forget(&self, req: PerformForgetRequest) -> TesseraResult<PerformAck> {
        let room_id = req.room_id.clone();
        self.run_locked(&room_id, move |inner| async move {
            inner.room_version(&req.room_id).await?;
            match inner.storage.membership(&req.room_id, &req.user_id).await? {
                None => Err(TesseraError::not_found(format!(
                    "Membership of {} in {}",
                    req.user_id, req.room_id
                ))),
                Some(Membership::Join) => Err(TesseraError::forbidden("cannot forget a room while joined")),
                Some(_) => {
                    inner.storage.forget_room(&req.room_id, &req.user_id).await?;
                    tracing::debug!(room_id = %req.room_id, user_id = %req.user_id, "Room forgotten");
                    Ok(PerformAck {})
                }
            }
        })
        .await
    }

    async fn perform_send_state(&self, req: PerformSendStateRequest) -> TesseraResult<PerformEventResponse> {
        let event = RoomEvent::new(
            &self.inner.server_name,
            req.room_id,
            req.sender,
            req.event_type,
            Some(req.state_key),
            req.content,
        );
        self.submit(event, None).await
    }

    async fn query_room_version_for_room(
        &self,
        req: QueryRoomVersionForRoomRequest,
    ) -> TesseraResult<QueryRoomVersionForRoomResponse> {
        let room_version = self.inner.room_version(&req.room_id).await?;
        Ok(QueryRoomVersionForRoomResponse { room_version })
    }

    async fn query_room_version_capabilities(
        &self,
        _req: QueryRoomVersionCapabilitiesRequest,
    ) -> TesseraResult<RoomVersionCapabilities> {
        Ok(RoomVersionCapabilities::with_default(self.inner.default_room_version.clone()))
    }

    async fn query_server_banned_from_room(
        &self,
        req: QueryServerBannedFromRoomRequest,
    ) -> TesseraResult<QueryServerBannedFromRoomResponse> {
        let banned = self.acls()?.is_server_banned_from_room(&req.server_name, &req.room_id);
        Ok(QueryServerBannedFromRoomResponse { banned })
    }

    async fn query_server_allowed_to_see_event(
        &self,
        req: QueryServerAllowedToSeeEventRequest,
    ) -> TesseraResult<QueryServerAllowedToSeeEventResponse> {
        let stored = self
            .inner
            .storage
            .event(&req.event_id)
            .await?
            .ok_or_else(|| TesseraError::not_found(format!("Event {}", req.event_id)))?;

        let memberships: Vec<Membership> = stored
            .memberships
            .iter()
            .filter(|(user, _)| server_name_of(user).as_ref() == Some(&req.server_name))
            .map(|(_, membership)| *membership)
            .collect();
        let any = |wanted: &[Membership]| memberships.iter().any(|m| wanted.contains(m));

        let allowed = match stored.history_visibility {
            HistoryVisibility::WorldReadable => true,
            HistoryVisibility::Shared => {
                any(&[Membership::Join])
                    || self.inner.is_server_in_room(&req.server_name, &stored.event.room_id).await?
            }
            HistoryVisibility::Invited => any(&[Membership::Join, Membership::Invite]),
            HistoryVisibility::Joined => any(&[Membership::Join]),
        };
        Ok(QueryServerAllowedToSeeEventResponse { allowed_to_see_event: allowed })
    }

    async fn query_shared_users(&self, req: QuerySharedUsersRequest) -> TesseraResult<QuerySharedUsersResponse> {
        let mut room_ids = self
            .inner
            .storage
            .rooms_by_membership(&req.user_id, Membership::Join)
            .await?;
        room_ids.extend(req.include_room_ids);
        room_ids.retain(|room_id| !req.exclude_room_ids.contains(room_id));

        let counts = self.inner.storage.joined_users_set_in_rooms(&room_ids).await?;
        Ok(QuerySharedUsersResponse { user_ids_to_count: counts.into_iter().collect() })
    }

    async fn query_rooms_for_user(&self, req: QueryRoomsForUserRequest) -> TesseraResult<RoomIdsResponse> {
        let room_ids = self
            .inner
            .storage
            .rooms_by_membership(&req.user_id, req.want_membership)
            .await?;
        Ok(RoomIdsResponse { room_ids })
    }

    async fn query_published_rooms(&self, _req: QueryPublishedRoomsRequest) -> TesseraResult<RoomIdsResponse> {
        let room_ids = self.inner.storage.published_rooms().await?;
        Ok(RoomIdsResponse { room_ids })
    }

    async fn query_membership_for_user(
        &self,
        req: QueryMembershipForUserRequest,
    ) -> TesseraResult<QueryMembershipForUserResponse> {
        if self.inner.storage.room_info(&req.room_id).await?.is_none() {
            return Ok(QueryMembershipForUserResponse { room_exists: false, membership: None, is_in_room: false });
        }
        let membership = self.inner.storage.membership(&req.room_id, &req.user_id).await?;
        Ok(QueryMembershipForUserResponse {
            room_exists: true,
            membership,
            is_in_room: membership == Some(Membership::Join),
        })
    }

    async fn query_server_joined_to_room(
        &self,
        req: QueryServerJoinedToRoomRequest,
    ) -> TesseraResult<QueryServerJoinedToRoomResponse> {
        if self.inner.storage.room_info(&req.room_id).await?.is_none() {
            return Ok(QueryServerJoinedToRoomResponse { room_exists: false, is_in_room: false });
        }
        let is_in_room = self.inner.is_server_in_room(&req.server_name, &req.room_id).await?;
        Ok(QueryServerJoinedToRoomResponse { room_exists: true, is_in_room })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryRoomStore;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const ALICE: &str = "@alice:local.org";

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<(String, BTreeSet<ServerName>)>>,
    }

    impl RecordingSender {
        fn destinations(&self) -> Vec<BTreeSet<ServerName>> {
            self.sent.lock().unwrap().iter().map(|(_, d)| d.clone()).collect()
        }
    }

    #[async_trait]
    impl FederationSender for RecordingSender {
        async fn send_event(&self, event: &RoomEvent, destinations: &BTreeSet<ServerName>) -> TesseraResult<()> {
            self.sent.lock().unwrap().push((event.event_id.clone(), destinations.clone()));
            Ok(())
        }
    }

    /// Fails its first `failures` handoffs, then records event IDs.
    struct FlakySender {
        failures: AtomicUsize,
        sent: Mutex<Vec<String>>,
    }

    impl FlakySender {
        fn failing(failures: usize) -> Self {
            Self { failures: AtomicUsize::new(failures), sent: Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl FederationSender for FlakySender {
        async fn send_event(&self, event: &RoomEvent, _destinations: &BTreeSet<ServerName>) -> TesseraResult<()> {
            if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok() {
                return Err(TesseraError::Internal(anyhow::anyhow!("queue unavailable")));
            }
            self.sent.lock().unwrap().push(event.event_id.clone());
            Ok(())
        }
    }

    fn config() -> RoomServerConfig {
        RoomServerConfig {
            default_room_version: RoomVersion::from("6"),
            room_version_cache_capacity: 16,
        }
    }

    fn authority(store: &MemoryRoomStore) -> RoomServerAuthority {
        let local = ServerName::from("local.org");
        let acls = Arc::new(ServerAcls::new(local.clone()));
        RoomServerAuthority::new(local, &config(), Arc::new(store.clone()), Some(acls))
    }

    fn servers(names: &[&str]) -> BTreeSet<ServerName> {
        names.iter().map(|n| ServerName::from(*n)).collect()
    }

    async fn public_room(authority: &RoomServerAuthority) -> String {
        authority
            .perform_create_room(PerformCreateRoomRequest {
                creator: ALICE.into(),
                join_rule: Some(tessera_common::models::JoinRule::Public),
                ..Default::default()
            })
            .await
            .unwrap()
            .room_id
    }

    async fn join(authority: &RoomServerAuthority, room_id: &str, user_id: &str) -> TesseraResult<PerformEventResponse> {
        authority
            .perform_join(PerformJoinRequest { room_id: room_id.into(), user_id: user_id.into() })
            .await
    }

    #[tokio::test]
    async fn room_version_is_stable_across_restart() {
        let store = MemoryRoomStore::new();
        let first = authority(&store);
        first.set_federation_sender(Arc::new(RecordingSender::default())).unwrap();
        let room_id = public_room(&first).await;
        join(&first, &room_id, "@bob:remote.org").await.unwrap();

        let query = || QueryRoomVersionForRoomRequest { room_id: room_id.clone() };
        assert_eq!(first.query_room_version_for_room(query()).await.unwrap().room_version.as_str(), "6");

        // A fresh authority over the same storage starts with an empty cache.
        let restarted = authority(&store);
        let reads = store.room_info_reads();
        for _ in 0..3 {
            let version = restarted.query_room_version_for_room(query()).await.unwrap().room_version;
            assert_eq!(version.as_str(), "6");
        }
        assert_eq!(store.room_info_reads() - reads, 1);
    }

    #[tokio::test]
    async fn unknown_room_version_is_not_found() {
        let store = MemoryRoomStore::new();
        let err = authority(&store)
            .query_room_version_for_room(QueryRoomVersionForRoomRequest { room_id: "!nope:local.org".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, TesseraError::NotFound { .. }));
    }

    #[tokio::test]
    async fn unsupported_room_version_is_rejected() {
        let store = MemoryRoomStore::new();
        let err = authority(&store)
            .perform_create_room(PerformCreateRoomRequest {
                creator: ALICE.into(),
                room_version: Some(RoomVersion::from("42")),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TesseraError::Validation { .. }));
    }

    #[tokio::test]
    async fn accepted_events_fan_out_to_joined_hosts() {
        let store = MemoryRoomStore::new();
        let authority = authority(&store);
        let sender = Arc::new(RecordingSender::default());
        authority.set_federation_sender(sender.clone()).unwrap();
        let room_id = public_room(&authority).await;

        // Only the local creator was joined, and bob's own server originated the join.
        join(&authority, &room_id, "@bob:remote.org").await.unwrap();
        join(&authority, &room_id, "@carol:third.org").await.unwrap();
        authority
            .perform_invite(PerformInviteRequest {
                room_id: room_id.clone(),
                inviter: ALICE.into(),
                invitee: "@dan:fourth.org".into(),
            })
            .await
            .unwrap();

        assert_eq!(
            sender.destinations(),
            vec![servers(&["remote.org"]), servers(&["fourth.org", "remote.org", "third.org"])]
        );
    }

    #[tokio::test]
    async fn missing_sender_is_a_configuration_error() {
        let store = MemoryRoomStore::new();
        let authority = authority(&store);
        let room_id = public_room(&authority).await;
        join(&authority, &room_id, "@bob:remote.org").await.unwrap();

        let err = join(&authority, &room_id, "@carol:third.org").await.unwrap_err();
        assert!(matches!(err, TesseraError::Configuration { .. }));
        assert_eq!(store.membership(&room_id, "@carol:third.org").await.unwrap(), None);
    }

    #[tokio::test]
    async fn federation_sender_can_only_be_set_once() {
        let store = MemoryRoomStore::new();
        let authority = authority(&store);
        authority.set_federation_sender(Arc::new(RecordingSender::default())).unwrap();
        let err = authority
            .set_federation_sender(Arc::new(RecordingSender::default()))
            .unwrap_err();
        assert!(matches!(err, TesseraError::Configuration { .. }));
    }

    #[tokio::test]
    async fn acl_state_bans_servers() {
        let store = MemoryRoomStore::new();
        let authority = authority(&store);
        let room_id = public_room(&authority).await;

        authority
            .perform_send_state(PerformSendStateRequest {
                room_id: room_id.clone(),
                sender: ALICE.into(),
                event_type: event_types::SERVER_ACL.into(),
                state_key: String::new(),
                content: json!({ "allow": ["*"], "deny": ["evil.org"] }),
            })
            .await
            .unwrap();

        let banned = |server: &str| QueryServerBannedFromRoomRequest {
            server_name: ServerName::from(server),
            room_id: room_id.clone(),
        };
        assert!(authority.query_server_banned_from_room(banned("evil.org")).await.unwrap().banned);
        assert!(!authority.query_server_banned_from_room(banned("local.org")).await.unwrap().banned);

        let err = join(&authority, &room_id, "@mallory:evil.org").await.unwrap_err();
        assert!(matches!(err, TesseraError::Forbidden { .. }));
    }

    #[tokio::test]
    async fn acl_change_while_a_join_waits_for_the_lock_is_enforced() {
        let store = MemoryRoomStore::new();
        let local = ServerName::from("local.org");
        let acls = Arc::new(ServerAcls::new(local.clone()));
        let authority = RoomServerAuthority::new(local, &config(), Arc::new(store.clone()), Some(acls.clone()));
        let room_id = public_room(&authority).await;

        let guard = authority.inner.locks.lock_owned(&room_id).await;
        let pending = tokio::spawn({
            let authority = authority.clone();
            let room_id = room_id.clone();
            async move { join(&authority, &room_id, "@mallory:evil.org").await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        acls.on_server_acl_updated(
            &room_id,
            &ServerAclContent { allow: vec!["*".into()], deny: vec!["evil.org".into()], allow_ip_literals: true },
        );
        drop(guard);

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, TesseraError::Forbidden { .. }));
        assert_eq!(store.membership(&room_id, "@mallory:evil.org").await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_leaves_apply_exactly_once() {
        let store = MemoryRoomStore::new();
        let authority = authority(&store);
        authority.set_federation_sender(Arc::new(RecordingSender::default())).unwrap();
        let room_id = public_room(&authority).await;
        join(&authority, &room_id, "@bob:local.org").await.unwrap();

        let leaves: Vec<_> = (0..8)
            .map(|_| {
                let authority = authority.clone();
                let room_id = room_id.clone();
                tokio::spawn(async move {
                    authority
                        .perform_leave(PerformLeaveRequest { room_id, user_id: "@bob:local.org".into() })
                        .await
                })
            })
            .collect();

        let mut applied = 0;
        for leave in leaves {
            match leave.await.unwrap() {
                Ok(_) => applied += 1,
                Err(e) => assert!(matches!(e, TesseraError::Forbidden { .. })),
            }
        }
        assert_eq!(applied, 1);
        assert_eq!(store.membership(&room_id, "@bob:local.org").await.unwrap(), Some(Membership::Leave));
    }

    #[tokio::test]
    async fn abandoned_join_still_completes() {
        let store = MemoryRoomStore::new();
        let authority = authority(&store);
        let room_id = public_room(&authority).await;

        // The first poll takes the lock and spawns the mutation; the zero timeout then drops the caller.
        let _ = tokio::time::timeout(Duration::ZERO, join(&authority, &room_id, "@bob:local.org")).await;

        let mut joined = false;
        for _ in 0..50 {
            if store.membership(&room_id, "@bob:local.org").await.unwrap() == Some(Membership::Join) {
                joined = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(joined);
    }

    #[tokio::test]
    async fn failed_handoff_keeps_the_event_and_retries_it() {
        let store = MemoryRoomStore::new();
        let authority = authority(&store);
        let sender = Arc::new(FlakySender::failing(1));
        authority.set_federation_sender(sender.clone()).unwrap();
        let room_id = public_room(&authority).await;
        join(&authority, &room_id, "@bob:remote.org").await.unwrap();

        // remote.org is owed this join, and the sender refuses it.
        let carol = join(&authority, &room_id, "@carol:local.org").await.unwrap();
        assert_eq!(store.membership(&room_id, "@carol:local.org").await.unwrap(), Some(Membership::Join));
        assert!(sender.sent.lock().unwrap().is_empty());

        let dan = join(&authority, &room_id, "@dan:local.org").await.unwrap();
        assert_eq!(*sender.sent.lock().unwrap(), vec![carol.event_id, dan.event_id]);
        assert!(store.take_unsent(&room_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ban_query_without_acls_is_a_configuration_error() {
        let store = MemoryRoomStore::new();
        let authority = RoomServerAuthority::new(ServerName::from("local.org"), &config(), Arc::new(store), None);
        let err = authority
            .query_server_banned_from_room(QueryServerBannedFromRoomRequest {
                server_name: ServerName::from("remote.org"),
                room_id: "!r:local.org".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TesseraError::Configuration { .. }));
    }

    #[tokio::test]
    async fn shared_users_respect_include_and_exclude() {
        let store = MemoryRoomStore::new();
        let authority = authority(&store);
        let room_x = public_room(&authority).await;
        let room_y = public_room(&authority).await;
        join(&authority, &room_x, "@bob:local.org").await.unwrap();
        join(&authority, &room_y, "@bob:local.org").await.unwrap();

        let shared = authority
            .query_shared_users(QuerySharedUsersRequest {
                user_id: ALICE.into(),
                include_room_ids: vec![room_x.clone()],
                exclude_room_ids: vec![room_x.clone()],
            })
            .await
            .unwrap()
            .user_ids_to_count;
        assert_eq!(shared.get("@bob:local.org"), Some(&1));
        assert_eq!(shared.get(ALICE), Some(&1));

        let shared = authority
            .query_shared_users(QuerySharedUsersRequest { user_id: ALICE.into(), ..Default::default() })
            .await
            .unwrap()
            .user_ids_to_count;
        assert_eq!(shared.get("@bob:local.org"), Some(&2));
    }

    #[tokio::test]
    async fn visibility_follows_membership_at_the_event() {
        let store = MemoryRoomStore::new();
        let authority = authority(&store);
        authority.set_federation_sender(Arc::new(RecordingSender::default())).unwrap();
        let room_id = authority
            .perform_create_room(PerformCreateRoomRequest {
                creator: ALICE.into(),
                join_rule: Some(tessera_common::models::JoinRule::Public),
                history_visibility: Some(HistoryVisibility::Joined),
                ..Default::default()
            })
            .await
            .unwrap()
            .room_id;

        let before = authority
            .perform_send_state(PerformSendStateRequest {
                room_id: room_id.clone(),
                sender: ALICE.into(),
                event_type: "m.room.topic".into(),
                state_key: String::new(),
                content: json!({ "topic": "before bob" }),
            })
            .await
            .unwrap()
            .event_id;
        let bob_join = join(&authority, &room_id, "@bob:remote.org").await.unwrap().event_id;

        let allowed = |event_id: String| QueryServerAllowedToSeeEventRequest {
            event_id,
            server_name: ServerName::from("remote.org"),
        };
        assert!(!authority.query_server_allowed_to_see_event(allowed(before)).await.unwrap().allowed_to_see_event);
        assert!(authority.query_server_allowed_to_see_event(allowed(bob_join)).await.unwrap().allowed_to_see_event);

        let err = authority
            .query_server_allowed_to_see_event(allowed("$missing:local.org".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, TesseraError::NotFound { .. }));
    }

    #[tokio::test]
    async fn forget_requires_a_past_membership() {
        let store = MemoryRoomStore::new();
        let authority = authority(&store);
        let room_id = public_room(&authority).await;
        let forget = |user: &str| PerformForgetRequest { room_id: room_id.clone(), user_id: user.into() };

        let err = authority.perform_forget(forget(ALICE)).await.unwrap_err();
        assert!(matches!(err, TesseraError::Forbidden { .. }));
        let err = authority.perform_forget(forget("@stranger:local.org")).await.unwrap_err();
        assert!(matches!(err, TesseraError::NotFound { .. }));

        authority
            .perform_leave(PerformLeaveRequest { room_id: room_id.clone(), user_id: ALICE.into() })
            .await
            .unwrap();
        authority.perform_forget(forget(ALICE)).await.unwrap();
        let rooms = authority
            .query_rooms_for_user(QueryRoomsForUserRequest { user_id: ALICE.into(), want_membership: Membership::Leave })
            .await
            .unwrap();
        assert!(rooms.room_ids.is_empty());
    }

    #[tokio::test]
    async fn peek_needs_world_readable_history() {
        let store = MemoryRoomStore::new();
        let authority = authority(&store);
        let private = public_room(&authority).await;
        let err = authority
            .perform_peek(PerformPeekRequest { room_id: private, user_id: "@bob:local.org".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, TesseraError::Forbidden { .. }));

        let readable = authority
            .perform_create_room(PerformCreateRoomRequest {
                creator: ALICE.into(),
                history_visibility: Some(HistoryVisibility::WorldReadable),
                ..Default::default()
            })
            .await
            .unwrap()
            .room_id;
        authority
            .perform_peek(PerformPeekRequest { room_id: readable, user_id: "@bob:local.org".into() })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn publish_lists_rooms() {
        let store = MemoryRoomStore::new();
        let authority = authority(&store);
        let room_id = public_room(&authority).await;
        authority
            .perform_publish(PerformPublishRequest { room_id: room_id.clone(), visibility: Visibility::Public })
            .await
            .unwrap();

        let published = authority.query_published_rooms(QueryPublishedRoomsRequest {}).await.unwrap();
        assert_eq!(published.room_ids, vec![room_id]);
    }
}
