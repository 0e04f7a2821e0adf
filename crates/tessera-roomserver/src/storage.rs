//! Room storage collaborator.
//!
//! The event graph and state resolution live behind [`RoomStorage`]. The
//! authority only needs the projections below: room metadata, current
//! membership, the handful of state events it enforces, and per-event
//! visibility snapshots. Every method applies atomically, so concurrent
//! readers observe a room either before or after a mutation.
//!
//! [`MemoryRoomStore`] is the in-process reference implementation.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tessera_common::models::{
    HistoryVisibility, JoinRule, Membership, RoomEvent, ServerAclContent, event as event_types,
};
use tessera_common::{RoomVersion, ServerName, TesseraError, TesseraResult};
use tokio::sync::RwLock;

// ─── Projections ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub room_id: String,
    pub room_version: RoomVersion,
    pub creator: String,
}

/// The current values of the state events the authority enforces.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomState {
    pub join_rule: JoinRule,
    pub history_visibility: HistoryVisibility,
    pub server_acl: Option<ServerAclContent>,
}

/// An event together with what was true in its room when it happened.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub event: RoomEvent,
    /// History visibility in force when the event was sent.
    pub history_visibility: HistoryVisibility,
    /// Every known membership once the event was applied.
    pub memberships: HashMap<String, Membership>,
}

/// An accepted event the federation sender refused, kept until it is handed off again.
#[derive(Debug, Clone)]
pub struct UnsentHandoff {
    pub event: RoomEvent,
    pub destinations: BTreeSet<ServerName>,
}

// ─── Trait ───────────────────────────────────────────────────────────────────

#[async_trait]
pub trait RoomStorage: Send + Sync {
    async fn room_info(&self, room_id: &str) -> TesseraResult<Option<RoomInfo>>;

    /// Create a room with its initial state events. Fails if the room exists.
    async fn create_room(&self, info: RoomInfo, events: Vec<RoomEvent>) -> TesseraResult<()>;

    async fn room_state(&self, room_id: &str) -> TesseraResult<Option<RoomState>>;

    async fn membership(&self, room_id: &str, user_id: &str) -> TesseraResult<Option<Membership>>;

    /// Append an accepted event and apply its state effects.
    async fn append_event(&self, event: RoomEvent) -> TesseraResult<()>;

    async fn event(&self, event_id: &str) -> TesseraResult<Option<StoredEvent>>;

    async fn joined_users(&self, room_id: &str) -> TesseraResult<Vec<String>>;

    /// Rooms where `user_id` currently has `membership`, sorted, excluding forgotten rooms.
    async fn rooms_by_membership(&self, user_id: &str, membership: Membership) -> TesseraResult<Vec<String>>;

    /// For each user joined to any of `room_ids`, the number of those rooms they are in.
    /// Repeated room IDs count once.
    async fn joined_users_set_in_rooms(&self, room_ids: &[String]) -> TesseraResult<HashMap<String, usize>>;

    /// Current ACL content of every room that has one.
    async fn server_acl_states(&self) -> TesseraResult<Vec<(String, ServerAclContent)>>;

    async fn set_published(&self, room_id: &str, published: bool) -> TesseraResult<()>;

    async fn published_rooms(&self) -> TesseraResult<Vec<String>>;

    async fn add_peek(&self, room_id: &str, user_id: &str) -> TesseraResult<()>;

    /// Hide the room from `user_id`'s room lists until they join it again.
    async fn forget_room(&self, room_id: &str, user_id: &str) -> TesseraResult<()>;

    /// Keep `handoff` alongside its room until [`take_unsent`](Self::take_unsent) collects it.
    async fn record_unsent(&self, handoff: UnsentHandoff) -> TesseraResult<()>;

    /// Remove and return the room's unsent handoffs, oldest first.
    async fn take_unsent(&self, room_id: &str) -> TesseraResult<Vec<UnsentHandoff>>;
}

// ─── In-memory implementation ────────────────────────────────────────────────

struct RoomRecord {
    info: RoomInfo,
    state: RoomState,
    memberships: HashMap<String, Membership>,
    published: bool,
    peeks: HashSet<String>,
    forgotten: HashSet<String>,
}

impl RoomRecord {
    fn apply(&mut self, event: &RoomEvent) -> TesseraResult<()> {
        let Some(state_key) = event.state_key.as_deref() else {
            return Ok(());
        };
        match event.event_type.as_str() {
            event_types::MEMBER => {
                let membership = event.membership_value().ok_or_else(|| {
                    TesseraError::validation("m.room.member event without a valid membership")
                })?;
                if membership == Membership::Join {
                    self.forgotten.remove(state_key);
                }
                self.memberships.insert(state_key.to_string(), membership);
            }
            event_types::JOIN_RULES => {
                self.state.join_rule = content_field(event, "join_rule")?;
            }
            event_types::HISTORY_VISIBILITY => {
                self.state.history_visibility = content_field(event, "history_visibility")?;
            }
            event_types::SERVER_ACL => {
                self.state.server_acl = Some(serde_json::from_value(event.content.clone())?);
            }
            _ => {}
        }
        Ok(())
    }
}

fn content_field<T: serde::de::DeserializeOwned>(event: &RoomEvent, field: &str) -> TesseraResult<T> {
    let value = event.content.get(field).cloned().ok_or_else(|| {
        TesseraError::validation(format!("{} event is missing {field}", event.event_type))
    })?;
    Ok(serde_json::from_value(value)?)
}

#[derive(Default)]
struct MemoryState {
    rooms: HashMap<String, RoomRecord>,
    events: HashMap<String, StoredEvent>,
    unsent: HashMap<String, Vec<UnsentHandoff>>,
}

impl MemoryState {
    /// Apply `event` to its room and record the visibility snapshot.
    fn record(&mut self, event: RoomEvent) -> TesseraResult<()> {
        let room = self
            .rooms
            .get_mut(&event.room_id)
            .ok_or_else(|| TesseraError::not_found(format!("Room {}", event.room_id)))?;
        let history_visibility = room.state.history_visibility;
        room.apply(&event)?;
        let stored = StoredEvent {
            history_visibility,
            memberships: room.memberships.clone(),
            event,
        };
        self.events.insert(stored.event.event_id.clone(), stored);
        Ok(())
    }
}

/// Reference [`RoomStorage`] kept in process memory. Clones share the same rooms.
#[derive(Clone, Default)]
pub struct MemoryRoomStore {
    state: Arc<RwLock<MemoryState>>,
    room_info_reads: Arc<AtomicUsize>,
}

impl MemoryRoomStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times [`RoomStorage::room_info`] has been called.
    pub fn room_info_reads(&self) -> usize {
        self.room_info_reads.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl RoomStorage for MemoryRoomStore {
    async fn room_info(&self, room_id: &str) -> TesseraResult<Option<RoomInfo>> {
        self.room_info_reads.fetch_add(1, Ordering::Relaxed);
        let state = self.state.read().await;
        Ok(state.rooms.get(room_id).map(|r| r.info.clone()))
    }

    async fn create_room(&self, info: RoomInfo, events: Vec<RoomEvent>) -> TesseraResult<()> {
        let mut state = self.state.write().await;
        if state.rooms.contains_key(&info.room_id) {
            return Err(TesseraError::validation(format!("Room {} already exists", info.room_id)));
        }
        let room_id = info.room_id.clone();

        // Apply to a scratch copy first so a bad initial event leaves nothing behind.
        let mut scratch = MemoryState::default();
        scratch.rooms.insert(
            room_id.clone(),
            RoomRecord {
                info,
                state: RoomState::default(),
                memberships: HashMap::new(),
                published: false,
                peeks: HashSet::new(),
                forgotten: HashSet::new(),
            },
        );
        for event in events {
            scratch.record(event)?;
        }

        state.rooms.extend(scratch.rooms);
        state.events.extend(scratch.events);
        tracing::debug!(room_id = %room_id, "Room created");
        Ok(())
    }

    async fn room_state(&self, room_id: &str) -> TesseraResult<Option<RoomState>> {
        let state = self.state.read().await;
        Ok(state.rooms.get(room_id).map(|r| r.state.clone()))
    }

    async fn membership(&self, room_id: &str, user_id: &str) -> TesseraResult<Option<Membership>> {
        let state = self.state.read().await;
        Ok(state.rooms.get(room_id).and_then(|r| r.memberships.get(user_id).copied()))
    }

    async fn append_event(&self, event: RoomEvent) -> TesseraResult<()> {
        self.state.write().await.record(event)
    }

    async fn event(&self, event_id: &str) -> TesseraResult<Option<StoredEvent>> {
        let state = self.state.read().await;
        Ok(state.events.get(event_id).cloned())
    }

    async fn joined_users(&self, room_id: &str) -> TesseraResult<Vec<String>> {
        let state = self.state.read().await;
        let mut users: Vec<String> = state
            .rooms
            .get(room_id)
            .map(|r| {
                r.memberships
                    .iter()
                    .filter(|(_, m)| **m == Membership::Join)
                    .map(|(u, _)| u.clone())
                    .collect()
            })
            .unwrap_or_default();
        users.sort();
        Ok(users)
    }

    async fn rooms_by_membership(&self, user_id: &str, membership: Membership) -> TesseraResult<Vec<String>> {
        let state = self.state.read().await;
        let mut rooms: Vec<String> = state
            .rooms
            .values()
            .filter(|r| r.memberships.get(user_id) == Some(&membership))
            .filter(|r| !r.forgotten.contains(user_id))
            .map(|r| r.info.room_id.clone())
            .collect();
        rooms.sort();
        Ok(rooms)
    }

    async fn joined_users_set_in_rooms(&self, room_ids: &[String]) -> TesseraResult<HashMap<String, usize>> {
        let state = self.state.read().await;
        let unique: BTreeSet<&String> = room_ids.iter().collect();
        let mut counts = HashMap::new();
        for room in unique.into_iter().filter_map(|id| state.rooms.get(id)) {
            for (user, membership) in &room.memberships {
                if *membership == Membership::Join {
                    *counts.entry(user.clone()).or_insert(0) += 1;
                }
            }
        }
        Ok(counts)
    }

    async fn server_acl_states(&self) -> TesseraResult<Vec<(String, ServerAclContent)>> {
        let state = self.state.read().await;
        Ok(state
            .rooms
            .values()
            .filter_map(|r| r.state.server_acl.clone().map(|acl| (r.info.room_id.clone(), acl)))
            .collect())
    }

    async fn set_published(&self, room_id: &str, published: bool) -> TesseraResult<()> {
        let mut state = self.state.write().await;
        let room = state
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| TesseraError::not_found(format!("Room {room_id}")))?;
        room.published = published;
        Ok(())
    }

    async fn published_rooms(&self) -> TesseraResult<Vec<String>> {
        let state = self.state.read().await;
        let mut rooms: Vec<String> = state
            .rooms
            .values()
            .filter(|r| r.published)
            .map(|r| r.info.room_id.clone())
            .collect();
        rooms.sort();
        Ok(rooms)
    }

    async fn add_peek(&self, room_id: &str, user_id: &str) -> TesseraResult<()> {
        let mut state = self.state.write().await;
        let room = state
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| TesseraError::not_found(format!("Room {room_id}")))?;
        room.peeks.insert(user_id.to_string());
        Ok(())
    }

    async fn forget_room(&self, room_id: &str, user_id: &str) -> TesseraResult<()> {
        let mut state = self.state.write().await;
        let room = state
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| TesseraError::not_found(format!("Room {room_id}")))?;
        room.forgotten.insert(user_id.to_string());
        Ok(())
    }

    async fn record_unsent(&self, handoff: UnsentHandoff) -> TesseraResult<()> {
        let mut state = self.state.write().await;
        let room_id = handoff.event.room_id.clone();
        state.unsent.entry(room_id).or_default().push(handoff);
        Ok(())
    }

    async fn take_unsent(&self, room_id: &str) -> TesseraResult<Vec<UnsentHandoff>> {
        let mut state = self.state.write().await;
        Ok(state.unsent.remove(room_id).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ROOM: &str = "!room:local.org";

    async fn store_with_room() -> MemoryRoomStore {
        let server = ServerName::from("local.org");
        let store = MemoryRoomStore::new();
        let info = RoomInfo {
            room_id: ROOM.into(),
            room_version: RoomVersion::default(),
            creator: "@alice:local.org".into(),
        };
        let events = vec![
            RoomEvent::membership(&server, ROOM, "@alice:local.org", "@alice:local.org", Membership::Join),
            RoomEvent::new(
                &server,
                ROOM,
                "@alice:local.org",
                event_types::HISTORY_VISIBILITY,
                Some(String::new()),
                json!({ "history_visibility": "joined" }),
            ),
        ];
        store.create_room(info, events).await.unwrap();
        store
    }

    #[tokio::test]
    async fn events_snapshot_visibility_before_and_membership_after() {
        let store = store_with_room().await;
        let server = ServerName::from("local.org");
        let join = RoomEvent::membership(&server, ROOM, "@bob:remote.org", "@bob:remote.org", Membership::Join);
        let event_id = join.event_id.clone();
        store.append_event(join).await.unwrap();

        let stored = store.event(&event_id).await.unwrap().unwrap();
        assert_eq!(stored.history_visibility, HistoryVisibility::Joined);
        assert_eq!(stored.memberships.get("@bob:remote.org"), Some(&Membership::Join));
        assert_eq!(store.joined_users(ROOM).await.unwrap(), vec!["@alice:local.org", "@bob:remote.org"]);
    }

    #[tokio::test]
    async fn creating_twice_fails() {
        let store = store_with_room().await;
        let info = RoomInfo {
            room_id: ROOM.into(),
            room_version: RoomVersion::from("1"),
            creator: "@mallory:local.org".into(),
        };
        assert!(matches!(
            store.create_room(info, vec![]).await,
            Err(TesseraError::Validation { .. })
        ));
        let info = store.room_info(ROOM).await.unwrap().unwrap();
        assert_eq!(info.room_version, RoomVersion::default());
    }

    #[tokio::test]
    async fn repeated_rooms_count_once() {
        let store = store_with_room().await;
        let counts = store
            .joined_users_set_in_rooms(&[ROOM.to_string(), ROOM.to_string()])
            .await
            .unwrap();
        assert_eq!(counts.get("@alice:local.org"), Some(&1));
    }

    #[tokio::test]
    async fn forgotten_rooms_are_hidden_until_rejoined() {
        let store = store_with_room().await;
        let server = ServerName::from("local.org");
        store
            .append_event(RoomEvent::membership(&server, ROOM, "@alice:local.org", "@alice:local.org", Membership::Leave))
            .await
            .unwrap();
        store.forget_room(ROOM, "@alice:local.org").await.unwrap();
        assert!(store.rooms_by_membership("@alice:local.org", Membership::Leave).await.unwrap().is_empty());

        store
            .append_event(RoomEvent::membership(&server, ROOM, "@alice:local.org", "@alice:local.org", Membership::Join))
            .await
            .unwrap();
        assert_eq!(store.rooms_by_membership("@alice:local.org", Membership::Join).await.unwrap(), vec![ROOM]);
    }

    #[tokio::test]
    async fn unsent_handoffs_are_taken_once_per_room() {
        let store = store_with_room().await;
        let server = ServerName::from("local.org");
        let event = RoomEvent::membership(&server, ROOM, "@alice:local.org", "@alice:local.org", Membership::Join);
        let event_id = event.event_id.clone();
        let destinations = BTreeSet::from([ServerName::from("remote.org")]);
        store.record_unsent(UnsentHandoff { event, destinations: destinations.clone() }).await.unwrap();

        assert!(store.take_unsent("!other:local.org").await.unwrap().is_empty());
        let unsent = store.take_unsent(ROOM).await.unwrap();
        assert_eq!(unsent.len(), 1);
        assert_eq!(unsent[0].event.event_id, event_id);
        assert_eq!(unsent[0].destinations, destinations);
        assert!(store.take_unsent(ROOM).await.unwrap().is_empty());
    }
}
