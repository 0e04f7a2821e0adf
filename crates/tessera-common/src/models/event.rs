//! Room events (PDUs) and ephemeral data units (EDUs).

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::ids::{ServerName, new_event_id};
use super::membership::Membership;

// ─── Event types ─────────────────────────────────────────────────────────────

pub const CREATE: &str = "m.room.create";
pub const MEMBER: &str = "m.room.member";
pub const JOIN_RULES: &str = "m.room.join_rules";
pub const HISTORY_VISIBILITY: &str = "m.room.history_visibility";
pub const SERVER_ACL: &str = "m.room.server_acl";

// ─── Room events ─────────────────────────────────────────────────────────────

/// A persistent event in a room's graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomEvent {
    pub event_id: String,
    pub room_id: String,
    pub sender: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Present on state events; the empty string is a valid key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    pub content: serde_json::Value,
    /// Unix millisecond timestamp.
    pub origin_server_ts: i64,
}

impl RoomEvent {
    /// Build a new event originating on `origin`.
    pub fn new(
        origin: &ServerName,
        room_id: impl Into<String>,
        sender: impl Into<String>,
        event_type: impl Into<String>,
        state_key: Option<String>,
        content: serde_json::Value,
    ) -> Self {
        Self {
            event_id: new_event_id(origin),
            room_id: room_id.into(),
            sender: sender.into(),
            event_type: event_type.into(),
            state_key,
            content,
            origin_server_ts: Utc::now().timestamp_millis(),
        }
    }

    /// An `m.room.member` event setting `target`'s membership.
    pub fn membership(
        origin: &ServerName,
        room_id: impl Into<String>,
        sender: impl Into<String>,
        target: impl Into<String>,
        membership: Membership,
    ) -> Self {
        Self::new(
            origin,
            room_id,
            sender,
            MEMBER,
            Some(target.into()),
            serde_json::json!({ "membership": membership.as_str() }),
        )
    }

    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }

    /// The membership carried by an `m.room.member` event.
    pub fn membership_value(&self) -> Option<Membership> {
        if self.event_type != MEMBER {
            return None;
        }
        serde_json::from_value(self.content.get("membership")?.clone()).ok()
    }
}

// ─── Ephemeral data units ────────────────────────────────────────────────────

/// A non-persistent federation payload such as typing or receipts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edu {
    pub edu_type: String,
    pub content: serde_json::Value,
}
