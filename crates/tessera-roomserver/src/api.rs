//! The room server's internal API.
//!
//! [`RoomserverInternalApi`] is implemented in process by
//! [`RoomServerAuthority`](crate::RoomServerAuthority) and over HTTP by the
//! client in `tessera-api`. Request and response types are the JSON bodies of
//! that binding.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tessera_common::models::{
    HistoryVisibility, JoinRule, Membership, RoomVersionCapabilities, ServerAclContent, Visibility,
};
use tessera_common::{RoomVersion, ServerName, TesseraResult};

// ─── Perform ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformCreateRoomRequest {
    pub creator: String,
    /// Falls back to the configured default.
    #[serde(default)]
    pub room_version: Option<RoomVersion>,
    #[serde(default)]
    pub join_rule: Option<JoinRule>,
    #[serde(default)]
    pub history_visibility: Option<HistoryVisibility>,
    #[serde(default)]
    pub server_acl: Option<ServerAclContent>,
    #[serde(default)]
    pub visibility: Option<Visibility>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformCreateRoomResponse {
    pub room_id: String,
    pub room_version: RoomVersion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformJoinRequest {
    pub room_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformLeaveRequest {
    pub room_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformInviteRequest {
    pub room_id: String,
    pub inviter: String,
    pub invitee: String,
}

/// Returned by every Perform operation that sends an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformEventResponse {
    pub event_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformPeekRequest {
    pub room_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformPublishRequest {
    pub room_id: String,
    pub visibility: Visibility,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformForgetRequest {
    pub room_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformSendStateRequest {
    pub room_id: String,
    pub sender: String,
    pub event_type: String,
    #[serde(default)]
    pub state_key: String,
    pub content: serde_json::Value,
}

/// Body of Perform operations with nothing to report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformAck {}

// ─── Query ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRoomVersionForRoomRequest {
    pub room_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRoomVersionForRoomResponse {
    pub room_version: RoomVersion,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryRoomVersionCapabilitiesRequest {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryServerBannedFromRoomRequest {
    pub server_name: ServerName,
    pub room_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryServerBannedFromRoomResponse {
    pub banned: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryServerAllowedToSeeEventRequest {
    pub event_id: String,
    pub server_name: ServerName,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryServerAllowedToSeeEventResponse {
    pub allowed_to_see_event: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuerySharedUsersRequest {
    pub user_id: String,
    #[serde(default)]
    pub include_room_ids: Vec<String>,
    #[serde(default)]
    pub exclude_room_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuerySharedUsersResponse {
    pub user_ids_to_count: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRoomsForUserRequest {
    pub user_id: String,
    pub want_membership: Membership,
}

/// A list of room IDs, returned by several queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomIdsResponse {
    pub room_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryPublishedRoomsRequest {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryMembershipForUserRequest {
    pub room_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryMembershipForUserResponse {
    pub room_exists: bool,
    pub membership: Option<Membership>,
    pub is_in_room: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryServerJoinedToRoomRequest {
    pub room_id: String,
    pub server_name: ServerName,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryServerJoinedToRoomResponse {
    pub room_exists: bool,
    pub is_in_room: bool,
}

// ─── Trait ───────────────────────────────────────────────────────────────────

#[async_trait]
pub trait RoomserverInternalApi: Send + Sync {
    async fn perform_create_room(&self, req: PerformCreateRoomRequest) -> TesseraResult<PerformCreateRoomResponse>;
    async fn perform_join(&self, req: PerformJoinRequest) -> TesseraResult<PerformEventResponse>;
    async fn perform_leave(&self, req: PerformLeaveRequest) -> TesseraResult<PerformEventResponse>;
    async fn perform_invite(&self, req: PerformInviteRequest) -> TesseraResult<PerformEventResponse>;
    async fn perform_peek(&self, req: PerformPeekRequest) -> TesseraResult<PerformAck>;
    async fn perform_publish(&self, req: PerformPublishRequest) -> TesseraResult<PerformAck>;
    async fn perform_forget(&self, req: PerformForgetRequest) -> TesseraResult<PerformAck>;
    async fn perform_send_state(&self, req: PerformSendStateRequest) -> TesseraResult<PerformEventResponse>;

    async fn query_room_version_for_room(
        &self,
        req: QueryRoomVersionForRoomRequest,
    ) -> TesseraResult<QueryRoomVersionForRoomResponse>;
    async fn query_room_version_capabilities(
        &self,
        req: QueryRoomVersionCapabilitiesRequest,
    ) -> TesseraResult<RoomVersionCapabilities>;
    async fn query_server_banned_from_room(
        &self,
        req: QueryServerBannedFromRoomRequest,
    ) -> TesseraResult<QueryServerBannedFromRoomResponse>;
    async fn query_server_allowed_to_see_event(
        &self,
        req: QueryServerAllowedToSeeEventRequest,
    ) -> TesseraResult<QueryServerAllowedToSeeEventResponse>;
    async fn query_shared_users(&self, req: QuerySharedUsersRequest) -> TesseraResult<QuerySharedUsersResponse>;
    async fn query_rooms_for_user(&self, req: QueryRoomsForUserRequest) -> TesseraResult<RoomIdsResponse>;
    async fn query_published_rooms(&self, req: QueryPublishedRoomsRequest) -> TesseraResult<RoomIdsResponse>;
    async fn query_membership_for_user(
        &self,
        req: QueryMembershipForUserRequest,
    ) -> TesseraResult<QueryMembershipForUserResponse>;
    async fn query_server_joined_to_room(
        &self,
        req: QueryServerJoinedToRoomRequest,
    ) -> TesseraResult<QueryServerJoinedToRoomResponse>;
}
