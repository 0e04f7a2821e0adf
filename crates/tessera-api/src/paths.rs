//! Route paths of the internal room server API.

pub const PERFORM_CREATE_ROOM: &str = "/roomserver/performCreateRoom";
pub const PERFORM_JOIN: &str = "/roomserver/performJoin";
pub const PERFORM_LEAVE: &str = "/roomserver/performLeave";
pub const PERFORM_INVITE: &str = "/roomserver/performInvite";
pub const PERFORM_PEEK: &str = "/roomserver/performPeek";
pub const PERFORM_PUBLISH: &str = "/roomserver/performPublish";
pub const PERFORM_FORGET: &str = "/roomserver/performForget";
pub const PERFORM_SEND_STATE: &str = "/roomserver/performSendState";

pub const QUERY_ROOM_VERSION_FOR_ROOM: &str = "/roomserver/queryRoomVersionForRoom";
pub const QUERY_ROOM_VERSION_CAPABILITIES: &str = "/roomserver/queryRoomVersionCapabilities";
pub const QUERY_SERVER_BANNED_FROM_ROOM: &str = "/roomserver/queryServerBannedFromRoom";
pub const QUERY_SERVER_ALLOWED_TO_SEE_EVENT: &str = "/roomserver/queryServerAllowedToSeeEvent";
pub const QUERY_SHARED_USERS: &str = "/roomserver/querySharedUsers";
pub const QUERY_ROOMS_FOR_USER: &str = "/roomserver/queryRoomsForUser";
pub const QUERY_PUBLISHED_ROOMS: &str = "/roomserver/queryPublishedRooms";
pub const QUERY_MEMBERSHIP_FOR_USER: &str = "/roomserver/queryMembershipForUser";
pub const QUERY_SERVER_JOINED_TO_ROOM: &str = "/roomserver/queryServerJoinedToRoom";

/// Liveness check, not part of the room server trait.
pub const HEALTH: &str = "/health";
