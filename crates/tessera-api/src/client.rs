//! HTTP client for a room server running in another process.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tessera_common::error::ErrorResponse;
use tessera_common::models::RoomVersionCapabilities;
use tessera_common::{TesseraError, TesseraResult};
use tessera_roomserver::RoomserverInternalApi;
use tessera_roomserver::api::*;
use tracing::debug;
use url::Url;

use crate::paths;

/// [`RoomserverInternalApi`] over HTTP.
#[derive(Clone)]
pub struct InternalApiClient {
    http: Client,
    base_url: Url,
}

impl InternalApiClient {
    /// `base_url` is the room server's internal address, e.g. `http://127.0.0.1:7770`.
    pub fn new(base_url: &str) -> TesseraResult<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| TesseraError::configuration(format!("invalid internal API URL {base_url}: {e}")))?;
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(transport)?;
        Ok(Self { http, base_url })
    }

    async fn call<Req, Resp>(&self, path: &str, req: &Req) -> TesseraResult<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| TesseraError::Internal(anyhow::anyhow!("bad internal API path {path}: {e}")))?;
        debug!("Internal API POST {}", url);

        let resp = self.http.post(url).json(req).send().await.map_err(transport)?;
        if resp.status().is_success() {
            return resp.json().await.map_err(transport);
        }

        let status = resp.status();
        match resp.json::<ErrorResponse>().await {
            Ok(body) => Err(TesseraError::from_error_response(body)),
            Err(_) => Err(TesseraError::Internal(anyhow::anyhow!(
                "internal API {path} answered {status} without an error body"
            ))),
        }
    }
}

fn transport(e: reqwest::Error) -> TesseraError {
    TesseraError::Internal(anyhow::Error::new(e).context("internal API transport"))
}

#[async_trait]
impl RoomserverInternalApi for InternalApiClient {
    async fn perform_create_room(&self, req: PerformCreateRoomRequest) -> TesseraResult<PerformCreateRoomResponse> {
        self.call(paths::PERFORM_CREATE_ROOM, &req).await
    }

    async fn perform_join(&self, req: PerformJoinRequest) -> TesseraResult<PerformEventResponse> {
        self.call(paths::PERFORM_JOIN, &req).await
    }

    async fn perform_leave(&self, req: PerformLeaveRequest) -> TesseraResult<PerformEventResponse> {
        self.call(paths::PERFORM_LEAVE, &req).await
    }

    async fn perform_invite(&self, req: PerformInviteRequest) -> TesseraResult<PerformEventResponse> {
        self.call(paths::PERFORM_INVITE, &req).await
    }

    async fn perform_peek(&self, req: PerformPeekRequest) -> TesseraResult<PerformAck> {
        self.call(paths::PERFORM_PEEK, &req).await
    }

    async fn perform_publish(&self, req: PerformPublishRequest) -> TesseraResult<PerformAck> {
        self.call(paths::PERFORM_PUBLISH, &req).await
    }

    async fn perform_forget(&self, req: PerformForgetRequest) -> TesseraResult<PerformAck> {
        self.call(paths::PERFORM_FORGET, &req).await
    }

    async fn perform_send_state(&self, req: PerformSendStateRequest) -> TesseraResult<PerformEventResponse> {
        self.call(paths::PERFORM_SEND_STATE, &req).await
    }

    async fn query_room_version_for_room(
        &self,
        req: QueryRoomVersionForRoomRequest,
    ) -> TesseraResult<QueryRoomVersionForRoomResponse> {
        self.call(paths::QUERY_ROOM_VERSION_FOR_ROOM, &req).await
    }

    async fn query_room_version_capabilities(
        &self,
        req: QueryRoomVersionCapabilitiesRequest,
    ) -> TesseraResult<RoomVersionCapabilities> {
        self.call(paths::QUERY_ROOM_VERSION_CAPABILITIES, &req).await
    }

    async fn query_server_banned_from_room(
        &self,
        req: QueryServerBannedFromRoomRequest,
    ) -> TesseraResult<QueryServerBannedFromRoomResponse> {
        self.call(paths::QUERY_SERVER_BANNED_FROM_ROOM, &req).await
    }

    async fn query_server_allowed_to_see_event(
        &self,
        req: QueryServerAllowedToSeeEventRequest,
    ) -> TesseraResult<QueryServerAllowedToSeeEventResponse> {
        self.call(paths::QUERY_SERVER_ALLOWED_TO_SEE_EVENT, &req).await
    }

    async fn query_shared_users(&self, req: QuerySharedUsersRequest) -> TesseraResult<QuerySharedUsersResponse> {
        self.call(paths::QUERY_SHARED_USERS, &req).await
    }

    async fn query_rooms_for_user(&self, req: QueryRoomsForUserRequest) -> TesseraResult<RoomIdsResponse> {
        self.call(paths::QUERY_ROOMS_FOR_USER, &req).await
    }

    async fn query_published_rooms(&self, req: QueryPublishedRoomsRequest) -> TesseraResult<RoomIdsResponse> {
        self.call(paths::QUERY_PUBLISHED_ROOMS, &req).await
    }

    async fn query_membership_for_user(
        &self,
        req: QueryMembershipForUserRequest,
    ) -> TesseraResult<QueryMembershipForUserResponse> {
        self.call(paths::QUERY_MEMBERSHIP_FOR_USER, &req).await
    }

    async fn query_server_joined_to_room(
        &self,
        req: QueryServerJoinedToRoomRequest,
    ) -> TesseraResult<QueryServerJoinedToRoomResponse> {
        self.call(paths::QUERY_SERVER_JOINED_TO_ROOM, &req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tessera_common::config::RoomServerConfig;
    use tessera_common::models::{JoinRule, Membership};
    use tessera_common::{RoomVersion, ServerName};
    use tessera_roomserver::{MemoryRoomStore, RoomServerAuthority, ServerAcls};

    fn authority(acls: bool) -> RoomServerAuthority {
        let local = ServerName::from("local.org");
        let config = RoomServerConfig {
            default_room_version: RoomVersion::from("6"),
            room_version_cache_capacity: 16,
        };
        let acls = acls.then(|| Arc::new(ServerAcls::new(local.clone())));
        RoomServerAuthority::new(local, &config, Arc::new(MemoryRoomStore::new()), acls)
    }

    async fn serve(authority: RoomServerAuthority) -> InternalApiClient {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = crate::internal_router(Arc::new(authority));
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        InternalApiClient::new(&format!("http://{addr}")).unwrap()
    }

    #[tokio::test]
    async fn remote_calls_match_local_ones() {
        let client = serve(authority(true)).await;

        let created = client
            .perform_create_room(PerformCreateRoomRequest {
                creator: "@alice:local.org".into(),
                join_rule: Some(JoinRule::Public),
                ..Default::default()
            })
            .await
            .unwrap();
        let version = client
            .query_room_version_for_room(QueryRoomVersionForRoomRequest { room_id: created.room_id.clone() })
            .await
            .unwrap();
        assert_eq!(version.room_version, created.room_version);

        let membership = client
            .query_membership_for_user(QueryMembershipForUserRequest {
                room_id: created.room_id.clone(),
                user_id: "@alice:local.org".into(),
            })
            .await
            .unwrap();
        assert_eq!(membership.membership, Some(Membership::Join));
        assert!(membership.is_in_room);
    }

    #[tokio::test]
    async fn error_variants_cross_the_wire() {
        let client = serve(authority(false)).await;

        let err = client
            .query_room_version_for_room(QueryRoomVersionForRoomRequest { room_id: "!nope:local.org".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, TesseraError::NotFound { .. }));

        let err = client
            .query_server_banned_from_room(QueryServerBannedFromRoomRequest {
                server_name: ServerName::from("remote.org"),
                room_id: "!nope:local.org".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TesseraError::Configuration { .. }));
    }

    #[test]
    fn rejects_a_malformed_base_url() {
        let err = InternalApiClient::new("not a url").err().unwrap();
        assert!(matches!(err, TesseraError::Configuration { .. }));
    }
}
