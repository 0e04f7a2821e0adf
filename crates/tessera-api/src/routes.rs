//! Server side of the internal API.
//!
//! Every operation is a `POST` with the request type as its JSON body. Errors
//! are rendered by [`TesseraError`]'s `IntoResponse`, which the client turns
//! back into the same variant.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use serde::Serialize;
use tessera_common::TesseraError;
use tessera_common::models::RoomVersionCapabilities;
use tessera_roomserver::RoomserverInternalApi;
use tessera_roomserver::api::*;

use crate::paths;

type Api = Arc<dyn RoomserverInternalApi>;
type ApiResult<T> = Result<Json<T>, TesseraError>;

// ─── Router ───────────────────────────────────────────────────────────────────

/// Expose `api` over HTTP.
pub fn internal_router(api: Api) -> Router {
    Router::new()
        .route(paths::PERFORM_CREATE_ROOM, post(perform_create_room))
        .route(paths::PERFORM_JOIN, post(perform_join))
        .route(paths::PERFORM_LEAVE, post(perform_leave))
        .route(paths::PERFORM_INVITE, post(perform_invite))
        .route(paths::PERFORM_PEEK, post(perform_peek))
        .route(paths::PERFORM_PUBLISH, post(perform_publish))
        .route(paths::PERFORM_FORGET, post(perform_forget))
        .route(paths::PERFORM_SEND_STATE, post(perform_send_state))
        .route(paths::QUERY_ROOM_VERSION_FOR_ROOM, post(query_room_version_for_room))
        .route(paths::QUERY_ROOM_VERSION_CAPABILITIES, post(query_room_version_capabilities))
        .route(paths::QUERY_SERVER_BANNED_FROM_ROOM, post(query_server_banned_from_room))
        .route(paths::QUERY_SERVER_ALLOWED_TO_SEE_EVENT, post(query_server_allowed_to_see_event))
        .route(paths::QUERY_SHARED_USERS, post(query_shared_users))
        .route(paths::QUERY_ROOMS_FOR_USER, post(query_rooms_for_user))
        .route(paths::QUERY_PUBLISHED_ROOMS, post(query_published_rooms))
        .route(paths::QUERY_MEMBERSHIP_FOR_USER, post(query_membership_for_user))
        .route(paths::QUERY_SERVER_JOINED_TO_ROOM, post(query_server_joined_to_room))
        .route(paths::HEALTH, get(health_check))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(api)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy", version: env!("CARGO_PKG_VERSION") })
}

// ─── Perform ──────────────────────────────────────────────────────────────────

async fn perform_create_room(
    State(api): State<Api>,
    Json(req): Json<PerformCreateRoomRequest>,
) -> ApiResult<PerformCreateRoomResponse> {
    Ok(Json(api.perform_create_room(req).await?))
}

async fn perform_join(State(api): State<Api>, Json(req): Json<PerformJoinRequest>) -> ApiResult<PerformEventResponse> {
    Ok(Json(api.perform_join(req).await?))
}

async fn perform_leave(State(api): State<Api>, Json(req): Json<PerformLeaveRequest>) -> ApiResult<PerformEventResponse> {
    Ok(Json(api.perform_leave(req).await?))
}

async fn perform_invite(
    State(api): State<Api>,
    Json(req): Json<PerformInviteRequest>,
) -> ApiResult<PerformEventResponse> {
    Ok(Json(api.perform_invite(req).await?))
}

async fn perform_peek(State(api): State<Api>, Json(req): Json<PerformPeekRequest>) -> ApiResult<PerformAck> {
    Ok(Json(api.perform_peek(req).await?))
}

async fn perform_publish(State(api): State<Api>, Json(req): Json<PerformPublishRequest>) -> ApiResult<PerformAck> {
    Ok(Json(api.perform_publish(req).await?))
}

async fn perform_forget(State(api): State<Api>, Json(req): Json<PerformForgetRequest>) -> ApiResult<PerformAck> {
    Ok(Json(api.perform_forget(req).await?))
}

async fn perform_send_state(
    State(api): State<Api>,
    Json(req): Json<PerformSendStateRequest>,
) -> ApiResult<PerformEventResponse> {
    Ok(Json(api.perform_send_state(req).await?))
}

// ─── Query ────────────────────────────────────────────────────────────────────

async fn query_room_version_for_room(
    State(api): State<Api>,
    Json(req): Json<QueryRoomVersionForRoomRequest>,
) -> ApiResult<QueryRoomVersionForRoomResponse> {
    Ok(Json(api.query_room_version_for_room(req).await?))
}

async fn query_room_version_capabilities(
    State(api): State<Api>,
    Json(req): Json<QueryRoomVersionCapabilitiesRequest>,
) -> ApiResult<RoomVersionCapabilities> {
    Ok(Json(api.query_room_version_capabilities(req).await?))
}

async fn query_server_banned_from_room(
    State(api): State<Api>,
    Json(req): Json<QueryServerBannedFromRoomRequest>,
) -> ApiResult<QueryServerBannedFromRoomResponse> {
    Ok(Json(api.query_server_banned_from_room(req).await?))
}

async fn query_server_allowed_to_see_event(
    State(api): State<Api>,
    Json(req): Json<QueryServerAllowedToSeeEventRequest>,
) -> ApiResult<QueryServerAllowedToSeeEventResponse> {
    Ok(Json(api.query_server_allowed_to_see_event(req).await?))
}

async fn query_shared_users(
    State(api): State<Api>,
    Json(req): Json<QuerySharedUsersRequest>,
) -> ApiResult<QuerySharedUsersResponse> {
    Ok(Json(api.query_shared_users(req).await?))
}

async fn query_rooms_for_user(
    State(api): State<Api>,
    Json(req): Json<QueryRoomsForUserRequest>,
) -> ApiResult<RoomIdsResponse> {
    Ok(Json(api.query_rooms_for_user(req).await?))
}

async fn query_published_rooms(
    State(api): State<Api>,
    Json(req): Json<QueryPublishedRoomsRequest>,
) -> ApiResult<RoomIdsResponse> {
    Ok(Json(api.query_published_rooms(req).await?))
}

async fn query_membership_for_user(
    State(api): State<Api>,
    Json(req): Json<QueryMembershipForUserRequest>,
) -> ApiResult<QueryMembershipForUserResponse> {
    Ok(Json(api.query_membership_for_user(req).await?))
}

async fn query_server_joined_to_room(
    State(api): State<Api>,
    Json(req): Json<QueryServerJoinedToRoomRequest>,
) -> ApiResult<QueryServerJoinedToRoomResponse> {
    Ok(Json(api.query_server_joined_to_room(req).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode, header};
    use tessera_common::config::RoomServerConfig;
    use tessera_common::error::ErrorResponse;
    use tessera_common::{RoomVersion, ServerName};
    use tessera_roomserver::{MemoryRoomStore, RoomServerAuthority, ServerAcls};
    use tower::ServiceExt;

    fn router() -> Router {
        let local = ServerName::from("local.org");
        let config = RoomServerConfig {
            default_room_version: RoomVersion::from("6"),
            room_version_cache_capacity: 16,
        };
        let acls = Arc::new(ServerAcls::new(local.clone()));
        let authority = RoomServerAuthority::new(local, &config, Arc::new(MemoryRoomStore::new()), Some(acls));
        internal_router(Arc::new(authority))
    }

    fn post_json(path: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(path)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn capabilities_are_served() {
        let response = router()
            .oneshot(post_json(paths::QUERY_ROOM_VERSION_CAPABILITIES, serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let caps: RoomVersionCapabilities = body_json(response).await;
        assert_eq!(caps.default_version.as_str(), "6");
        assert!(caps.available.contains_key(&RoomVersion::from("1")));
    }

    #[tokio::test]
    async fn errors_carry_their_code() {
        let response = router()
            .oneshot(post_json(
                paths::QUERY_ROOM_VERSION_FOR_ROOM,
                serde_json::json!({ "room_id": "!missing:local.org" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body: ErrorResponse = body_json(response).await;
        assert_eq!(body.error, "NOT_FOUND");
        assert_eq!(body.code, 404);
    }

    #[tokio::test]
    async fn health_reports_healthy() {
        let response = router()
            .oneshot(Request::builder().uri(paths::HEALTH).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
