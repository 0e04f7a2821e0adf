//! # tessera-api
//!
//! HTTP binding of [`RoomserverInternalApi`](tessera_roomserver::RoomserverInternalApi).
//! The router exposes any implementation over `POST /roomserver/<operation>`;
//! [`InternalApiClient`] implements the same trait on top of it, so callers in
//! another process cannot tell the two apart.

pub mod client;
pub mod paths;
pub mod routes;

pub use client::InternalApiClient;
pub use routes::internal_router;
