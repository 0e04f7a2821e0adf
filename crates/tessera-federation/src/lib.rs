//! # tessera-federation
//!
//! Outbound side of server-to-server federation.
//!
//! ## Key concepts
//!
//! - **Outbound queue** (`queue.rs`): durable per-destination store of PDUs and
//!   EDUs owed to remote servers, drained by an external delivery scheduler.
//! - **Queueing sender** (`sender.rs`): the room server's federation sender;
//!   filters destinations through the room's server ACL and queues the event.
//! - **Notary cache** (`notary.rs`): remote servers' key documents, with
//!   upstream fetches only for keys the cache cannot cover.
//! - **Key client** (`client.rs`) and **discovery** (`discovery.rs`): fetch key
//!   documents over HTTPS after resolving `.well-known/matrix/server`.

pub mod client;
pub mod discovery;
pub mod error;
pub mod notary;
pub mod queue;
pub mod sender;
pub mod types;

pub use client::ServerKeyClient;
pub use error::FederationError;
pub use notary::{NotaryFetcher, NotaryKeyCache};
pub use queue::{OutboundQueue, Receipt};
pub use sender::QueueingSender;
pub use types::ServerKeys;
