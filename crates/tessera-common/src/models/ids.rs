//! Server names and the identifier helpers built on them.

use std::fmt;
use std::net::Ipv4Addr;

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A federation server name, `host[:port]`.
///
/// Ordering is plain string ordering so destination sets iterate deterministically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerName(String);

impl ServerName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The host part with any explicit port removed. IPv6 literals keep their brackets.
    pub fn host(&self) -> &str {
        let name = self.0.as_str();
        if name.starts_with('[') {
            return match name.find(']') {
                Some(end) => &name[..=end],
                None => name,
            };
        }
        match name.rsplit_once(':') {
            Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => host,
            _ => name,
        }
    }

    /// Whether the host is an IPv4 or bracketed IPv6 literal rather than a DNS name.
    pub fn is_ip_literal(&self) -> bool {
        let host = self.host();
        host.starts_with('[') || host.parse::<Ipv4Addr>().is_ok()
    }
}

impl fmt::Display for ServerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServerName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ServerName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The server part of a sigil-prefixed identifier (`@alice:example.org` → `example.org`).
pub fn server_name_of(id: &str) -> Option<ServerName> {
    let (_, server) = id.get(1..)?.split_once(':')?;
    if server.is_empty() {
        return None;
    }
    Some(ServerName::new(server))
}

/// Generate a new locally-unique event ID on this server.
pub fn new_event_id(server_name: &ServerName) -> String {
    format!("${}:{}", opaque_id(), server_name)
}

/// Generate a new room ID owned by this server.
pub fn new_room_id(server_name: &ServerName) -> String {
    format!("!{}:{}", opaque_id(), server_name)
}

fn opaque_id() -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(Uuid::new_v4().as_bytes())
}
