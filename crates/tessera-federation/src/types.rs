//! Federation wire types: server key documents and well-known delegation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tessera_common::ServerName;

/// A server's key document as served at `/_matrix/key/v2/server`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerKeys {
    pub server_name: ServerName,
    /// Unix milliseconds until which the document may be cached.
    pub valid_until_ts: i64,
    /// Current verify keys, keyed by key ID (e.g. `ed25519:abc`).
    #[serde(default)]
    pub verify_keys: BTreeMap<String, VerifyKey>,
    /// Retired keys, still needed to check old events.
    #[serde(default)]
    pub old_verify_keys: BTreeMap<String, OldVerifyKey>,
}

impl ServerKeys {
    /// Every key ID the document vouches for, current or retired.
    pub fn key_ids(&self) -> impl Iterator<Item = &String> {
        self.verify_keys.keys().chain(self.old_verify_keys.keys())
    }

    pub fn covers(&self, key_id: &str) -> bool {
        self.verify_keys.contains_key(key_id) || self.old_verify_keys.contains_key(key_id)
    }
}

/// A single public verify key entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyKey {
    /// Unpadded base64 public key bytes.
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OldVerifyKey {
    pub key: String,
    /// Unix milliseconds at which the key stopped being used.
    pub expired_ts: i64,
}

/// Response shape for `/.well-known/matrix/server`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WellKnownServer {
    /// The delegated server name (may differ from the queried hostname for delegation).
    #[serde(rename = "m.server")]
    pub server: String,
}
