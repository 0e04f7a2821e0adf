//! Server access control lists.
//!
//! Each room may carry an `m.room.server_acl` state event listing glob patterns
//! of server names that are allowed or denied. The patterns are compiled once per
//! change and consulted on every ban query.
//!
//! ## Evaluation
//!
//! 1. The local server is never banned.
//! 2. A room without an ACL event bans nobody.
//! 3. An IP literal is banned when the room disallows IP literals.
//! 4. A matching deny pattern bans.
//! 5. A matching allow pattern admits; anything else is banned.
//!
//! Matching ignores the port and is case-insensitive.

use std::collections::HashMap;
use std::sync::RwLock;

use regex::{Regex, RegexBuilder};
use tessera_common::models::ServerAclContent;
use tessera_common::{ServerName, TesseraResult};

use crate::storage::RoomStorage;

struct CompiledAcl {
    allow: Vec<Regex>,
    deny: Vec<Regex>,
    allow_ip_literals: bool,
}

impl CompiledAcl {
    fn compile(room_id: &str, content: &ServerAclContent) -> Self {
        Self {
            allow: compile_globs(room_id, &content.allow),
            deny: compile_globs(room_id, &content.deny),
            allow_ip_literals: content.allow_ip_literals,
        }
    }

    fn bans(&self, server_name: &ServerName) -> bool {
        if server_name.is_ip_literal() && !self.allow_ip_literals {
            return true;
        }
        let host = server_name.host();
        if self.deny.iter().any(|re| re.is_match(host)) {
            return true;
        }
        !self.allow.iter().any(|re| re.is_match(host))
    }
}

/// Translate a server-name glob (`*`, `?`) into an anchored, case-insensitive regex.
fn glob_to_regex(glob: &str) -> Result<Regex, regex::Error> {
    let mut pattern = String::with_capacity(glob.len() + 8);
    pattern.push('^');
    for ch in glob.chars() {
        match ch {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            other => pattern.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
        }
    }
    pattern.push('$');
    RegexBuilder::new(&pattern).case_insensitive(true).build()
}

fn compile_globs(room_id: &str, globs: &[String]) -> Vec<Regex> {
    globs
        .iter()
        .filter_map(|glob| match glob_to_regex(glob) {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::warn!(room_id, glob = %glob, error = %e, "Skipping unusable ACL pattern");
                None
            }
        })
        .collect()
}

/// Compiled ACLs for every room this server knows about.
pub struct ServerAcls {
    local_server: ServerName,
    rooms: RwLock<HashMap<String, CompiledAcl>>,
}

impl ServerAcls {
    pub fn new(local_server: ServerName) -> Self {
        Self { local_server, rooms: RwLock::new(HashMap::new()) }
    }

    /// Compile the current ACL state of every room in storage.
    pub async fn load(local_server: ServerName, storage: &dyn RoomStorage) -> TesseraResult<Self> {
        let acls = Self::new(local_server);
        let states = storage.server_acl_states().await?;
        tracing::info!(rooms = states.len(), "Loaded server ACLs");
        for (room_id, content) in states {
            acls.on_server_acl_updated(&room_id, &content);
        }
        Ok(acls)
    }

    /// Recompile `room_id`'s ACL after its `m.room.server_acl` event changed.
    pub fn on_server_acl_updated(&self, room_id: &str, content: &ServerAclContent) {
        let compiled = CompiledAcl::compile(room_id, content);
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        rooms.insert(room_id.to_string(), compiled);
        tracing::debug!(room_id, "Server ACL recompiled");
    }

    pub fn is_server_banned_from_room(&self, server_name: &ServerName, room_id: &str) -> bool {
        // Only this exact server name is exempt; another port on the same host is a different server.
        if server_name.as_str().eq_ignore_ascii_case(self.local_server.as_str()) {
            return false;
        }
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        match rooms.get(room_id) {
            Some(acl) => acl.bans(server_name),
            None => false,
        }
    }
}
