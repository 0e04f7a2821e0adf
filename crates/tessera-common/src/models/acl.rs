//! Content of the `m.room.server_acl` state event.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerAclContent {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
    #[serde(default = "default_allow_ip_literals")]
    pub allow_ip_literals: bool,
}

fn default_allow_ip_literals() -> bool {
    true
}

impl Default for ServerAclContent {
    fn default() -> Self {
        Self {
            allow: vec!["*".to_string()],
            deny: Vec::new(),
            allow_ip_literals: true,
        }
    }
}
