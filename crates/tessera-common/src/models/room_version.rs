//! Room versions and their stability.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Versions this server can create and participate in, with their stability.
const SUPPORTED: &[(&str, Stability)] = &[
    ("1", Stability::Stable),
    ("2", Stability::Stable),
    ("3", Stability::Stable),
    ("4", Stability::Stable),
    ("5", Stability::Stable),
    ("6", Stability::Stable),
    ("7", Stability::Unstable),
    ("8", Stability::Unstable),
];

/// The identifier of a room's rule set. Immutable for the lifetime of a room.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomVersion(String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stability {
    Stable,
    Unstable,
}

impl RoomVersion {
    pub const DEFAULT: &'static str = "6";

    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn stability(&self) -> Option<Stability> {
        SUPPORTED.iter().find(|(v, _)| *v == self.0).map(|(_, s)| *s)
    }

    pub fn is_supported(&self) -> bool {
        self.stability().is_some()
    }

    /// Numeric form, for rules gated on a minimum version.
    pub fn number(&self) -> Option<u32> {
        self.0.parse().ok()
    }
}

impl Default for RoomVersion {
    fn default() -> Self {
        Self::new(Self::DEFAULT)
    }
}

impl fmt::Display for RoomVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomVersion {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// What this server advertises about room versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomVersionCapabilities {
    pub default_version: RoomVersion,
    pub available: BTreeMap<RoomVersion, Stability>,
}

impl RoomVersionCapabilities {
    pub fn with_default(default_version: RoomVersion) -> Self {
        let available = SUPPORTED
            .iter()
            .map(|(v, s)| (RoomVersion::from(*v), *s))
            .collect();
        Self { default_version, available }
    }
}
