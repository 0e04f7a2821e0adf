//! Memoizes each room's immutable version.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use tessera_common::RoomVersion;

/// Bounded room_id → version cache. The first version stored for a room wins.
pub struct RoomVersionCache {
    entries: Mutex<LruCache<String, RoomVersion>>,
}

impl RoomVersionCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self { entries: Mutex::new(LruCache::new(capacity)) }
    }

    pub fn get(&self, room_id: &str) -> Option<RoomVersion> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(room_id).cloned()
    }

    /// Remember `version` for `room_id`. A later, different version is ignored.
    pub fn store(&self, room_id: &str, version: RoomVersion) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(room_id) {
            Some(existing) if *existing != version => {
                tracing::warn!(
                    room_id,
                    cached = %existing,
                    ignored = %version,
                    "Conflicting room version; keeping the cached one"
                );
            }
            Some(_) => {}
            None => {
                entries.put(room_id.to_string(), version);
            }
        }
    }
}
