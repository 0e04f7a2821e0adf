//! Per-room mutual exclusion for mutating operations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Lock table keyed by room_id. Operations on different rooms never contend.
#[derive(Default)]
pub struct RoomLocks {
    rooms: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl RoomLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `room_id`. The guard can move into a spawned task.
    pub async fn lock_owned(&self, room_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
            // Entries nobody holds or waits on can go.
            rooms.retain(|_, lock| Arc::strong_count(lock) > 1);
            rooms.entry(room_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}
