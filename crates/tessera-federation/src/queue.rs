//! Durable outbound federation queue.
//!
//! Bodies are stored once and referenced by a [`Receipt`]; each destination
//! that still owes a body holds an association to it. A body is deleted when
//! its last association goes, whether by a successful delivery (`clean_*`),
//! EDU expiry, or a room purge. Delivery failures never remove anything, and
//! blacklisting a destination leaves its associations in place.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::Utc;
use tessera_common::{ServerName, TesseraError, TesseraResult};
use tessera_db::Database;
use tessera_db::repository::{blacklist, queue_edus, queue_json, queue_pdus};

/// Handle to a stored body. Receipts order by storage time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Receipt(i64);

impl Receipt {
    fn nids(receipts: &[Receipt]) -> Vec<i64> {
        receipts.iter().map(|r| r.0).collect()
    }
}

/// The room a body belongs to, from its own `room_id` or its content's.
fn room_id_of(blob: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(blob).ok()?;
    value
        .get("room_id")
        .or_else(|| value.get("content").and_then(|c| c.get("room_id")))
        .and_then(|v| v.as_str())
        .map(str::to_owned)
}

#[derive(Clone)]
pub struct OutboundQueue {
    db: Database,
}

impl OutboundQueue {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Store a PDU or EDU body. Nothing is owed until it is associated.
    pub async fn store_json(&self, blob: &str) -> TesseraResult<Receipt> {
        let room_id = room_id_of(blob);
        let nid = queue_json::insert_json(&self.db.pool, blob, room_id.as_deref()).await?;
        Ok(Receipt(nid))
    }

    pub async fn associate_pdu_with_destinations(
        &self,
        destinations: &BTreeSet<ServerName>,
        receipt: Receipt,
    ) -> TesseraResult<()> {
        let mut tx = self.db.begin_write().await?;
        ensure_stored(&mut *tx, receipt).await?;
        for destination in destinations {
            queue_pdus::insert_queue_pdu(&mut *tx, destination.as_str(), receipt.0).await?;
        }
        tx.commit().await?;
        tracing::debug!(?receipt, destinations = destinations.len(), "PDU queued");
        Ok(())
    }

    /// Associate an EDU. Types listed in `ttl_by_type` expire that long from now.
    pub async fn associate_edu_with_destinations(
        &self,
        destinations: &BTreeSet<ServerName>,
        receipt: Receipt,
        edu_type: &str,
        ttl_by_type: &BTreeMap<String, Duration>,
    ) -> TesseraResult<()> {
        let expires_at = ttl_by_type.get(edu_type).map(|ttl| {
            let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
            Utc::now().timestamp_millis().saturating_add(ttl_ms)
        });

        let mut tx = self.db.begin_write().await?;
        ensure_stored(&mut *tx, receipt).await?;
        for destination in destinations {
            queue_edus::insert_queue_edu(&mut *tx, destination.as_str(), receipt.0, edu_type, expires_at).await?;
        }
        tx.commit().await?;
        tracing::debug!(?receipt, edu_type, destinations = destinations.len(), "EDU queued");
        Ok(())
    }

    /// Up to `limit` bodies owed to `server_name`, oldest first. Nothing is removed.
    pub async fn get_pending_pdus(&self, server_name: &ServerName, limit: u32) -> TesseraResult<BTreeMap<Receipt, String>> {
        let nids = queue_pdus::select_queue_pdus(&self.db.pool, server_name.as_str(), limit).await?;
        self.load(&nids).await
    }

    pub async fn get_pending_edus(&self, server_name: &ServerName, limit: u32) -> TesseraResult<BTreeMap<Receipt, String>> {
        let nids = queue_edus::select_queue_edus(&self.db.pool, server_name.as_str(), limit).await?;
        self.load(&nids).await
    }

    async fn load(&self, nids: &[i64]) -> TesseraResult<BTreeMap<Receipt, String>> {
        let rows = queue_json::select_json(&self.db.pool, nids).await?;
        Ok(rows.into_iter().map(|(nid, body)| (Receipt(nid), body)).collect())
    }

    /// Mark PDUs delivered to `server_name`.
    pub async fn clean_pdus(&self, server_name: &ServerName, receipts: &[Receipt]) -> TesseraResult<()> {
        let nids = Receipt::nids(receipts);
        let mut tx = self.db.begin_write().await?;
        queue_pdus::delete_queue_pdus(&mut *tx, server_name.as_str(), &nids).await?;
        let deleted = queue_json::delete_unreferenced_json(&mut *tx, &nids).await?;
        tx.commit().await?;
        tracing::debug!(server = %server_name, cleaned = nids.len(), deleted, "PDUs cleaned");
        Ok(())
    }

    /// Mark EDUs delivered to `server_name`.
    pub async fn clean_edus(&self, server_name: &ServerName, receipts: &[Receipt]) -> TesseraResult<()> {
        let nids = Receipt::nids(receipts);
        let mut tx = self.db.begin_write().await?;
        queue_edus::delete_queue_edus(&mut *tx, server_name.as_str(), &nids).await?;
        let deleted = queue_json::delete_unreferenced_json(&mut *tx, &nids).await?;
        tx.commit().await?;
        tracing::debug!(server = %server_name, cleaned = nids.len(), deleted, "EDUs cleaned");
        Ok(())
    }

    /// Drop EDU associations past their type's TTL.
    pub async fn delete_expired_edus(&self) -> TesseraResult<()> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.db.begin_write().await?;
        let nids = queue_edus::select_expired_json_nids(&mut *tx, now).await?;
        let expired = queue_edus::delete_expired_edus(&mut *tx, now).await?;
        queue_json::delete_unreferenced_json(&mut *tx, &nids).await?;
        tx.commit().await?;
        if expired > 0 {
            tracing::info!(expired, "Expired EDUs removed from the queue");
        }
        Ok(())
    }

    pub async fn get_pending_pdu_server_names(&self) -> TesseraResult<Vec<ServerName>> {
        let names = queue_pdus::select_pending_pdu_server_names(&self.db.pool).await?;
        Ok(names.into_iter().map(ServerName::from).collect())
    }

    pub async fn get_pending_edu_server_names(&self) -> TesseraResult<Vec<ServerName>> {
        let names = queue_edus::select_pending_edu_server_names(&self.db.pool).await?;
        Ok(names.into_iter().map(ServerName::from).collect())
    }

    /// Remove everything queued for `room_id`, for every destination.
    pub async fn purge_room(&self, room_id: &str) -> TesseraResult<()> {
        let mut tx = self.db.begin_write().await?;
        let nids = queue_json::select_json_nids_for_room(&mut *tx, room_id).await?;
        queue_pdus::delete_queue_pdus_for_json(&mut *tx, &nids).await?;
        queue_edus::delete_queue_edus_for_json(&mut *tx, &nids).await?;
        queue_json::delete_unreferenced_json(&mut *tx, &nids).await?;
        tx.commit().await?;
        tracing::info!(room_id, purged = nids.len(), "Room purged from the outbound queue");
        Ok(())
    }

    // ── Blacklist ────────────────────────────────────────────────────────────
    //
    // These run on their own task so they finish even if the caller stops waiting.

    pub async fn add_server_to_blacklist(&self, server_name: &ServerName) -> TesseraResult<()> {
        let pool = self.db.pool.clone();
        let name = server_name.clone();
        tokio::spawn(async move {
            blacklist::insert_blacklist(&pool, name.as_str()).await?;
            tracing::info!(server = %name, "Server blacklisted");
            Ok::<_, TesseraError>(())
        })
        .await?
    }

    pub async fn remove_server_from_blacklist(&self, server_name: &ServerName) -> TesseraResult<()> {
        let pool = self.db.pool.clone();
        let name = server_name.clone();
        tokio::spawn(async move {
            blacklist::delete_blacklist(&pool, name.as_str()).await?;
            tracing::info!(server = %name, "Server removed from blacklist");
            Ok::<_, TesseraError>(())
        })
        .await?
    }

    pub async fn remove_all_servers_from_blacklist(&self) -> TesseraResult<()> {
        let pool = self.db.pool.clone();
        tokio::spawn(async move {
            blacklist::delete_all_blacklist(&pool).await?;
            tracing::info!("Blacklist cleared");
            Ok::<_, TesseraError>(())
        })
        .await?
    }

    pub async fn is_server_blacklisted(&self, server_name: &ServerName) -> TesseraResult<bool> {
        let pool = self.db.pool.clone();
        let name = server_name.clone();
        tokio::spawn(async move { blacklist::select_blacklist(&pool, name.as_str()).await }).await?
    }
}

async fn ensure_stored(tx: &mut sqlx::SqliteConnection, receipt: Receipt) -> TesseraResult<()> {
    if queue_json::json_exists(&mut *tx, receipt.0).await? {
        Ok(())
    } else {
        Err(TesseraError::not_found(format!("Queued body for {receipt:?}")))
    }
}
