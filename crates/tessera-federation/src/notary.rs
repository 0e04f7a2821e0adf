//! Notary key cache.
//!
//! Caches remote servers' key documents so signature checks do not need a
//! round trip for every event. A lookup answers from the smallest set of
//! cached documents that covers the requested key IDs, and asks the upstream
//! [`NotaryFetcher`] only for the IDs no unexpired document covers.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tessera_common::{ServerName, TesseraError, TesseraResult};
use tessera_db::Database;
use tessera_db::repository::notary;

use crate::error::FederationError;
use crate::types::ServerKeys;

/// Where key documents come from when the cache cannot answer.
#[async_trait]
pub trait NotaryFetcher: Send + Sync {
    /// Fetch documents for `server_name` covering `key_ids` (all current keys when empty).
    async fn fetch_server_keys(
        &self,
        server_name: &ServerName,
        key_ids: &[String],
    ) -> Result<Vec<ServerKeys>, FederationError>;
}

struct CachedDocument {
    notary_id: i64,
    valid_until: i64,
    keys: ServerKeys,
}

#[derive(Clone)]
pub struct NotaryKeyCache {
    db: Database,
    fetcher: Arc<dyn NotaryFetcher>,
}

impl NotaryKeyCache {
    pub fn new(db: Database, fetcher: Arc<dyn NotaryFetcher>) -> Self {
        Self { db, fetcher }
    }

    /// Merge a key document into the cache.
    ///
    /// Each key ID ends up pointing at whichever document is valid for longer;
    /// key IDs the document does not mention are untouched. Runs to completion
    /// on its own task.
    pub async fn update_notary_keys(&self, server_name: &ServerName, keys: ServerKeys) -> TesseraResult<()> {
        let db = self.db.clone();
        let server = server_name.clone();
        tokio::spawn(async move {
            let body = serde_json::to_string(&keys)?;
            let mut tx = db.begin_write().await?;
            let notary_id =
                notary::insert_server_keys_json(&mut *tx, server.as_str(), &body, keys.valid_until_ts).await?;
            for key_id in keys.key_ids() {
                notary::upsert_server_keys_metadata(&mut *tx, server.as_str(), key_id, notary_id, keys.valid_until_ts)
                    .await?;
            }
            let dropped = notary::delete_unreferenced_server_keys_json(&mut *tx, server.as_str()).await?;
            tx.commit().await?;
            tracing::debug!(server = %server, notary_id, dropped, "Notary keys updated");
            Ok::<_, TesseraError>(())
        })
        .await?
    }

    /// Documents for `server_name` whose union covers `key_ids`.
    ///
    /// With no key IDs every cached document is returned, or the upstream is asked
    /// when nothing is cached. If the upstream fails after part of the request was
    /// answered from cache, the partial answer is returned.
    pub async fn get_notary_keys(&self, server_name: &ServerName, key_ids: &[String]) -> TesseraResult<Vec<ServerKeys>> {
        let now = Utc::now().timestamp_millis();
        let requested: BTreeSet<&str> = key_ids.iter().map(String::as_str).collect();

        let metadata = notary::select_server_keys_metadata(&self.db.pool, server_name.as_str(), key_ids).await?;
        let fresh: Vec<_> = metadata.into_iter().filter(|m| m.valid_until > now).collect();
        // Metadata names, per key ID, the document with the longest validity.
        let winners: HashMap<&str, i64> = fresh.iter().map(|m| (m.key_id.as_str(), m.notary_id)).collect();
        let covered: BTreeSet<&str> = winners.keys().copied().collect();
        let documents = self.load_documents(fresh.iter().map(|m| m.notary_id).collect()).await?;

        let (mut result, uncovered): (Vec<ServerKeys>, Vec<String>) = if requested.is_empty() {
            let cached: Vec<ServerKeys> = documents.into_iter().map(|d| d.keys).collect();
            if !cached.is_empty() {
                return Ok(cached);
            }
            (Vec::new(), Vec::new())
        } else {
            let uncovered = requested.difference(&covered).map(|k| k.to_string()).collect();
            (cover(documents, &covered, &winners), uncovered)
        };

        if !requested.is_empty() && uncovered.is_empty() {
            return Ok(result);
        }

        tracing::debug!(server = %server_name, ?uncovered, "Fetching keys from upstream");
        match self.fetcher.fetch_server_keys(server_name, &uncovered).await {
            Ok(fetched) => {
                for keys in &fetched {
                    self.update_notary_keys(server_name, keys.clone()).await?;
                }
                result.extend(fetched);
                Ok(result)
            }
            Err(e) if !result.is_empty() => {
                tracing::warn!(server = %server_name, error = %e, ?uncovered, "Upstream key fetch failed; returning cached keys only");
                Ok(result)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn load_documents(&self, mut notary_ids: Vec<i64>) -> TesseraResult<Vec<CachedDocument>> {
        notary_ids.sort_unstable();
        notary_ids.dedup();
        let rows = notary::select_server_keys_json(&self.db.pool, &notary_ids).await?;
        rows.into_iter()
            .map(|row| {
                Ok(CachedDocument {
                    notary_id: row.notary_id,
                    valid_until: row.valid_until,
                    keys: serde_json::from_str(&row.response_json)?,
                })
            })
            .collect()
    }
}

/// Greedy set cover: repeatedly take the document that is the current winner
/// for the most still-needed key IDs, preferring longer validity and then the
/// older document. A document mentioning a key it does not win for does not
/// count as covering it.
fn cover(documents: Vec<CachedDocument>, needed: &BTreeSet<&str>, winners: &HashMap<&str, i64>) -> Vec<ServerKeys> {
    let wins = |doc: &CachedDocument, key_id: &str| winners.get(key_id) == Some(&doc.notary_id);
    let mut remaining: BTreeSet<&str> = needed.clone();
    let mut candidates: HashMap<i64, CachedDocument> = documents.into_iter().map(|d| (d.notary_id, d)).collect();
    let mut chosen = Vec::new();

    while !remaining.is_empty() {
        let best = candidates
            .values()
            .map(|doc| {
                let gain = remaining.iter().filter(|&&k| wins(doc, k)).count();
                (gain, doc.valid_until, std::cmp::Reverse(doc.notary_id))
            })
            .filter(|(gain, _, _)| *gain > 0)
            .max();
        let Some((_, _, std::cmp::Reverse(id))) = best else {
            break;
        };
        let Some(doc) = candidates.remove(&id) else {
            break;
        };
        remaining.retain(|&k| !wins(&doc, k));
        chosen.push(doc.keys);
    }
    chosen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VerifyKey;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    const HOUR_MS: i64 = 3_600_000;

    fn keys(server: &str, key_ids: &[&str], valid_until_ts: i64) -> ServerKeys {
        ServerKeys {
            server_name: ServerName::from(server),
            valid_until_ts,
            verify_keys: key_ids
                .iter()
                .map(|id| (id.to_string(), VerifyKey { key: format!("key-{id}") }))
                .collect(),
            old_verify_keys: BTreeMap::new(),
        }
    }

    #[derive(Default)]
    struct StubFetcher {
        requests: Mutex<Vec<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl NotaryFetcher for StubFetcher {
        async fn fetch_server_keys(
            &self,
            server_name: &ServerName,
            key_ids: &[String],
        ) -> Result<Vec<ServerKeys>, FederationError> {
            self.requests.lock().unwrap().push(key_ids.to_vec());
            if self.fail {
                return Err(FederationError::RequestFailed {
                    server: server_name.to_string(),
                    reason: "connection refused".into(),
                });
            }
            let ids: Vec<&str> = key_ids.iter().map(String::as_str).collect();
            let ids = if ids.is_empty() { vec!["ed25519:current"] } else { ids };
            Ok(vec![keys(server_name.as_str(), &ids, Utc::now().timestamp_millis() + HOUR_MS)])
        }
    }

    async fn cache_with(fetcher: Arc<StubFetcher>) -> NotaryKeyCache {
        NotaryKeyCache::new(Database::connect_in_memory().await.unwrap(), fetcher)
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn covered(docs: &[ServerKeys]) -> BTreeSet<String> {
        docs.iter().flat_map(|d| d.key_ids().cloned()).collect()
    }

    #[tokio::test]
    async fn only_uncovered_keys_go_upstream() {
        let fetcher = Arc::new(StubFetcher::default());
        let cache = cache_with(fetcher.clone()).await;
        let server = ServerName::from("remote.org");
        let later = Utc::now().timestamp_millis() + HOUR_MS;
        cache.update_notary_keys(&server, keys("remote.org", &["k1"], later)).await.unwrap();

        let docs = cache.get_notary_keys(&server, &ids(&["k1", "k2"])).await.unwrap();
        assert_eq!(covered(&docs), ids(&["k1", "k2"]).into_iter().collect());
        assert_eq!(*fetcher.requests.lock().unwrap(), vec![ids(&["k2"])]);

        // Both are cached now.
        let docs = cache.get_notary_keys(&server, &ids(&["k1", "k2"])).await.unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(fetcher.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn one_document_covering_everything_is_enough() {
        let fetcher = Arc::new(StubFetcher::default());
        let cache = cache_with(fetcher.clone()).await;
        let server = ServerName::from("remote.org");
        let later = Utc::now().timestamp_millis() + HOUR_MS;
        cache.update_notary_keys(&server, keys("remote.org", &["k1"], later)).await.unwrap();
        cache.update_notary_keys(&server, keys("remote.org", &["k1", "k2"], later + 1)).await.unwrap();

        let docs = cache.get_notary_keys(&server, &ids(&["k1", "k2"])).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert!(fetcher.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_documents_count_as_missing() {
        let fetcher = Arc::new(StubFetcher::default());
        let cache = cache_with(fetcher.clone()).await;
        let server = ServerName::from("remote.org");
        let earlier = Utc::now().timestamp_millis() - HOUR_MS;
        cache.update_notary_keys(&server, keys("remote.org", &["k1"], earlier)).await.unwrap();

        let docs = cache.get_notary_keys(&server, &ids(&["k1"])).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert!(docs[0].valid_until_ts > Utc::now().timestamp_millis());
        assert_eq!(*fetcher.requests.lock().unwrap(), vec![ids(&["k1"])]);
    }

    #[tokio::test]
    async fn older_documents_do_not_replace_newer_ones() {
        let cache = cache_with(Arc::new(StubFetcher::default())).await;
        let server = ServerName::from("remote.org");
        let later = Utc::now().timestamp_millis() + 2 * HOUR_MS;
        let mut newer = keys("remote.org", &["k1"], later);
        newer.verify_keys.insert("k1".into(), VerifyKey { key: "newer".into() });
        cache.update_notary_keys(&server, newer).await.unwrap();
        cache.update_notary_keys(&server, keys("remote.org", &["k1"], later - HOUR_MS)).await.unwrap();

        let docs = cache.get_notary_keys(&server, &ids(&["k1"])).await.unwrap();
        assert_eq!(docs[0].verify_keys["k1"].key, "newer");
    }

    #[tokio::test]
    async fn each_key_comes_from_its_longest_lived_document() {
        let fetcher = Arc::new(StubFetcher::default());
        let cache = cache_with(fetcher.clone()).await;
        let server = ServerName::from("remote.org");
        let soon = Utc::now().timestamp_millis() + HOUR_MS;
        let later = soon + 3 * HOUR_MS;
        cache.update_notary_keys(&server, keys("remote.org", &["k1", "k2"], soon)).await.unwrap();
        cache.update_notary_keys(&server, keys("remote.org", &["k1"], later)).await.unwrap();

        // The first document still mentions k1, but only k2 is served from it.
        let docs = cache.get_notary_keys(&server, &ids(&["k1", "k2"])).await.unwrap();
        let validity: BTreeSet<i64> = docs.iter().map(|d| d.valid_until_ts).collect();
        assert_eq!(validity, BTreeSet::from([soon, later]));
        let k1_from = docs.iter().find(|d| d.valid_until_ts == later).unwrap();
        assert!(k1_from.covers("k1"));
        assert!(fetcher.requests.lock().unwrap().is_empty());

        let docs = cache.get_notary_keys(&server, &ids(&["k1"])).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].valid_until_ts, later);
    }

    #[tokio::test]
    async fn upstream_failure_returns_partial_or_errors() {
        let fetcher = Arc::new(StubFetcher { fail: true, ..Default::default() });
        let cache = cache_with(fetcher).await;
        let server = ServerName::from("remote.org");
        let later = Utc::now().timestamp_millis() + HOUR_MS;
        cache.update_notary_keys(&server, keys("remote.org", &["k1"], later)).await.unwrap();

        let docs = cache.get_notary_keys(&server, &ids(&["k1", "k2"])).await.unwrap();
        assert_eq!(covered(&docs), ids(&["k1"]).into_iter().collect());

        let err = cache.get_notary_keys(&ServerName::from("unknown.org"), &ids(&["k9"])).await.unwrap_err();
        assert!(matches!(err, TesseraError::Internal(_)));
    }

    #[tokio::test]
    async fn empty_request_returns_cache_or_asks_upstream() {
        let fetcher = Arc::new(StubFetcher::default());
        let cache = cache_with(fetcher.clone()).await;
        let server = ServerName::from("remote.org");

        let docs = cache.get_notary_keys(&server, &[]).await.unwrap();
        assert_eq!(covered(&docs), ids(&["ed25519:current"]).into_iter().collect());
        assert_eq!(fetcher.requests.lock().unwrap().len(), 1);

        let docs = cache.get_notary_keys(&server, &[]).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(fetcher.requests.lock().unwrap().len(), 1);
    }
}
