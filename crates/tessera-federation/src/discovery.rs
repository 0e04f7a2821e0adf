//! Server discovery: resolves a server name to a reachable HTTPS base URL.
//!
//! Resolution order:
//!
//! 1. **Pinned**: a base URL registered with [`DiscoveryCache::pin`]
//! 2. **IP literal / explicit port**: `server:8448` → use as-is
//! 3. **`.well-known/matrix/server`**: GET `https://<name>/.well-known/matrix/server`
//!    If found, follow the delegated server name.
//! 4. **Direct HTTPS fallback**: `https://<name>:8448`
//!
//! Resolved URLs are cached in memory with a 24-hour TTL.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use tessera_common::ServerName;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{error::FederationError, types::WellKnownServer};

/// Default federation port.
const DEFAULT_FED_PORT: u16 = 8448;

/// How long to cache a resolved base URL before re-resolving.
const CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

// ─── Cache ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
enum CacheEntry {
    Resolved { base_url: String, resolved_at: Instant },
    Pinned { base_url: String },
}

/// In-memory cache for resolved server base URLs. Clones share the cache.
#[derive(Debug, Clone)]
pub struct DiscoveryCache {
    inner: Arc<RwLock<HashMap<ServerName, CacheEntry>>>,
    http: reqwest::Client,
}

impl DiscoveryCache {
    pub fn new() -> Result<Self, FederationError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .user_agent(concat!("Tessera-Federation/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FederationError::Client(e.to_string()))?;
        Ok(Self { inner: Arc::new(RwLock::new(HashMap::new())), http })
    }

    /// Always resolve `server_name` to `base_url`, bypassing discovery.
    pub async fn pin(&self, server_name: ServerName, base_url: impl Into<String>) {
        let base_url = base_url.into();
        debug!("Discovery pinned: {} → {}", server_name, base_url);
        self.inner.write().await.insert(server_name, CacheEntry::Pinned { base_url });
    }

    /// Resolve `server_name` to an HTTPS base URL, using cache if valid.
    pub async fn resolve(&self, server_name: &ServerName) -> Result<String, FederationError> {
        // Check cache.
        {
            let cache = self.inner.read().await;
            match cache.get(server_name) {
                Some(CacheEntry::Pinned { base_url }) => return Ok(base_url.clone()),
                Some(CacheEntry::Resolved { base_url, resolved_at }) if resolved_at.elapsed() < CACHE_TTL => {
                    debug!("Discovery cache hit: {} → {}", server_name, base_url);
                    return Ok(base_url.clone());
                }
                _ => {}
            }
        }

        // Resolve.
        let base_url = self.do_resolve(server_name.as_str()).await?;

        // Populate cache.
        self.inner.write().await.insert(
            server_name.clone(),
            CacheEntry::Resolved { base_url: base_url.clone(), resolved_at: Instant::now() },
        );

        Ok(base_url)
    }

    /// Invalidate cache for a server (e.g. after a connection failure). Pins survive.
    pub async fn invalidate(&self, server_name: &ServerName) {
        let mut cache = self.inner.write().await;
        if matches!(cache.get(server_name), Some(CacheEntry::Resolved { .. })) {
            cache.remove(server_name);
        }
    }

    // ── Resolution logic ─────────────────────────────────────────────────────

    async fn do_resolve(&self, server_name: &str) -> Result<String, FederationError> {
        if has_explicit_port(server_name) {
            let base = format!("https://{}", server_name);
            debug!("Discovery (explicit port): {} → {}", server_name, base);
            return Ok(base);
        }

        if let Some(base) = self.try_well_known(server_name).await? {
            debug!("Discovery (well-known): {} → {}", server_name, base);
            return Ok(base);
        }

        let base = format!("https://{}:{}", server_name, DEFAULT_FED_PORT);
        debug!("Discovery (fallback): {} → {}", server_name, base);
        Ok(base)
    }

    /// `Ok(None)` when there is no usable well-known document; a document that
    /// delegates to nothing is an error.
    async fn try_well_known(&self, server_name: &str) -> Result<Option<String>, FederationError> {
        let url = format!("https://{}/.well-known/matrix/server", server_name);
        let Ok(resp) = self.http.get(&url).send().await else {
            return Ok(None);
        };
        if !resp.status().is_success() {
            return Ok(None);
        }
        let Ok(wk) = resp.json::<WellKnownServer>().await else {
            return Ok(None);
        };
        Ok(Some(delegated_base_url(server_name, &wk)?))
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn delegated_base_url(server_name: &str, wk: &WellKnownServer) -> Result<String, FederationError> {
    let delegated = wk.server.trim();
    if delegated.is_empty() {
        return Err(FederationError::EmptyDelegation { server: server_name.to_owned() });
    }
    if has_explicit_port(delegated) {
        Ok(format!("https://{}", delegated))
    } else {
        Ok(format!("https://{}:{}", delegated, DEFAULT_FED_PORT))
    }
}

fn has_explicit_port(server_name: &str) -> bool {
    // IPv6 literal with port: [::1]:8448
    if server_name.starts_with('[') {
        return server_name.contains("]:");
    }
    // hostname:port, but ignore bare IPv6 with extra colons.
    let colon_count = server_name.chars().filter(|&c| c == ':').count();
    colon_count == 1
}
