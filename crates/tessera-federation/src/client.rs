//! Key-fetching HTTP client.
//!
//! [`ServerKeyClient`] is the upstream of the notary cache: it resolves a
//! server with [`DiscoveryCache`] and downloads its key document from
//! `/_matrix/key/v2/server`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tessera_common::ServerName;
use tracing::debug;
use url::Url;

use crate::{discovery::DiscoveryCache, error::FederationError, notary::NotaryFetcher, types::ServerKeys};

const KEY_PATH: &str = "/_matrix/key/v2/server";

/// Async HTTP client for fetching remote server keys. Key fetches are unauthenticated.
#[derive(Clone)]
pub struct ServerKeyClient {
    http: Client,
    discovery: DiscoveryCache,
}

impl ServerKeyClient {
    pub fn new(discovery: DiscoveryCache) -> Result<Self, FederationError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("Tessera-Federation/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FederationError::Client(e.to_string()))?;
        Ok(Self { http, discovery })
    }

    /// Fetch the key document a remote server publishes about itself.
    ///
    /// `GET /_matrix/key/v2/server`
    pub async fn fetch_server_keys(&self, destination: &ServerName) -> Result<ServerKeys, FederationError> {
        let base_url = self.discovery.resolve(destination).await?;
        let url = Url::parse(&base_url)?.join(KEY_PATH)?;
        debug!("Fetching server keys from {}", url);

        let resp = self
            .http
            .get(url)
            .send()
            .await
            .inspect_err(|_| self.forget_resolution(destination))?
            .error_for_status()
            .map_err(|e| FederationError::RequestFailed { server: destination.to_string(), reason: e.to_string() })?;
        let keys: ServerKeys = resp.json().await?;

        if keys.server_name != *destination {
            return Err(FederationError::KeyDocument {
                server: destination.to_string(),
                reason: format!("signed for {}", keys.server_name),
            });
        }
        Ok(keys)
    }

    /// Drop a cached resolution after a connection failure so the next call re-resolves.
    fn forget_resolution(&self, destination: &ServerName) {
        let discovery = self.discovery.clone();
        let destination = destination.clone();
        tokio::spawn(async move { discovery.invalidate(&destination).await });
    }
}

#[async_trait]
impl NotaryFetcher for ServerKeyClient {
    async fn fetch_server_keys(
        &self,
        server_name: &ServerName,
        key_ids: &[String],
    ) -> Result<Vec<ServerKeys>, FederationError> {
        // The server endpoint always returns every current key.
        debug!(server = %server_name, ?key_ids, "Upstream key request");
        Ok(vec![ServerKeyClient::fetch_server_keys(self, server_name).await?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, routing::get};
    use serde_json::json;

    async fn serve(document: serde_json::Value) -> String {
        let app = Router::new().route(KEY_PATH, get(move || async move { Json(document) }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    async fn pinned_client(server: &ServerName, base_url: String) -> ServerKeyClient {
        let discovery = DiscoveryCache::new().unwrap();
        discovery.pin(server.clone(), base_url).await;
        ServerKeyClient::new(discovery).unwrap()
    }

    #[tokio::test]
    async fn fetches_the_published_document() {
        let base = serve(json!({
            "server_name": "remote.org",
            "valid_until_ts": 4_102_444_800_000i64,
            "verify_keys": { "ed25519:a": { "key": "AAAA" } },
            "old_verify_keys": { "ed25519:old": { "key": "BBBB", "expired_ts": 1 } }
        }))
        .await;
        let server = ServerName::from("remote.org");
        let client = pinned_client(&server, base).await;

        let docs = NotaryFetcher::fetch_server_keys(&client, &server, &["ed25519:a".into()]).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert!(docs[0].covers("ed25519:a"));
        assert!(docs[0].covers("ed25519:old"));
    }

    #[tokio::test]
    async fn rejects_documents_for_another_server() {
        let base = serve(json!({ "server_name": "impostor.org", "valid_until_ts": 1 })).await;
        let server = ServerName::from("remote.org");
        let client = pinned_client(&server, base).await;

        let err = client.fetch_server_keys(&server).await.unwrap_err();
        assert!(matches!(err, FederationError::KeyDocument { .. }));
    }
}
