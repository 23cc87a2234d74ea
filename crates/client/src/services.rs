//! HTTP client for the adaptation, summarization and TURN-credential
//! collaborators.

use std::time::Duration;

use async_trait::async_trait;
use meshroom_protocol::config::{IceConfig, ServicesConfig, default_stun_urls};
use meshroom_protocol::{
    AdaptResponse, NetworkMetrics, OperatingMode, SummarizeRequest, SummarizeResponse,
    TurnCredentials,
};
use reqwest::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{info, warn};

use crate::error::ServiceError;
use crate::peer::IceServerConfig;
use crate::stats::Adapter;

/// Produces a summary of a room's transcript.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, room: &str) -> Result<String, ServiceError>;
}

#[derive(Clone)]
pub struct ServiceClient {
    client: Client,
    base_url: String,
}

impl ServiceClient {
    /// `None` when no collaborator base URL is configured.
    pub fn from_config(config: &ServicesConfig) -> Result<Option<Self>, ServiceError> {
        let Some(base_url) = config.base_url.as_deref() else {
            return Ok(None);
        };
        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        Ok(Some(Self::with_client(client, base_url)))
    }

    pub fn with_client(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn read<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ServiceError> {
        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(ServiceError::Status {
                status: status.as_u16(),
                message,
            });
        }
        Ok(resp.json::<T>().await?)
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ServiceError> {
        let resp = self.client.post(self.url(path)).json(body).send().await?;
        Self::read(resp).await
    }

    pub async fn adapt(&self, metrics: NetworkMetrics) -> Result<OperatingMode, ServiceError> {
        let resp: AdaptResponse = self.post("/adapt", &metrics).await?;
        Ok(resp.mode)
    }

    pub async fn summarize(&self, room: &str) -> Result<String, ServiceError> {
        let body = SummarizeRequest {
            room: room.to_string(),
        };
        let resp: SummarizeResponse = self.post("/summarize", &body).await?;
        Ok(resp.result.into_text())
    }

    pub async fn turn_credentials(&self) -> Result<TurnCredentials, ServiceError> {
        let resp = self.client.get(self.url("/turn-credentials")).send().await?;
        Self::read(resp).await
    }
}

#[async_trait]
impl Adapter for ServiceClient {
    async fn decide(&self, metrics: NetworkMetrics) -> Result<OperatingMode, ServiceError> {
        self.adapt(metrics).await
    }
}

#[async_trait]
impl Summarizer for ServiceClient {
    async fn summarize(&self, room: &str) -> Result<String, ServiceError> {
        ServiceClient::summarize(self, room).await
    }
}

/// ICE servers from the static configuration, or the public STUN pair when
/// nothing is configured.
pub fn configured_ice_servers(ice: &IceConfig) -> Vec<IceServerConfig> {
    let mut servers = Vec::new();
    if !ice.stun_urls.is_empty() {
        servers.push(IceServerConfig {
            urls: ice.stun_urls.clone(),
            username: None,
            credential: None,
        });
    }
    if !ice.turn_urls.is_empty() {
        servers.push(IceServerConfig {
            urls: ice.turn_urls.clone(),
            username: ice.turn_username.clone(),
            credential: ice.turn_credential.clone(),
        });
    }
    if servers.is_empty() {
        servers.push(IceServerConfig {
            urls: default_stun_urls(),
            username: None,
            credential: None,
        });
    }
    servers
}

/// Fetch TURN credentials from the collaborator and put them in front of
/// the configured servers. Falls back to [`configured_ice_servers`].
pub async fn resolve_ice_servers(
    client: Option<&ServiceClient>,
    ice: &IceConfig,
) -> Vec<IceServerConfig> {
    let mut servers = configured_ice_servers(ice);
    let Some(client) = client else {
        return servers;
    };
    match client.turn_credentials().await {
        Ok(creds) if !creds.uris.is_empty() => {
            info!(uris = creds.uris.len(), "Using fetched TURN credentials");
            servers.insert(
                0,
                IceServerConfig {
                    urls: creds.uris,
                    username: Some(creds.username),
                    credential: Some(creds.credential),
                },
            );
        }
        Ok(_) => warn!("TURN credential response had no URIs, using configured ICE servers"),
        Err(e) => warn!("TURN credentials unavailable, using configured ICE servers: {e}"),
    }
    servers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_base_url_means_no_client() {
        let config = ServicesConfig {
            base_url: None,
            request_timeout_ms: 1000,
        };
        assert!(ServiceClient::from_config(&config).unwrap().is_none());
    }

    #[test]
    fn base_url_trailing_slash_trimmed() {
        let client = ServiceClient::with_client(Client::new(), "http://localhost:8000/");
        assert_eq!(client.url("/adapt"), "http://localhost:8000/adapt");
    }

    #[test]
    fn empty_ice_config_falls_back_to_public_stun() {
        let ice = IceConfig {
            stun_urls: vec![],
            turn_urls: vec![],
            turn_username: None,
            turn_credential: None,
        };
        let servers = configured_ice_servers(&ice);
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].urls, default_stun_urls());
    }

    #[test]
    fn turn_servers_carry_credentials() {
        let ice = IceConfig {
            turn_urls: vec!["turn:turn.example.com:3478".to_string()],
            turn_username: Some("u".to_string()),
            turn_credential: Some("c".to_string()),
            ..Default::default()
        };
        let servers = configured_ice_servers(&ice);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[1].username.as_deref(), Some("u"));
    }

    #[tokio::test]
    async fn unreachable_collaborator_falls_back() {
        // Port 9 (discard) on localhost refuses connections.
        let client = ServiceClient::with_client(
            Client::builder()
                .timeout(Duration::from_millis(500))
                .build()
                .unwrap(),
            "http://127.0.0.1:9",
        );
        let servers = resolve_ice_servers(Some(&client), &IceConfig::default()).await;
        assert_eq!(servers, configured_ice_servers(&IceConfig::default()));
        assert!(client.adapt(NetworkMetrics {
            rtt: 10.0,
            packet_loss: 0.0,
            bandwidth: 1000.0,
        })
        .await
        .is_err());
    }
}
