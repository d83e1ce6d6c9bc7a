//! HTTP client for the platform gateway
//!
//! Speaks the gateway's REST surface with one bearer token per instance.
//! Every response is mapped onto the closed error taxonomy here, so callers
//! never see a raw status code: 429 becomes [`Error::RateLimited`] with the
//! platform's mandated wait, 5xx and transport failures become
//! [`Error::TransientRemote`], and access-gone statuses become the sticky
//! permanent variants.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use reqwest::StatusCode;
use serde::Deserialize;

use crate::config::{CredentialConfig, GatewayConfig, ThrottleConfig};
use crate::error::{Error, Result};
use crate::types::ContainerKind;

use super::{Page, PlatformClient, RemoteContainer, RemoteEntry, RemoteMedia};

/// Wire form of a container, as the gateway serializes it.
#[derive(Debug, Deserialize)]
struct ContainerResponse {
    id: i64,
    name: Option<String>,
    kind: String,
}

/// Wire form of a history entry.
#[derive(Debug, Deserialize)]
struct EntryResponse {
    sequence_id: i64,
    ts: Option<String>,
    sender: Option<String>,
    media: Option<MediaResponse>,
}

#[derive(Debug, Deserialize)]
struct MediaResponse {
    content_id: String,
    #[serde(default)]
    size_bytes: i64,
    #[serde(default)]
    duration_secs: i64,
    asset_ref: Option<String>,
}

/// Response from GET /containers/{id}/history
#[derive(Debug, Deserialize)]
struct HistoryResponse {
    entries: Vec<EntryResponse>,
    /// Tracked-kind item count for the whole container, when known
    #[serde(default)]
    total: Option<i64>,
}

/// Response from POST .../forward
#[derive(Debug, Deserialize)]
struct ForwardResponse {
    sequence_id: i64,
}

/// HTTP client bound to one credential.
pub struct GatewayClient {
    credential: String,
    http_client: reqwest::Client,
    base_url: String,
}

impl GatewayClient {
    /// Create a client for one credential against the configured gateway.
    pub fn new(
        gateway: &GatewayConfig,
        credential: &CredentialConfig,
        throttle: &ThrottleConfig,
    ) -> Result<Self> {
        let base_url = gateway
            .base_url
            .clone()
            .ok_or_else(|| Error::Config("gateway.base_url is required".to_string()))?
            .trim_end_matches('/')
            .to_string();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(token) = &credential.token {
            let auth_value = format!("Bearer {}", token);
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&auth_value)
                    .map_err(|e| Error::Config(format!("invalid credential token: {}", e)))?,
            );
        }

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(throttle.request_timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            credential: credential.name.clone(),
            http_client,
            base_url,
        })
    }

    /// Map a transport error onto the taxonomy. Timeouts and connection
    /// failures are transient.
    fn transport_error(e: reqwest::Error) -> Error {
        Error::TransientRemote(format!("HTTP request failed: {}", e))
    }

    /// Map a non-success status onto the taxonomy.
    async fn status_error(container_id: i64, response: reqwest::Response) -> Error {
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let seconds = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(60);
            return Error::RateLimited { seconds };
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown".to_string());

        match status {
            StatusCode::FORBIDDEN | StatusCode::NOT_FOUND | StatusCode::GONE => {
                Error::PermanentContainer {
                    container_id,
                    reason: format!("gateway {}: {}", status, body),
                }
            }
            s if s.is_server_error() => {
                Error::TransientRemote(format!("gateway {}: {}", status, body))
            }
            s => Error::TransientRemote(format!("unexpected gateway status {}: {}", s, body)),
        }
    }

    fn parse_ts(ts: Option<String>) -> Option<DateTime<Utc>> {
        ts.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    fn entry_from_wire(wire: EntryResponse) -> RemoteEntry {
        RemoteEntry {
            sequence_id: wire.sequence_id,
            ts: Self::parse_ts(wire.ts),
            sender: wire.sender,
            media: wire.media.map(|m| RemoteMedia {
                content_id: m.content_id,
                size_bytes: m.size_bytes,
                duration_secs: m.duration_secs,
                asset_ref: m.asset_ref,
            }),
        }
    }
}

#[async_trait]
impl PlatformClient for GatewayClient {
    fn credential(&self) -> &str {
        &self.credential
    }

    async fn get_container(&self, container_id: i64) -> Result<RemoteContainer> {
        let url = format!("{}/containers/{}", self.base_url, container_id);

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(Self::transport_error)?;

        if !response.status().is_success() {
            return Err(Self::status_error(container_id, response).await);
        }

        let wire: ContainerResponse = response
            .json()
            .await
            .map_err(|e| Error::TransientRemote(format!("failed to parse response: {}", e)))?;

        Ok(RemoteContainer {
            id: wire.id,
            name: wire.name,
            kind: ContainerKind::from_str(&wire.kind).unwrap_or(ContainerKind::Group),
        })
    }

    async fn list_history(
        &self,
        container_id: i64,
        before: Option<i64>,
        limit: u32,
    ) -> Result<Page> {
        let url = format!("{}/containers/{}/history", self.base_url, container_id);

        let mut request = self.http_client.get(&url).query(&[("limit", limit)]);
        if let Some(before) = before {
            request = request.query(&[("before", before)]);
        }

        let response = request.send().await.map_err(Self::transport_error)?;

        if !response.status().is_success() {
            return Err(Self::status_error(container_id, response).await);
        }

        let wire: HistoryResponse = response
            .json()
            .await
            .map_err(|e| Error::TransientRemote(format!("failed to parse response: {}", e)))?;

        Ok(Page {
            entries: wire.entries.into_iter().map(Self::entry_from_wire).collect(),
            total: wire.total,
        })
    }

    async fn get_entry(&self, container_id: i64, sequence_id: i64) -> Result<Option<RemoteEntry>> {
        let url = format!(
            "{}/containers/{}/entries/{}",
            self.base_url, container_id, sequence_id
        );

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(Self::transport_error)?;

        // A missing entry is not a missing container: the gateway
        // distinguishes them, 404 here means the entry itself is gone.
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::status_error(container_id, response).await);
        }

        let wire: EntryResponse = response
            .json()
            .await
            .map_err(|e| Error::TransientRemote(format!("failed to parse response: {}", e)))?;

        Ok(Some(Self::entry_from_wire(wire)))
    }

    async fn forward_entry(
        &self,
        from_container: i64,
        sequence_id: i64,
        to_container: i64,
    ) -> Result<i64> {
        let url = format!(
            "{}/containers/{}/entries/{}/forward",
            self.base_url, from_container, sequence_id
        );

        let response = self
            .http_client
            .post(&url)
            .json(&serde_json::json!({ "to_container": to_container }))
            .send()
            .await
            .map_err(Self::transport_error)?;

        if !response.status().is_success() {
            return Err(Self::status_error(from_container, response).await);
        }

        let wire: ForwardResponse = response
            .json()
            .await
            .map_err(|e| Error::TransientRemote(format!("failed to parse response: {}", e)))?;

        Ok(wire.sequence_id)
    }

    async fn download_asset(&self, asset_ref: &str) -> Result<Vec<u8>> {
        let url = format!("{}/assets/{}", self.base_url, asset_ref);

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(Self::transport_error)?;

        let status = response.status();

        // A 404 on an asset means it was deleted at the source. Sticky.
        if status == StatusCode::NOT_FOUND {
            return Err(Error::PermanentItem(format!(
                "asset {} absent at source",
                asset_ref
            )));
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            let seconds = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(60);
            return Err(Error::RateLimited { seconds });
        }
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            return Err(Error::TransientRemote(format!(
                "gateway {}: {}",
                status, body
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::TransientRemote(format!("failed to read asset body: {}", e)))?;

        Ok(bytes.to_vec())
    }
}
