//! Remote platform access
//!
//! [`PlatformClient`] is the seam between the sync core and the messaging
//! platform. Production code talks HTTP through [`http::GatewayClient`];
//! tests substitute scripted fakes. One client instance corresponds to one
//! credential, so rate-limit state stays per-credential by construction.

pub mod http;

use crate::error::Result;
use crate::types::ContainerKind;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use http::GatewayClient;

/// Container metadata as the platform reports it.
#[derive(Debug, Clone)]
pub struct RemoteContainer {
    pub id: i64,
    pub name: Option<String>,
    pub kind: ContainerKind,
}

/// The media payload of a history entry, when the entry carries one of the
/// tracked kind.
#[derive(Debug, Clone)]
pub struct RemoteMedia {
    /// Platform content address, stable across forwards and duplicates
    pub content_id: String,
    pub size_bytes: i64,
    pub duration_secs: i64,
    /// Opaque reference for downloading the preview asset
    pub asset_ref: Option<String>,
}

/// One history entry. Entries without media (service messages, other media
/// kinds) still occupy sequence ids and still flow through the scanner.
#[derive(Debug, Clone)]
pub struct RemoteEntry {
    pub sequence_id: i64,
    pub ts: Option<DateTime<Utc>>,
    pub sender: Option<String>,
    pub media: Option<RemoteMedia>,
}

/// One page of history, newest entry first.
#[derive(Debug, Clone)]
pub struct Page {
    pub entries: Vec<RemoteEntry>,
    /// Platform-reported count of tracked-kind items in the whole container,
    /// when the platform includes it (typically on the first page)
    pub total: Option<i64>,
}

/// Authenticated access to the remote platform through one credential.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Credential name, for logs and flood telemetry.
    fn credential(&self) -> &str;

    /// Container metadata.
    async fn get_container(&self, container_id: i64) -> Result<RemoteContainer>;

    /// One page of history, newest first. `before` bounds the page to
    /// sequence ids strictly smaller; `None` starts from the newest entry.
    async fn list_history(
        &self,
        container_id: i64,
        before: Option<i64>,
        limit: u32,
    ) -> Result<Page>;

    /// Fetch a single entry by sequence id. `Ok(None)` means the entry does
    /// not exist (deleted or never assigned).
    async fn get_entry(&self, container_id: i64, sequence_id: i64) -> Result<Option<RemoteEntry>>;

    /// Forward an entry into another container, returning its sequence id
    /// there.
    async fn forward_entry(
        &self,
        from_container: i64,
        sequence_id: i64,
        to_container: i64,
    ) -> Result<i64>;

    /// Download a preview asset by its opaque reference.
    async fn download_asset(&self, asset_ref: &str) -> Result<Vec<u8>>;
}
