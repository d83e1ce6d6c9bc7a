//! Core domain types for vidmirror
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Container** | A chat/channel/group-like collection of items on the remote platform |
//! | **Item** | A content-addressed media object, deduplicated by platform-assigned unique id |
//! | **Mention** | One occurrence of an Item inside a Container at a specific sequence position |
//! | **Sequence id** | The platform's monotonically increasing per-container message identifier |
//! | **Credential** | One authenticated identity (relay bot or owner session) usable against the platform |
//! | **Cooldown** | A mandatory wait the platform imposes on a credential that exceeded its call rate |
//!
//! Many mentions may reference the same item; that is what "duplicate" counts.
//! The core never deletes a mention — the mention log is append-only and is
//! the ground truth all counters derive from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================
// Container
// ============================================

/// Kind of remote container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerKind {
    Channel,
    Group,
    Private,
}

impl ContainerKind {
    /// Identifier used in database storage
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerKind::Channel => "channel",
            ContainerKind::Group => "group",
            ContainerKind::Private => "private",
        }
    }
}

impl std::str::FromStr for ContainerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "channel" => Ok(ContainerKind::Channel),
            "group" => Ok(ContainerKind::Group),
            "private" => Ok(ContainerKind::Private),
            _ => Err(format!("unknown container kind: {}", s)),
        }
    }
}

/// A tracked remote container.
///
/// Created on discovery, updated on every scan. The two sticky flags are
/// terminal: `skipped` means access is permanently gone, `history_exhausted`
/// means backfill confirmed there is no older history left.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    /// Platform-assigned container id
    pub id: i64,
    /// Display name
    pub name: Option<String>,
    /// Kind of container
    pub kind: ContainerKind,
    /// Whether the container still receives activity
    pub active: bool,
    /// Most recent remote activity we know about
    pub last_activity_at: Option<DateTime<Utc>>,
    /// When a catch-up scan last completed
    pub last_scan_at: Option<DateTime<Utc>>,
    /// Sticky permanent-error exclusion
    pub skipped: bool,
    /// Why the container was skipped (logged once when set)
    pub skip_reason: Option<String>,
    /// Backfill hit the true start of history (terminal, durable)
    pub history_exhausted: bool,
}

// ============================================
// Item / Mention
// ============================================

/// State of an item's auxiliary preview asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetState {
    /// Not yet fetched
    Pending,
    /// Fetched and stored
    Fetched,
    /// Absent at the source (permanent, sticky)
    Absent,
    /// No credential currently has access (retryable later)
    NoAccess,
}

impl AssetState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetState::Pending => "pending",
            AssetState::Fetched => "fetched",
            AssetState::Absent => "absent",
            AssetState::NoAccess => "no_access",
        }
    }
}

impl std::str::FromStr for AssetState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AssetState::Pending),
            "fetched" => Ok(AssetState::Fetched),
            "absent" => Ok(AssetState::Absent),
            "no_access" => Ok(AssetState::NoAccess),
            _ => Err(format!("unknown asset state: {}", s)),
        }
    }
}

/// A content-addressed media object.
///
/// `content_id` is the platform's stable unique id for the underlying media,
/// identical across every mention of the same file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    /// Platform content address (primary key)
    pub content_id: String,
    /// Media size in bytes
    pub size_bytes: i64,
    /// Duration in seconds
    pub duration_secs: i64,
    /// Opaque reference used to download the media/asset
    pub asset_ref: Option<String>,
    /// Hidden from listings (operator decision, external to the core)
    pub hidden: bool,
    /// Preview asset lifecycle
    pub asset_state: AssetState,
    /// Sequence id of this item in the relay container, once staged there
    pub relay_sequence_id: Option<i64>,
    /// First time any mention of this item was seen
    pub first_seen_at: DateTime<Utc>,
}

/// One occurrence of an item in a container.
///
/// UNIQUE(container_id, sequence_id) in the store; racing writers on the
/// same mention converge to one row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mention {
    /// Container the item appeared in
    pub container_id: i64,
    /// Platform sequence id within that container
    pub sequence_id: i64,
    /// Content id of the referenced item
    pub content_id: String,
    /// Platform timestamp of the mention
    pub ts: Option<DateTime<Utc>>,
    /// Attribution (sender id/handle), free-form
    pub sender: Option<String>,
}

// ============================================
// Counters
// ============================================

/// Durable per-container counters. Always derived, never authoritative:
/// the mention log is the ground truth.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ContainerCounters {
    /// Items the platform reports to exist remotely
    pub remote_total: i64,
    /// Mentions mirrored locally
    pub indexed: i64,
    /// Content ids with more than one mention in this container
    pub duplicate: i64,
}

impl ContainerCounters {
    /// Distinct items remotely: `remote_total - duplicate`.
    pub fn unique_remote(&self) -> i64 {
        self.remote_total - self.duplicate
    }

    /// Items still missing locally, floored at zero.
    pub fn missing(&self) -> i64 {
        (self.unique_remote() - self.indexed).max(0)
    }
}

// ============================================
// Credentials / rate limiting
// ============================================

/// Identifier for one authenticated platform identity.
pub type CredentialId = String;

/// What a credential is for, which decides its position in the fallback
/// chain: relays first (higher throughput budget), the owner last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    /// Relay bot reading from the relay container
    Relay,
    /// Direct-owner session reading from origin containers (slow path)
    Owner,
}

/// Diagnostic record of one rate-limit incident. Used only for tuning batch
/// sizes, never for correctness.
#[derive(Debug, Clone)]
pub struct FloodIncident {
    /// Credential that got throttled
    pub credential_id: CredentialId,
    /// Units completed by that credential before the incident
    pub completed_before: u64,
    /// Seconds the credential had been working since its last cooldown
    pub elapsed_secs: u64,
    /// Cooldown the platform demanded
    pub cooldown_secs: u64,
    /// Wall-clock time the incident was recorded
    pub recorded_at: DateTime<Utc>,
}

// ============================================
// Scan outcomes
// ============================================

/// Which way a history walk moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanDirection {
    /// From the newest item backward (catch-up)
    FromNewest,
    /// From the oldest known item strictly older (backfill)
    OlderThanAnchor,
}

/// Terminal state of one scanner run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStop {
    /// Hit the consecutive-known threshold (the mirror is current)
    StoppedByThreshold,
    /// The remote side ran out of pages
    StoppedByExhaustion,
    /// Hit the per-run cap on new items
    StoppedByCap,
}

/// Summary of one per-container scanner run.
#[derive(Debug, Clone)]
pub struct RunResult {
    /// Container scanned
    pub container_id: i64,
    /// Remote items examined (of the tracked media kind)
    pub processed: u64,
    /// Newly mirrored items above the previously newest known id
    pub new_count: u64,
    /// Newly mirrored items that filled holes below the newest known id
    pub gap_filled: u64,
    /// Why the run ended
    pub final_state: ScanStop,
}
