//! Error types for vidmirror-core
//!
//! The taxonomy is closed on purpose: every failure a remote call or store
//! write can produce maps onto one of these variants, and retry behavior is
//! decided in exactly one place ([`Error::retry_class`]).

use thiserror::Error;

/// Main error type for the vidmirror-core library
#[derive(Error, Debug)]
pub enum Error {
    /// The platform throttled the issuing credential and demands a wait.
    ///
    /// Expected during normal operation. The in-flight unit of work is
    /// requeued and the credential cools down; never surfaced to the
    /// operator as a failure.
    #[error("rate limited: wait {seconds}s")]
    RateLimited {
        /// Mandatory wait imposed by the platform
        seconds: u64,
    },

    /// Network hiccup, timeout, or 5xx from the gateway. Retried a bounded
    /// number of times with backoff.
    #[error("transient remote error: {0}")]
    TransientRemote(String),

    /// Access to the whole container is gone (revoked, deleted, invalid).
    /// The container gets a sticky skip flag and is logged once.
    #[error("container {container_id} permanently unavailable: {reason}")]
    PermanentContainer { container_id: i64, reason: String },

    /// One item can never be completed (e.g. asset deleted at source).
    /// Sticky per-item; the container continues.
    #[error("permanent item error: {0}")]
    PermanentItem(String),

    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

/// How the scheduler reacts to an error, keyed purely by kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Requeue the unit, cool the credential down. No retry-count penalty.
    RequeueAfterCooldown,
    /// Retry with short backoff, bounded attempts, then sticky item failure.
    RetryBounded,
    /// Sticky per-container skip; siblings unaffected.
    StickyContainer,
    /// Sticky per-item failure; container continues.
    StickyItem,
    /// Fatal for the current unit of work only; the pool continues.
    FatalUnit,
}

impl Error {
    /// The single retry-policy table for the worker pool.
    pub fn retry_class(&self) -> RetryClass {
        match self {
            Error::RateLimited { .. } => RetryClass::RequeueAfterCooldown,
            Error::TransientRemote(_) => RetryClass::RetryBounded,
            Error::PermanentContainer { .. } => RetryClass::StickyContainer,
            Error::PermanentItem(_) => RetryClass::StickyItem,
            Error::Database(_) | Error::Io(_) | Error::Config(_) => RetryClass::FatalUnit,
        }
    }
}

/// Result type alias for vidmirror-core
pub type Result<T> = std::result::Result<T, Error>;
