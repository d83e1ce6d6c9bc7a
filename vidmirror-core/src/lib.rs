//! # vidmirror-core
//!
//! Core library for vidmirror - a catch-up mirror of media inventories
//! spread across containers on a rate-limited messaging platform.
//!
//! This library provides:
//! - Domain types for containers, items, mentions, and counters
//! - Database storage layer with SQLite (the append-only mention log)
//! - The catch-up/backfill scanner and counter reconciliation
//! - A per-credential rate-limited worker pool with a fallback chain
//! - Configuration management and logging infrastructure
//!
//! ## Architecture
//!
//! The mention log is the ground truth; everything else derives from it:
//! - **Mentions (durable):** append-only (container, sequence) → content id
//! - **Counters (derived):** remote_total/indexed/duplicate, regenerable,
//!   used only as scheduling hints
//! - **Scans (transient):** bounded backward walks that stop on strong
//!   evidence the mirror is current
//!
//! ## Example
//!
//! ```rust,no_run
//! use vidmirror_core::{Config, Database};
//!
//! // Load configuration
//! let config = Config::load().expect("failed to load config");
//!
//! // Open the mirror database
//! let db = Database::open(&Config::database_path()).expect("failed to open database");
//! db.migrate().expect("failed to run migrations");
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use db::{BatchStats, Database};
pub use error::{Error, Result};
pub use sync::{AssetSummary, SyncEngine, SyncSummary};
pub use types::*;

// Public modules
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod pool;
pub mod remote;
pub mod sync;
pub mod types;
