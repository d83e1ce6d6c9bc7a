//! Database layer for vidmirror
//!
//! SQLite-backed persistent store: schema migrations and the repository
//! interface the sync core consumes.

pub mod repo;
pub mod schema;

pub use repo::{BatchStats, Database};
