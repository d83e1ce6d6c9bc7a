//! Counter reconciliation
//!
//! Counters are scheduling hints derived from the append-only mention log,
//! never ground truth. Two modes: a full reset-then-recompute rebuild over
//! all containers, and the incremental bump the scanner applies per batch.
//! A rebuild may overlap scanning (it only reads committed mentions) but
//! never overlaps another rebuild; a second caller is turned away instead
//! of queued.

use std::sync::Arc;
use std::sync::Mutex;

use crate::db::{BatchStats, Database};
use crate::error::Result;

pub struct CounterReconciler {
    db: Arc<Database>,
    /// In-process mutual exclusion for full rebuilds
    rebuild_gate: Mutex<()>,
}

impl CounterReconciler {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            rebuild_gate: Mutex::new(()),
        }
    }

    /// Full rebuild across all containers. Returns `None` when a rebuild is
    /// already in flight, `Some(containers_updated)` otherwise.
    pub fn rebuild_all(&self) -> Result<Option<usize>> {
        let _guard = match self.rebuild_gate.try_lock() {
            Ok(g) => g,
            Err(_) => {
                tracing::info!("Counter rebuild already running, skipping");
                return Ok(None);
            }
        };

        let updated = self.db.recompute_counters_all()?;
        tracing::info!(containers = updated, "Counter rebuild complete");
        Ok(Some(updated))
    }

    /// Rebuild one container's counters from its mention log.
    pub fn rebuild(&self, container_id: i64) -> Result<()> {
        self.db.recompute_counters(container_id)
    }

    /// Incremental bump after a persisted scanner batch.
    pub fn bump_after_batch(&self, container_id: i64, stats: &BatchStats) -> Result<()> {
        self.db.bump_counters(container_id, stats)
    }
}
