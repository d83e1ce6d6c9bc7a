//! Database repository layer
//!
//! Provides query and insert operations for containers, items, mentions and
//! the derived per-container counters. The mention log is append-only: the
//! core inserts mentions and never deletes them, and every counter in
//! `container_counters` can be regenerated from it.

use crate::error::{Error, Result};
use crate::types::*;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;

/// Deltas produced by persisting one scanner batch, fed to the incremental
/// counter bump so a full rebuild is not needed per scan.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchStats {
    /// Items not previously known anywhere
    pub new_items: usize,
    /// Mentions actually inserted (racing duplicates collapse to no-ops)
    pub new_mentions: usize,
    /// Content ids that crossed from one mention to more than one
    pub new_duplicates: usize,
}

/// One pending preview-asset unit, joined with an origin mention so the
/// owner credential can fall back to the source container.
#[derive(Debug, Clone)]
pub struct AssetTask {
    /// Item needing its asset
    pub content_id: String,
    /// Opaque download reference, if already known
    pub asset_ref: Option<String>,
    /// Where the item sits in the relay container, if staged
    pub relay_sequence_id: Option<i64>,
    /// Any origin mention (container, sequence) for the slow path
    pub origin_container_id: i64,
    pub origin_sequence_id: i64,
}

/// Database handle with connection pooling (single connection for now)
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &PathBuf) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // Enable foreign keys and WAL mode for better concurrency
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -64000;  -- 64MB cache
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        super::schema::run_migrations(&conn)
    }

    // ============================================
    // Container operations
    // ============================================

    /// Insert or update a container (created on discovery, updated on scan).
    pub fn upsert_container(&self, container: &Container) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO containers (id, name, kind, active, last_activity_at, last_scan_at,
                                    skipped, skip_reason, history_exhausted)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                kind = excluded.kind,
                active = excluded.active,
                last_activity_at = COALESCE(excluded.last_activity_at, containers.last_activity_at)
            "#,
            params![
                container.id,
                container.name,
                container.kind.as_str(),
                container.active,
                container.last_activity_at.map(|t| t.to_rfc3339()),
                container.last_scan_at.map(|t| t.to_rfc3339()),
                container.skipped,
                container.skip_reason,
                container.history_exhausted,
            ],
        )?;
        Ok(())
    }

    /// Get a container by id
    pub fn get_container(&self, id: i64) -> Result<Option<Container>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT * FROM containers WHERE id = ?", [id], |row| {
            Self::row_to_container(row)
        })
        .optional()
        .map_err(Error::from)
    }

    /// Record that a catch-up scan just completed for this container.
    pub fn touch_last_scan(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE containers SET last_scan_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    /// Raise the recorded last-activity timestamp if `ts` is newer.
    pub fn touch_last_activity(&self, id: i64, ts: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            UPDATE containers SET last_activity_at = ?1
            WHERE id = ?2
              AND (last_activity_at IS NULL OR last_activity_at < ?1)
            "#,
            params![ts.to_rfc3339(), id],
        )?;
        Ok(())
    }

    /// Sticky per-container skip after a permanent error. Idempotent.
    pub fn mark_container_skipped(&self, id: i64, reason: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE containers SET skipped = 1, skip_reason = ?1 WHERE id = ?2",
            params![reason, id],
        )?;
        Ok(())
    }

    /// Terminal backfill marker: two empty confirmations at the oldest
    /// boundary mean there is no older history to fetch, ever.
    pub fn mark_history_exhausted(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE containers SET history_exhausted = 1 WHERE id = ?",
            [id],
        )?;
        Ok(())
    }

    fn row_to_container(row: &Row) -> rusqlite::Result<Container> {
        let kind_str: String = row.get("kind")?;
        Ok(Container {
            id: row.get("id")?,
            name: row.get("name")?,
            kind: ContainerKind::from_str(&kind_str).unwrap_or(ContainerKind::Group),
            active: row.get("active")?,
            last_activity_at: Self::get_datetime(row, "last_activity_at")?,
            last_scan_at: Self::get_datetime(row, "last_scan_at")?,
            skipped: row.get("skipped")?,
            skip_reason: row.get("skip_reason")?,
            history_exhausted: row.get("history_exhausted")?,
        })
    }

    fn get_datetime(row: &Row, col: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
        let s: Option<String> = row.get(col)?;
        Ok(s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc)))
    }

    // ============================================
    // Item / mention operations
    // ============================================

    /// Insert or update an item. Returns true if the item was not previously
    /// known anywhere in the mirror.
    pub fn upsert_item(&self, item: &Item) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        Self::upsert_item_on(&conn, item)
    }

    fn upsert_item_on(conn: &Connection, item: &Item) -> Result<bool> {
        let exists: bool = conn
            .query_row(
                "SELECT 1 FROM items WHERE content_id = ? LIMIT 1",
                [&item.content_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();

        conn.execute(
            r#"
            INSERT INTO items (content_id, size_bytes, duration_secs, asset_ref, hidden,
                               asset_state, relay_sequence_id, first_seen_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(content_id) DO UPDATE SET
                size_bytes = excluded.size_bytes,
                duration_secs = excluded.duration_secs,
                asset_ref = COALESCE(excluded.asset_ref, items.asset_ref)
            "#,
            params![
                item.content_id,
                item.size_bytes,
                item.duration_secs,
                item.asset_ref,
                item.hidden,
                item.asset_state.as_str(),
                item.relay_sequence_id,
                item.first_seen_at.to_rfc3339(),
            ],
        )?;
        Ok(!exists)
    }

    /// Insert a mention, idempotently keyed by (container_id, sequence_id).
    /// Returns true if a row was actually inserted.
    pub fn upsert_mention(&self, mention: &Mention) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        Self::upsert_mention_on(&conn, mention)
    }

    fn upsert_mention_on(conn: &Connection, mention: &Mention) -> Result<bool> {
        let inserted = conn.execute(
            r#"
            INSERT OR IGNORE INTO mentions (container_id, sequence_id, content_id, ts, sender)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                mention.container_id,
                mention.sequence_id,
                mention.content_id,
                mention.ts.map(|t| t.to_rfc3339()),
                mention.sender,
            ],
        )?;
        Ok(inserted > 0)
    }

    /// Persist one scanner batch in a single transaction and report the
    /// deltas needed for an incremental counter bump.
    pub fn record_batch(&self, batch: &[(Item, Mention)]) -> Result<BatchStats> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let mut stats = BatchStats::default();

        for (item, mention) in batch {
            if Self::upsert_item_on(&tx, item)? {
                stats.new_items += 1;
            }

            // Prior mention count decides whether this insert creates a new
            // duplicate (the 1 -> 2 crossing) for the container.
            let prior: i64 = tx.query_row(
                "SELECT COUNT(*) FROM mentions WHERE container_id = ?1 AND content_id = ?2",
                params![mention.container_id, mention.content_id],
                |r| r.get(0),
            )?;

            if Self::upsert_mention_on(&tx, mention)? {
                stats.new_mentions += 1;
                if prior == 1 {
                    stats.new_duplicates += 1;
                }
            }
        }

        tx.commit()?;
        Ok(stats)
    }

    /// All locally-known sequence ids for a container, loaded once per scan
    /// for O(1) membership tests.
    pub fn known_sequence_ids(&self, container_id: i64) -> Result<HashSet<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT sequence_id FROM mentions WHERE container_id = ?")?;
        let ids = stmt
            .query_map([container_id], |r| r.get::<_, i64>(0))?
            .collect::<rusqlite::Result<HashSet<i64>>>()?;
        Ok(ids)
    }

    /// Smallest locally-known sequence id (the backfill anchor).
    pub fn oldest_known_sequence_id(&self, container_id: i64) -> Result<Option<i64>> {
        let conn = self.conn.lock().unwrap();
        let min: Option<i64> = conn.query_row(
            "SELECT MIN(sequence_id) FROM mentions WHERE container_id = ?",
            [container_id],
            |r| r.get(0),
        )?;
        Ok(min)
    }

    /// Flip an item's asset lifecycle state.
    pub fn set_asset_state(&self, content_id: &str, state: AssetState) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE items SET asset_state = ?1 WHERE content_id = ?2",
            params![state.as_str(), content_id],
        )?;
        Ok(())
    }

    /// Record where an item landed in the relay container.
    pub fn set_relay_sequence(&self, content_id: &str, sequence_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE items SET relay_sequence_id = ?1 WHERE content_id = ?2",
            params![sequence_id, content_id],
        )?;
        Ok(())
    }

    /// Items whose preview asset is still pending or access-blocked, joined
    /// with one origin mention each for the owner fallback.
    pub fn pending_assets(&self, limit: usize) -> Result<Vec<AssetTask>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT i.content_id, i.asset_ref, i.relay_sequence_id,
                   m.container_id, MIN(m.sequence_id)
            FROM items i
            JOIN mentions m ON m.content_id = i.content_id
            WHERE i.asset_state IN ('pending', 'no_access')
              AND i.hidden = 0
            GROUP BY i.content_id
            ORDER BY i.first_seen_at DESC
            LIMIT ?
            "#,
        )?;
        let tasks = stmt
            .query_map([limit as i64], |r| {
                Ok(AssetTask {
                    content_id: r.get(0)?,
                    asset_ref: r.get(1)?,
                    relay_sequence_id: r.get(2)?,
                    origin_container_id: r.get(3)?,
                    origin_sequence_id: r.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    /// Items not yet staged into the relay container.
    pub fn items_needing_relay(&self, limit: usize) -> Result<Vec<AssetTask>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT i.content_id, i.asset_ref, i.relay_sequence_id,
                   m.container_id, MIN(m.sequence_id)
            FROM items i
            JOIN mentions m ON m.content_id = i.content_id
            JOIN containers c ON c.id = m.container_id
            WHERE i.asset_state = 'pending'
              AND i.relay_sequence_id IS NULL
              AND i.hidden = 0
              AND c.skipped = 0
            GROUP BY i.content_id
            ORDER BY i.first_seen_at DESC
            LIMIT ?
            "#,
        )?;
        let tasks = stmt
            .query_map([limit as i64], |r| {
                Ok(AssetTask {
                    content_id: r.get(0)?,
                    asset_ref: r.get(1)?,
                    relay_sequence_id: r.get(2)?,
                    origin_container_id: r.get(3)?,
                    origin_sequence_id: r.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    // ============================================
    // Counter operations
    // ============================================

    /// Read the derived counters for a container.
    pub fn counters(&self, container_id: i64) -> Result<Option<ContainerCounters>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            r#"
            SELECT remote_total, indexed, duplicate
            FROM container_counters WHERE container_id = ?
            "#,
            [container_id],
            |r| {
                Ok(ContainerCounters {
                    remote_total: r.get(0)?,
                    indexed: r.get(1)?,
                    duplicate: r.get(2)?,
                })
            },
        )
        .optional()
        .map_err(Error::from)
    }

    /// Store the platform-reported remote total for a container.
    pub fn set_remote_total(&self, container_id: i64, total: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO container_counters (container_id, remote_total, last_updated)
            VALUES (?1, ?2, CURRENT_TIMESTAMP)
            ON CONFLICT(container_id) DO UPDATE SET
                remote_total = excluded.remote_total,
                last_updated = CURRENT_TIMESTAMP
            "#,
            params![container_id, total],
        )?;
        Ok(())
    }

    /// Incremental bump after a persisted batch, avoiding a full rebuild
    /// per scan.
    pub fn bump_counters(&self, container_id: i64, stats: &BatchStats) -> Result<()> {
        if stats.new_mentions == 0 {
            return Ok(());
        }
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO container_counters (container_id, indexed, duplicate, last_updated)
            VALUES (?1, ?2, ?3, CURRENT_TIMESTAMP)
            ON CONFLICT(container_id) DO UPDATE SET
                indexed = container_counters.indexed + excluded.indexed,
                duplicate = container_counters.duplicate + excluded.duplicate,
                last_updated = CURRENT_TIMESTAMP
            "#,
            params![
                container_id,
                stats.new_mentions as i64,
                stats.new_duplicates as i64
            ],
        )?;
        Ok(())
    }

    /// Reset-then-recompute `indexed` and `duplicate` for one container from
    /// the mention log.
    pub fn recompute_counters(&self, container_id: i64) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let indexed: i64 = tx.query_row(
            "SELECT COUNT(*) FROM mentions WHERE container_id = ?",
            [container_id],
            |r| r.get(0),
        )?;
        let duplicate: i64 = tx.query_row(
            r#"
            SELECT COUNT(*) FROM (
                SELECT content_id FROM mentions
                WHERE container_id = ?
                GROUP BY content_id
                HAVING COUNT(*) > 1
            )
            "#,
            [container_id],
            |r| r.get(0),
        )?;

        tx.execute(
            r#"
            INSERT INTO container_counters (container_id, indexed, duplicate, last_updated)
            VALUES (?1, ?2, ?3, CURRENT_TIMESTAMP)
            ON CONFLICT(container_id) DO UPDATE SET
                indexed = excluded.indexed,
                duplicate = excluded.duplicate,
                last_updated = CURRENT_TIMESTAMP
            "#,
            params![container_id, indexed, duplicate],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Full rebuild: one aggregated pass over the mention log for all
    /// containers. Safe to run while scans commit new mentions — it only
    /// derives from what is already committed. Returns containers updated.
    pub fn recompute_counters_all(&self) -> Result<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        // Reset before recomputing so containers whose mentions disappeared
        // upstream of us (none, normally) do not keep stale values.
        tx.execute("UPDATE container_counters SET indexed = 0, duplicate = 0", [])?;

        let updated = tx.execute(
            r#"
            INSERT INTO container_counters (container_id, indexed, duplicate, last_updated)
            SELECT m.container_id,
                   COUNT(*),
                   (SELECT COUNT(*) FROM (
                        SELECT content_id FROM mentions d
                        WHERE d.container_id = m.container_id
                        GROUP BY content_id
                        HAVING COUNT(*) > 1
                   )),
                   CURRENT_TIMESTAMP
            FROM mentions m
            GROUP BY m.container_id
            ON CONFLICT(container_id) DO UPDATE SET
                indexed = excluded.indexed,
                duplicate = excluded.duplicate,
                last_updated = CURRENT_TIMESTAMP
            "#,
            [],
        )?;

        tx.commit()?;
        Ok(updated)
    }

    /// Containers worth a catch-up scan: still missing items, active, and
    /// not sticky-skipped. Ordered by how much is missing.
    pub fn containers_needing_catchup(&self, limit: usize) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT cc.container_id
            FROM container_counters cc
            JOIN containers c ON c.id = cc.container_id
            WHERE c.active = 1
              AND c.skipped = 0
              AND cc.remote_total > 0
              AND MAX(cc.remote_total - cc.duplicate - cc.indexed, 0) > 0
            ORDER BY (cc.remote_total - cc.duplicate - cc.indexed) DESC
            LIMIT ?
            "#,
        )?;
        let ids = stmt
            .query_map([limit as i64], |r| r.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    /// Containers eligible for backfill: some history already mirrored (an
    /// anchor exists) and not yet confirmed history-exhausted.
    pub fn containers_for_backfill(&self, limit: usize) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT DISTINCT c.id
            FROM containers c
            JOIN mentions m ON m.container_id = c.id
            WHERE c.skipped = 0
              AND c.history_exhausted = 0
            LIMIT ?
            "#,
        )?;
        let ids = stmt
            .query_map([limit as i64], |r| r.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    // ============================================
    // Flood telemetry (diagnostic only)
    // ============================================

    /// Append one flood incident for later batch-size tuning.
    pub fn record_flood_incident(&self, incident: &FloodIncident) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO flood_incidents
                (credential_id, completed_before, elapsed_secs, cooldown_secs, recorded_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                incident.credential_id,
                incident.completed_before as i64,
                incident.elapsed_secs as i64,
                incident.cooldown_secs as i64,
                incident.recorded_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Flood incidents recorded at or after the given instant.
    pub fn flood_incidents_since(&self, since: DateTime<Utc>) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM flood_incidents WHERE recorded_at >= ?",
            [since.to_rfc3339()],
            |r| r.get(0),
        )?;
        Ok(count)
    }
}
