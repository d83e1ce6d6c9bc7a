//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: Initial schema
    r#"
    -- ============================================
    -- Canonical mirror (append-only mention log)
    -- ============================================

    CREATE TABLE IF NOT EXISTS containers (
        id                 INTEGER PRIMARY KEY,
        name               TEXT,
        kind               TEXT NOT NULL,         -- 'channel', 'group', 'private'
        active             INTEGER NOT NULL DEFAULT 1,
        last_activity_at   DATETIME,
        last_scan_at       DATETIME,
        skipped            INTEGER NOT NULL DEFAULT 0,
        skip_reason        TEXT,
        history_exhausted  INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS items (
        content_id         TEXT PRIMARY KEY,      -- platform content address
        size_bytes         INTEGER NOT NULL DEFAULT 0,
        duration_secs      INTEGER NOT NULL DEFAULT 0,
        asset_ref          TEXT,
        hidden             INTEGER NOT NULL DEFAULT 0,
        asset_state        TEXT NOT NULL DEFAULT 'pending',
        relay_sequence_id  INTEGER,
        first_seen_at      DATETIME NOT NULL
    );

    CREATE TABLE IF NOT EXISTS mentions (
        id                 INTEGER PRIMARY KEY AUTOINCREMENT,
        container_id       INTEGER NOT NULL REFERENCES containers(id),
        sequence_id        INTEGER NOT NULL,
        content_id         TEXT NOT NULL REFERENCES items(content_id),
        ts                 DATETIME,
        sender             TEXT,

        UNIQUE(container_id, sequence_id)
    );

    CREATE INDEX IF NOT EXISTS idx_mentions_container ON mentions(container_id);
    CREATE INDEX IF NOT EXISTS idx_mentions_container_seq ON mentions(container_id, sequence_id);
    CREATE INDEX IF NOT EXISTS idx_mentions_content ON mentions(content_id);
    CREATE INDEX IF NOT EXISTS idx_items_asset_state ON items(asset_state) WHERE asset_state != 'fetched';

    -- ============================================
    -- Derived counters (regenerable from mentions)
    -- ============================================

    CREATE TABLE IF NOT EXISTS container_counters (
        container_id       INTEGER PRIMARY KEY REFERENCES containers(id),
        remote_total       INTEGER NOT NULL DEFAULT 0,
        indexed            INTEGER NOT NULL DEFAULT 0,
        duplicate          INTEGER NOT NULL DEFAULT 0,
        last_updated       DATETIME
    );
    "#,
    // Version 2: Flood incident telemetry (diagnostic only)
    r#"
    CREATE TABLE IF NOT EXISTS flood_incidents (
        id                 INTEGER PRIMARY KEY AUTOINCREMENT,
        credential_id      TEXT NOT NULL,
        completed_before   INTEGER NOT NULL,
        elapsed_secs       INTEGER NOT NULL,
        cooldown_secs      INTEGER NOT NULL,
        recorded_at        DATETIME NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_flood_credential ON flood_incidents(credential_id, recorded_at);
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    tracing::info!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
        }
    }

    if current_version < SCHEMA_VERSION {
        tracing::info!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrations complete"
        );
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().unwrap();

        // Run migrations twice - should be idempotent
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let tables = [
            "containers",
            "items",
            "mentions",
            "container_counters",
            "flood_incidents",
        ];

        for table in tables {
            let exists: i32 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?",
                    [table],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(exists, 1, "Table {} should exist", table);
        }
    }

    #[test]
    fn test_mention_uniqueness() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        conn.execute(
            "INSERT INTO containers (id, kind) VALUES (1, 'channel')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO items (content_id, first_seen_at) VALUES ('abc', datetime('now'))",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO mentions (container_id, sequence_id, content_id) VALUES (1, 10, 'abc')",
            [],
        )
        .unwrap();

        // A racing writer on the same (container, sequence) must not create a
        // second row.
        let res = conn.execute(
            "INSERT INTO mentions (container_id, sequence_id, content_id) VALUES (1, 10, 'abc')",
            [],
        );
        assert!(res.is_err());

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM mentions", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
