use rusqlite::Connection;

/// Schema version stamped into `PRAGMA user_version`.
pub const SCHEMA_VERSION: u32 = 1;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    seq             INTEGER PRIMARY KEY AUTOINCREMENT,
    id              TEXT NOT NULL UNIQUE,
    display_name    TEXT NOT NULL,
    metadata        TEXT NOT NULL DEFAULT '{}',
    reference_image TEXT NOT NULL,
    embedding       TEXT NOT NULL,
    enrolled_at     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS attendance (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    identity_id TEXT NOT NULL REFERENCES identities(id),
    date        TEXT NOT NULL,
    status      TEXT NOT NULL DEFAULT 'Present',
    recorded_at TEXT NOT NULL,
    UNIQUE (identity_id, date)
);

CREATE INDEX IF NOT EXISTS attendance_by_date ON attendance (date);
";

/// Idempotent schema application.
pub fn apply_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.execute_batch(SCHEMA)?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    Ok(())
}

pub fn read_schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
}
