use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `jobs` and `leases` tables (idempotent) and an index on
/// `(status, due_at)` so the due-job query stays cheap with many jobs.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id              TEXT    NOT NULL PRIMARY KEY,
            correlation_id  TEXT    NOT NULL,
            status          TEXT    NOT NULL,
            priority        INTEGER NOT NULL DEFAULT 0,
            due_at          INTEGER,            -- epoch millis, NULL once exhausted
            last_update     INTEGER NOT NULL,   -- epoch millis
            record          TEXT    NOT NULL    -- JSON-encoded Job
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_jobs_status_due ON jobs (status, due_at);

        CREATE TABLE IF NOT EXISTS leases (
            id              TEXT    NOT NULL PRIMARY KEY,
            token           TEXT,
            last_heartbeat  INTEGER             -- epoch millis
        ) STRICT;
        ",
    )?;
    Ok(())
}
