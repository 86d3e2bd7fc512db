//! Connection tuning shared by the staging and durable databases

use rusqlite::Connection;
use std::time::Duration;

/// WAL journal, NORMAL sync, in-memory temp tables, periodic checkpoints.
///
/// `busy_timeout` lets several collector processes append to the same
/// staging file without failing on a momentary write lock.
pub fn apply_optimized_pragmas(conn: &Connection, busy_timeout: Duration) -> rusqlite::Result<()> {
    // journal_mode returns a row; in-memory databases report "memory"
    let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "wal_autocheckpoint", 1000)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(busy_timeout)?;
    Ok(())
}
