//! Shared SQLite plumbing for the staging and durable stores
//!
//! - `StoreError` - the store error taxonomy (unavailable / constraint / timeout)
//! - `SharedConnection` - `Arc<Mutex<Connection>>` whose work runs on the
//!   blocking pool under an explicit timeout
//! - embedded schema migrations (`sql/staging`, `sql/durable`)
//! - the `channels` registry table, which both databases carry

use crate::sqlite_pragma::apply_optimized_pragmas;
use crate::types::{ChannelInfo, Platform};
use rusqlite::{Connection, ErrorCode};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("schema migration {file} failed: {message}")]
    Migration { file: &'static str, message: String },
}

impl StoreError {
    /// Unavailable and Timeout may succeed on a later attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _) if code.code == ErrorCode::ConstraintViolation => {
                StoreError::ConstraintViolation(err.to_string())
            }
            _ => StoreError::Unavailable(err.to_string()),
        }
    }
}

/// Decode a stored platform name inside a row mapper
pub fn platform_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Platform> {
    let value: String = row.get(idx)?;
    Platform::from_str(&value).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unknown platform '{}'", value).into(),
        )
    })
}

/// One schema file, applied in declaration order. Every statement must use
/// `IF NOT EXISTS` so re-running on an existing database is a no-op.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub file: &'static str,
    pub sql: &'static str,
}

pub const STAGING_MIGRATIONS: &[Migration] = &[
    Migration {
        file: "01_stream_snapshots.sql",
        sql: include_str!("../sql/staging/01_stream_snapshots.sql"),
    },
    Migration {
        file: "02_collector_status.sql",
        sql: include_str!("../sql/staging/02_collector_status.sql"),
    },
    Migration {
        file: "03_channels.sql",
        sql: include_str!("../sql/staging/03_channels.sql"),
    },
];

pub const DURABLE_MIGRATIONS: &[Migration] = &[
    Migration {
        file: "01_windowed_aggregates.sql",
        sql: include_str!("../sql/durable/01_windowed_aggregates.sql"),
    },
    Migration {
        file: "02_aggregation_faults.sql",
        sql: include_str!("../sql/durable/02_aggregation_faults.sql"),
    },
    Migration {
        file: "03_aggregator_lease.sql",
        sql: include_str!("../sql/durable/03_aggregator_lease.sql"),
    },
    Migration {
        file: "04_channels.sql",
        sql: include_str!("../sql/durable/04_channels.sql"),
    },
];

pub const CHANNEL_COLUMNS: &str = "platform, channel_id, display_name, language, last_title, \
                                   last_game, first_seen_at, last_seen_at, peak_viewers";

/// Merge channel rows: descriptive fields follow the newest sighting,
/// first_seen/peak only ever widen
const UPSERT_CHANNEL_SQL: &str = "INSERT INTO channels
     (platform, channel_id, display_name, language, last_title, last_game,
      first_seen_at, last_seen_at, peak_viewers)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
     ON CONFLICT(platform, channel_id) DO UPDATE SET
        display_name = CASE WHEN excluded.last_seen_at >= last_seen_at
                            THEN excluded.display_name ELSE display_name END,
        language = CASE WHEN excluded.last_seen_at >= last_seen_at
                        THEN COALESCE(excluded.language, language) ELSE language END,
        last_title = CASE WHEN excluded.last_seen_at >= last_seen_at
                          THEN excluded.last_title ELSE last_title END,
        last_game = CASE WHEN excluded.last_seen_at >= last_seen_at
                         THEN excluded.last_game ELSE last_game END,
        first_seen_at = MIN(first_seen_at, excluded.first_seen_at),
        last_seen_at = MAX(last_seen_at, excluded.last_seen_at),
        peak_viewers = MAX(peak_viewers, excluded.peak_viewers)";

pub fn channel_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChannelInfo> {
    Ok(ChannelInfo {
        platform: platform_column(row, 0)?,
        channel_id: row.get(1)?,
        display_name: row.get(2)?,
        language: row.get(3)?,
        last_title: row.get(4)?,
        last_game: row.get(5)?,
        first_seen_at: row.get(6)?,
        last_seen_at: row.get(7)?,
        peak_viewers: row.get(8)?,
    })
}

/// Upsert a batch of channel rows in one transaction
pub fn upsert_channel_rows(conn: &mut Connection, channels: &[ChannelInfo]) -> Result<usize, StoreError> {
    let tx = conn.transaction()?;
    let mut written = 0;
    {
        let mut stmt = tx.prepare_cached(UPSERT_CHANNEL_SQL)?;
        for channel in channels {
            written += stmt.execute(rusqlite::params![
                channel.platform.as_str(),
                channel.channel_id,
                channel.display_name,
                channel.language,
                channel.last_title,
                channel.last_game,
                channel.first_seen_at,
                channel.last_seen_at,
                channel.peak_viewers,
            ])?;
        }
    }
    tx.commit()?;
    Ok(written)
}

/// Run schema migrations against an open connection
pub fn run_schema_migrations(
    conn: &Connection,
    label: &str,
    migrations: &[Migration],
) -> Result<(), StoreError> {
    log::info!("🔧 Running {} schema migrations", label);

    for migration in migrations {
        log::debug!("   ├─ Executing: {}", migration.file);
        conn.execute_batch(migration.sql)
            .map_err(|e| StoreError::Migration {
                file: migration.file,
                message: e.to_string(),
            })?;
    }

    log::info!("   └─ ✅ {} migrations applied", migrations.len());
    Ok(())
}

/// A single SQLite connection shared across tasks.
///
/// Every call runs inside `spawn_blocking` and is bounded by `timeout`.
/// A call that times out may still complete on the blocking pool; writers
/// rely on idempotent statements so a replay after an ambiguous failure is
/// harmless.
#[derive(Clone)]
pub struct SharedConnection {
    conn: Arc<Mutex<Connection>>,
    timeout: Duration,
}

impl SharedConnection {
    pub fn open(db_path: impl AsRef<Path>, timeout: Duration) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Unavailable(format!(
                        "failed to create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(db_path)?;
        apply_optimized_pragmas(&conn, timeout)?;
        Ok(Self::from_connection(conn, timeout))
    }

    pub fn open_in_memory(timeout: Duration) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        apply_optimized_pragmas(&conn, timeout)?;
        Ok(Self::from_connection(conn, timeout))
    }

    fn from_connection(conn: Connection, timeout: Duration) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            timeout,
        }
    }

    /// Synchronous access for startup work (migrations)
    pub fn migrate(&self, label: &str, migrations: &[Migration]) -> Result<(), StoreError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| StoreError::Unavailable("connection mutex poisoned".to_string()))?;
        run_schema_migrations(&conn, label, migrations)
    }

    pub async fn call<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let handle = tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("connection mutex poisoned".to_string()))?;
            f(&mut guard)
        });

        match tokio::time::timeout(self.timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(StoreError::Unavailable(format!(
                "store task failed: {}",
                join_err
            ))),
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }
}
