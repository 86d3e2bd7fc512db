use super::StagingStore;
use crate::db::{
    channel_from_row, platform_column, upsert_channel_rows, SharedConnection, StoreError, CHANNEL_COLUMNS,
    STAGING_MIGRATIONS,
};
use crate::types::{ChannelInfo, CollectorStatus, Snapshot, StagedSnapshot};
use async_trait::async_trait;
use rusqlite::{params, Connection};
use std::path::Path;
use std::time::Duration;

const SNAPSHOT_COLUMNS: &str = "id, platform, stream_id, game, organizer, viewer_count, \
                                observed_at, collected_at, processed";

/// SQLite staging store (WAL mode, safe for several collector processes)
#[derive(Clone)]
pub struct SqliteStagingStore {
    conn: SharedConnection,
}

impl SqliteStagingStore {
    pub fn open(db_path: impl AsRef<Path>, timeout: Duration) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref();
        let conn = SharedConnection::open(db_path, timeout)?;
        conn.migrate("staging", STAGING_MIGRATIONS)?;
        log::info!("✅ Staging store ready: {}", db_path.display());
        Ok(Self { conn })
    }

    pub fn open_in_memory(timeout: Duration) -> Result<Self, StoreError> {
        let conn = SharedConnection::open_in_memory(timeout)?;
        conn.migrate("staging", STAGING_MIGRATIONS)?;
        Ok(Self { conn })
    }
}

fn snapshot_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StagedSnapshot> {
    Ok(StagedSnapshot {
        id: row.get(0)?,
        snapshot: Snapshot {
            platform: platform_column(row, 1)?,
            stream_id: row.get(2)?,
            game: row.get(3)?,
            organizer: row.get(4)?,
            viewer_count: row.get(5)?,
            observed_at: row.get(6)?,
            collected_at: row.get(7)?,
        },
        processed: row.get::<_, i64>(8)? != 0,
    })
}

fn query_snapshots(
    conn: &Connection,
    sql: &str,
    args: impl rusqlite::Params,
) -> Result<Vec<StagedSnapshot>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(args, snapshot_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[async_trait]
impl StagingStore for SqliteStagingStore {
    async fn append(&self, batch: Vec<Snapshot>) -> Result<usize, StoreError> {
        if batch.is_empty() {
            return Ok(0);
        }

        for snapshot in &batch {
            snapshot.validate().map_err(|violation| {
                StoreError::ConstraintViolation(format!(
                    "{} stream {}: {}",
                    snapshot.platform, snapshot.stream_id, violation
                ))
            })?;
        }

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut inserted = 0;
                {
                    let mut stmt = tx.prepare_cached(
                        "INSERT INTO stream_snapshots
                         (platform, stream_id, game, organizer, viewer_count, observed_at, collected_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                         ON CONFLICT(platform, stream_id, observed_at) DO NOTHING",
                    )?;
                    for snapshot in &batch {
                        inserted += stmt.execute(params![
                            snapshot.platform.as_str(),
                            snapshot.stream_id,
                            snapshot.game,
                            snapshot.organizer,
                            snapshot.viewer_count,
                            snapshot.observed_at,
                            snapshot.collected_at,
                        ])?;
                    }
                }
                tx.commit()?;

                log::debug!(
                    "✅ Staged {} of {} snapshots ({} duplicates ignored)",
                    inserted,
                    batch.len(),
                    batch.len() - inserted
                );
                Ok(inserted)
            })
            .await
    }

    async fn read_unprocessed(&self, since: i64) -> Result<Vec<StagedSnapshot>, StoreError> {
        self.conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {} FROM stream_snapshots
                     WHERE processed = 0 AND observed_at >= ?1
                     ORDER BY id ASC",
                    SNAPSHOT_COLUMNS
                );
                query_snapshots(conn, &sql, params![since])
            })
            .await
    }

    async fn read_range(&self, start: i64, end: i64) -> Result<Vec<StagedSnapshot>, StoreError> {
        self.conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {} FROM stream_snapshots
                     WHERE observed_at >= ?1 AND observed_at < ?2
                     ORDER BY id ASC",
                    SNAPSHOT_COLUMNS
                );
                query_snapshots(conn, &sql, params![start, end])
            })
            .await
    }

    async fn mark_processed(&self, ids: Vec<i64>) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut updated = 0;
                {
                    let mut stmt = tx.prepare_cached(
                        "UPDATE stream_snapshots SET processed = 1 WHERE id = ?1 AND processed = 0",
                    )?;
                    for id in &ids {
                        updated += stmt.execute(params![id])?;
                    }
                }
                tx.commit()?;
                Ok(updated)
            })
            .await
    }

    async fn purge_processed_before(&self, cutoff: i64) -> Result<usize, StoreError> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let deleted = tx.execute(
                    "DELETE FROM stream_snapshots WHERE processed = 1 AND observed_at < ?1",
                    params![cutoff],
                )?;
                tx.execute("DELETE FROM channels WHERE last_seen_at < ?1", params![cutoff])?;
                tx.commit()?;
                Ok(deleted)
            })
            .await
    }

    async fn record_collector_status(&self, status: CollectorStatus) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO collector_status
                     (platform, last_attempt_at, last_success_at, last_batch_size,
                      consecutive_failures, last_error, halted)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(platform) DO UPDATE SET
                        last_attempt_at = excluded.last_attempt_at,
                        last_success_at = excluded.last_success_at,
                        last_batch_size = excluded.last_batch_size,
                        consecutive_failures = excluded.consecutive_failures,
                        last_error = excluded.last_error,
                        halted = excluded.halted",
                    params![
                        status.platform.as_str(),
                        status.last_attempt_at,
                        status.last_success_at,
                        status.last_batch_size,
                        status.consecutive_failures,
                        status.last_error,
                        status.halted as i64,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    async fn collector_statuses(&self) -> Result<Vec<CollectorStatus>, StoreError> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT platform, last_attempt_at, last_success_at, last_batch_size,
                            consecutive_failures, last_error, halted
                     FROM collector_status ORDER BY platform",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok(CollectorStatus {
                            platform: platform_column(row, 0)?,
                            last_attempt_at: row.get(1)?,
                            last_success_at: row.get(2)?,
                            last_batch_size: row.get(3)?,
                            consecutive_failures: row.get(4)?,
                            last_error: row.get(5)?,
                            halted: row.get::<_, i64>(6)? != 0,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    async fn upsert_channels(&self, channels: Vec<ChannelInfo>) -> Result<usize, StoreError> {
        if channels.is_empty() {
            return Ok(0);
        }
        self.conn
            .call(move |conn| upsert_channel_rows(conn, &channels))
            .await
    }

    async fn channels_seen_since(&self, since: i64) -> Result<Vec<ChannelInfo>, StoreError> {
        self.conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {} FROM channels WHERE last_seen_at >= ?1 ORDER BY platform, channel_id",
                    CHANNEL_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![since], channel_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}
