use super::DurableStore;
use crate::db::{
    channel_from_row, platform_column, upsert_channel_rows, SharedConnection, StoreError, CHANNEL_COLUMNS,
    DURABLE_MIGRATIONS,
};
use crate::types::{AggregationFault, ChannelInfo, GroupKey, InconsistencyReason, Platform, WindowedAggregate};
use std::collections::HashSet;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::time::Duration;

const LEASE_NAME: &str = "aggregator";

const AGGREGATE_COLUMNS: &str = "window_start, window_length_days, game, organizer, platform, \
                                 viewer_hours, peak_viewers, avg_viewers, sample_count";

#[derive(Clone)]
pub struct SqliteDurableStore {
    conn: SharedConnection,
}

impl SqliteDurableStore {
    pub fn open(db_path: impl AsRef<Path>, timeout: Duration) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref();
        let conn = SharedConnection::open(db_path, timeout)?;
        conn.migrate("durable", DURABLE_MIGRATIONS)?;
        log::info!("✅ Durable store ready: {}", db_path.display());
        Ok(Self { conn })
    }

    pub fn open_in_memory(timeout: Duration) -> Result<Self, StoreError> {
        let conn = SharedConnection::open_in_memory(timeout)?;
        conn.migrate("durable", DURABLE_MIGRATIONS)?;
        Ok(Self { conn })
    }
}

fn aggregate_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<WindowedAggregate> {
    Ok(WindowedAggregate {
        window_start: row.get(0)?,
        window_length_days: row.get(1)?,
        game: row.get(2)?,
        organizer: row.get(3)?,
        platform: platform_column(row, 4)?,
        viewer_hours: row.get(5)?,
        peak_viewers: row.get(6)?,
        avg_viewers: row.get(7)?,
        sample_count: row.get(8)?,
    })
}

fn query_aggregates(
    conn: &Connection,
    filter: &str,
    args: impl rusqlite::Params,
) -> Result<Vec<WindowedAggregate>, StoreError> {
    let sql = format!(
        "SELECT {} FROM windowed_aggregates WHERE {}
         ORDER BY window_start, platform, game, organizer",
        AGGREGATE_COLUMNS, filter
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(args, aggregate_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[async_trait]
impl DurableStore for SqliteDurableStore {
    async fn upsert_aggregate(&self, row: WindowedAggregate) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO windowed_aggregates
                     (window_start, window_length_days, game, organizer, platform,
                      viewer_hours, peak_viewers, avg_viewers, sample_count)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                     ON CONFLICT(window_start, window_length_days, game, organizer, platform)
                     DO UPDATE SET
                        viewer_hours = excluded.viewer_hours,
                        peak_viewers = excluded.peak_viewers,
                        avg_viewers = excluded.avg_viewers,
                        sample_count = excluded.sample_count",
                    params![
                        row.window_start,
                        row.window_length_days,
                        row.game,
                        row.organizer,
                        row.platform.as_str(),
                        row.viewer_hours,
                        row.peak_viewers,
                        row.avg_viewers,
                        row.sample_count,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    async fn retain_groups(
        &self,
        window_start: i64,
        window_length_days: u32,
        keep: Vec<GroupKey>,
    ) -> Result<usize, StoreError> {
        let keep: HashSet<GroupKey> = keep.into_iter().collect();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let existing = query_aggregates(
                    &tx,
                    "window_length_days = ?1 AND window_start = ?2",
                    params![window_length_days, window_start],
                )?;

                let mut deleted = 0;
                for row in existing.iter().filter(|r| !keep.contains(&r.group_key())) {
                    deleted += tx.execute(
                        "DELETE FROM windowed_aggregates
                         WHERE window_start = ?1 AND window_length_days = ?2
                           AND game = ?3 AND organizer = ?4 AND platform = ?5",
                        params![
                            window_start,
                            window_length_days,
                            row.game,
                            row.organizer,
                            row.platform.as_str(),
                        ],
                    )?;
                }
                tx.commit()?;

                if deleted > 0 {
                    log::info!(
                        "🧹 Removed {} superseded rows from {}d window {}",
                        deleted,
                        window_length_days,
                        window_start
                    );
                }
                Ok(deleted)
            })
            .await
    }

    async fn aggregates_for_window(
        &self,
        window_length_days: u32,
        window_start: i64,
    ) -> Result<Vec<WindowedAggregate>, StoreError> {
        self.conn
            .call(move |conn| {
                query_aggregates(
                    conn,
                    "window_length_days = ?1 AND window_start = ?2",
                    params![window_length_days, window_start],
                )
            })
            .await
    }

    async fn daily_aggregates(&self, from: i64, to: i64) -> Result<Vec<WindowedAggregate>, StoreError> {
        self.conn
            .call(move |conn| {
                query_aggregates(
                    conn,
                    "window_length_days = 1 AND window_start >= ?1 AND window_start < ?2",
                    params![from, to],
                )
            })
            .await
    }

    async fn has_window(&self, window_start: i64, window_length_days: u32) -> Result<bool, StoreError> {
        self.conn
            .call(move |conn| {
                let exists: bool = conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM windowed_aggregates
                                   WHERE window_start = ?1 AND window_length_days = ?2)",
                    params![window_start, window_length_days],
                    |row| row.get(0),
                )?;
                Ok(exists)
            })
            .await
    }

    async fn latest_window_start(&self, window_length_days: u32) -> Result<Option<i64>, StoreError> {
        self.conn
            .call(move |conn| {
                let latest: Option<i64> = conn.query_row(
                    "SELECT MAX(window_start) FROM windowed_aggregates WHERE window_length_days = ?1",
                    params![window_length_days],
                    |row| row.get(0),
                )?;
                Ok(latest)
            })
            .await
    }

    async fn record_fault(&self, fault: AggregationFault) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO aggregation_faults
                     (detected_at, window_start, window_length_days, platform, game, organizer, reason)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        fault.detected_at,
                        fault.window_start,
                        fault.window_length_days,
                        fault.platform.as_str(),
                        fault.game,
                        fault.organizer,
                        fault.reason.as_str(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    async fn faults_since(&self, since: i64) -> Result<Vec<AggregationFault>, StoreError> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT detected_at, window_start, window_length_days, platform, game, organizer, reason
                     FROM aggregation_faults WHERE detected_at >= ?1
                     ORDER BY detected_at, id",
                )?;
                let rows = stmt
                    .query_map(params![since], |row| {
                        let reason: String = row.get(6)?;
                        let reason = InconsistencyReason::from_str(&reason).ok_or_else(|| {
                            rusqlite::Error::FromSqlConversionFailure(
                                6,
                                rusqlite::types::Type::Text,
                                format!("unknown fault reason '{}'", reason).into(),
                            )
                        })?;
                        Ok(AggregationFault {
                            detected_at: row.get(0)?,
                            window_start: row.get(1)?,
                            window_length_days: row.get(2)?,
                            platform: platform_column(row, 3)?,
                            game: row.get(4)?,
                            organizer: row.get(5)?,
                            reason,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    async fn try_acquire_lease(&self, holder: &str, now: i64, ttl_secs: i64) -> Result<bool, StoreError> {
        let holder = holder.to_string();
        self.conn
            .call(move |conn| {
                let changed = conn.execute(
                    "INSERT INTO aggregator_lease (name, holder, expires_at)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT(name) DO UPDATE SET
                        holder = excluded.holder,
                        expires_at = excluded.expires_at
                     WHERE aggregator_lease.expires_at <= ?4
                        OR aggregator_lease.holder = excluded.holder",
                    params![LEASE_NAME, holder, now + ttl_secs, now],
                )?;
                Ok(changed > 0)
            })
            .await
    }

    async fn release_lease(&self, holder: &str) -> Result<(), StoreError> {
        let holder = holder.to_string();
        self.conn
            .call(move |conn| {
                let current: Option<String> = conn
                    .query_row(
                        "SELECT holder FROM aggregator_lease WHERE name = ?1",
                        params![LEASE_NAME],
                        |row| row.get(0),
                    )
                    .optional()?;
                if current.as_deref() == Some(holder.as_str()) {
                    conn.execute(
                        "DELETE FROM aggregator_lease WHERE name = ?1 AND holder = ?2",
                        params![LEASE_NAME, holder],
                    )?;
                } else {
                    log::warn!("⚠️  Lease no longer held by {}; nothing to release", holder);
                }
                Ok(())
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

    async fn channels(&self, platform: Option<Platform>) -> Result<Vec<ChannelInfo>, StoreError> {
        self.conn
            .call(move |conn| {
                let sql = format!(
                    "SELECT {} FROM channels WHERE ?1 IS NULL OR platform = ?1
                     ORDER BY platform, channel_id",
                    CHANNEL_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![platform.map(|p| p.as_str())], channel_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> SqliteDurableStore {
        SqliteDurableStore::open_in_memory(Duration::from_secs(5)).unwrap()
    }

    fn row(window_start: i64, length: u32, game: &str, viewer_hours: f64) -> WindowedAggregate {
        WindowedAggregate {
            window_start,
            window_length_days: length,
            game: game.to_string(),
            organizer: "ESL".to_string(),
            platform: Platform::Twitch,
            viewer_hours,
            peak_viewers: 150,
            avg_viewers: viewer_hours / (length as f64 * 24.0),
            sample_count: 2,
        }
    }

    #[tokio::test]
    async fn test_upsert_replaces_existing_row() {
        let store = store();
        store.upsert_aggregate(row(0, 1, "Dota 2", 10.0)).await.unwrap();
        store.upsert_aggregate(row(0, 1, "Dota 2", 12.5)).await.unwrap();
        store.upsert_aggregate(row(0, 3, "Dota 2", 30.0)).await.unwrap();

        let daily = store.aggregates_for_window(1, 0).await.unwrap();
        assert_eq!(daily, vec![row(0, 1, "Dota 2", 12.5)]);
        assert!(store.has_window(0, 3).await.unwrap());
        assert!(!store.has_window(0, 7).await.unwrap());
    }

    #[tokio::test]
    async fn test_daily_range_and_latest_window() {
        let store = store();
        for day in 0..4 {
            store
                .upsert_aggregate(row(day * 86_400, 1, "Dota 2", 1.0))
                .await
                .unwrap();
        }
        store.upsert_aggregate(row(86_400, 3, "Dota 2", 3.0)).await.unwrap();

        let rows = store.daily_aggregates(86_400, 3 * 86_400).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.window_length_days == 1));

        assert_eq!(store.latest_window_start(1).await.unwrap(), Some(3 * 86_400));
        assert_eq!(store.latest_window_start(3).await.unwrap(), Some(86_400));
        assert_eq!(store.latest_window_start(90).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_faults_are_append_only() {
        let store = store();
        let fault = AggregationFault {
            detected_at: 100,
            window_start: 0,
            window_length_days: 1,
            platform: Platform::YouTube,
            game: "unknown".to_string(),
            organizer: "unknown".to_string(),
            reason: InconsistencyReason::ClockSkew,
        };
        store.record_fault(fault.clone()).await.unwrap();
        store.record_fault(fault.clone()).await.unwrap();

        assert_eq!(store.faults_since(0).await.unwrap().len(), 2);
        assert!(store.faults_since(101).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lease_excludes_second_holder_until_expiry() {
        let store = store();
        assert!(store.try_acquire_lease("a", 1_000, 900).await.unwrap());
        assert!(!store.try_acquire_lease("b", 1_100, 900).await.unwrap());
        // Renewal by the owner
        assert!(store.try_acquire_lease("a", 1_200, 900).await.unwrap());
        // Expired lease is taken over
        assert!(store.try_acquire_lease("b", 2_100, 900).await.unwrap());
        assert!(!store.try_acquire_lease("a", 2_200, 900).await.unwrap());

        // Releasing someone else's lease does nothing
        store.release_lease("a").await.unwrap();
        assert!(!store.try_acquire_lease("a", 2_300, 900).await.unwrap());

        store.release_lease("b").await.unwrap();
        assert!(store.try_acquire_lease("a", 2_400, 900).await.unwrap());
    }

    #[tokio::test]
    async fn test_retain_groups_drops_only_missing_groups() {
        let store = store();
        store.upsert_aggregate(row(0, 1, "unmapped:VALORANT", 4.0)).await.unwrap();
        store.upsert_aggregate(row(0, 1, "Valorant", 4.0)).await.unwrap();
        store.upsert_aggregate(row(0, 3, "unmapped:VALORANT", 4.0)).await.unwrap();

        let keep = vec![row(0, 1, "Valorant", 4.0).group_key()];
        assert_eq!(store.retain_groups(0, 1, keep).await.unwrap(), 1);

        let daily = store.aggregates_for_window(1, 0).await.unwrap();
        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].game, "Valorant");
        // Other windows untouched
        assert_eq!(store.aggregates_for_window(3, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_channels_filter_by_platform() {
        let store = store();
        let channel = |platform: Platform, id: &str| ChannelInfo {
            platform,
            channel_id: id.to_string(),
            display_name: id.to_string(),
            language: Some("en".to_string()),
            last_title: "Grand final".to_string(),
            last_game: "Counter-Strike".to_string(),
            first_seen_at: 10,
            last_seen_at: 20,
            peak_viewers: 1_000,
        };
        store
            .upsert_channels(vec![
                channel(Platform::Twitch, "esl_csgo"),
                channel(Platform::YouTube, "UCx"),
            ])
            .await
            .unwrap();

        assert_eq!(store.channels(None).await.unwrap().len(), 2);
        let youtube = store.channels(Some(Platform::YouTube)).await.unwrap();
        assert_eq!(youtube.len(), 1);
        assert_eq!(youtube[0].channel_id, "UCx");
    }

    #[tokio::test]
    async fn test_rows_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("durable.db");
        {
            let store = SqliteDurableStore::open(&path, Duration::from_secs(5)).unwrap();
            store.upsert_aggregate(row(0, 1, "Dota 2", 1.5)).await.unwrap();
        }
        let store = SqliteDurableStore::open(&path, Duration::from_secs(5)).unwrap();
        assert_eq!(store.aggregates_for_window(1, 0).await.unwrap().len(), 1);
    }
}
