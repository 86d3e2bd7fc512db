use super::integrate::{dedup_snapshots, integrate_day, GroupOutcome};
use super::window::{window_hours, windows_containing, DayWindow, RollupWindow};
use crate::config::AggregatorConfig;
use crate::db::StoreError;
use crate::durable::DurableStore;
use crate::identity::IdentityMap;
use crate::staging::StagingStore;
use crate::types::{
    floor_day, AggregationFault, GroupKey, InconsistencyReason, StagedSnapshot, WindowedAggregate,
    SECONDS_PER_DAY, SECONDS_PER_HOUR,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AggregatorError {
    #[error("staging store: {0}")]
    Staging(#[source] StoreError),

    #[error("durable store: {0}")]
    Durable(#[source] StoreError),

    /// Another instance took over the lease mid-run; nothing further was written
    #[error("aggregator lease lost by {holder}")]
    LeaseLost { holder: String },
}

/// Parameters of one aggregation run; passed explicitly into every step
#[derive(Debug, Clone)]
pub struct AggregationSettings {
    /// Roll-up lengths in days (> 1)
    pub window_lengths: Vec<u32>,
    pub max_gap_secs: i64,
    pub retention_secs: i64,
    pub lease_ttl_secs: i64,
}

impl From<&AggregatorConfig> for AggregationSettings {
    fn from(config: &AggregatorConfig) -> Self {
        Self {
            window_lengths: config.window_lengths.clone(),
            max_gap_secs: config.max_gap_secs,
            retention_secs: config.retention_secs,
            lease_ttl_secs: config.lease_ttl_secs,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// Another instance held the lease; nothing was done
    pub lease_busy: bool,
    pub days: usize,
    pub groups_written: usize,
    pub groups_failed: usize,
    pub faults: usize,
    pub rollups_written: usize,
    pub rollups_failed: usize,
    pub snapshots_marked: usize,
    pub purged: usize,
    pub channels_synced: usize,
}

/// Compacts staged snapshots into daily rows and trailing-window roll-ups
pub struct Aggregator {
    staging: Arc<dyn StagingStore>,
    durable: Arc<dyn DurableStore>,
    identity: Arc<IdentityMap>,
    settings: AggregationSettings,
    holder: String,
}

impl Aggregator {
    pub fn new(
        staging: Arc<dyn StagingStore>,
        durable: Arc<dyn DurableStore>,
        identity: Arc<IdentityMap>,
        mut settings: AggregationSettings,
    ) -> Self {
        if settings.max_gap_secs > SECONDS_PER_DAY {
            log::warn!(
                "⚠️  max gap of {}s exceeds one day; clamping to {}s",
                settings.max_gap_secs,
                SECONDS_PER_DAY
            );
            settings.max_gap_secs = SECONDS_PER_DAY;
        }
        let holder = format!(
            "aggregator-{}-{:08x}",
            std::process::id(),
            rand::random::<u32>()
        );
        Self {
            staging,
            durable,
            identity,
            settings,
            holder,
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// One aggregation run at wall-clock time `now`.
    ///
    /// Skipped when another aggregator holds the lease. The lease is renewed
    /// before every write and the run stops with `LeaseLost` if renewal
    /// fails. The lease is released whether or not the run succeeds.
    pub async fn run(&self, now: i64) -> Result<RunReport, AggregatorError> {
        let started = Instant::now();
        let acquired = self
            .durable
            .try_acquire_lease(&self.holder, now, self.settings.lease_ttl_secs)
            .await
            .map_err(AggregatorError::Durable)?;
        if !acquired {
            log::info!("🔒 Aggregator lease held by another instance; skipping run");
            return Ok(RunReport {
                lease_busy: true,
                ..RunReport::default()
            });
        }

        let result = self.run_locked(now, started).await;

        if let Err(e) = self.durable.release_lease(&self.holder).await {
            log::warn!("⚠️  Failed to release aggregator lease: {}", e);
        }
        result
    }

    /// Extend the lease to `ttl` past the current time, which is `now` plus
    /// the time this run has taken so far.
    async fn renew_lease(&self, now: i64, started: Instant) -> Result<(), AggregatorError> {
        let elapsed = i64::try_from(started.elapsed().as_secs()).unwrap_or(i64::MAX);
        let held = self
            .durable
            .try_acquire_lease(&self.holder, now.saturating_add(elapsed), self.settings.lease_ttl_secs)
            .await
            .map_err(AggregatorError::Durable)?;
        if held {
            Ok(())
        } else {
            log::error!("❌ Aggregator lease taken over while {} was running; stopping", self.holder);
            Err(AggregatorError::LeaseLost {
                holder: self.holder.clone(),
            })
        }
    }

    async fn run_locked(&self, now: i64, started: Instant) -> Result<RunReport, AggregatorError> {
        let mut report = RunReport::default();
        let today = DayWindow::containing(now);
        let horizon = floor_day(now - self.settings.retention_secs);

        report.channels_synced = self.sync_channels(horizon).await;

        let unprocessed = self
            .staging
            .read_unprocessed(0)
            .await
            .map_err(AggregatorError::Staging)?;

        // An interval may cross midnight, so a new snapshot within max_gap of
        // a day boundary also dirties the neighbouring day
        let max_gap = self.settings.max_gap_secs;
        let mut by_day: BTreeMap<i64, Vec<StagedSnapshot>> = BTreeMap::new();
        for snapshot in unprocessed {
            let t = snapshot.snapshot.observed_at;
            let day_start = floor_day(t);
            if t - max_gap < day_start && day_start - SECONDS_PER_DAY >= horizon {
                by_day.entry(day_start - SECONDS_PER_DAY).or_default();
            }
            if t + max_gap > day_start + SECONDS_PER_DAY
                && day_start < today.start
                && day_start + SECONDS_PER_DAY >= horizon
            {
                by_day.entry(day_start + SECONDS_PER_DAY).or_default();
            }
            by_day.entry(day_start).or_default().push(snapshot);
        }

        if !by_day.is_empty() {
            log::info!(
                "🔄 Aggregating {} day(s) with unprocessed snapshots",
                by_day.len()
            );
        }

        for (day_start, pending) in by_day {
            self.renew_lease(now, started).await?;
            report.days += 1;
            let day = DayWindow::starting_at(day_start);

            let recomputable = day_start >= horizon
                || !self
                    .durable
                    .has_window(day_start, 1)
                    .await
                    .map_err(AggregatorError::Durable)?;

            if recomputable {
                self.aggregate_day(day, today, &pending, now, started, &mut report)
                    .await?;
            } else {
                self.flag_late_day(day, &pending, now, started, &mut report)
                    .await?;
            }
        }

        self.renew_lease(now, started).await?;
        match self.staging.purge_processed_before(horizon - max_gap).await {
            Ok(purged) => report.purged = purged,
            Err(e) => log::warn!("⚠️  Purge of processed snapshots failed: {}", e),
        }

        log::info!(
            "✅ Aggregation run: {} days, {} groups written, {} failed, {} faults, {} roll-ups, {} snapshots marked, {} purged, {} channels synced",
            report.days,
            report.groups_written,
            report.groups_failed,
            report.faults,
            report.rollups_written,
            report.snapshots_marked,
            report.purged,
            report.channels_synced
        );
        Ok(report)
    }

    /// Copy channels seen since `since` from staging into the durable
    /// registry. Failures are logged; the next run copies them again.
    async fn sync_channels(&self, since: i64) -> usize {
        let channels = match self.staging.channels_seen_since(since).await {
            Ok(channels) => channels,
            Err(e) => {
                log::warn!("⚠️  Could not read staged channels: {}", e);
                return 0;
            }
        };
        match self.durable.upsert_channels(channels).await {
            Ok(synced) => synced,
            Err(e) => {
                log::warn!("⚠️  Channel registry sync failed: {}", e);
                0
            }
        }
    }

    /// Recompute day `day` from every retained snapshot, then its roll-ups.
    async fn aggregate_day(
        &self,
        day: DayWindow,
        today: DayWindow,
        pending: &[StagedSnapshot],
        now: i64,
        started: Instant,
        report: &mut RunReport,
    ) -> Result<(), AggregatorError> {
        let max_gap = self.settings.max_gap_secs;
        let rows = self
            .staging
            .read_range(day.start - max_gap, day.end + max_gap)
            .await
            .map_err(AggregatorError::Staging)?;

        let (mut rows, replaced) = dedup_snapshots(rows);
        for row in rows.iter_mut() {
            row.snapshot.game = self.identity.resolve_stored_game(&row.snapshot.game);
            row.snapshot.organizer = self.identity.resolve_stored_organizer(&row.snapshot.organizer);
        }

        let results = integrate_day(&rows, &replaced, day, max_gap);
        let mut settled: HashSet<i64> = HashSet::new();
        let mut keep = Vec::new();
        let mut day_complete = true;

        for (key, result) in results {
            match result.outcome {
                GroupOutcome::Metrics(metrics) => {
                    let viewer_hours = metrics.viewer_hours();
                    let row = WindowedAggregate {
                        window_start: day.start,
                        window_length_days: 1,
                        game: key.game.clone(),
                        organizer: key.organizer.clone(),
                        platform: key.platform,
                        viewer_hours,
                        peak_viewers: metrics.peak_viewers,
                        avg_viewers: viewer_hours / window_hours(1),
                        sample_count: metrics.sample_count,
                    };
                    self.renew_lease(now, started).await?;
                    match self.durable.upsert_aggregate(row).await {
                        Ok(()) => {
                            report.groups_written += 1;
                            settled.extend(result.snapshot_ids);
                            keep.push(key);
                        }
                        Err(e) => {
                            log::error!("❌ Daily row {} for {} not written: {}", day, key, e);
                            report.groups_failed += 1;
                            day_complete = false;
                        }
                    }
                }
                GroupOutcome::Inconsistent(reason) => {
                    log::warn!("⚠️  Skipping {} on {}: {}", key, day, reason);
                    if self.record_fault(&key, day.start, 1, reason, now).await {
                        report.faults += 1;
                        settled.extend(result.snapshot_ids);
                    } else {
                        report.groups_failed += 1;
                        day_complete = false;
                    }
                    // A skipped group keeps whatever row it already had
                    keep.push(key);
                }
            }
        }

        if day_complete {
            if let Err(e) = self.durable.retain_groups(day.start, 1, keep).await {
                log::warn!("⚠️  Could not prune superseded daily rows for {}: {}", day, e);
            }
        }

        let rollups_ok = self.roll_up(day, today, now, started, report).await?;

        if !rollups_ok {
            log::warn!(
                "⚠️  Roll-ups containing {} incomplete; its snapshots stay unprocessed",
                day
            );
            return Ok(());
        }

        let ids: Vec<i64> = pending
            .iter()
            .map(|s| s.id)
            .filter(|id| settled.contains(id))
            .collect();
        self.renew_lease(now, started).await?;
        match self.staging.mark_processed(ids).await {
            Ok(marked) => report.snapshots_marked += marked,
            Err(e) => log::warn!("⚠️  Failed to mark snapshots of {} processed: {}", day, e),
        }
        Ok(())
    }

    /// Rebuild every configured trailing window that contains `day` from
    /// daily rows. Returns false if any write failed.
    async fn roll_up(
        &self,
        day: DayWindow,
        today: DayWindow,
        now: i64,
        started: Instant,
        report: &mut RunReport,
    ) -> Result<bool, AggregatorError> {
        let mut all_ok = true;

        for &length in &self.settings.window_lengths {
            for window in windows_containing(day, length, today) {
                self.renew_lease(now, started).await?;
                match self.write_rollup(window).await {
                    Ok(written) => report.rollups_written += written,
                    Err(e) => {
                        log::error!(
                            "❌ {}d roll-up starting {} failed: {}",
                            length,
                            window.start,
                            e
                        );
                        report.rollups_failed += 1;
                        all_ok = false;
                    }
                }
            }
        }
        Ok(all_ok)
    }

    async fn write_rollup(&self, window: RollupWindow) -> Result<usize, StoreError> {
        let dailies = self.durable.daily_aggregates(window.start, window.end()).await?;

        // (viewer-seconds, peak, samples); daily viewer-hours are exact
        // multiples of 1/3600 so summing seconds keeps roll-ups exact
        let mut sums: BTreeMap<GroupKey, (i64, i64, i64)> = BTreeMap::new();
        for daily in &dailies {
            let entry = sums.entry(daily.group_key()).or_insert((0, 0, 0));
            let seconds = (daily.viewer_hours * SECONDS_PER_HOUR as f64).round() as i64;
            entry.0 = entry.0.saturating_add(seconds);
            entry.1 = entry.1.max(daily.peak_viewers);
            entry.2 = entry.2.saturating_add(daily.sample_count);
        }

        let hours = window.hours();
        let keys: Vec<GroupKey> = sums.keys().cloned().collect();
        for (key, (seconds, peak, samples)) in sums {
            let viewer_hours = seconds as f64 / SECONDS_PER_HOUR as f64;
            self.durable
                .upsert_aggregate(WindowedAggregate {
                    window_start: window.start,
                    window_length_days: window.length_days,
                    game: key.game,
                    organizer: key.organizer,
                    platform: key.platform,
                    viewer_hours,
                    peak_viewers: peak,
                    avg_viewers: viewer_hours / hours,
                    sample_count: samples,
                })
                .await?;
        }

        let written = keys.len();
        self.durable
            .retain_groups(window.start, window.length_days, keys)
            .await?;
        Ok(written)
    }

    /// Snapshots for a day whose input has already been purged cannot be
    /// merged into its rows. Record one fault per group and settle them.
    async fn flag_late_day(
        &self,
        day: DayWindow,
        pending: &[StagedSnapshot],
        now: i64,
        started: Instant,
        report: &mut RunReport,
    ) -> Result<(), AggregatorError> {
        log::warn!(
            "⚠️  {} late snapshot(s) for {}, which is past the retention horizon",
            pending.len(),
            day
        );

        let mut groups: BTreeMap<GroupKey, Vec<i64>> = BTreeMap::new();
        for s in pending {
            let key = GroupKey {
                platform: s.snapshot.platform,
                game: self.identity.resolve_stored_game(&s.snapshot.game),
                organizer: self.identity.resolve_stored_organizer(&s.snapshot.organizer),
            };
            groups.entry(key).or_default().push(s.id);
        }

        self.renew_lease(now, started).await?;
        let mut settled = Vec::new();
        for (key, ids) in groups {
            if self
                .record_fault(&key, day.start, 1, InconsistencyReason::LateBeyondRetention, now)
                .await
            {
                report.faults += 1;
                settled.extend(ids);
            } else {
                report.groups_failed += 1;
            }
        }

        match self.staging.mark_processed(settled).await {
            Ok(marked) => report.snapshots_marked += marked,
            Err(e) => log::warn!("⚠️  Failed to mark late snapshots processed: {}", e),
        }
        Ok(())
    }

    async fn record_fault(
        &self,
        key: &GroupKey,
        window_start: i64,
        window_length_days: u32,
        reason: InconsistencyReason,
        now: i64,
    ) -> bool {
        let fault = AggregationFault {
            detected_at: now,
            window_start,
            window_length_days,
            platform: key.platform,
            game: key.game.clone(),
            organizer: key.organizer.clone(),
            reason,
        };
        match self.durable.record_fault(fault).await {
            Ok(()) => true,
            Err(e) => {
                log::error!("❌ Failed to record fault for {}: {}", key, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable::SqliteDurableStore;
    use crate::identity::IdentityFile;
    use crate::staging::SqliteStagingStore;
    use crate::types::{ChannelInfo, CollectorStatus, Platform, Snapshot};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    const DAY: i64 = SECONDS_PER_DAY;
    const TIMEOUT: Duration = Duration::from_secs(5);

    fn settings(retention_days: i64) -> AggregationSettings {
        AggregationSettings {
            window_lengths: vec![7],
            max_gap_secs: 180,
            retention_secs: retention_days * DAY,
            lease_ttl_secs: 300,
        }
    }

    fn snap(stream: &str, game: &str, viewers: i64, t: i64) -> Snapshot {
        Snapshot {
            platform: Platform::Twitch,
            stream_id: stream.to_string(),
            game: game.to_string(),
            organizer: "unknown".to_string(),
            viewer_count: viewers,
            observed_at: t,
            collected_at: t + 2,
        }
    }

    struct Harness {
        staging: Arc<SqliteStagingStore>,
        durable: Arc<SqliteDurableStore>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                staging: Arc::new(SqliteStagingStore::open_in_memory(TIMEOUT).unwrap()),
                durable: Arc::new(SqliteDurableStore::open_in_memory(TIMEOUT).unwrap()),
            }
        }

        fn aggregator(&self, identity: IdentityMap, settings: AggregationSettings) -> Aggregator {
            Aggregator::new(
                self.staging.clone(),
                self.durable.clone(),
                Arc::new(identity),
                settings,
            )
        }

        async fn daily(&self, day_start: i64) -> Vec<WindowedAggregate> {
            self.durable.aggregates_for_window(1, day_start).await.unwrap()
        }
    }

    fn empty_identity() -> IdentityMap {
        IdentityMap::from_file_contents(IdentityFile::default())
    }

    #[tokio::test]
    async fn test_two_snapshots_one_minute_apart() {
        let h = Harness::new();
        let t0 = DAY + 1_000;
        h.staging
            .append(vec![snap("s1", "Dota 2", 100, t0), snap("s1", "Dota 2", 150, t0 + 60)])
            .await
            .unwrap();

        let aggregator = h.aggregator(empty_identity(), settings(30));
        let report = aggregator.run(3 * DAY + 43_200).await.unwrap();

        assert!(!report.lease_busy);
        assert_eq!(report.groups_written, 1);
        assert_eq!(report.snapshots_marked, 2);
        // 7-day windows ending on day 1, 2 and 3
        assert_eq!(report.rollups_written, 3);

        let rows = h.daily(DAY).await;
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert!((row.viewer_hours - 100.0 / 60.0).abs() < 1e-9);
        assert_eq!(row.peak_viewers, 150);
        assert_eq!(row.sample_count, 2);
        assert!((row.avg_viewers - row.viewer_hours / 24.0).abs() < 1e-12);

        let weekly = h.durable.aggregates_for_window(7, DAY - 6 * DAY).await.unwrap();
        assert_eq!(weekly.len(), 1);
        assert!((weekly[0].viewer_hours - row.viewer_hours).abs() < 1e-9);
        assert!((weekly[0].avg_viewers - row.viewer_hours / 168.0).abs() < 1e-12);

        assert!(h.staging.read_unprocessed(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_late_arrival_matches_single_pass() {
        let t0 = DAY + 5_000;
        let now = 2 * DAY + 100;

        let incremental = Harness::new();
        let aggregator = incremental.aggregator(empty_identity(), settings(30));
        incremental
            .staging
            .append(vec![snap("s1", "Dota 2", 100, t0), snap("s1", "Dota 2", 150, t0 + 120)])
            .await
            .unwrap();
        aggregator.run(now).await.unwrap();
        assert!((incremental.daily(DAY).await[0].viewer_hours - 12_000.0 / 3_600.0).abs() < 1e-9);

        incremental
            .staging
            .append(vec![snap("s1", "Dota 2", 300, t0 + 60)])
            .await
            .unwrap();
        aggregator.run(now + 60).await.unwrap();

        let single = Harness::new();
        single
            .staging
            .append(vec![
                snap("s1", "Dota 2", 100, t0),
                snap("s1", "Dota 2", 300, t0 + 60),
                snap("s1", "Dota 2", 150, t0 + 120),
            ])
            .await
            .unwrap();
        single
            .aggregator(empty_identity(), settings(30))
            .run(now + 60)
            .await
            .unwrap();

        let a = incremental.daily(DAY).await;
        let b = single.daily(DAY).await;
        assert_eq!(a, b);
        assert!((a[0].viewer_hours - 24_000.0 / 3_600.0).abs() < 1e-9);
        assert_eq!(a[0].peak_viewers, 300);
        assert_eq!(a[0].sample_count, 3);

        for end_day in [DAY, 2 * DAY] {
            let start = end_day - 6 * DAY;
            assert_eq!(
                incremental.durable.aggregates_for_window(7, start).await.unwrap(),
                single.durable.aggregates_for_window(7, start).await.unwrap()
            );
        }
    }

    #[tokio::test]
    async fn test_rerun_without_new_input_changes_nothing() {
        let h = Harness::new();
        h.staging
            .append(vec![snap("s1", "Dota 2", 40, DAY), snap("s1", "Dota 2", 60, DAY + 90)])
            .await
            .unwrap();
        let aggregator = h.aggregator(empty_identity(), settings(30));

        aggregator.run(DAY + 7_200).await.unwrap();
        let first = h.daily(DAY).await;
        let report = aggregator.run(DAY + 7_200).await.unwrap();

        assert_eq!(report.days, 0);
        assert_eq!(h.daily(DAY).await, first);
    }

    #[tokio::test]
    async fn test_run_skipped_while_lease_held() {
        let h = Harness::new();
        h.staging
            .append(vec![snap("s1", "Dota 2", 10, DAY)])
            .await
            .unwrap();
        let now = DAY + 600;
        assert!(h.durable.try_acquire_lease("someone-else", now, 300).await.unwrap());

        let aggregator = h.aggregator(empty_identity(), settings(30));
        let report = aggregator.run(now).await.unwrap();

        assert!(report.lease_busy);
        assert_eq!(h.staging.read_unprocessed(0).await.unwrap().len(), 1);
        assert!(h.daily(DAY).await.is_empty());

        // Lease expired: the next run proceeds
        let report = aggregator.run(now + 301).await.unwrap();
        assert!(!report.lease_busy);
        assert_eq!(h.daily(DAY).await.len(), 1);
    }

    #[tokio::test]
    async fn test_late_snapshot_beyond_retention_is_flagged() {
        let h = Harness::new();
        h.staging
            .append(vec![snap("s1", "Dota 2", 100, DAY + 100), snap("s1", "Dota 2", 100, DAY + 160)])
            .await
            .unwrap();
        let aggregator = h.aggregator(empty_identity(), settings(2));
        aggregator.run(DAY + 1_000).await.unwrap();
        let before = h.daily(DAY).await;

        let now = 10 * DAY;
        let mut late = snap("s1", "Dota 2", 5_000, DAY + 130);
        late.collected_at = now - 10;
        h.staging.append(vec![late]).await.unwrap();

        let report = aggregator.run(now).await.unwrap();
        assert_eq!(report.faults, 1);
        assert_eq!(h.daily(DAY).await, before);

        let faults = h.durable.faults_since(0).await.unwrap();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].reason, InconsistencyReason::LateBeyondRetention);
        assert_eq!(faults[0].window_start, DAY);
        assert!(h.staging.read_unprocessed(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_processed_snapshots_purged_past_retention() {
        let h = Harness::new();
        h.staging
            .append(vec![snap("s1", "Dota 2", 100, DAY + 100), snap("s2", "Dota 2", 10, 9 * DAY)])
            .await
            .unwrap();
        let aggregator = h.aggregator(empty_identity(), settings(2));

        let report = aggregator.run(9 * DAY + 500).await.unwrap();

        // Day 1 is past the horizon but was never written, so it is computed
        // once, then its input is purged
        assert_eq!(h.daily(DAY).await.len(), 1);
        assert_eq!(report.purged, 1);
        assert_eq!(h.staging.read_range(0, 2 * DAY).await.unwrap().len(), 0);
        assert_eq!(h.staging.read_range(9 * DAY, 10 * DAY).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_overflow_group_is_skipped_with_fault() {
        let h = Harness::new();
        h.staging
            .append(vec![
                snap("big", "Dota 2", i64::MAX / 10, DAY),
                snap("big", "Dota 2", 1, DAY + 60),
                snap("ok", "Hearthstone", 10, DAY),
                snap("ok", "Hearthstone", 10, DAY + 60),
            ])
            .await
            .unwrap();
        let aggregator = h.aggregator(empty_identity(), settings(30));

        let report = aggregator.run(DAY + 3_600).await.unwrap();

        assert_eq!(report.groups_written, 1);
        assert_eq!(report.faults, 1);
        let rows = h.daily(DAY).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].game, "Hearthstone");
        let faults = h.durable.faults_since(0).await.unwrap();
        assert_eq!(faults[0].reason, InconsistencyReason::ArithmeticOverflow);
        assert_eq!(faults[0].game, "Dota 2");
    }

    #[tokio::test]
    async fn test_interval_crossing_midnight_updates_previous_day() {
        let h = Harness::new();
        let aggregator = h.aggregator(empty_identity(), settings(30));
        h.staging
            .append(vec![snap("s1", "Dota 2", 10, 2 * DAY - 60)])
            .await
            .unwrap();
        aggregator.run(2 * DAY + 600).await.unwrap();
        assert!(h.daily(DAY).await[0].viewer_hours.abs() < 1e-12);

        // The next observation closes the interval: 60 seconds land on day 1
        h.staging
            .append(vec![snap("s1", "Dota 2", 10, 2 * DAY + 60)])
            .await
            .unwrap();
        aggregator.run(2 * DAY + 900).await.unwrap();

        let day1 = h.daily(DAY).await;
        assert!((day1[0].viewer_hours - 600.0 / 3_600.0).abs() < 1e-9);
        let day2 = h.daily(2 * DAY).await;
        assert!((day2[0].viewer_hours - 600.0 / 3_600.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_identity_update_regroups_unmapped_names() {
        let h = Harness::new();
        h.staging
            .append(vec![
                snap("s1", "unmapped:DOTA2", 100, DAY),
                snap("s1", "unmapped:DOTA2", 100, DAY + 60),
            ])
            .await
            .unwrap();
        h.aggregator(empty_identity(), settings(30))
            .run(DAY + 600)
            .await
            .unwrap();
        assert_eq!(h.daily(DAY).await[0].game, "unmapped:DOTA2");

        let mut file = IdentityFile::default();
        file.games.insert("Dota 2".to_string(), vec!["dota2".to_string()]);
        h.staging
            .append(vec![snap("s1", "unmapped:DOTA2", 100, DAY + 120)])
            .await
            .unwrap();
        h.aggregator(IdentityMap::from_file_contents(file), settings(30))
            .run(DAY + 900)
            .await
            .unwrap();

        let rows = h.daily(DAY).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].game, "Dota 2");
        assert_eq!(rows[0].sample_count, 3);

        let weekly = h.durable.aggregates_for_window(7, DAY - 6 * DAY).await.unwrap();
        assert_eq!(weekly.len(), 1);
        assert_eq!(weekly[0].game, "Dota 2");
    }

    /// Rejects every write for one game
    struct FailingDurable {
        inner: SqliteDurableStore,
        failing_game: &'static str,
    }

    #[async_trait]
    impl DurableStore for FailingDurable {
        async fn upsert_aggregate(&self, row: WindowedAggregate) -> Result<(), StoreError> {
            if row.game == self.failing_game {
                return Err(StoreError::Unavailable("disk full".to_string()));
            }
            self.inner.upsert_aggregate(row).await
        }

        async fn retain_groups(
            &self,
            window_start: i64,
            window_length_days: u32,
            keep: Vec<GroupKey>,
        ) -> Result<usize, StoreError> {
            self.inner.retain_groups(window_start, window_length_days, keep).await
        }

        async fn aggregates_for_window(
            &self,
            window_length_days: u32,
            window_start: i64,
        ) -> Result<Vec<WindowedAggregate>, StoreError> {
            self.inner.aggregates_for_window(window_length_days, window_start).await
        }

        async fn daily_aggregates(&self, from: i64, to: i64) -> Result<Vec<WindowedAggregate>, StoreError> {
            self.inner.daily_aggregates(from, to).await
        }

        async fn has_window(&self, window_start: i64, window_length_days: u32) -> Result<bool, StoreError> {
            self.inner.has_window(window_start, window_length_days).await
        }

        async fn latest_window_start(&self, window_length_days: u32) -> Result<Option<i64>, StoreError> {
            self.inner.latest_window_start(window_length_days).await
        }

        async fn record_fault(&self, fault: AggregationFault) -> Result<(), StoreError> {
            self.inner.record_fault(fault).await
        }

        async fn faults_since(&self, since: i64) -> Result<Vec<AggregationFault>, StoreError> {
            self.inner.faults_since(since).await
        }

        async fn try_acquire_lease(&self, holder: &str, now: i64, ttl_secs: i64) -> Result<bool, StoreError> {
            self.inner.try_acquire_lease(holder, now, ttl_secs).await
        }

        async fn release_lease(&self, holder: &str) -> Result<(), StoreError> {
            self.inner.release_lease(holder).await
        }

        async fn upsert_channels(&self, channels: Vec<ChannelInfo>) -> Result<usize, StoreError> {
            self.inner.upsert_channels(channels).await
        }

        async fn channels(&self, platform: Option<Platform>) -> Result<Vec<ChannelInfo>, StoreError> {
            self.inner.channels(platform).await
        }
    }

    #[tokio::test]
    async fn test_failed_group_does_not_block_others() {
        let staging = Arc::new(SqliteStagingStore::open_in_memory(TIMEOUT).unwrap());
        let durable = Arc::new(FailingDurable {
            inner: SqliteDurableStore::open_in_memory(TIMEOUT).unwrap(),
            failing_game: "Dota 2",
        });
        staging
            .append(vec![
                snap("a", "Dota 2", 100, DAY),
                snap("a", "Dota 2", 100, DAY + 60),
                snap("b", "Hearthstone", 20, DAY),
                snap("b", "Hearthstone", 20, DAY + 60),
            ])
            .await
            .unwrap();

        let aggregator = Aggregator::new(
            staging.clone(),
            durable.clone(),
            Arc::new(empty_identity()),
            settings(30),
        );
        let report = aggregator.run(DAY + 600).await.unwrap();

        assert_eq!(report.groups_written, 1);
        assert_eq!(report.groups_failed, 1);

        let rows = durable.aggregates_for_window(1, DAY).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].game, "Hearthstone");

        // The failed group's snapshots are retried next run
        let pending = staging.read_unprocessed(0).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(|s| s.snapshot.game == "Dota 2"));
    }

    /// Loses the lease to another instance right after the first row lands
    struct StolenLeaseDurable {
        inner: SqliteDurableStore,
        stolen: AtomicBool,
        writes_after_loss: AtomicUsize,
    }

    #[async_trait]
    impl DurableStore for StolenLeaseDurable {
        async fn upsert_aggregate(&self, row: WindowedAggregate) -> Result<(), StoreError> {
            if self.stolen.load(Ordering::SeqCst) {
                self.writes_after_loss.fetch_add(1, Ordering::SeqCst);
            }
            self.inner.upsert_aggregate(row).await?;
            self.stolen.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn retain_groups(
            &self,
            window_start: i64,
            window_length_days: u32,
            keep: Vec<GroupKey>,
        ) -> Result<usize, StoreError> {
            if self.stolen.load(Ordering::SeqCst) {
                self.writes_after_loss.fetch_add(1, Ordering::SeqCst);
            }
            self.inner.retain_groups(window_start, window_length_days, keep).await
        }

        async fn aggregates_for_window(
            &self,
            window_length_days: u32,
            window_start: i64,
        ) -> Result<Vec<WindowedAggregate>, StoreError> {
            self.inner.aggregates_for_window(window_length_days, window_start).await
        }

        async fn daily_aggregates(&self, from: i64, to: i64) -> Result<Vec<WindowedAggregate>, StoreError> {
            self.inner.daily_aggregates(from, to).await
        }

        async fn has_window(&self, window_start: i64, window_length_days: u32) -> Result<bool, StoreError> {
            self.inner.has_window(window_start, window_length_days).await
        }

        async fn latest_window_start(&self, window_length_days: u32) -> Result<Option<i64>, StoreError> {
            self.inner.latest_window_start(window_length_days).await
        }

        async fn record_fault(&self, fault: AggregationFault) -> Result<(), StoreError> {
            self.inner.record_fault(fault).await
        }

        async fn faults_since(&self, since: i64) -> Result<Vec<AggregationFault>, StoreError> {
            self.inner.faults_since(since).await
        }

        async fn try_acquire_lease(&self, holder: &str, now: i64, ttl_secs: i64) -> Result<bool, StoreError> {
            if self.stolen.load(Ordering::SeqCst) {
                return Ok(false);
            }
            self.inner.try_acquire_lease(holder, now, ttl_secs).await
        }

        async fn release_lease(&self, holder: &str) -> Result<(), StoreError> {
            self.inner.release_lease(holder).await
        }

        async fn upsert_channels(&self, channels: Vec<ChannelInfo>) -> Result<usize, StoreError> {
            self.inner.upsert_channels(channels).await
        }

        async fn channels(&self, platform: Option<Platform>) -> Result<Vec<ChannelInfo>, StoreError> {
            self.inner.channels(platform).await
        }
    }

    #[tokio::test]
    async fn test_run_stops_when_lease_is_taken_over() {
        let staging = Arc::new(SqliteStagingStore::open_in_memory(TIMEOUT).unwrap());
        let durable = Arc::new(StolenLeaseDurable {
            inner: SqliteDurableStore::open_in_memory(TIMEOUT).unwrap(),
            stolen: AtomicBool::new(false),
            writes_after_loss: AtomicUsize::new(0),
        });
        staging
            .append(vec![
                snap("a", "Dota 2", 100, DAY),
                snap("a", "Dota 2", 100, DAY + 60),
                snap("b", "Hearthstone", 20, DAY),
                snap("b", "Hearthstone", 20, DAY + 60),
            ])
            .await
            .unwrap();

        let aggregator = Aggregator::new(
            staging.clone(),
            durable.clone(),
            Arc::new(empty_identity()),
            settings(30),
        );
        let result = aggregator.run(DAY + 600).await;

        assert!(matches!(result, Err(AggregatorError::LeaseLost { .. })));
        assert_eq!(durable.writes_after_loss.load(Ordering::SeqCst), 0);
        assert_eq!(durable.inner.aggregates_for_window(1, DAY).await.unwrap().len(), 1);
        assert!(durable.inner.aggregates_for_window(7, DAY - 6 * DAY).await.unwrap().is_empty());
        // Nothing was settled, so the next lease holder redoes the day
        assert_eq!(staging.read_unprocessed(0).await.unwrap().len(), 4);
    }

    /// Staging whose first `mark_processed` call fails, as if the process
    /// died between writing rows and settling their input
    struct FlakyMarkStaging {
        inner: SqliteStagingStore,
        mark_failures: AtomicUsize,
    }

    #[async_trait]
    impl StagingStore for FlakyMarkStaging {
        async fn append(&self, batch: Vec<Snapshot>) -> Result<usize, StoreError> {
            self.inner.append(batch).await
        }

        async fn read_unprocessed(&self, since: i64) -> Result<Vec<StagedSnapshot>, StoreError> {
            self.inner.read_unprocessed(since).await
        }

        async fn read_range(&self, start: i64, end: i64) -> Result<Vec<StagedSnapshot>, StoreError> {
            self.inner.read_range(start, end).await
        }

        async fn mark_processed(&self, ids: Vec<i64>) -> Result<usize, StoreError> {
            let failing = self
                .mark_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(StoreError::Unavailable("database is locked".to_string()));
            }
            self.inner.mark_processed(ids).await
        }

        async fn purge_processed_before(&self, cutoff: i64) -> Result<usize, StoreError> {
            self.inner.purge_processed_before(cutoff).await
        }

        async fn record_collector_status(&self, status: CollectorStatus) -> Result<(), StoreError> {
            self.inner.record_collector_status(status).await
        }

        async fn collector_statuses(&self) -> Result<Vec<CollectorStatus>, StoreError> {
            self.inner.collector_statuses().await
        }

        async fn upsert_channels(&self, channels: Vec<ChannelInfo>) -> Result<usize, StoreError> {
            self.inner.upsert_channels(channels).await
        }

        async fn channels_seen_since(&self, since: i64) -> Result<Vec<ChannelInfo>, StoreError> {
            self.inner.channels_seen_since(since).await
        }
    }

    #[tokio::test]
    async fn test_rerun_after_failed_mark_writes_same_rows() {
        let staging = Arc::new(FlakyMarkStaging {
            inner: SqliteStagingStore::open_in_memory(TIMEOUT).unwrap(),
            mark_failures: AtomicUsize::new(1),
        });
        let durable = Arc::new(SqliteDurableStore::open_in_memory(TIMEOUT).unwrap());
        staging
            .append(vec![
                snap("s1", "Dota 2", 100, DAY + 1_000),
                snap("s1", "Dota 2", 250, DAY + 1_120),
                snap("s2", "Hearthstone", 30, DAY + 1_000),
                snap("s2", "Hearthstone", 30, DAY + 1_060),
            ])
            .await
            .unwrap();
        let aggregator = Aggregator::new(
            staging.clone(),
            durable.clone(),
            Arc::new(empty_identity()),
            settings(30),
        );
        let now = DAY + 7_200;
        let weekly_start = DAY - 6 * DAY;

        let first = aggregator.run(now).await.unwrap();
        assert_eq!(first.groups_written, 2);
        assert_eq!(first.snapshots_marked, 0);
        assert_eq!(staging.read_unprocessed(0).await.unwrap().len(), 4);
        let daily = durable.aggregates_for_window(1, DAY).await.unwrap();
        let weekly = durable.aggregates_for_window(7, weekly_start).await.unwrap();

        let second = aggregator.run(now).await.unwrap();
        assert_eq!(second.snapshots_marked, 4);
        assert!(staging.read_unprocessed(0).await.unwrap().is_empty());
        assert_eq!(durable.aggregates_for_window(1, DAY).await.unwrap(), daily);
        assert_eq!(durable.aggregates_for_window(7, weekly_start).await.unwrap(), weekly);
        assert_eq!(daily.len(), 2);
        assert_eq!(weekly.len(), 2);
    }

    #[tokio::test]
    async fn test_staged_channels_reach_durable_registry() {
        let h = Harness::new();
        let channel = |id: &str, seen_at: i64| ChannelInfo {
            platform: Platform::Twitch,
            channel_id: id.to_string(),
            display_name: id.to_string(),
            language: Some("en".to_string()),
            last_title: "Major qualifier".to_string(),
            last_game: "Counter-Strike".to_string(),
            first_seen_at: seen_at,
            last_seen_at: seen_at,
            peak_viewers: 900,
        };
        h.staging
            .upsert_channels(vec![channel("stale", DAY), channel("esl_csgo", 40 * DAY)])
            .await
            .unwrap();

        let report = h
            .aggregator(empty_identity(), settings(30))
            .run(40 * DAY + 600)
            .await
            .unwrap();

        assert_eq!(report.channels_synced, 1);
        let registry = h.durable.channels(None).await.unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry[0].channel_id, "esl_csgo");
    }

    #[test]
    fn test_max_gap_is_clamped_to_one_day() {
        let h = Harness::new();
        let mut wide = settings(30);
        wide.max_gap_secs = 3 * DAY;
        let aggregator = h.aggregator(empty_identity(), wide);
        assert_eq!(aggregator.settings.max_gap_secs, DAY);
    }
}
