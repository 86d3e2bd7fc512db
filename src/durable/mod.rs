//! Durable store: windowed aggregates, aggregation faults and the
//! aggregator lease
//!
//! Tables (see `sql/durable/`):
//! - `windowed_aggregates` - UPSERT on the 5-tuple primary key
//! - `aggregation_faults` - INSERT (append-only operator review records)
//! - `aggregator_lease` - single-row lease, conditional UPSERT
//! - `channels` - channel registry synced from staging by the aggregator

pub mod query;
pub mod sqlite;

pub use sqlite::SqliteDurableStore;

use crate::db::StoreError;
use crate::types::{AggregationFault, ChannelInfo, GroupKey, Platform, WindowedAggregate};
use async_trait::async_trait;

#[async_trait]
pub trait DurableStore: Send + Sync {
    /// INSERT ... ON CONFLICT DO UPDATE on
    /// (window_start, window_length_days, game, organizer, platform)
    async fn upsert_aggregate(&self, row: WindowedAggregate) -> Result<(), StoreError>;

    /// Delete the rows of one window whose group is not in `keep`.
    ///
    /// Used after a complete recompute of a window, so a group that no
    /// longer exists (for instance after an identity map update) does not
    /// linger next to its replacement.
    async fn retain_groups(
        &self,
        window_start: i64,
        window_length_days: u32,
        keep: Vec<GroupKey>,
    ) -> Result<usize, StoreError>;

    async fn aggregates_for_window(
        &self,
        window_length_days: u32,
        window_start: i64,
    ) -> Result<Vec<WindowedAggregate>, StoreError>;

    /// Daily rows (`window_length_days = 1`) with `from <= window_start < to`
    async fn daily_aggregates(&self, from: i64, to: i64) -> Result<Vec<WindowedAggregate>, StoreError>;

    async fn has_window(&self, window_start: i64, window_length_days: u32) -> Result<bool, StoreError>;

    async fn latest_window_start(&self, window_length_days: u32) -> Result<Option<i64>, StoreError>;

    async fn record_fault(&self, fault: AggregationFault) -> Result<(), StoreError>;

    async fn faults_since(&self, since: i64) -> Result<Vec<AggregationFault>, StoreError>;

    /// Take or renew the aggregator lease. Succeeds when no lease exists, the
    /// current one expired, or `holder` already owns it.
    async fn try_acquire_lease(&self, holder: &str, now: i64, ttl_secs: i64) -> Result<bool, StoreError>;

    async fn release_lease(&self, holder: &str) -> Result<(), StoreError>;

    /// Merge channel rows; descriptive fields follow the newest sighting
    async fn upsert_channels(&self, channels: Vec<ChannelInfo>) -> Result<usize, StoreError>;

    /// Registry rows, optionally for one platform
    async fn channels(&self, platform: Option<Platform>) -> Result<Vec<ChannelInfo>, StoreError>;
}
