//! Staging store: short-lived raw snapshots between collectors and the
//! aggregator, plus per-platform collector status rows and the channel
//! registry the collectors refresh

pub mod sqlite;

pub use sqlite::SqliteStagingStore;

use crate::db::StoreError;
use crate::types::{ChannelInfo, CollectorStatus, Snapshot, StagedSnapshot};
use async_trait::async_trait;

#[async_trait]
pub trait StagingStore: Send + Sync {
    /// Append a batch in one transaction.
    ///
    /// Every snapshot is validated first; one violation rejects the whole
    /// batch with `ConstraintViolation`. Exact duplicates of
    /// (platform, stream_id, observed_at) are ignored. Returns the number of
    /// rows inserted.
    async fn append(&self, batch: Vec<Snapshot>) -> Result<usize, StoreError>;

    /// Unprocessed snapshots with `observed_at >= since`, ordered by id
    async fn read_unprocessed(&self, since: i64) -> Result<Vec<StagedSnapshot>, StoreError>;

    /// Every retained snapshot, processed or not, with
    /// `start <= observed_at < end`
    async fn read_range(&self, start: i64, end: i64) -> Result<Vec<StagedSnapshot>, StoreError>;

    async fn mark_processed(&self, ids: Vec<i64>) -> Result<usize, StoreError>;

    /// Delete processed snapshots observed before `cutoff`, along with
    /// channels last seen before it. Unprocessed rows are never purged.
    /// Returns the number of snapshots deleted.
    async fn purge_processed_before(&self, cutoff: i64) -> Result<usize, StoreError>;

    async fn record_collector_status(&self, status: CollectorStatus) -> Result<(), StoreError>;

    async fn collector_statuses(&self) -> Result<Vec<CollectorStatus>, StoreError>;

    /// Merge channel sightings into the registry
    async fn upsert_channels(&self, channels: Vec<ChannelInfo>) -> Result<usize, StoreError>;

    /// Channels seen at or after `since`
    async fn channels_seen_since(&self, since: i64) -> Result<Vec<ChannelInfo>, StoreError>;
}
