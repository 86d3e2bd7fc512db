//! Core data model shared by collectors, stores and the aggregator
//!
//! - `Platform` - the streaming platforms we poll
//! - `Snapshot` - one viewer-count observation of one broadcast
//! - `WindowedAggregate` - one durable row of windowed metrics
//! - `AggregationFault` - an operator review record for a skipped group
//!
//! All timestamps are Unix seconds (UTC).

use serde::{Deserialize, Serialize};
use std::fmt;

pub const SECONDS_PER_HOUR: i64 = 60 * 60;
pub const SECONDS_PER_DAY: i64 = 24 * SECONDS_PER_HOUR;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Twitch,
    YouTube,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Twitch => "twitch",
            Platform::YouTube => "youtube",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "twitch" => Some(Platform::Twitch),
            "youtube" => Some(Platform::YouTube),
            _ => None,
        }
    }

    pub fn all() -> [Platform; 2] {
        [Platform::Twitch, Platform::YouTube]
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a snapshot cannot enter the staging store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotViolation {
    NegativeViewerCount(i64),
    ObservedAfterCollected { observed_at: i64, collected_at: i64 },
    EmptyStreamId,
}

impl fmt::Display for SnapshotViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotViolation::NegativeViewerCount(v) => {
                write!(f, "viewer_count must be >= 0, got {}", v)
            }
            SnapshotViolation::ObservedAfterCollected {
                observed_at,
                collected_at,
            } => write!(
                f,
                "observed_at {} is after collected_at {}",
                observed_at, collected_at
            ),
            SnapshotViolation::EmptyStreamId => write!(f, "stream_id is empty"),
        }
    }
}

/// One observation of a single broadcast's viewer count at one instant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub platform: Platform,
    /// Platform-scoped identifier (a Twitch stream id, a YouTube video id)
    pub stream_id: String,
    /// Stored game name (`name`, `unmapped:<raw>` or `unknown`)
    pub game: String,
    /// Stored organizer name (`name`, `unmapped:<raw>` or `unknown`)
    pub organizer: String,
    pub viewer_count: i64,
    pub observed_at: i64,
    pub collected_at: i64,
}

impl Snapshot {
    /// Check the per-record invariants.
    ///
    /// Uniqueness of (platform, stream_id, observed_at) is a cross-record
    /// property and is enforced by the staging store.
    pub fn validate(&self) -> Result<(), SnapshotViolation> {
        if self.viewer_count < 0 {
            return Err(SnapshotViolation::NegativeViewerCount(self.viewer_count));
        }
        if self.observed_at > self.collected_at {
            return Err(SnapshotViolation::ObservedAfterCollected {
                observed_at: self.observed_at,
                collected_at: self.collected_at,
            });
        }
        if self.stream_id.is_empty() {
            return Err(SnapshotViolation::EmptyStreamId);
        }
        Ok(())
    }
}

/// A snapshot as read back from the staging store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedSnapshot {
    pub id: i64,
    pub processed: bool,
    pub snapshot: Snapshot,
}

/// Aggregation group: metrics are computed per (platform, game, organizer)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKey {
    pub platform: Platform,
    pub game: String,
    pub organizer: String,
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.platform, self.game, self.organizer)
    }
}

/// One durable row.
///
/// Primary key: (window_start, window_length_days, game, organizer, platform).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowedAggregate {
    /// UTC midnight of the first day in the window
    pub window_start: i64,
    pub window_length_days: u32,
    pub game: String,
    pub organizer: String,
    pub platform: Platform,
    pub viewer_hours: f64,
    pub peak_viewers: i64,
    /// viewer_hours / window hours (offline time counts as zero viewers)
    pub avg_viewers: f64,
    pub sample_count: i64,
}

impl WindowedAggregate {
    pub fn group_key(&self) -> GroupKey {
        GroupKey {
            platform: self.platform,
            game: self.game.clone(),
            organizer: self.organizer.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InconsistencyReason {
    /// A group's integrated viewer-seconds came out negative
    NegativeViewerHours,
    /// Integer viewer-seconds overflowed
    ArithmeticOverflow,
    /// A snapshot was observed after it was collected
    ClockSkew,
    /// A snapshot arrived after its day's input left the retention horizon
    LateBeyondRetention,
}

impl InconsistencyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            InconsistencyReason::NegativeViewerHours => "negative_viewer_hours",
            InconsistencyReason::ArithmeticOverflow => "arithmetic_overflow",
            InconsistencyReason::ClockSkew => "clock_skew",
            InconsistencyReason::LateBeyondRetention => "late_beyond_retention",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "negative_viewer_hours" => Some(InconsistencyReason::NegativeViewerHours),
            "arithmetic_overflow" => Some(InconsistencyReason::ArithmeticOverflow),
            "clock_skew" => Some(InconsistencyReason::ClockSkew),
            "late_beyond_retention" => Some(InconsistencyReason::LateBeyondRetention),
            _ => None,
        }
    }
}

impl fmt::Display for InconsistencyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A group the aggregator skipped instead of writing a suspicious row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationFault {
    pub detected_at: i64,
    pub window_start: i64,
    pub window_length_days: u32,
    pub platform: Platform,
    pub game: String,
    pub organizer: String,
    pub reason: InconsistencyReason,
}

/// Registry entry for a broadcasting channel, refreshed from every poll
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub platform: Platform,
    /// Twitch user id or YouTube channel id
    pub channel_id: String,
    pub display_name: String,
    pub language: Option<String>,
    /// Title of the latest broadcast seen
    pub last_title: String,
    /// Stored game name of the latest broadcast seen
    pub last_game: String,
    pub first_seen_at: i64,
    pub last_seen_at: i64,
    /// Highest single-poll viewer count seen for the channel
    pub peak_viewers: i64,
}

/// Per-platform collector health, written by that platform's collector only
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectorStatus {
    pub platform: Platform,
    pub last_attempt_at: i64,
    pub last_success_at: Option<i64>,
    pub last_batch_size: i64,
    pub consecutive_failures: i64,
    pub last_error: Option<String>,
    pub halted: bool,
}

impl CollectorStatus {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            last_attempt_at: 0,
            last_success_at: None,
            last_batch_size: 0,
            consecutive_failures: 0,
            last_error: None,
            halted: false,
        }
    }
}

/// Current Unix timestamp in seconds
pub fn current_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

/// UTC midnight at or before `ts`
pub fn floor_day(ts: i64) -> i64 {
    ts.div_euclid(SECONDS_PER_DAY) * SECONDS_PER_DAY
}
