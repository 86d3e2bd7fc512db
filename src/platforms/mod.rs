//! Platform adapters: one per streaming platform, each turning that
//! platform's live-stream listing into normalized `RawStreamInfo` records

pub mod error;
pub mod twitch;
pub mod youtube;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::AdapterError;
pub use twitch::TwitchAdapter;
pub use youtube::YouTubeAdapter;

use crate::config::CollectorConfig;
use crate::identity::{IdentityMap, NormalizedName};
use crate::types::Platform;
use async_trait::async_trait;
use std::sync::Arc;

/// One live broadcast as reported by a platform, after name normalization
#[derive(Debug, Clone, PartialEq)]
pub struct RawStreamInfo {
    pub platform: Platform,
    pub stream_id: String,
    pub channel_id: String,
    pub channel_name: String,
    pub title: String,
    pub game: NormalizedName,
    pub organizer: NormalizedName,
    pub viewer_count: u64,
    pub language: Option<String>,
    /// Upstream observation time when the platform reports one; the
    /// collector falls back to the poll time
    pub observed_at: Option<i64>,
}

/// The result of one `fetch_live_streams` call.
///
/// Finite and not restartable: a fresh call re-queries upstream.
#[derive(Debug, Clone)]
pub struct FetchBatch {
    pub platform: Platform,
    pub streams: Vec<RawStreamInfo>,
    /// Records dropped because they could not be decoded
    pub malformed: usize,
    pub polled_at: i64,
}

#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    async fn fetch_live_streams(&self) -> Result<FetchBatch, AdapterError>;
}

/// Build the adapter for `platform` from the collector configuration.
///
/// Missing credentials surface as `AdapterError::Auth` so the caller halts
/// that platform like any other credential failure.
pub fn build_adapter(
    platform: Platform,
    config: &CollectorConfig,
    identity: Arc<IdentityMap>,
) -> Result<Arc<dyn PlatformAdapter>, AdapterError> {
    match platform {
        Platform::Twitch => {
            let twitch = config.twitch.clone().ok_or_else(|| {
                AdapterError::Auth("TWITCH_CLIENT_ID / TWITCH_CLIENT_SECRET not configured".to_string())
            })?;
            Ok(Arc::new(TwitchAdapter::new(twitch, identity)?))
        }
        Platform::YouTube => {
            let youtube = config
                .youtube
                .clone()
                .ok_or_else(|| AdapterError::Auth("YOUTUBE_API_KEY not configured".to_string()))?;
            Ok(Arc::new(YouTubeAdapter::new(youtube, identity)?))
        }
    }
}
