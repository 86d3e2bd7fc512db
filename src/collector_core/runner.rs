use super::error_handler::ExponentialBackoff;
use crate::config::RetryConfig;
use crate::db::StoreError;
use crate::platforms::{AdapterError, FetchBatch, PlatformAdapter};
use crate::staging::StagingStore;
use crate::types::{current_timestamp, ChannelInfo, CollectorStatus, Platform, Snapshot};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{interval, sleep, timeout, Instant, MissedTickBehavior};

/// Upstream retry hints longer than this are clamped
const MAX_RETRY_HINT: Duration = Duration::from_secs(6 * 60 * 60);

#[derive(Debug, Error)]
pub enum CollectorError {
    /// Credentials rejected; this platform's collector stops
    #[error("{platform} collector halted: authentication failed: {message}")]
    Auth { platform: Platform, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Stored {
        fetched: usize,
        inserted: usize,
        dropped: usize,
    },
    /// Quiet period after a rate limit or repeated failure
    BackingOff { remaining: Duration },
    /// Nothing was written this tick
    Skipped { reason: String },
}

/// Polls one platform and appends each successful poll to staging
pub struct Collector {
    adapter: Arc<dyn PlatformAdapter>,
    staging: Arc<dyn StagingStore>,
    poll_interval: Duration,
    retry: RetryConfig,
    backoff: ExponentialBackoff,
    resume_at: Option<Instant>,
    status: CollectorStatus,
}

impl Collector {
    pub fn new(
        adapter: Arc<dyn PlatformAdapter>,
        staging: Arc<dyn StagingStore>,
        poll_interval: Duration,
        retry: RetryConfig,
    ) -> Self {
        let platform = adapter.platform();
        Self {
            backoff: ExponentialBackoff::new(retry.backoff_initial, retry.backoff_max),
            adapter,
            staging,
            poll_interval,
            retry,
            resume_at: None,
            status: CollectorStatus::new(platform),
        }
    }

    pub fn platform(&self) -> Platform {
        self.status.platform
    }

    pub fn status(&self) -> &CollectorStatus {
        &self.status
    }

    /// Tick every `poll_interval` until an authentication failure.
    ///
    /// Ticks that overrun the interval are skipped, never queued.
    pub async fn run(mut self) -> Result<(), CollectorError> {
        log::info!(
            "🚀 {} collector started (every {}s)",
            self.platform(),
            self.poll_interval.as_secs()
        );

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let started = Instant::now();
            let outcome = self.tick().await?;
            log_outcome(self.platform(), &outcome);

            let elapsed = started.elapsed();
            if elapsed > self.poll_interval {
                log::warn!(
                    "⚠️  {} tick took {:.1}s (interval {}s); skipping missed ticks",
                    self.platform(),
                    elapsed.as_secs_f64(),
                    self.poll_interval.as_secs()
                );
            }
        }
    }

    /// One poll: fetch, convert, append. Bounded by `poll_interval`.
    pub async fn tick(&mut self) -> Result<TickOutcome, CollectorError> {
        let started = Instant::now();
        let deadline = started + self.poll_interval;
        self.status.last_attempt_at = current_timestamp();

        if let Some(resume_at) = self.resume_at {
            if started < resume_at {
                let remaining = resume_at - started;
                self.record_status().await;
                return Ok(TickOutcome::BackingOff { remaining });
            }
            self.resume_at = None;
        }

        let batch = match self.fetch_with_retry(deadline).await {
            Ok(batch) => batch,
            Err(AdapterError::Auth(message)) => {
                log::error!(
                    "❌ {} credentials rejected, halting this collector: {}",
                    self.platform(),
                    message
                );
                self.status.halted = true;
                self.note_failure(format!("authentication failed: {}", message));
                self.record_status().await;
                return Err(CollectorError::Auth {
                    platform: self.platform(),
                    message,
                });
            }
            Err(err) => {
                self.note_failure(err.to_string());
                self.record_status().await;
                return Ok(TickOutcome::Skipped {
                    reason: err.to_string(),
                });
            }
        };

        let fetched = batch.streams.len();
        let channels = to_channels(&batch);
        let (snapshots, dropped) = to_snapshots(batch, current_timestamp());

        match self.append_with_retry(snapshots, deadline).await {
            Ok(inserted) => {
                if let Err(e) = self.staging.upsert_channels(channels).await {
                    log::warn!("⚠️  Failed to update {} channel registry: {}", self.platform(), e);
                }
                self.backoff.reset();
                self.status.last_success_at = Some(current_timestamp());
                self.status.last_batch_size = inserted as i64;
                self.status.consecutive_failures = 0;
                self.status.last_error = None;
                self.record_status().await;
                Ok(TickOutcome::Stored {
                    fetched,
                    inserted,
                    dropped,
                })
            }
            Err(err) => {
                log::error!("❌ {} batch dropped: {}", self.platform(), err);
                self.note_failure(format!("staging append failed: {}", err));
                self.record_status().await;
                Ok(TickOutcome::Skipped {
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Call the adapter, retrying retryable errors while the wait still fits
    /// before `deadline`. Otherwise the collector goes quiet until the
    /// backoff elapses.
    async fn fetch_with_retry(&mut self, deadline: Instant) -> Result<FetchBatch, AdapterError> {
        let max_attempts = self.retry.max_sync_retries.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(AdapterError::Transient("tick deadline reached".to_string()));
            }

            let err = match timeout(remaining, self.adapter.fetch_live_streams()).await {
                Ok(Ok(batch)) => return Ok(batch),
                Ok(Err(err)) => err,
                Err(_) => AdapterError::Transient(format!(
                    "adapter call exceeded {}s tick deadline",
                    self.poll_interval.as_secs()
                )),
            };

            if !err.is_retryable() {
                return Err(err);
            }

            let hint = err.retry_after().unwrap_or_default().min(MAX_RETRY_HINT);
            let wait = hint.max(self.backoff.next_delay());

            if attempt >= max_attempts || Instant::now() + wait >= deadline {
                log::warn!(
                    "⏳ {} fetch failed ({}); backing off {}s",
                    self.platform(),
                    err,
                    wait.as_secs()
                );
                self.resume_at = Some(Instant::now() + wait);
                return Err(err);
            }

            log::warn!(
                "⏳ {} fetch failed ({}); retry {} of {} in {}ms",
                self.platform(),
                err,
                attempt,
                max_attempts - 1,
                wait.as_millis()
            );
            sleep(wait).await;
        }
    }

    /// Append under the tick deadline. Unavailable/timeout errors are retried
    /// while time remains; replays are harmless because the store ignores
    /// duplicate (platform, stream_id, observed_at).
    async fn append_with_retry(&self, snapshots: Vec<Snapshot>, deadline: Instant) -> Result<usize, StoreError> {
        let max_attempts = self.retry.max_sync_retries.max(1);
        let mut backoff = ExponentialBackoff::new(self.retry.backoff_initial, self.retry.backoff_max);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.staging.append(snapshots.clone()).await {
                Ok(inserted) => return Ok(inserted),
                Err(err) if err.is_retryable() => {
                    let wait = backoff.next_delay();
                    if attempt >= max_attempts || Instant::now() + wait >= deadline {
                        return Err(err);
                    }
                    log::warn!(
                        "⏳ {} staging append failed ({}); retrying in {}ms",
                        self.platform(),
                        err,
                        wait.as_millis()
                    );
                    sleep(wait).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn note_failure(&mut self, message: String) {
        self.status.consecutive_failures += 1;
        self.status.last_error = Some(message);
    }

    async fn record_status(&self) {
        if let Err(e) = self.staging.record_collector_status(self.status.clone()).await {
            log::warn!("⚠️  Failed to record {} collector status: {}", self.platform(), e);
        }
    }
}

/// Convert a fetch batch into snapshots.
///
/// `observed_at` is the adapter's time when it reports one, else the poll
/// time. Records that fail validation are dropped; repeated
/// (stream_id, observed_at) pairs keep the first record. Returns the
/// snapshots and the number of records dropped, including those the adapter
/// already discarded.
pub fn to_snapshots(batch: FetchBatch, collected_at: i64) -> (Vec<Snapshot>, usize) {
    let mut dropped = batch.malformed;
    let mut seen = HashSet::new();
    let mut snapshots = Vec::with_capacity(batch.streams.len());

    for stream in batch.streams {
        let observed_at = stream.observed_at.unwrap_or(batch.polled_at);
        let Ok(viewer_count) = i64::try_from(stream.viewer_count) else {
            dropped += 1;
            continue;
        };

        let snapshot = Snapshot {
            platform: batch.platform,
            stream_id: stream.stream_id,
            game: stream.game.to_stored(),
            organizer: stream.organizer.to_stored(),
            viewer_count,
            observed_at,
            collected_at,
        };

        if let Err(violation) = snapshot.validate() {
            log::warn!(
                "⚠️  Dropping {} stream {}: {}",
                snapshot.platform,
                snapshot.stream_id,
                violation
            );
            dropped += 1;
            continue;
        }
        if !seen.insert((snapshot.stream_id.clone(), snapshot.observed_at)) {
            continue;
        }
        snapshots.push(snapshot);
    }

    (snapshots, dropped)
}

/// One registry row per channel in the batch, carrying the loudest stream
/// of that channel. Records without a channel id are skipped.
pub fn to_channels(batch: &FetchBatch) -> Vec<ChannelInfo> {
    let mut channels: HashMap<&str, ChannelInfo> = HashMap::new();

    for stream in &batch.streams {
        if stream.channel_id.trim().is_empty() {
            continue;
        }
        let seen_at = stream.observed_at.unwrap_or(batch.polled_at);
        let viewers = i64::try_from(stream.viewer_count).unwrap_or(i64::MAX);

        match channels.get_mut(stream.channel_id.as_str()) {
            Some(existing) if existing.peak_viewers >= viewers => {}
            Some(existing) => {
                existing.peak_viewers = viewers;
                existing.last_title = stream.title.clone();
                existing.last_game = stream.game.to_stored();
            }
            None => {
                channels.insert(
                    stream.channel_id.as_str(),
                    ChannelInfo {
                        platform: batch.platform,
                        channel_id: stream.channel_id.clone(),
                        display_name: stream.channel_name.clone(),
                        language: stream.language.clone(),
                        last_title: stream.title.clone(),
                        last_game: stream.game.to_stored(),
                        first_seen_at: seen_at,
                        last_seen_at: seen_at,
                        peak_viewers: viewers,
                    },
                );
            }
        }
    }

    let mut channels: Vec<ChannelInfo> = channels.into_values().collect();
    channels.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
    channels
}

pub fn log_outcome(platform: Platform, outcome: &TickOutcome) {
    match outcome {
        TickOutcome::Stored {
            fetched,
            inserted,
            dropped,
        } => log::info!(
            "📊 {}: {} live streams, {} stored, {} dropped",
            platform,
            fetched,
            inserted,
            dropped
        ),
        TickOutcome::BackingOff { remaining } => log::debug!(
            "💤 {}: backing off for another {}s",
            platform,
            remaining.as_secs()
        ),
        TickOutcome::Skipped { reason } => log::warn!("⏭️  {}: tick skipped ({})", platform, reason),
    }
}
