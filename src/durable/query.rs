//! Read-only views over the durable store: ranked lists, market share and
//! the channel registry
//!
//! Shares are computed on read from one window's rows. A game's share sums
//! its viewer-hours across every platform and organizer; an organizer's share
//! sums across platforms, so an organizer broadcasting on several platforms
//! is compared on its combined audience.

use super::DurableStore;
use crate::db::StoreError;
use crate::types::{ChannelInfo, Platform, WindowedAggregate};
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("unsupported window length: {0} days")]
    UnsupportedWindow(u32),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketShare {
    pub name: String,
    pub viewer_hours: f64,
    /// Largest peak of any contributing (platform, organizer/game) group
    pub peak_viewers: i64,
    /// In [0, 1]; all shares of one window sum to 1 when any viewer-hours exist
    pub share: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedWindow {
    pub window_start: i64,
    pub window_length_days: u32,
    pub entries: Vec<MarketShare>,
}

pub fn game_market_share(rows: &[WindowedAggregate]) -> Vec<MarketShare> {
    market_share_by(rows, |row| row.game.as_str())
}

pub fn organizer_market_share(rows: &[WindowedAggregate]) -> Vec<MarketShare> {
    market_share_by(rows, |row| row.organizer.as_str())
}

fn market_share_by<'a, F>(rows: &'a [WindowedAggregate], key: F) -> Vec<MarketShare>
where
    F: Fn(&'a WindowedAggregate) -> &'a str,
{
    let mut totals: BTreeMap<&str, (f64, i64)> = BTreeMap::new();
    for row in rows {
        let entry = totals.entry(key(row)).or_insert((0.0, 0));
        entry.0 += row.viewer_hours;
        entry.1 = entry.1.max(row.peak_viewers);
    }

    let total: f64 = totals.values().map(|(hours, _)| hours).sum();

    let mut shares: Vec<MarketShare> = totals
        .into_iter()
        .map(|(name, (viewer_hours, peak_viewers))| MarketShare {
            name: name.to_string(),
            viewer_hours,
            peak_viewers,
            share: if total > 0.0 { viewer_hours / total } else { 0.0 },
        })
        .collect();

    shares.sort_by(|a, b| {
        b.viewer_hours
            .total_cmp(&a.viewer_hours)
            .then_with(|| a.name.cmp(&b.name))
    });
    shares
}

fn check_window(supported: &[u32], window_length_days: u32) -> Result<(), QueryError> {
    if window_length_days == 1 || supported.contains(&window_length_days) {
        Ok(())
    } else {
        Err(QueryError::UnsupportedWindow(window_length_days))
    }
}

async fn latest_window_rows(
    store: &dyn DurableStore,
    supported: &[u32],
    window_length_days: u32,
) -> Result<Option<(i64, Vec<WindowedAggregate>)>, QueryError> {
    check_window(supported, window_length_days)?;
    let Some(start) = store.latest_window_start(window_length_days).await? else {
        return Ok(None);
    };
    let rows = store.aggregates_for_window(window_length_days, start).await?;
    Ok(Some((start, rows)))
}

/// Games of the most recent window of `window_length_days`, ranked by
/// viewer-hours (ties by name). `None` until a window has been written.
pub async fn ranked_games(
    store: &dyn DurableStore,
    supported: &[u32],
    window_length_days: u32,
    limit: usize,
) -> Result<Option<RankedWindow>, QueryError> {
    ranked(store, supported, window_length_days, limit, game_market_share).await
}

pub async fn ranked_organizers(
    store: &dyn DurableStore,
    supported: &[u32],
    window_length_days: u32,
    limit: usize,
) -> Result<Option<RankedWindow>, QueryError> {
    ranked(store, supported, window_length_days, limit, organizer_market_share).await
}

async fn ranked(
    store: &dyn DurableStore,
    supported: &[u32],
    window_length_days: u32,
    limit: usize,
    share_fn: fn(&[WindowedAggregate]) -> Vec<MarketShare>,
) -> Result<Option<RankedWindow>, QueryError> {
    let Some((window_start, rows)) = latest_window_rows(store, supported, window_length_days).await? else {
        return Ok(None);
    };
    let mut entries = share_fn(&rows);
    entries.truncate(limit);
    Ok(Some(RankedWindow {
        window_start,
        window_length_days,
        entries,
    }))
}

/// Registered channels ranked by the largest audience seen (ties by
/// display name), optionally restricted to one platform
pub async fn top_channels(
    store: &dyn DurableStore,
    platform: Option<Platform>,
    limit: usize,
) -> Result<Vec<ChannelInfo>, QueryError> {
    let mut channels = store.channels(platform).await?;
    channels.sort_by(|a, b| {
        b.peak_viewers
            .cmp(&a.peak_viewers)
            .then_with(|| a.display_name.cmp(&b.display_name))
    });
    channels.truncate(limit);
    Ok(channels)
}
