//! Per-day integration of viewer counts
//!
//! Each stream's viewer count is a step function: a snapshot's count holds
//! from its `observed_at` until the stream's next snapshot (left-rectangle
//! rule). Consecutive snapshots further apart than `max_gap` are treated as
//! offline in between, and a stream's last snapshot contributes nothing
//! after itself.
//!
//! All sums are integer viewer-seconds with checked arithmetic, so a day
//! integrates to the same value regardless of input order.

use super::window::DayWindow;
use crate::types::{GroupKey, InconsistencyReason, StagedSnapshot, SECONDS_PER_HOUR};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMetrics {
    pub viewer_seconds: i64,
    pub peak_viewers: i64,
    pub sample_count: i64,
}

impl GroupMetrics {
    pub fn viewer_hours(&self) -> f64 {
        self.viewer_seconds as f64 / SECONDS_PER_HOUR as f64
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupOutcome {
    Metrics(GroupMetrics),
    Inconsistent(InconsistencyReason),
}

/// Result for one (platform, game, organizer) group of one day
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupResult {
    pub outcome: GroupOutcome,
    /// Staged ids attributed to this group that were observed inside the day
    pub snapshot_ids: Vec<i64>,
}

/// Drop repeated (platform, stream_id, observed_at) observations, keeping the
/// one collected last (ties by id).
///
/// Returns the survivors and, per survivor id, the ids it replaced.
pub fn dedup_snapshots(rows: Vec<StagedSnapshot>) -> (Vec<StagedSnapshot>, HashMap<i64, Vec<i64>>) {
    let mut best: HashMap<(crate::types::Platform, String, i64), StagedSnapshot> = HashMap::new();
    let mut replaced: HashMap<i64, Vec<i64>> = HashMap::new();

    for row in rows {
        let key = (
            row.snapshot.platform,
            row.snapshot.stream_id.clone(),
            row.snapshot.observed_at,
        );
        match best.remove(&key) {
            None => {
                best.insert(key, row);
            }
            Some(current) => {
                let newer = (row.snapshot.collected_at, row.id) > (current.snapshot.collected_at, current.id);
                let (winner, loser) = if newer { (row, current) } else { (current, row) };
                let mut absorbed = replaced.remove(&loser.id).unwrap_or_default();
                absorbed.push(loser.id);
                replaced.entry(winner.id).or_default().extend(absorbed);
                best.insert(key, winner);
            }
        }
    }

    let mut kept: Vec<StagedSnapshot> = best.into_values().collect();
    kept.sort_by_key(|s| s.id);
    (kept, replaced)
}

#[derive(Default)]
struct GroupAccumulator {
    viewer_seconds: i64,
    sample_count: i64,
    snapshot_ids: Vec<i64>,
    /// (time, order, delta): order 0 = segment end, 1 = start, 2 = point end
    events: Vec<(i64, u8, i64)>,
    fault: Option<InconsistencyReason>,
}

impl GroupAccumulator {
    fn flag(&mut self, reason: InconsistencyReason) {
        if self.fault.is_none() {
            self.fault = Some(reason);
        }
    }

    fn add_seconds(&mut self, viewers: i64, seconds: i64) {
        match viewers
            .checked_mul(seconds)
            .and_then(|vs| self.viewer_seconds.checked_add(vs))
        {
            Some(total) => self.viewer_seconds = total,
            None => self.flag(InconsistencyReason::ArithmeticOverflow),
        }
    }

    /// Highest concurrent total over the day
    fn peak(&mut self) -> Option<i64> {
        self.events.sort_unstable();
        let mut current: i64 = 0;
        let mut peak: i64 = 0;
        for &(_, _, delta) in &self.events {
            current = current.checked_add(delta)?;
            peak = peak.max(current);
        }
        Some(peak)
    }

    fn finish(mut self) -> GroupResult {
        let outcome = match self.fault {
            Some(reason) => GroupOutcome::Inconsistent(reason),
            None if self.viewer_seconds < 0 => {
                GroupOutcome::Inconsistent(InconsistencyReason::NegativeViewerHours)
            }
            None => match self.peak() {
                Some(peak_viewers) => GroupOutcome::Metrics(GroupMetrics {
                    viewer_seconds: self.viewer_seconds,
                    peak_viewers,
                    sample_count: self.sample_count,
                }),
                None => GroupOutcome::Inconsistent(InconsistencyReason::ArithmeticOverflow),
            },
        };
        let mut snapshot_ids = self.snapshot_ids;
        snapshot_ids.sort_unstable();
        GroupResult {
            outcome,
            snapshot_ids,
        }
    }
}

fn group_key(snapshot: &StagedSnapshot) -> GroupKey {
    GroupKey {
        platform: snapshot.snapshot.platform,
        game: snapshot.snapshot.game.clone(),
        organizer: snapshot.snapshot.organizer.clone(),
    }
}

/// Integrate one day.
///
/// `snapshots` must already be deduplicated and should cover
/// `[day.start - max_gap, day.end + max_gap)` so intervals crossing midnight
/// are attributed correctly. `replaced` maps survivor ids to the duplicate ids
/// they stand for (see `dedup_snapshots`).
pub fn integrate_day(
    snapshots: &[StagedSnapshot],
    replaced: &HashMap<i64, Vec<i64>>,
    day: DayWindow,
    max_gap: i64,
) -> BTreeMap<GroupKey, GroupResult> {
    let mut streams: BTreeMap<(crate::types::Platform, &str), Vec<&StagedSnapshot>> = BTreeMap::new();
    for s in snapshots {
        streams
            .entry((s.snapshot.platform, s.snapshot.stream_id.as_str()))
            .or_default()
            .push(s);
    }

    let mut groups: BTreeMap<GroupKey, GroupAccumulator> = BTreeMap::new();

    for (_, mut series) in streams {
        series.sort_by_key(|s| (s.snapshot.observed_at, s.id));

        for (i, a) in series.iter().enumerate() {
            let acc = groups.entry(group_key(a)).or_default();
            let t = a.snapshot.observed_at;
            let viewers = a.snapshot.viewer_count;

            if day.contains(t) {
                acc.sample_count += 1;
                acc.snapshot_ids.push(a.id);
                if let Some(ids) = replaced.get(&a.id) {
                    acc.snapshot_ids.extend(ids);
                }
                if a.snapshot.observed_at > a.snapshot.collected_at {
                    acc.flag(InconsistencyReason::ClockSkew);
                }
                if viewers < 0 {
                    acc.flag(InconsistencyReason::NegativeViewerHours);
                }
            }

            let next_t = series.get(i + 1).map(|b| b.snapshot.observed_at);
            match next_t {
                Some(next_t) if next_t - t <= max_gap => {
                    let seconds = day.overlap(t, next_t);
                    if seconds > 0 {
                        acc.add_seconds(viewers, seconds);
                        acc.events.push((t.max(day.start), 1, viewers));
                        acc.events.push((next_t.min(day.end), 0, -viewers));
                    } else if day.contains(t) {
                        // Repeated observed_at for one stream cannot occur after dedup;
                        // treat a zero-length step as a point
                        acc.events.push((t, 1, viewers));
                        acc.events.push((t, 2, -viewers));
                    }
                }
                _ => {
                    if day.contains(t) {
                        acc.events.push((t, 1, viewers));
                        acc.events.push((t, 2, -viewers));
                    }
                }
            }
        }
    }

    groups
        .into_iter()
        .filter(|(_, acc)| acc.sample_count > 0 || acc.viewer_seconds != 0 || !acc.events.is_empty())
        .map(|(key, acc)| (key, acc.finish()))
        .collect()
}
