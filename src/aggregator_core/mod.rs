//! Aggregator Core - staging snapshots to windowed aggregates
//!
//! # Architecture
//!
//! ```text
//! StagingStore (unprocessed snapshots, bucketed by UTC day)
//!     ↓
//! dedup_snapshots → identity re-resolution → integrate_day
//!     ↓
//! daily rows (window_length_days = 1)
//!     ↓
//! trailing roll-ups rebuilt from daily rows (7d, 30d, ...)
//!     ↓
//! DurableStore (upsert by primary key) + mark_processed + purge
//! ```
//!
//! A run holds the durable-store lease so two aggregators never interleave.

pub mod engine;
pub mod integrate;
pub mod window;

pub use engine::{AggregationSettings, Aggregator, AggregatorError, RunReport};
pub use integrate::{dedup_snapshots, integrate_day, GroupMetrics, GroupOutcome, GroupResult};
pub use window::{window_hours, windows_containing, DayWindow, RollupWindow};
