//! Per-platform collection: poll an adapter on a fixed interval and append
//! each successful poll to the staging store

pub mod error_handler;
pub mod runner;

pub use error_handler::ExponentialBackoff;
pub use runner::{log_outcome, to_channels, to_snapshots, Collector, CollectorError, TickOutcome};
