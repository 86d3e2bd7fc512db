//! Esports viewership tracker
//!
//! Platform collectors write viewer-count snapshots to a staging store; an
//! aggregator compacts them into daily and trailing-window aggregates in a
//! durable store that the query layer ranks by market share.

pub mod aggregator_core;
pub mod collector_core;
pub mod config;
pub mod db;
pub mod durable;
pub mod health;
pub mod identity;
pub mod platforms;
pub mod sqlite_pragma;
pub mod staging;
pub mod types;
