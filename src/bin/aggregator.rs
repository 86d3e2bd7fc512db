//! Aggregator - compacts staged snapshots into windowed aggregates
//!
//! Usage:
//!   cargo run --release --bin aggregator
//!   cargo run --release --bin aggregator -- --once
//!   cargo run --release --bin aggregator -- --top 7
//!
//! Environment variables (see `config::AggregatorConfig`):
//!   STAGING_DB_PATH / DURABLE_DB_PATH - SQLite paths
//!   AGGREGATION_INTERVAL_SECS - seconds between runs (default: 3600)
//!   WINDOW_LENGTHS_DAYS - roll-up lengths (default: 3,7,30,90)
//!   RETENTION_HOURS - staging retention horizon (default: 48)

use clap::Parser;
use dotenv::dotenv;
use esportstracker::aggregator_core::{AggregationSettings, Aggregator};
use esportstracker::config::AggregatorConfig;
use esportstracker::durable::query::{ranked_games, ranked_organizers, top_channels, RankedWindow};
use esportstracker::durable::{DurableStore, SqliteDurableStore};
use esportstracker::health::HealthReport;
use esportstracker::identity::IdentityMap;
use esportstracker::staging::{SqliteStagingStore, StagingStore};
use esportstracker::types::current_timestamp;
use log::{error, info, warn};
use std::sync::Arc;
use tokio::time::{interval, MissedTickBehavior};

#[derive(Debug, Parser)]
#[command(name = "aggregator", about = "Compact staged snapshots into windowed aggregates")]
struct Args {
    /// Run a single aggregation and exit
    #[arg(long)]
    once: bool,

    /// After each run, log the top entries of this window length (days)
    #[arg(long)]
    top: Option<u32>,

    /// Number of entries to log with --top
    #[arg(long, default_value_t = 10)]
    limit: usize,
}

fn log_ranking(label: &str, ranked: &RankedWindow) {
    info!(
        "🏆 Top {} for {}d window starting {}:",
        label, ranked.window_length_days, ranked.window_start
    );
    for (i, entry) in ranked.entries.iter().enumerate() {
        info!(
            "   {}. {} - {:.1} viewer-hours ({:.1}%), peak {}",
            i + 1,
            entry.name,
            entry.viewer_hours,
            entry.share * 100.0,
            entry.peak_viewers
        );
    }
}

async fn log_rankings(
    durable: &dyn DurableStore,
    supported: &[u32],
    window_length_days: u32,
    limit: usize,
) {
    match ranked_games(durable, supported, window_length_days, limit).await {
        Ok(Some(ranked)) => log_ranking("games", &ranked),
        Ok(None) => info!("📭 No {}d aggregates yet", window_length_days),
        Err(e) => warn!("⚠️  Game ranking failed: {}", e),
    }
    match ranked_organizers(durable, supported, window_length_days, limit).await {
        Ok(Some(ranked)) => log_ranking("organizers", &ranked),
        Ok(None) => {}
        Err(e) => warn!("⚠️  Organizer ranking failed: {}", e),
    }
    match top_channels(durable, None, limit).await {
        Ok(channels) if channels.is_empty() => {}
        Ok(channels) => {
            info!("📺 Top channels by peak audience:");
            for (i, channel) in channels.iter().enumerate() {
                info!(
                    "   {}. {} ({}) - peak {}, last playing {}",
                    i + 1,
                    channel.display_name,
                    channel.platform,
                    channel.peak_viewers,
                    channel.last_game
                );
            }
        }
        Err(e) => warn!("⚠️  Channel ranking failed: {}", e),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = AggregatorConfig::from_env()?;
    config.log_summary();

    let identity = Arc::new(IdentityMap::load(config.identity_path.as_deref())?);
    let staging: Arc<dyn StagingStore> = Arc::new(SqliteStagingStore::open(
        &config.store.staging_db_path,
        config.store.store_timeout,
    )?);
    let durable: Arc<dyn DurableStore> = Arc::new(SqliteDurableStore::open(
        &config.store.durable_db_path,
        config.store.store_timeout,
    )?);
    info!("✅ Stores ready");

    let aggregator = Aggregator::new(
        staging.clone(),
        durable.clone(),
        identity,
        AggregationSettings::from(&config),
    );
    info!("🔑 Lease holder id: {}", aggregator.holder());

    let mut ticker = interval(config.aggregation_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("⚠️  Received CTRL+C, shutting down...");
                break;
            }
        }

        let now = current_timestamp();
        match aggregator.run(now).await {
            Ok(report) if report.lease_busy => {}
            Ok(_) => {
                if let Some(length) = args.top {
                    log_rankings(durable.as_ref(), &config.window_lengths, length, args.limit).await;
                }
            }
            Err(e) => {
                error!("❌ Aggregation run failed: {}", e);
                if args.once {
                    return Err(e.into());
                }
            }
        }

        match staging.collector_statuses().await {
            Ok(statuses) => {
                HealthReport::new(statuses, Vec::new(), now, config.stale_after_secs).log_summary()
            }
            Err(e) => warn!("⚠️  Could not read collector statuses: {}", e),
        }

        if args.once {
            break;
        }
    }

    info!("✅ Aggregator stopped");
    Ok(())
}
