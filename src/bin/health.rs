//! Health - prints collector health and recent aggregation faults as JSON
//!
//! Exits non-zero when any collector is not healthy.
//!
//! Usage:
//!   cargo run --release --bin health -- --since-hours 24

use clap::Parser;
use dotenv::dotenv;
use esportstracker::config::AggregatorConfig;
use esportstracker::durable::{DurableStore, SqliteDurableStore};
use esportstracker::health::HealthReport;
use esportstracker::staging::{SqliteStagingStore, StagingStore};
use esportstracker::types::{current_timestamp, SECONDS_PER_HOUR};

#[derive(Debug, Parser)]
#[command(name = "health", about = "Report collector health and aggregation faults")]
struct Args {
    /// Include faults detected within this many hours
    #[arg(long, default_value_t = 24)]
    since_hours: i64,

    /// Pretty-print the JSON report
    #[arg(long)]
    pretty: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Args::parse();
    let config = AggregatorConfig::from_env()?;

    let staging = SqliteStagingStore::open(&config.store.staging_db_path, config.store.store_timeout)?;
    let durable = SqliteDurableStore::open(&config.store.durable_db_path, config.store.store_timeout)?;

    let now = current_timestamp();
    let statuses = staging.collector_statuses().await?;
    let faults = durable
        .faults_since(now - args.since_hours * SECONDS_PER_HOUR)
        .await?;

    let report = HealthReport::new(statuses, faults, now, config.stale_after_secs);
    let json = if args.pretty {
        serde_json::to_string_pretty(&report)?
    } else {
        serde_json::to_string(&report)?
    };
    println!("{}", json);

    report.log_summary();
    if !report.all_healthy() {
        std::process::exit(1);
    }
    Ok(())
}
