//! Collector - polls live streams per platform into the staging store
//!
//! Usage:
//!   cargo run --release --bin collector -- --platform all
//!   cargo run --release --bin collector -- --platform twitch --once
//!
//! Environment variables (see `config::CollectorConfig`):
//!   STAGING_DB_PATH - staging SQLite path (default: data/staging.db)
//!   POLL_INTERVAL_SECS - seconds between polls (default: 60)
//!   TWITCH_CLIENT_ID / TWITCH_CLIENT_SECRET - Twitch app credentials
//!   YOUTUBE_API_KEY - YouTube Data API key
//!   IDENTITY_PATH - optional JSON identity map

use clap::{Parser, ValueEnum};
use dotenv::dotenv;
use esportstracker::collector_core::{log_outcome, Collector};
use esportstracker::config::CollectorConfig;
use esportstracker::identity::IdentityMap;
use esportstracker::platforms::build_adapter;
use esportstracker::staging::{SqliteStagingStore, StagingStore};
use esportstracker::types::{current_timestamp, CollectorStatus, Platform};
use log::{error, info, warn};
use std::sync::Arc;
use tokio::task::JoinSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PlatformArg {
    Twitch,
    Youtube,
    All,
}

impl PlatformArg {
    fn platforms(self) -> Vec<Platform> {
        match self {
            PlatformArg::Twitch => vec![Platform::Twitch],
            PlatformArg::Youtube => vec![Platform::YouTube],
            PlatformArg::All => Platform::all().to_vec(),
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "collector", about = "Poll live esports streams into the staging store")]
struct Args {
    /// Platform(s) to poll
    #[arg(long, value_enum, default_value = "all")]
    platform: PlatformArg,

    /// Run a single poll per platform and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = CollectorConfig::from_env()?;
    config.log_summary();

    let identity = Arc::new(IdentityMap::load(config.identity_path.as_deref())?);
    let staging: Arc<dyn StagingStore> = Arc::new(SqliteStagingStore::open(
        &config.store.staging_db_path,
        config.store.store_timeout,
    )?);
    info!("✅ Staging store ready at {}", config.store.staging_db_path);

    let mut collectors = Vec::new();
    let mut halted = 0usize;
    for platform in args.platform.platforms() {
        match build_adapter(platform, &config, identity.clone()) {
            Ok(adapter) => collectors.push(Collector::new(
                adapter,
                staging.clone(),
                config.poll_interval,
                config.retry.clone(),
            )),
            Err(e) => {
                error!("🛑 {} collector not started: {}", platform, e);
                halted += 1;
                let mut status = CollectorStatus::new(platform);
                status.last_attempt_at = current_timestamp();
                status.last_error = Some(e.to_string());
                status.halted = true;
                if let Err(e) = staging.record_collector_status(status).await {
                    warn!("⚠️  Could not record {} status: {}", platform, e);
                }
            }
        }
    }

    if collectors.is_empty() {
        return Err("no collector could be started".into());
    }

    if args.once {
        for mut collector in collectors {
            match collector.tick().await {
                Ok(outcome) => log_outcome(collector.platform(), &outcome),
                Err(e) => {
                    error!("🛑 {}", e);
                    halted += 1;
                }
            }
        }
        if halted > 0 {
            return Err(format!("{} platform(s) halted", halted).into());
        }
        return Ok(());
    }

    let mut tasks = JoinSet::new();
    for collector in collectors {
        tasks.spawn(collector.run());
    }
    info!("🔄 Press CTRL+C to shutdown gracefully");

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                match signal {
                    Ok(()) => info!("⚠️  Received CTRL+C, shutting down..."),
                    Err(err) => error!("❌ Failed to listen for CTRL+C: {}", err),
                }
                tasks.abort_all();
                break;
            }
            joined = tasks.join_next() => {
                match joined {
                    // Each platform halts independently; the others keep polling
                    Some(Ok(Err(e))) => {
                        error!("🛑 {}", e);
                        halted += 1;
                    }
                    Some(Ok(Ok(()))) => {}
                    Some(Err(e)) => {
                        error!("❌ Collector task panicked: {}", e);
                        halted += 1;
                    }
                    None => {
                        error!("❌ All collectors stopped");
                        break;
                    }
                }
            }
        }
    }

    info!("✅ Collector stopped");
    if halted > 0 {
        return Err(format!("{} platform(s) halted", halted).into());
    }
    Ok(())
}
