use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use nextbus_gtfs_rt::config::{CoverageConfig, MatchingConfig, PollConfig, ThrottleConfig};
use nextbus_gtfs_rt::feed::{self, FeedStore};
use nextbus_gtfs_rt::matching::SharedSnapshot;
use nextbus_gtfs_rt::nextbus::api::{DEFAULT_BASE_URL, NextBusApi};
use nextbus_gtfs_rt::runner::{Runner, RunnerOptions};
use nextbus_gtfs_rt::throttle::MeteredDownloader;

/// Polls a NextBus publicXMLFeed agency and maintains GTFS-realtime trip
/// update, vehicle position, and alert feeds.
#[derive(Parser)]
#[command(name = "nextbus-gtfs-rt", version, about)]
struct Args {
    /// NextBus agency id, e.g. "sf-muni".
    #[arg(long)]
    agency: String,

    /// Path to the agency's GTFS archive. Enables route and stop mapping.
    #[arg(long)]
    gtfs: Option<PathBuf>,

    /// Also match upstream schedule blocks against GTFS trips, so live
    /// predictions carry canonical trip ids.
    #[arg(long)]
    gtfs_trip_matching: bool,

    /// Directory for cached configuration downloads.
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Upstream feed base url.
    #[arg(long, default_value = DEFAULT_BASE_URL)]
    base_url: String,

    /// Override the agency time zone, e.g. "America/Los_Angeles".
    #[arg(long)]
    timezone: Option<chrono_tz::Tz>,

    /// Maintain the trip updates feed.
    #[arg(long)]
    trip_updates: bool,

    /// Maintain the vehicle positions feed.
    #[arg(long)]
    vehicle_positions: bool,

    /// Maintain the alerts feed.
    #[arg(long)]
    alerts: bool,

    /// Write the trip updates feed to this file after every cycle.
    #[arg(long)]
    trip_updates_output: Option<PathBuf>,

    /// Write the vehicle positions feed to this file after every cycle.
    #[arg(long)]
    vehicle_positions_output: Option<PathBuf>,

    /// Write the alerts feed to this file after every cycle.
    #[arg(long)]
    alerts_output: Option<PathBuf>,

    /// Serve the feeds over http on this port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    if !(args.trip_updates || args.vehicle_positions || args.alerts) {
        anyhow::bail!(
            "nothing to do: enable at least one of --trip-updates, --vehicle-positions, --alerts"
        );
    }
    if let Some(cache_dir) = &args.cache_dir {
        std::fs::create_dir_all(cache_dir)
            .with_context(|| format!("creating cache directory {}", cache_dir.display()))?;
    }

    let downloader = Arc::new(MeteredDownloader::new(ThrottleConfig::default())?);
    let api = Arc::new(NextBusApi::new(
        downloader,
        args.agency.clone(),
        args.base_url.clone(),
        args.cache_dir.clone(),
    ));
    let store = Arc::new(FeedStore::new());
    let snapshot = Arc::new(SharedSnapshot::default());

    let runner = Arc::new(Runner {
        api,
        snapshot,
        store: Arc::clone(&store),
        options: RunnerOptions {
            gtfs_path: args.gtfs.clone(),
            trip_matching: args.gtfs_trip_matching,
            timezone: args.timezone,
            trip_updates_output: args.trip_updates_output.clone(),
            vehicle_positions_output: args.vehicle_positions_output.clone(),
            alerts_output: args.alerts_output.clone(),
        },
        matching: MatchingConfig::default(),
        coverage: CoverageConfig::default(),
        poll: PollConfig::default(),
    });

    info!("starting feed exporter for agency {}", args.agency);

    let refresh_runner = Arc::clone(&runner);
    let mut refresh_handle = tokio::spawn(async move {
        refresh_runner.refresh_task().await;
    });

    let mut workers = Vec::new();
    if args.trip_updates {
        let trip_runner = Arc::clone(&runner);
        workers.push(tokio::spawn(async move {
            trip_runner.trip_updates_worker().await;
        }));
    }
    if args.vehicle_positions {
        let vehicle_runner = Arc::clone(&runner);
        workers.push(tokio::spawn(async move {
            vehicle_runner.vehicle_positions_worker().await;
        }));
    }
    if args.alerts {
        let alerts_runner = Arc::clone(&runner);
        workers.push(tokio::spawn(async move {
            alerts_runner.alerts_worker().await;
        }));
    }

    if let Some(port) = args.port {
        let serve_store = Arc::clone(&store);
        std::thread::spawn(move || feed::serve(serve_store, port));
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("listening for shutdown signal")?;
            info!("interrupt received, shutting down");
        }
        _ = &mut refresh_handle => {
            warn!("configuration refresh task exited unexpectedly");
        }
    }

    refresh_handle.abort();
    for worker in &workers {
        worker.abort();
    }
    Ok(())
}
