//! Long-lived pollers and the daily configuration refresh.
//!
//! One worker per outbound feed, each cycling poll, process, sleep for
//! whatever is left of the minimum interval. A separate task rebuilds the
//! coverage and mapping snapshot every morning; pollers keep reading the
//! previous snapshot until the new one is published whole.

use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use gtfs_structures::Gtfs;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::NextBusError;
use crate::config::{CoverageConfig, MatchingConfig, PollConfig};
use crate::coverage;
use crate::duration_since_unix_epoch;
use crate::feed::{self, FeedKind, FeedStore};
use crate::live::{self, VehicleStatuses};
use crate::matching::{self, MappingSnapshot, SharedSnapshot};
use crate::nextbus::api::NextBusApi;
use crate::nextbus::models::NbRoute;

/// Vehicle deviation state idle longer than this is dropped between poll
/// cycles.
const VEHICLE_STATUS_TTL: Duration = Duration::from_secs(30 * 60);

/// Wait between attempts at the startup configuration pass. Until one
/// succeeds there is no coverage, so the pollers have nothing to do.
const STARTUP_RETRY: Duration = Duration::from_secs(60);

/// Deployment choices assembled from the command line.
#[derive(Debug, Clone, Default)]
pub struct RunnerOptions {
    /// Canonical GTFS archive; without one, external tags pass through
    /// unmapped.
    pub gtfs_path: Option<PathBuf>,
    pub trip_matching: bool,
    /// Overrides the agency record's time zone.
    pub timezone: Option<Tz>,
    pub trip_updates_output: Option<PathBuf>,
    pub vehicle_positions_output: Option<PathBuf>,
    pub alerts_output: Option<PathBuf>,
}

/// Shared state of one running agency exporter.
pub struct Runner {
    pub api: Arc<NextBusApi>,
    pub snapshot: Arc<SharedSnapshot>,
    pub store: Arc<FeedStore>,
    pub options: RunnerOptions,
    pub matching: MatchingConfig,
    pub coverage: CoverageConfig,
    pub poll: PollConfig,
}

impl Runner {
    /// Runs the startup configuration pass, then refreshes every morning at
    /// the configured hour in the agency's zone. A failed refresh keeps the
    /// previous snapshot and tries again the next morning.
    pub async fn refresh_task(&self) {
        while let Err(error) = self.refresh_pass(true).await {
            warn!(
                "startup configuration pass failed, retrying in {}s: {error}",
                STARTUP_RETRY.as_secs()
            );
            sleep(STARTUP_RETRY).await;
        }
        loop {
            let tz = self.snapshot.load().await.agency_tz;
            let delay = delay_until_next_refresh(Utc::now(), tz, self.coverage.refresh_hour);
            info!("next configuration refresh in {}s", delay.as_secs());
            sleep(delay).await;
            if let Err(error) = self.refresh_pass(false).await {
                warn!("configuration refresh failed, keeping previous mappings: {error}");
            }
        }
    }

    async fn refresh_pass(&self, use_cache: bool) -> Result<(), Box<dyn Error + Sync + Send>> {
        info!("rebuilding stop coverage and gtfs mappings");
        let routes = self.fetch_route_configs(use_cache).await?;
        let mut snapshot = match &self.options.gtfs_path {
            Some(path) => {
                let gtfs = load_gtfs(path).await?;
                matching::build_snapshot(
                    &self.api,
                    &gtfs,
                    &routes,
                    &self.matching,
                    self.options.trip_matching,
                    use_cache,
                )
                .await?
            }
            None => MappingSnapshot::empty(),
        };
        if let Some(timezone) = self.options.timezone {
            snapshot.agency_tz = timezone;
        }
        snapshot.coverage = coverage::sample(&routes, &self.coverage);
        info!(
            "publishing snapshot: {} routes mapped, {} stops mapped, {} block schedules, {} routes covered",
            snapshot.route_ids.len(),
            snapshot.stop_ids.len(),
            snapshot.block_indices.len(),
            snapshot.coverage.len()
        );
        self.snapshot.publish(snapshot).await;
        Ok(())
    }

    /// One `routeConfig` download per listed route, shared by the sampler
    /// and every matching stage of the pass.
    async fn fetch_route_configs(&self, use_cache: bool) -> Result<Vec<NbRoute>, NextBusError> {
        let listed = self.api.route_list(use_cache).await?;
        let mut routes = Vec::with_capacity(listed.len());
        for listed_route in &listed {
            routes.extend(self.api.route_config(&listed_route.tag, use_cache).await?);
        }
        info!("downloaded {} route configurations", routes.len());
        Ok(routes)
    }

    /// Trip-update poller. Owns the per-vehicle deviation state; nothing
    /// else reads or writes it.
    pub async fn trip_updates_worker(&self) {
        let mut statuses = VehicleStatuses::new();
        loop {
            let started = Instant::now();
            let snapshot = self.snapshot.load().await;
            self.trip_updates_cycle(&snapshot, &mut statuses).await;
            let now = duration_since_unix_epoch();
            statuses.prune(now, VEHICLE_STATUS_TTL);
            self.write_output(
                FeedKind::TripUpdates,
                self.options.trip_updates_output.as_deref(),
                now,
            )
            .await;
            self.sleep_remainder(started).await;
        }
    }

    async fn trip_updates_cycle(
        &self,
        snapshot: &MappingSnapshot,
        statuses: &mut VehicleStatuses,
    ) {
        for coverage in &snapshot.coverage {
            let predictions = match self.api.predictions_for_multi_stops(coverage).await {
                Ok(predictions) => predictions,
                Err(error) => {
                    warn!(
                        "route {}: predictions fetch failed: {error}",
                        coverage.route_tag
                    );
                    continue;
                }
            };
            let now = duration_since_unix_epoch();
            let mut rows = live::flatten_predictions(&predictions);
            live::map_to_gtfs(&mut rows, snapshot, statuses, &self.matching, now);
            let entities = feed::trip_update_entities(&rows, now);
            debug!(
                "route {}: {} trip update entities",
                coverage.route_tag,
                entities.len()
            );
            self.store.apply(FeedKind::TripUpdates, entities);
        }
    }

    /// Vehicle-position poller. Remembers the previous request time per
    /// route so the upstream only sends vehicles that reported since.
    pub async fn vehicle_positions_worker(&self) {
        let mut last_request_times: AHashMap<String, i64> = AHashMap::new();
        loop {
            let started = Instant::now();
            let snapshot = self.snapshot.load().await;
            self.vehicle_positions_cycle(&snapshot, &mut last_request_times)
                .await;
            self.write_output(
                FeedKind::VehiclePositions,
                self.options.vehicle_positions_output.as_deref(),
                duration_since_unix_epoch(),
            )
            .await;
            self.sleep_remainder(started).await;
        }
    }

    async fn vehicle_positions_cycle(
        &self,
        snapshot: &MappingSnapshot,
        last_request_times: &mut AHashMap<String, i64>,
    ) {
        for coverage in &snapshot.coverage {
            let route_tag = coverage.route_tag.as_str();
            let last_request = last_request_times.get(route_tag).copied().unwrap_or(0);
            let request_time = duration_since_unix_epoch().as_millis() as i64;
            let vehicles = match self.api.vehicle_locations(route_tag, last_request).await {
                Ok(vehicles) => vehicles,
                Err(error) => {
                    warn!("route {route_tag}: vehicle locations fetch failed: {error}");
                    continue;
                }
            };
            last_request_times.insert(route_tag.to_string(), request_time);
            if vehicles.is_empty() {
                continue;
            }
            let entities =
                feed::vehicle_position_entities(&vehicles, duration_since_unix_epoch());
            debug!("route {route_tag}: {} vehicles reported", entities.len());
            self.store.apply(FeedKind::VehiclePositions, entities);
        }
    }

    /// Service-message poller. The whole batch is fetched in one request,
    /// so the error boundary is the cycle itself.
    pub async fn alerts_worker(&self) {
        loop {
            let started = Instant::now();
            self.alerts_cycle().await;
            self.sleep_remainder(started).await;
        }
    }

    async fn alerts_cycle(&self) {
        let messages = match self.api.messages().await {
            Ok(messages) => messages,
            Err(error) => {
                warn!("messages fetch failed: {error}");
                return;
            }
        };
        let snapshot = self.snapshot.load().await;
        let entities = feed::alert_entities(&messages, &snapshot);
        debug!("{} alert entities active", entities.len());
        self.store.replace_all(FeedKind::Alerts, entities);
        self.write_output(
            FeedKind::Alerts,
            self.options.alerts_output.as_deref(),
            duration_since_unix_epoch(),
        )
        .await;
    }

    async fn write_output(&self, kind: FeedKind, path: Option<&Path>, now: Duration) {
        let Some(path) = path else {
            return;
        };
        if let Err(error) = tokio::fs::write(path, self.store.encode(kind, now)).await {
            warn!(
                "failed writing {} feed to {}: {error}",
                kind.as_str(),
                path.display()
            );
        }
    }

    /// Spacing is measured from the start of the previous poll, so a slow
    /// cycle rolls straight into the next one.
    async fn sleep_remainder(&self, started: Instant) {
        if let Some(remaining) = self
            .poll
            .minimum_time_between_requests
            .checked_sub(started.elapsed())
        {
            sleep(remaining).await;
        }
    }
}

async fn load_gtfs(path: &Path) -> Result<Gtfs, Box<dyn Error + Sync + Send>> {
    let path = path.to_path_buf();
    let gtfs = tokio::task::spawn_blocking(move || Gtfs::from_path(&path)).await??;
    info!(
        "loaded gtfs archive: {} routes, {} stops, {} trips",
        gtfs.routes.len(),
        gtfs.stops.len(),
        gtfs.trips.len()
    );
    Ok(gtfs)
}

/// Delay from `now` until the next morning refresh: tomorrow at the
/// configured local hour, skipping forward a day when a DST gap swallows
/// that wall-clock time.
fn delay_until_next_refresh(now: DateTime<Utc>, tz: Tz, refresh_hour: u32) -> Duration {
    let local_now = now.with_timezone(&tz);
    let mut date = local_now.date_naive() + chrono::Duration::days(1);
    for _ in 0..3 {
        if let Some(at) = date
            .and_hms_opt(refresh_hour, 0, 0)
            .and_then(|time| tz.from_local_datetime(&time).earliest())
        {
            if let Ok(delay) = (at.with_timezone(&Utc) - now).to_std() {
                return delay;
            }
        }
        date += chrono::Duration::days(1);
    }
    Duration::from_secs(24 * 3600)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn refresh_is_scheduled_for_tomorrow_morning() {
        let now = Utc.with_ymd_and_hms(2026, 8, 10, 12, 0, 0).unwrap();
        let delay = delay_until_next_refresh(now, chrono_tz::UTC, 4);
        assert_eq!(delay, Duration::from_secs(16 * 3600));
    }

    #[test]
    fn refresh_skips_today_even_just_before_the_hour() {
        let now = Utc.with_ymd_and_hms(2026, 8, 10, 3, 0, 0).unwrap();
        let delay = delay_until_next_refresh(now, chrono_tz::UTC, 4);
        assert_eq!(delay, Duration::from_secs(25 * 3600));
    }

    #[test]
    fn refresh_rolls_past_a_dst_gap() {
        // 2026-03-08 02:00 does not exist in New York; the refresh lands on
        // the 9th instead.
        let tz = chrono_tz::America::New_York;
        let now = Utc.with_ymd_and_hms(2026, 3, 7, 12, 0, 0).unwrap();
        let delay = delay_until_next_refresh(now, tz, 2);
        assert_eq!(delay, Duration::from_secs(42 * 3600));
    }
}
