//! Reconciliation of the external feed against a canonical GTFS archive.
//!
//! The stages run in dependency order: routes first, then per-direction
//! stops, then schedule trips. Their combined output is an immutable
//! [`MappingSnapshot`] that the live pollers read lock-free; a refresh
//! builds a whole new snapshot and swaps it in only when every stage
//! succeeded, so a broken upstream pass can never corrupt a serving one.

pub mod indices;
pub mod routes;
pub mod stops;
pub mod trips;

use std::sync::Arc;

use ahash::AHashMap;
use chrono_tz::Tz;
use gtfs_structures::Gtfs;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::NextBusError;
use crate::config::MatchingConfig;
use crate::coverage::RouteStopCoverage;
use crate::nextbus::api::NextBusApi;
use crate::nextbus::models::{NbRoute, RouteDirectionStopKey};
use indices::{ServiceDateBlockKey, StopTimeIndices};

/// An external route paired with the canonical route id it covers best.
#[derive(Debug, Clone)]
pub struct RouteMatch<'a> {
    pub nb_route: &'a NbRoute,
    pub route_id: String,
}

/// The complete mapping state one reconciliation pass produces.
#[derive(Debug, Clone)]
pub struct MappingSnapshot {
    /// External route tag -> canonical route id.
    pub route_ids: AHashMap<String, String>,
    /// (route, direction, stop tag) -> canonical stop id.
    pub stop_ids: AHashMap<RouteDirectionStopKey, String>,
    /// Assembled block schedules per active service date. Empty when trip
    /// matching is disabled.
    pub block_indices: AHashMap<ServiceDateBlockKey, Arc<StopTimeIndices>>,
    /// Stops polled for predictions, sampled from the same route configs
    /// the mappings were built from.
    pub coverage: Vec<RouteStopCoverage>,
    pub agency_tz: Tz,
}

impl MappingSnapshot {
    pub fn empty() -> MappingSnapshot {
        MappingSnapshot::default()
    }
}

impl Default for MappingSnapshot {
    fn default() -> MappingSnapshot {
        MappingSnapshot {
            route_ids: AHashMap::new(),
            stop_ids: AHashMap::new(),
            block_indices: AHashMap::new(),
            coverage: Vec::new(),
            agency_tz: chrono_tz::UTC,
        }
    }
}

/// Swappable handle the pollers read on every cycle. Readers clone the
/// inner [`Arc`] and keep using their snapshot even while a refresh
/// publishes the next one.
#[derive(Default)]
pub struct SharedSnapshot {
    inner: RwLock<Arc<MappingSnapshot>>,
}

impl SharedSnapshot {
    pub fn new(snapshot: MappingSnapshot) -> SharedSnapshot {
        SharedSnapshot {
            inner: RwLock::new(Arc::new(snapshot)),
        }
    }

    pub async fn load(&self) -> Arc<MappingSnapshot> {
        Arc::clone(&*self.inner.read().await)
    }

    pub async fn publish(&self, snapshot: MappingSnapshot) {
        *self.inner.write().await = Arc::new(snapshot);
    }
}

/// Run every matching stage against a fresh copy of the canonical archive.
///
/// `use_cache` lets the startup pass reuse config responses fetched by a
/// previous run; refreshes pass `false` to observe upstream changes.
pub async fn build_snapshot(
    api: &NextBusApi,
    gtfs: &Gtfs,
    routes: &[NbRoute],
    config: &MatchingConfig,
    trip_matching: bool,
    use_cache: bool,
) -> Result<MappingSnapshot, NextBusError> {
    let agency_tz = agency_timezone(gtfs);
    let candidates = candidate_stop_map(routes, gtfs, config);
    let route_matches = routes::match_routes(routes, gtfs, &candidates);
    info!(
        "matched {} of {} external routes",
        route_matches.len(),
        routes.len()
    );

    let stop_ids = stops::match_stops(&route_matches, &candidates, gtfs);
    info!("mapped {} external stops", stop_ids.len());

    let block_indices = if trip_matching {
        trips::match_trips(api, &route_matches, &stop_ids, gtfs, config, use_cache).await?
    } else {
        AHashMap::new()
    };

    let route_ids = route_matches
        .iter()
        .map(|route_match| {
            (
                route_match.nb_route.tag.clone(),
                route_match.route_id.clone(),
            )
        })
        .collect();
    Ok(MappingSnapshot {
        route_ids,
        stop_ids,
        block_indices,
        coverage: Vec::new(),
        agency_tz,
    })
}

fn candidate_stop_map(
    routes: &[NbRoute],
    gtfs: &Gtfs,
    config: &MatchingConfig,
) -> AHashMap<String, Vec<String>> {
    stops::candidate_stops(routes, gtfs.stops.values(), config.stop_match_distance)
}

fn agency_timezone(gtfs: &Gtfs) -> Tz {
    let Some(agency) = gtfs.agencies.first() else {
        warn!("archive lists no agency, using UTC");
        return chrono_tz::UTC;
    };
    match agency.timezone.parse() {
        Ok(tz) => tz,
        Err(_) => {
            warn!("unparseable agency timezone {:?}, using UTC", agency.timezone);
            chrono_tz::UTC
        }
    }
}
