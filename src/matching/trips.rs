//! Schedule-to-trip matching.
//!
//! The upstream schedule command publishes per-direction timetables keyed
//! by an agency-defined service class ("wk", "sat", ...). Matching aligns
//! every external trip against the canonical trips of the already-matched
//! route, picks the service id whose trip pool explains the class best,
//! and assembles per-block stop-call indices for each date that service
//! id is active.

use ahash::AHashMap;
use chrono::{Datelike, Duration, NaiveDate};
use gtfs_structures::{Calendar, CalendarDate, Exception, Gtfs, Trip};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::RouteMatch;
use super::indices::{BlockStopTime, ServiceDateBlockKey, StopTimeIndices};
use crate::NextBusError;
use crate::config::MatchingConfig;
use crate::nextbus::api::NextBusApi;
use crate::nextbus::models::{FlatStopTime, NbSchedule, RouteDirectionStopKey};

/// Download every matched route's schedule and align it with the canonical
/// trips, producing block schedules keyed by service date.
///
/// Routes whose schedule cannot be fetched or decoded are skipped with a
/// warning; a service class with no configured day mask aborts the whole
/// pass instead, since every later pass would silently drop it too.
pub async fn match_trips(
    api: &NextBusApi,
    route_matches: &[RouteMatch<'_>],
    stop_mappings: &AHashMap<RouteDirectionStopKey, String>,
    gtfs: &Gtfs,
    config: &MatchingConfig,
    use_cache: bool,
) -> Result<AHashMap<ServiceDateBlockKey, Arc<StopTimeIndices>>, NextBusError> {
    let mut indices = AHashMap::new();
    for route_match in route_matches {
        let route_tag = route_match.nb_route.tag.as_str();
        let schedules = match api.schedule(route_tag, use_cache).await {
            Ok(schedules) => schedules,
            Err(err) => {
                warn!("skipping trip matching for route {route_tag}: {err}");
                continue;
            }
        };
        match_route_trips(
            &schedules,
            route_match,
            stop_mappings,
            gtfs,
            config,
            &mut indices,
        )?;
    }
    Ok(indices)
}

fn match_route_trips(
    schedules: &[NbSchedule],
    route_match: &RouteMatch<'_>,
    stop_mappings: &AHashMap<RouteDirectionStopKey, String>,
    gtfs: &Gtfs,
    config: &MatchingConfig,
    indices: &mut AHashMap<ServiceDateBlockKey, Arc<StopTimeIndices>>,
) -> Result<(), NextBusError> {
    let route_id = route_match.route_id.as_str();

    // Canonical trips of this route bucketed by service id, in stable
    // order so score ties always resolve the same way.
    let mut route_trips: Vec<&Trip> = gtfs
        .trips
        .values()
        .filter(|trip| trip.route_id == route_id)
        .collect();
    route_trips.sort_unstable_by(|a, b| a.id.cmp(&b.id));
    let mut trips_by_service: BTreeMap<&str, Vec<PoolTrip>> = BTreeMap::new();
    for trip in route_trips {
        trips_by_service
            .entry(trip.service_id.as_str())
            .or_default()
            .push(PoolTrip::from_gtfs_trip(trip));
    }

    // A block interleaves its directions over the day, so its rows are
    // pooled across every table of the class before resegmenting.
    let mut rows_by_class_block: BTreeMap<(String, String), Vec<FlatStopTime>> = BTreeMap::new();
    for row in flatten_schedules(schedules, stop_mappings) {
        rows_by_class_block
            .entry((row.service_class.clone(), row.block_tag.clone()))
            .or_default()
            .push(row);
    }
    let mut trips_by_class: BTreeMap<String, Vec<Vec<FlatStopTime>>> = BTreeMap::new();
    for ((service_class, _), rows) in rows_by_class_block {
        trips_by_class
            .entry(service_class)
            .or_default()
            .extend(regroup_block_trips(rows));
    }

    for (service_class, external_trips) in &trips_by_class {
        let mask = config
            .service_class_masks
            .get(service_class)
            .ok_or_else(|| NextBusError::UnknownServiceClass(service_class.clone()))?;
        let candidates = candidate_service_ids(mask, &gtfs.calendar);
        let pools = candidates.iter().filter_map(|service_id| {
            trips_by_service
                .get(service_id.as_str())
                .map(|pool| (service_id.as_str(), pool.as_slice()))
        });
        let Some(class_match) = match_class_trips(external_trips, pools, config) else {
            warn!("no canonical trips on route {route_id} for service class {service_class}");
            continue;
        };
        let ClassMatch { service_id, blocks } = class_match;

        let exceptions = gtfs
            .calendar_dates
            .get(&service_id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let dates = resolve_service_dates(gtfs.calendar.get(&service_id), exceptions);
        if dates.is_empty() {
            warn!("service id {service_id} matched on route {route_id} has no active dates");
            continue;
        }

        let assembled: Vec<(String, Arc<StopTimeIndices>)> = blocks
            .into_iter()
            .map(|(block_tag, calls)| (block_tag, Arc::new(StopTimeIndices::build(calls))))
            .collect();
        for date in &dates {
            for (block_tag, block_indices) in &assembled {
                indices.insert(
                    ServiceDateBlockKey::new(route_id, block_tag.clone(), *date),
                    Arc::clone(block_indices),
                );
            }
        }
        info!(
            "route {route_id} class {service_class}: service id {service_id}, {} blocks over {} dates",
            assembled.len(),
            dates.len(),
        );
    }
    Ok(())
}

/// One external timetable cell per row, with the stop mapped to its
/// canonical id where the stop matcher produced one. Rows with a negative
/// time mark stops the trip does not serve and are dropped.
fn flatten_schedules(
    schedules: &[NbSchedule],
    stop_mappings: &AHashMap<RouteDirectionStopKey, String>,
) -> Vec<FlatStopTime> {
    let mut rows = Vec::new();
    for schedule in schedules {
        for trip in &schedule.trips {
            for stop_time in &trip.stop_times {
                if stop_time.epoch_time < 0 {
                    continue;
                }
                let key = RouteDirectionStopKey::new(
                    schedule.route_tag.as_str(),
                    schedule.direction_tag.as_str(),
                    stop_time.tag.as_str(),
                );
                rows.push(FlatStopTime {
                    schedule_class: schedule.schedule_class.clone(),
                    service_class: schedule.service_class.clone(),
                    route_tag: schedule.route_tag.clone(),
                    direction_tag: schedule.direction_tag.clone(),
                    block_tag: trip.block_id.clone(),
                    stop_tag: stop_time.tag.clone(),
                    gtfs_stop_id: stop_mappings.get(&key).cloned(),
                    epoch_time: stop_time.epoch_time,
                });
            }
        }
    }
    rows
}

/// Order one block's rows by time and cut a new trip wherever the
/// direction changes. The sort is stable, so simultaneous rows keep their
/// timetable order.
fn regroup_block_trips(mut rows: Vec<FlatStopTime>) -> Vec<Vec<FlatStopTime>> {
    rows.sort_by_key(|row| row.epoch_time);
    let mut trips: Vec<Vec<FlatStopTime>> = Vec::new();
    for row in rows {
        match trips.last_mut() {
            Some(trip)
                if trip
                    .last()
                    .is_some_and(|last| last.direction_tag == row.direction_tag) =>
            {
                trip.push(row)
            }
            _ => trips.push(vec![row]),
        }
    }
    trips
}

/// A canonical trip prepared for alignment: its calls in sequence order,
/// plus per-stop occurrence lists for nearest-time lookup. Loop trips call
/// at a stop more than once, hence lists.
struct PoolTrip {
    trip_id: String,
    /// (stop id, mid time) in stop sequence order.
    stop_calls: Vec<(String, i64)>,
    /// stop id -> (mid time, position in stop_calls) sorted by time.
    occurrences: AHashMap<String, Vec<(i64, usize)>>,
}

impl PoolTrip {
    fn new(trip_id: impl Into<String>, stop_calls: Vec<(String, i64)>) -> PoolTrip {
        let mut occurrences: AHashMap<String, Vec<(i64, usize)>> = AHashMap::new();
        for (position, (stop_id, mid_time)) in stop_calls.iter().enumerate() {
            occurrences
                .entry(stop_id.clone())
                .or_default()
                .push((*mid_time, position));
        }
        for pairs in occurrences.values_mut() {
            pairs.sort_unstable();
        }
        PoolTrip {
            trip_id: trip_id.into(),
            stop_calls,
            occurrences,
        }
    }

    fn from_gtfs_trip(trip: &Trip) -> PoolTrip {
        let stop_calls = trip
            .stop_times
            .iter()
            .filter_map(|stop_time| {
                mid_time(stop_time.arrival_time, stop_time.departure_time)
                    .map(|mid| (stop_time.stop.id.clone(), mid))
            })
            .collect();
        PoolTrip::new(trip.id.as_str(), stop_calls)
    }
}

/// Midpoint of a call's arrival and departure, seconds after the service
/// date start. Calls with neither time are uninterpolated and skipped.
fn mid_time(arrival: Option<u32>, departure: Option<u32>) -> Option<i64> {
    match (arrival, departure) {
        (Some(arrival), Some(departure)) => Some((i64::from(arrival) + i64::from(departure)) / 2),
        (Some(arrival), None) => Some(i64::from(arrival)),
        (None, Some(departure)) => Some(i64::from(departure)),
        (None, None) => None,
    }
}

/// Occurrence whose mid time is closest to `time`; the earlier call wins
/// ties. `pairs` must be sorted and non-empty.
fn nearest_occurrence(pairs: &[(i64, usize)], time: i64) -> (i64, usize) {
    let split = pairs.partition_point(|(mid_time, _)| *mid_time < time);
    if split == 0 {
        return pairs[0];
    }
    if split == pairs.len() {
        return pairs[split - 1];
    }
    let before = pairs[split - 1];
    let after = pairs[split];
    if time - before.0 <= after.0 - time {
        before
    } else {
        after
    }
}

/// How badly one external trip aligns with one canonical trip, in minutes.
///
/// Each row either misses (its stop never occurs in the canonical trip),
/// lands out of order (its nearest occurrence precedes the previous row's),
/// or contributes its whole-minute time delta. A pairing where every row
/// missed gets the sentinel score so it can never beat a real alignment.
fn alignment_score(rows: &[FlatStopTime], pool_trip: &PoolTrip, config: &MatchingConfig) -> f64 {
    let mut score = 0.0;
    let mut matched_any = false;
    let mut last_position: Option<usize> = None;
    for row in rows {
        let occurrences = row
            .gtfs_stop_id
            .as_ref()
            .and_then(|stop_id| pool_trip.occurrences.get(stop_id));
        let Some(occurrences) = occurrences else {
            score += config.miss_penalty;
            continue;
        };
        let row_seconds = row.epoch_time / 1000;
        let (mid_time, position) = nearest_occurrence(occurrences, row_seconds);
        matched_any = true;
        if last_position.is_some_and(|last| position < last) {
            score += config.order_penalty;
        } else {
            score += ((row_seconds - mid_time).abs() / 60) as f64;
        }
        last_position = Some(position);
    }
    if !matched_any {
        return config.all_miss_score;
    }
    score
}

fn best_pool_trip<'a>(
    rows: &[FlatStopTime],
    pool: &'a [PoolTrip],
    config: &MatchingConfig,
) -> Option<(&'a PoolTrip, f64)> {
    let mut best: Option<(&PoolTrip, f64)> = None;
    for pool_trip in pool {
        let score = alignment_score(rows, pool_trip, config);
        if best.map_or(true, |(_, best_score)| score < best_score) {
            best = Some((pool_trip, score));
        }
    }
    best
}

/// Service ids whose calendar overlaps the class's weekday mask the most.
/// Every id tied at the maximum is kept; calendars with no overlap never
/// qualify. The result is sorted.
fn candidate_service_ids<'a>(
    mask: &str,
    calendars: impl IntoIterator<Item = (&'a String, &'a Calendar)>,
) -> Vec<String> {
    let mut best_overlap = 0;
    let mut candidates: Vec<String> = Vec::new();
    for (service_id, calendar) in calendars {
        let overlap = mask_overlap(mask, calendar);
        if overlap == 0 {
            continue;
        }
        match overlap.cmp(&best_overlap) {
            Ordering::Greater => {
                best_overlap = overlap;
                candidates.clear();
                candidates.push(service_id.clone());
            }
            Ordering::Equal => candidates.push(service_id.clone()),
            Ordering::Less => {}
        }
    }
    candidates.sort_unstable();
    candidates
}

/// Days active in both the mask (Monday first) and the calendar.
fn mask_overlap(mask: &str, calendar: &Calendar) -> u32 {
    let days = [
        calendar.monday,
        calendar.tuesday,
        calendar.wednesday,
        calendar.thursday,
        calendar.friday,
        calendar.saturday,
        calendar.sunday,
    ];
    mask.bytes()
        .zip(days)
        .filter(|(flag, active)| *flag == b'1' && *active)
        .count() as u32
}

struct ClassMatch {
    service_id: String,
    /// Block tag -> canonical calls of every kept pairing, unordered.
    blocks: AHashMap<String, Vec<BlockStopTime>>,
}

/// Pick the service id whose pool aligns cheapest with the class's
/// external trips, then assemble block schedules from the pairings that
/// clear the match threshold.
///
/// Pools must arrive in ascending service id order; total-score ties keep
/// the first. Discarded pairings still count toward their candidate's
/// total, so a pool that explains every trip moderately beats one that
/// nails half and misses the rest.
fn match_class_trips<'a>(
    external_trips: &[Vec<FlatStopTime>],
    pools: impl IntoIterator<Item = (&'a str, &'a [PoolTrip])>,
    config: &MatchingConfig,
) -> Option<ClassMatch> {
    if external_trips.is_empty() {
        return None;
    }
    let mut best: Option<(&str, f64, Vec<(&PoolTrip, f64)>)> = None;
    for (service_id, pool) in pools {
        if pool.is_empty() {
            continue;
        }
        let pairings: Vec<(&PoolTrip, f64)> = external_trips
            .iter()
            .filter_map(|rows| best_pool_trip(rows, pool, config))
            .collect();
        let total: f64 = pairings.iter().map(|(_, score)| score).sum();
        if best
            .as_ref()
            .map_or(true, |(_, best_total, _)| total < *best_total)
        {
            best = Some((service_id, total, pairings));
        }
    }
    let (service_id, total, pairings) = best?;
    debug!("service id {service_id} selected with total score {total}");

    let mut blocks: AHashMap<String, Vec<BlockStopTime>> = AHashMap::new();
    for (rows, (pool_trip, score)) in external_trips.iter().zip(&pairings) {
        let Some(first) = rows.first() else {
            continue;
        };
        if *score > config.trip_match_threshold {
            warn!(
                "discarding pairing of block {} with trip {} (score {score})",
                first.block_tag, pool_trip.trip_id,
            );
            continue;
        }
        let calls = blocks.entry(first.block_tag.clone()).or_default();
        calls.extend(
            pool_trip
                .stop_calls
                .iter()
                .map(|(stop_id, mid_time)| BlockStopTime {
                    trip_id: pool_trip.trip_id.clone(),
                    stop_id: stop_id.clone(),
                    mid_time: *mid_time,
                }),
        );
    }
    Some(ClassMatch {
        service_id: service_id.to_string(),
        blocks,
    })
}

/// Expand a service id's calendar and exceptions into its active dates.
fn resolve_service_dates(
    calendar: Option<&Calendar>,
    exceptions: &[CalendarDate],
) -> BTreeSet<NaiveDate> {
    let mut dates = BTreeSet::new();
    if let Some(calendar) = calendar {
        let mut current = calendar.start_date;
        while current <= calendar.end_date {
            let active = match current.weekday() {
                chrono::Weekday::Mon => calendar.monday,
                chrono::Weekday::Tue => calendar.tuesday,
                chrono::Weekday::Wed => calendar.wednesday,
                chrono::Weekday::Thu => calendar.thursday,
                chrono::Weekday::Fri => calendar.friday,
                chrono::Weekday::Sat => calendar.saturday,
                chrono::Weekday::Sun => calendar.sunday,
            };
            if active {
                dates.insert(current);
            }
            current += Duration::days(1);
        }
    }
    for exception in exceptions {
        match exception.exception_type {
            Exception::Added => {
                dates.insert(exception.date);
            }
            Exception::Deleted => {
                dates.remove(&exception.date);
            }
        }
    }
    dates
}
