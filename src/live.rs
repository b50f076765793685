//! Live trip inference.
//!
//! Prediction rows arrive route- and stop-tagged but rarely trip-tagged.
//! After rewriting tags to canonical ids, rows are grouped per vehicle run
//! and the group's earliest anchor is placed into the block's assembled
//! schedule by deviation-scored nearest-time search; later rows ride
//! forward from the anchor through the block's ordered stop calls. The
//! observed deviation is carried per vehicle across polls so the next
//! anchor prefers schedule slots consistent with how the vehicle has been
//! running.

use std::collections::BTreeMap;
use std::time::Duration;

use ahash::AHashMap;
use chrono::{DateTime, NaiveDate};
use chrono_tz::Tz;
use tracing::debug;

use crate::config::MatchingConfig;
use crate::matching::MappingSnapshot;
use crate::matching::indices::{ServiceDateBlockKey, StopTimeIndex};
use crate::nextbus::models::{FlatPrediction, NbPredictions, RouteDirectionStopKey};
use crate::service_date_start_epoch;

/// Cross-poll inference state for one vehicle id.
#[derive(Debug, Clone)]
pub struct VehicleStatus {
    /// Frozen at first sighting so an overnight run keeps the service
    /// date it started under.
    pub service_date: NaiveDate,
    pub service_date_start_ms: i64,
    /// Seconds behind (positive) or ahead of (negative) schedule at the
    /// last anchored prediction.
    pub last_deviation: i64,
    pub last_touched: Duration,
}

/// Single-writer store of per-vehicle inference state.
#[derive(Debug, Default)]
pub struct VehicleStatuses {
    statuses: AHashMap<String, VehicleStatus>,
}

impl VehicleStatuses {
    pub fn new() -> VehicleStatuses {
        VehicleStatuses::default()
    }

    pub fn get(&self, vehicle_id: &str) -> Option<&VehicleStatus> {
        self.statuses.get(vehicle_id)
    }

    /// Drop vehicles not seen for `max_idle`, so a vehicle returning
    /// tomorrow starts from a fresh service date and zero deviation.
    pub fn prune(&mut self, now: Duration, max_idle: Duration) {
        self.statuses
            .retain(|_, status| now.saturating_sub(status.last_touched) <= max_idle);
    }

    fn status_for(&mut self, vehicle_id: &str, tz: Tz, now: Duration) -> Option<&mut VehicleStatus> {
        if !self.statuses.contains_key(vehicle_id) {
            let now_local =
                DateTime::from_timestamp_millis(now.as_millis() as i64)?.with_timezone(&tz);
            let service_date = now_local.date_naive();
            let start = service_date_start_epoch(service_date, tz)?;
            self.statuses.insert(
                vehicle_id.to_string(),
                VehicleStatus {
                    service_date,
                    service_date_start_ms: start * 1000,
                    last_deviation: 0,
                    last_touched: now,
                },
            );
        }
        let status = self.statuses.get_mut(vehicle_id)?;
        status.last_touched = now;
        Some(status)
    }
}

/// One row per prediction with its enclosing (route, stop) context.
pub fn flatten_predictions(predictions: &[NbPredictions]) -> Vec<FlatPrediction> {
    let mut rows = Vec::new();
    for group in predictions {
        for direction in &group.directions {
            for prediction in &direction.predictions {
                rows.push(FlatPrediction {
                    route_tag: group.route_tag.clone(),
                    stop_tag: group.stop_tag.clone(),
                    epoch_time: prediction.epoch_time,
                    dir_tag: prediction.dir_tag.clone(),
                    vehicle: prediction.vehicle.clone(),
                    block: prediction.block.clone(),
                    trip_tag: prediction.trip_tag.clone(),
                });
            }
        }
    }
    rows
}

/// Rewrite tags to canonical ids, then infer trip identity for every
/// vehicle run that did not supply one.
///
/// `now` is sampled once per poll cycle by the caller so that every group
/// in the cycle sees the same clock.
pub fn map_to_gtfs(
    predictions: &mut [FlatPrediction],
    snapshot: &MappingSnapshot,
    statuses: &mut VehicleStatuses,
    config: &MatchingConfig,
    now: Duration,
) {
    for row in predictions.iter_mut() {
        rewrite_tags(row, snapshot);
    }

    // Group keys pick the trip tag when the feed supplied one, so
    // externally identified rows never mix with rows needing inference.
    let mut groups: BTreeMap<(String, String), Vec<usize>> = BTreeMap::new();
    for (i, row) in predictions.iter().enumerate() {
        let Some(vehicle) = &row.vehicle else { continue };
        let Some(run) = row.trip_tag.as_ref().or(row.block.as_ref()) else {
            continue;
        };
        groups
            .entry((vehicle.clone(), run.clone()))
            .or_default()
            .push(i);
    }
    for (_, mut group) in groups {
        group.sort_by_key(|&i| predictions[i].epoch_time);
        if predictions[group[0]].trip_tag.is_some() {
            continue;
        }
        infer_group(predictions, &group, snapshot, statuses, config, now);
    }
}

/// Both lookups key on the original tags, so the two rewrites commute.
fn rewrite_tags(row: &mut FlatPrediction, snapshot: &MappingSnapshot) {
    let route_id = snapshot.route_ids.get(&row.route_tag).cloned();
    let stop_id = row.dir_tag.as_ref().and_then(|dir_tag| {
        snapshot
            .stop_ids
            .get(&RouteDirectionStopKey::new(
                row.route_tag.as_str(),
                dir_tag.as_str(),
                row.stop_tag.as_str(),
            ))
            .cloned()
    });
    if let Some(route_id) = route_id {
        row.route_tag = route_id;
    }
    if let Some(stop_id) = stop_id {
        row.stop_tag = stop_id;
    }
}

fn infer_group(
    predictions: &mut [FlatPrediction],
    group: &[usize],
    snapshot: &MappingSnapshot,
    statuses: &mut VehicleStatuses,
    config: &MatchingConfig,
    now: Duration,
) {
    let Some(&first) = group.first() else { return };
    let Some(vehicle_id) = predictions[first].vehicle.clone() else {
        return;
    };
    let Some(block) = predictions[first].block.clone() else {
        return;
    };
    let route_id = predictions[first].route_tag.clone();
    let Some(status) = statuses.status_for(&vehicle_id, snapshot.agency_tz, now) else {
        return;
    };
    let key = ServiceDateBlockKey::new(route_id, block, status.service_date);
    let Some(indices) = snapshot.block_indices.get(&key) else {
        debug!(
            "no schedule for vehicle {vehicle_id} under block {} on {}",
            key.block_tag, key.service_date
        );
        return;
    };

    // Anchor on the earliest prediction whose stop the block calls at.
    let mut anchored: Option<(usize, usize)> = None;
    for (slot, &row) in group.iter().enumerate() {
        let Some(index) = indices.index_for_stop(&predictions[row].stop_tag) else {
            continue;
        };
        let effective = (predictions[row].epoch_time - status.service_date_start_ms) / 1000;
        let Some((position, deviation)) =
            choose_neighbor(index, effective, status.last_deviation, config)
        else {
            continue;
        };
        predictions[row].trip_tag = Some(indices.stop_times()[position].trip_id.clone());
        status.last_deviation = deviation;
        anchored = Some((slot, position));
        break;
    }
    let Some((anchor_slot, mut position)) = anchored else {
        return;
    };

    // Later predictions ride forward through the block's call list; the
    // first stop not found ahead ends propagation for the cycle.
    for &row in &group[anchor_slot + 1..] {
        let Some(next) = indices.next_call_at_stop(position + 1, &predictions[row].stop_tag)
        else {
            break;
        };
        predictions[row].trip_tag = Some(indices.stop_times()[next].trip_id.clone());
        position = next;
    }
}

/// Neighbor of the insertion point whose deviation is cheapest given how
/// the vehicle has been running. Early running is penalized double; ties
/// keep the earlier slot.
fn choose_neighbor(
    index: &StopTimeIndex,
    effective: i64,
    last_deviation: i64,
    config: &MatchingConfig,
) -> Option<(usize, i64)> {
    let mid_times = index.mid_times();
    let split = index.insertion_point(effective);
    let mut best: Option<(usize, i64, f64)> = None;
    for slot in [split.checked_sub(1), Some(split)].into_iter().flatten() {
        if slot >= mid_times.len() {
            continue;
        }
        let deviation = effective - mid_times[slot];
        let factor = if deviation < 0 {
            config.early_deviation_factor
        } else {
            1.0
        };
        let score = (deviation - last_deviation).abs() as f64 + factor * deviation.abs() as f64;
        if best.as_ref().map_or(true, |(_, _, best_score)| score < *best_score) {
            best = Some((index.position(slot), deviation, score));
        }
    }
    best.map(|(position, deviation, _)| (position, deviation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::indices::{BlockStopTime, StopTimeIndices};
    use std::sync::Arc;

    // 2024-01-05 00:00:00 UTC.
    const DAY_START_MS: i64 = 1_704_412_800_000;

    fn call(trip_id: &str, stop_id: &str, mid_time: i64) -> BlockStopTime {
        BlockStopTime {
            trip_id: trip_id.to_string(),
            stop_id: stop_id.to_string(),
            mid_time,
        }
    }

    fn snapshot(calls: Vec<BlockStopTime>) -> MappingSnapshot {
        let mut snapshot = MappingSnapshot::empty();
        let date = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();
        snapshot.block_indices.insert(
            ServiceDateBlockKey::new("R", "B1", date),
            Arc::new(StopTimeIndices::build(calls)),
        );
        snapshot
    }

    fn prediction(stop: &str, offset_ms: i64) -> FlatPrediction {
        FlatPrediction {
            route_tag: "R".to_string(),
            stop_tag: stop.to_string(),
            epoch_time: DAY_START_MS + offset_ms,
            dir_tag: None,
            vehicle: Some("v1".to_string()),
            block: Some("B1".to_string()),
            trip_tag: None,
        }
    }

    fn now() -> Duration {
        Duration::from_millis((DAY_START_MS + 3_600_000) as u64)
    }

    #[test]
    fn anchors_then_propagates_within_one_cycle() {
        let snapshot = snapshot(vec![
            call("T", "A", 0),
            call("T", "B", 300),
            call("T", "C", 600),
        ]);
        let mut statuses = VehicleStatuses::new();
        let config = MatchingConfig::default();
        let mut rows = vec![prediction("A", 5_000), prediction("B", 292_000)];

        map_to_gtfs(&mut rows, &snapshot, &mut statuses, &config, now());
        assert_eq!(rows[0].trip_tag.as_deref(), Some("T"));
        assert_eq!(rows[1].trip_tag.as_deref(), Some("T"));
        // Propagated rows do not move the deviation; only anchors do.
        assert_eq!(statuses.get("v1").unwrap().last_deviation, 5);
    }

    #[test]
    fn deviation_follows_the_anchor_across_cycles() {
        let snapshot = snapshot(vec![
            call("T", "A", 0),
            call("T", "B", 300),
            call("T", "C", 600),
        ]);
        let mut statuses = VehicleStatuses::new();
        let config = MatchingConfig::default();

        let mut first = vec![prediction("A", 5_000)];
        map_to_gtfs(&mut first, &snapshot, &mut statuses, &config, now());
        assert_eq!(first[0].trip_tag.as_deref(), Some("T"));
        assert_eq!(statuses.get("v1").unwrap().last_deviation, 5);

        let mut second = vec![prediction("B", 292_000)];
        map_to_gtfs(&mut second, &snapshot, &mut statuses, &config, now());
        assert_eq!(second[0].trip_tag.as_deref(), Some("T"));
        assert_eq!(statuses.get("v1").unwrap().last_deviation, -8);
    }

    #[test]
    fn on_schedule_vehicles_keep_zero_deviation() {
        let snapshot = snapshot(vec![call("T", "A", 100), call("T", "B", 400)]);
        let mut statuses = VehicleStatuses::new();
        let config = MatchingConfig::default();

        for (stop, offset_ms) in [("A", 100_000), ("B", 400_000)] {
            let mut rows = vec![prediction(stop, offset_ms)];
            map_to_gtfs(&mut rows, &snapshot, &mut statuses, &config, now());
            assert_eq!(rows[0].trip_tag.as_deref(), Some("T"));
            assert_eq!(statuses.get("v1").unwrap().last_deviation, 0);
        }
    }

    #[test]
    fn early_running_scores_worse_than_late() {
        // Calls at 100 and 300; an observation at 200 is 100s late for the
        // first and 100s early for the second, so the first must win.
        let indices = StopTimeIndices::build(vec![call("T1", "S", 100), call("T2", "S", 300)]);
        let index = indices.index_for_stop("S").unwrap();
        let (position, deviation) =
            choose_neighbor(index, 200, 0, &MatchingConfig::default()).unwrap();
        assert_eq!(indices.stop_times()[position].trip_id, "T1");
        assert_eq!(deviation, 100);
    }

    #[test]
    fn propagation_stops_at_the_first_unmatched_stop() {
        let snapshot = snapshot(vec![
            call("T", "A", 0),
            call("T", "B", 300),
        ]);
        let mut statuses = VehicleStatuses::new();
        let config = MatchingConfig::default();
        let mut rows = vec![
            prediction("A", 5_000),
            prediction("X", 100_000),
            prediction("B", 292_000),
        ];

        map_to_gtfs(&mut rows, &snapshot, &mut statuses, &config, now());
        assert_eq!(rows[0].trip_tag.as_deref(), Some("T"));
        assert_eq!(rows[1].trip_tag, None);
        assert_eq!(rows[2].trip_tag, None);
    }

    #[test]
    fn unknown_blocks_leave_the_group_unassigned() {
        let snapshot = snapshot(vec![call("T", "A", 0)]);
        let mut statuses = VehicleStatuses::new();
        let config = MatchingConfig::default();
        let mut rows = vec![prediction("A", 5_000)];
        rows[0].block = Some("B9".to_string());

        map_to_gtfs(&mut rows, &snapshot, &mut statuses, &config, now());
        assert_eq!(rows[0].trip_tag, None);
    }

    #[test]
    fn externally_supplied_trips_are_untouched() {
        let snapshot = snapshot(vec![call("T", "A", 0)]);
        let mut statuses = VehicleStatuses::new();
        let config = MatchingConfig::default();
        let mut rows = vec![prediction("A", 5_000)];
        rows[0].trip_tag = Some("X".to_string());

        map_to_gtfs(&mut rows, &snapshot, &mut statuses, &config, now());
        assert_eq!(rows[0].trip_tag.as_deref(), Some("X"));
        assert!(statuses.get("v1").is_none());
    }

    #[test]
    fn service_date_is_frozen_at_first_sighting() {
        let snapshot = snapshot(vec![call("T", "A", 0)]);
        let mut statuses = VehicleStatuses::new();
        let config = MatchingConfig::default();

        let mut rows = vec![prediction("A", 5_000)];
        map_to_gtfs(&mut rows, &snapshot, &mut statuses, &config, now());
        let first_date = statuses.get("v1").unwrap().service_date;

        // A poll the next morning still infers against the original date.
        let next_morning = now() + Duration::from_secs(24 * 3600);
        let mut rows = vec![prediction("A", 65_000)];
        map_to_gtfs(&mut rows, &snapshot, &mut statuses, &config, next_morning);
        assert_eq!(statuses.get("v1").unwrap().service_date, first_date);
        assert_eq!(rows[0].trip_tag.as_deref(), Some("T"));
    }

    #[test]
    fn pruning_forgets_idle_vehicles() {
        let snapshot = snapshot(vec![call("T", "A", 0)]);
        let mut statuses = VehicleStatuses::new();
        let config = MatchingConfig::default();
        let mut rows = vec![prediction("A", 5_000)];
        map_to_gtfs(&mut rows, &snapshot, &mut statuses, &config, now());
        assert!(statuses.get("v1").is_some());

        statuses.prune(now() + Duration::from_secs(3600), Duration::from_secs(1800));
        assert!(statuses.get("v1").is_none());
    }

    #[test]
    fn tags_rewrite_from_the_original_route_and_stop() {
        let mut snapshot = MappingSnapshot::empty();
        snapshot
            .route_ids
            .insert("r1".to_string(), "R1".to_string());
        snapshot.stop_ids.insert(
            RouteDirectionStopKey::new("r1", "d1", "s1"),
            "S1".to_string(),
        );
        let mut row = FlatPrediction {
            route_tag: "r1".to_string(),
            stop_tag: "s1".to_string(),
            epoch_time: 0,
            dir_tag: Some("d1".to_string()),
            vehicle: None,
            block: None,
            trip_tag: None,
        };
        rewrite_tags(&mut row, &snapshot);
        assert_eq!(row.route_tag, "R1");
        assert_eq!(row.stop_tag, "S1");
    }
}
