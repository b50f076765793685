//! Geographic stop candidates and per-direction stop assignment.
//!
//! Candidates come from a bounding-box query around each external stop.
//! Ambiguity is then settled one direction at a time: a stop with a single
//! candidate is fixed outright, the rest go through a bounded backtracking
//! search that scores complete assignments against the canonical route's
//! observed stop sequences.

use std::sync::Arc;

use ahash::AHashMap;
use gtfs_structures::Gtfs;
use itertools::Itertools;
use rstar::primitives::GeomWithData;
use rstar::{AABB, RTree};

use super::RouteMatch;
use crate::nextbus::models::{NbRoute, RouteDirectionStopKey};

const EARTH_RADIUS_M: f64 = 6_371_010.0;

type StopPoint = GeomWithData<[f64; 2], String>;

/// Candidate canonical stop ids per external stop tag. A tag appearing on
/// several routes is queried once; candidates are sorted so that every
/// later tie-break is reproducible.
pub fn candidate_stops<'a>(
    routes: &[NbRoute],
    gtfs_stops: impl IntoIterator<Item = &'a Arc<gtfs_structures::Stop>>,
    match_distance: f64,
) -> AHashMap<String, Vec<String>> {
    let points: Vec<StopPoint> = gtfs_stops
        .into_iter()
        .filter_map(|stop| {
            let (Some(latitude), Some(longitude)) = (stop.latitude, stop.longitude) else {
                return None;
            };
            Some(GeomWithData::new([longitude, latitude], stop.id.clone()))
        })
        .collect();
    let tree = RTree::bulk_load(points);

    let mut candidates: AHashMap<String, Vec<String>> = AHashMap::new();
    for route in routes {
        for stop in &route.stops {
            if candidates.contains_key(&stop.tag) {
                continue;
            }
            let mut ids: Vec<String> = tree
                .locate_in_envelope(&bounds_around(stop.lat, stop.lon, match_distance))
                .map(|point| point.data.clone())
                .collect();
            ids.sort_unstable();
            candidates.insert(stop.tag.clone(), ids);
        }
    }
    candidates
}

/// Box spanning `distance` meters in each direction, in degrees.
fn bounds_around(lat: f64, lon: f64, distance: f64) -> AABB<[f64; 2]> {
    let lat_radius = (distance / EARTH_RADIUS_M).to_degrees();
    let lon_radius = (distance / EARTH_RADIUS_M / lat.to_radians().cos()).to_degrees();
    AABB::from_corners(
        [lon - lon_radius, lat - lat_radius],
        [lon + lon_radius, lat + lat_radius],
    )
}

/// Resolves the external to canonical stop assignment for every direction
/// of every matched route.
pub fn match_stops(
    route_matches: &[RouteMatch<'_>],
    candidates: &AHashMap<String, Vec<String>>,
    gtfs: &Gtfs,
) -> AHashMap<RouteDirectionStopKey, String> {
    let mut mappings = AHashMap::new();
    for matched in route_matches {
        let sequences = stop_sequences_for_route(gtfs, &matched.route_id);
        // Position of each stop within each sequence; a loop route keeps
        // the last visit.
        let sequence_indices: Vec<AHashMap<&str, usize>> = sequences
            .iter()
            .map(|sequence| {
                sequence
                    .iter()
                    .enumerate()
                    .map(|(position, stop_id)| (stop_id.as_str(), position))
                    .collect()
            })
            .collect();

        for direction in &matched.nb_route.directions {
            let assigned = assign_direction(&direction.stops, candidates, &sequence_indices);
            for (stop_tag, stop_id) in assigned {
                mappings.insert(
                    RouteDirectionStopKey::new(
                        matched.nb_route.tag.clone(),
                        direction.tag.clone(),
                        stop_tag,
                    ),
                    stop_id,
                );
            }
        }
    }
    mappings
}

/// Distinct stop-id sequences observed across a canonical route's trips.
fn stop_sequences_for_route(gtfs: &Gtfs, route_id: &str) -> Vec<Vec<String>> {
    let mut sequences: Vec<Vec<String>> = gtfs
        .trips
        .values()
        .filter(|trip| trip.route_id == route_id)
        .map(|trip| {
            trip.stop_times
                .iter()
                .map(|stop_time| stop_time.stop.id.clone())
                .collect()
        })
        .collect();
    sequences.sort_unstable();
    sequences.dedup();
    sequences
}

/// One direction's assignment. Stops without candidates stay unmapped.
fn assign_direction(
    ordered_tags: &[String],
    candidates: &AHashMap<String, Vec<String>>,
    sequence_indices: &[AHashMap<&str, usize>],
) -> AHashMap<String, String> {
    let mut assigned: AHashMap<String, String> = AHashMap::new();
    let mut ambiguous: Vec<(&str, &[String])> = Vec::new();
    for tag in ordered_tags.iter().unique() {
        let Some(stop_candidates) = candidates.get(tag) else {
            continue;
        };
        match stop_candidates.as_slice() {
            [] => {}
            [only] => {
                assigned.insert(tag.clone(), only.clone());
            }
            _ => ambiguous.push((tag.as_str(), stop_candidates.as_slice())),
        }
    }
    if ambiguous.is_empty() {
        return assigned;
    }
    search_assignments(ordered_tags, &ambiguous, assigned, sequence_indices)
}

/// Iterative backtracking over the cross product of the ambiguous stops'
/// candidate lists. Per-stop penalties only grow as stops are added, so a
/// partial assignment already at the best complete score is abandoned.
fn search_assignments(
    ordered_tags: &[String],
    ambiguous: &[(&str, &[String])],
    mut assigned: AHashMap<String, String>,
    sequence_indices: &[AHashMap<&str, usize>],
) -> AHashMap<String, String> {
    let mut best = assigned.clone();
    let mut best_score = u32::MAX;
    // cursor[d] is the candidate currently applied for ambiguous stop d.
    let mut cursor: Vec<usize> = Vec::with_capacity(ambiguous.len());

    loop {
        if cursor.len() == ambiguous.len() {
            let score = assignment_score(ordered_tags, &assigned, sequence_indices);
            if score < best_score {
                best_score = score;
                best = assigned.clone();
            }
            if !advance(&mut cursor, ambiguous, &mut assigned) {
                break;
            }
            continue;
        }
        let (tag, stop_candidates) = ambiguous[cursor.len()];
        assigned.insert(tag.to_string(), stop_candidates[0].clone());
        cursor.push(0);
        if assignment_score(ordered_tags, &assigned, sequence_indices) >= best_score
            && !advance(&mut cursor, ambiguous, &mut assigned)
        {
            break;
        }
    }
    best
}

/// Steps to the next untried candidate combination, unwinding exhausted
/// depths. Returns false once the whole space is consumed.
fn advance(
    cursor: &mut Vec<usize>,
    ambiguous: &[(&str, &[String])],
    assigned: &mut AHashMap<String, String>,
) -> bool {
    while let Some(depth) = cursor.len().checked_sub(1) {
        let (tag, stop_candidates) = ambiguous[depth];
        let next = cursor[depth] + 1;
        if next < stop_candidates.len() {
            cursor[depth] = next;
            assigned.insert(tag.to_string(), stop_candidates[next].clone());
            return true;
        }
        cursor.pop();
        assigned.remove(tag);
    }
    false
}

/// Penalty for an assignment against one canonical sequence: a point per
/// assigned stop the sequence never visits, plus a point per stop landing
/// before the previously assigned position. The best sequence counts, so
/// a route with branches is scored against its closest branch.
fn assignment_score(
    ordered_tags: &[String],
    assigned: &AHashMap<String, String>,
    sequence_indices: &[AHashMap<&str, usize>],
) -> u32 {
    let mut min_score = u32::MAX;
    for indices in sequence_indices {
        let mut score = 0u32;
        let mut last_position: Option<usize> = None;
        for tag in ordered_tags {
            let Some(stop_id) = assigned.get(tag) else {
                continue;
            };
            match indices.get(stop_id.as_str()) {
                Some(&position) => {
                    if last_position.is_some_and(|last| position < last) {
                        score += 1;
                    }
                    last_position = Some(position);
                }
                None => score += 1,
            }
        }
        min_score = min_score.min(score);
    }
    min_score
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nb_stop(tag: &str, lat: f64, lon: f64) -> crate::nextbus::models::NbStop {
        crate::nextbus::models::NbStop {
            tag: tag.to_string(),
            title: None,
            lat,
            lon,
            stop_id: None,
        }
    }

    fn gtfs_stop(id: &str, lat: f64, lon: f64) -> Arc<gtfs_structures::Stop> {
        Arc::new(gtfs_structures::Stop {
            id: id.to_string(),
            latitude: Some(lat),
            longitude: Some(lon),
            ..Default::default()
        })
    }

    fn tags(tags: &[&str]) -> Vec<String> {
        tags.iter().map(|t| t.to_string()).collect()
    }

    fn candidate_map(entries: &[(&str, &[&str])]) -> AHashMap<String, Vec<String>> {
        entries
            .iter()
            .map(|(tag, ids)| (tag.to_string(), ids.iter().map(|i| i.to_string()).collect()))
            .collect()
    }

    fn sequence_index(sequence: &[&'static str]) -> AHashMap<&'static str, usize> {
        sequence.iter().enumerate().map(|(i, id)| (*id, i)).collect()
    }

    #[test]
    fn candidates_respect_the_match_distance() {
        let route = NbRoute {
            tag: "N".to_string(),
            title: None,
            stops: vec![nb_stop("5240", 37.7600, -122.4500)],
            directions: Vec::new(),
        };
        // 50 m north is inside a 75 m box, 200 m north is not.
        let near = gtfs_stop("near", 37.7600 + 0.00045, -122.4500);
        let far = gtfs_stop("far", 37.7600 + 0.0018, -122.4500);
        let no_coords = Arc::new(gtfs_structures::Stop {
            id: "nowhere".to_string(),
            ..Default::default()
        });

        let candidates = candidate_stops(
            std::slice::from_ref(&route),
            [&near, &far, &no_coords],
            75.0,
        );
        assert_eq!(candidates["5240"], vec!["near".to_string()]);
    }

    #[test]
    fn unambiguous_candidates_map_directly_and_score_zero() {
        let ordered = tags(&["s1", "s2", "s3"]);
        let candidates = candidate_map(&[("s1", &["A"]), ("s2", &["B"]), ("s3", &["C"])]);
        let sequences = vec![sequence_index(&["A", "B", "C"])];

        let assigned = assign_direction(&ordered, &candidates, &sequences);
        assert_eq!(assigned["s1"], "A");
        assert_eq!(assigned["s2"], "B");
        assert_eq!(assigned["s3"], "C");
        assert_eq!(assignment_score(&ordered, &assigned, &sequences), 0);
    }

    #[test]
    fn ambiguous_stops_resolve_against_sequence_membership() {
        let ordered = tags(&["s1", "s2"]);
        let candidates = candidate_map(&[("s1", &["A", "X"]), ("s2", &["B"])]);
        let sequences = vec![sequence_index(&["A", "B"])];

        let assigned = assign_direction(&ordered, &candidates, &sequences);
        assert_eq!(assigned["s1"], "A");
    }

    #[test]
    fn branching_sequences_score_against_the_best_branch() {
        let ordered = tags(&["s1", "s2", "s3"]);
        let candidates =
            candidate_map(&[("s1", &["A"]), ("s2", &["B"]), ("s3", &["C", "D"])]);
        let sequences = vec![sequence_index(&["A", "B", "C"]), sequence_index(&["A", "B", "D"])];

        // Both branches allow a zero score; the first candidate in sorted
        // order wins the tie.
        let assigned = assign_direction(&ordered, &candidates, &sequences);
        assert_eq!(assigned["s3"], "C");
    }

    #[test]
    fn stops_without_candidates_stay_unmapped() {
        let ordered = tags(&["s1", "s2"]);
        let candidates = candidate_map(&[("s1", &[]), ("s2", &["B"])]);
        let sequences = vec![sequence_index(&["A", "B"])];

        let assigned = assign_direction(&ordered, &candidates, &sequences);
        assert!(!assigned.contains_key("s1"));
        assert_eq!(assigned["s2"], "B");
    }

    #[test]
    fn out_of_order_assignments_are_penalized() {
        let ordered = tags(&["s1", "s2"]);
        let mut assigned = AHashMap::new();
        assigned.insert("s1".to_string(), "B".to_string());
        assigned.insert("s2".to_string(), "A".to_string());
        let sequences = vec![sequence_index(&["A", "B"])];

        assert_eq!(assignment_score(&ordered, &assigned, &sequences), 1);
    }
}
