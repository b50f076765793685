//! Maps external routes to canonical routes by stop-set overlap.

use ahash::{AHashMap, AHashSet};
use gtfs_structures::Gtfs;
use tracing::debug;

use super::RouteMatch;
use crate::nextbus::models::NbRoute;

/// Pairs each external route with the canonical route whose stop set best
/// covers the external stops' geographic candidates. An external route
/// with no overlap anywhere stays unmatched.
pub fn match_routes<'a>(
    routes: &'a [NbRoute],
    gtfs: &Gtfs,
    candidates: &AHashMap<String, Vec<String>>,
) -> Vec<RouteMatch<'a>> {
    let stop_sets = stop_sets_by_route(gtfs);
    let mut matches = Vec::new();
    for nb_route in routes {
        match best_route(nb_route, &stop_sets, candidates) {
            Some(route_id) => {
                debug!("matched route {} to {route_id}", nb_route.tag);
                matches.push(RouteMatch { nb_route, route_id });
            }
            None => debug!("no canonical route overlaps route {}", nb_route.tag),
        }
    }
    matches
}

/// Union of the stops visited by each canonical route's trips.
fn stop_sets_by_route(gtfs: &Gtfs) -> AHashMap<String, AHashSet<String>> {
    let mut stop_sets: AHashMap<String, AHashSet<String>> = AHashMap::new();
    for trip in gtfs.trips.values() {
        let stops = stop_sets.entry(trip.route_id.clone()).or_default();
        for stop_time in &trip.stop_times {
            stops.insert(stop_time.stop.id.clone());
        }
    }
    stop_sets
}

fn best_route(
    nb_route: &NbRoute,
    stop_sets: &AHashMap<String, AHashSet<String>>,
    candidates: &AHashMap<String, Vec<String>>,
) -> Option<String> {
    if nb_route.stops.is_empty() {
        return None;
    }
    let mut best: Option<(f64, &str)> = None;
    for (route_id, stop_set) in stop_sets {
        let hits = nb_route
            .stops
            .iter()
            .filter(|stop| {
                candidates
                    .get(&stop.tag)
                    .is_some_and(|ids| ids.iter().any(|id| stop_set.contains(id)))
            })
            .count();
        let ratio = hits as f64 / nb_route.stops.len() as f64;
        if ratio == 0.0 {
            continue;
        }
        // Equal coverage falls to the lexicographically smallest id.
        let better = match best {
            None => true,
            Some((best_ratio, best_id)) => {
                ratio > best_ratio || (ratio == best_ratio && route_id.as_str() < best_id)
            }
        };
        if better {
            best = Some((ratio, route_id));
        }
    }
    best.map(|(_, route_id)| route_id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nextbus::models::NbStop;

    fn nb_route(tag: &str, stop_tags: &[&str]) -> NbRoute {
        NbRoute {
            tag: tag.to_string(),
            title: None,
            stops: stop_tags
                .iter()
                .map(|t| NbStop {
                    tag: t.to_string(),
                    title: None,
                    lat: 0.0,
                    lon: 0.0,
                    stop_id: None,
                })
                .collect(),
            directions: Vec::new(),
        }
    }

    fn stop_set(ids: &[&str]) -> AHashSet<String> {
        ids.iter().map(|i| i.to_string()).collect()
    }

    fn candidate_map(entries: &[(&str, &[&str])]) -> AHashMap<String, Vec<String>> {
        entries
            .iter()
            .map(|(tag, ids)| (tag.to_string(), ids.iter().map(|i| i.to_string()).collect()))
            .collect()
    }

    #[test]
    fn zero_overlap_never_matches() {
        let route = nb_route("N", &["s1", "s2"]);
        let candidates = candidate_map(&[("s1", &["A"]), ("s2", &["B"])]);
        let mut stop_sets = AHashMap::new();
        stop_sets.insert("route_1".to_string(), stop_set(&["X", "Y"]));

        assert_eq!(best_route(&route, &stop_sets, &candidates), None);
    }

    #[test]
    fn higher_coverage_wins() {
        let route = nb_route("N", &["s1", "s2"]);
        let candidates = candidate_map(&[("s1", &["A"]), ("s2", &["B"])]);
        let mut stop_sets = AHashMap::new();
        stop_sets.insert("partial".to_string(), stop_set(&["A", "X"]));
        stop_sets.insert("full".to_string(), stop_set(&["A", "B"]));

        assert_eq!(
            best_route(&route, &stop_sets, &candidates),
            Some("full".to_string())
        );
    }

    #[test]
    fn equal_coverage_prefers_the_smallest_route_id() {
        let route = nb_route("N", &["s1"]);
        let candidates = candidate_map(&[("s1", &["A"])]);
        let mut stop_sets = AHashMap::new();
        stop_sets.insert("route_b".to_string(), stop_set(&["A"]));
        stop_sets.insert("route_a".to_string(), stop_set(&["A"]));

        assert_eq!(
            best_route(&route, &stop_sets, &candidates),
            Some("route_a".to_string())
        );
    }

    #[test]
    fn stops_without_candidates_do_not_count_as_hits() {
        let route = nb_route("N", &["s1", "s2"]);
        let candidates = candidate_map(&[("s1", &["A"])]);
        let mut stop_sets = AHashMap::new();
        stop_sets.insert("half".to_string(), stop_set(&["A", "B"]));

        // Only s1 hits; the route still matches on the surviving ratio.
        assert_eq!(
            best_route(&route, &stop_sets, &candidates),
            Some("half".to_string())
        );
    }
}
