//! Picks the subset of stops polled for predictions each cycle.
//!
//! Requesting every stop on every route would blow through the upstream
//! bandwidth quota, and adjacent stops mostly carry redundant deviation
//! information anyway. So once a day we rebuild a coverage model: each
//! route keeps its direction terminals plus enough interior stops, chosen
//! farthest-first, to fill a downsampled share of the route.

use ahash::{AHashMap, AHashSet};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::CoverageConfig;
use crate::nextbus::models::NbRoute;

/// The stops of one route that get polled for predictions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteStopCoverage {
    pub route_tag: String,
    /// Sorted so that reruns over the same configuration produce the
    /// same request urls.
    pub stop_tags: Vec<String>,
}

/// Builds the coverage model for a full set of route configurations.
pub fn sample(routes: &[NbRoute], config: &CoverageConfig) -> Vec<RouteStopCoverage> {
    let ratio = downsample_ratio(routes, config);
    debug!("stop coverage downsample ratio is {ratio:.3}");
    routes
        .iter()
        .map(|route| coverage_for_route(route, ratio))
        .collect()
}

/// Fraction of each route's stops to poll, derived from how many stops fit
/// in one polling cycle versus how many the network has. Capped so we never
/// poll more than half of a route.
fn downsample_ratio(routes: &[NbRoute], config: &CoverageConfig) -> f64 {
    let total_segments: usize = routes.iter().map(segment_count).sum();
    let stops_per_cycle = (config.requests_per_cycle * config.stops_per_request) as f64;
    (stops_per_cycle / total_segments as f64).min(config.max_ratio)
}

/// Number of unique consecutive stop pairs across all directions of a
/// route. A rough measure of route complexity that is stable when the same
/// street runs in both directions.
fn segment_count(route: &NbRoute) -> usize {
    let mut segments: AHashSet<(&str, &str)> = AHashSet::new();
    for direction in &route.directions {
        for pair in direction.stops.windows(2) {
            segments.insert((pair[0].as_str(), pair[1].as_str()));
        }
    }
    segments.len()
}

fn coverage_for_route(route: &NbRoute, ratio: f64) -> RouteStopCoverage {
    let mut selected: AHashSet<String> = AHashSet::new();
    // Direction terminals are always polled.
    for direction in &route.directions {
        if let Some(last) = direction.stops.last() {
            selected.insert(last.clone());
        }
    }

    let target = (segment_count(route) as f64 * ratio) as usize;
    while selected.len() < target {
        let mut weights: AHashMap<&str, u64> = AHashMap::new();
        for direction in &route.directions {
            let distances = min_hop_distances(&direction.stops, &selected);
            for (stop_tag, distance) in direction.stops.iter().zip(distances) {
                if !selected.contains(stop_tag) {
                    *weights.entry(stop_tag.as_str()).or_insert(0) += distance as u64;
                }
            }
        }
        // Heaviest stop wins; equal weights fall back to tag order so the
        // selection is reproducible.
        let Some((stop_tag, _)) = weights
            .into_iter()
            .max_by(|(tag_a, weight_a), (tag_b, weight_b)| {
                weight_a.cmp(weight_b).then_with(|| tag_b.cmp(tag_a))
            })
        else {
            break;
        };
        selected.insert(stop_tag.to_string());
    }

    let mut stop_tags: Vec<String> = selected.into_iter().collect();
    stop_tags.sort_unstable();
    RouteStopCoverage {
        route_tag: route.tag.clone(),
        stop_tags,
    }
}

/// Hop distance from each stop to the nearest already-selected stop in the
/// same direction, looking both ways. The ends of the sequence count as
/// distance zero anchors, which keeps weights from piling up at the edges.
fn min_hop_distances(stops: &[String], selected: &AHashSet<String>) -> Vec<usize> {
    let mut distances = vec![0usize; stops.len()];
    let mut run = 0usize;
    for (i, stop_tag) in stops.iter().enumerate() {
        if selected.contains(stop_tag) {
            run = 0;
        }
        distances[i] = run;
        run += 1;
    }
    run = 0;
    for (i, stop_tag) in stops.iter().enumerate().rev() {
        if selected.contains(stop_tag) {
            run = 0;
        }
        distances[i] = distances[i].min(run);
        run += 1;
    }
    distances
}
