//! Tunables for the throttle, sampler, and matchers. Every constant the
//! algorithms depend on lives here with its conventional default so a
//! deployment can override any of them without touching algorithm code.

use ahash::AHashMap;
use std::time::Duration;

/// Byte-budget pacing for the shared downloader.
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Sliding accounting window.
    pub window: Duration,
    /// Bytes allowed per window before the gate starts stalling callers.
    pub byte_budget: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        ThrottleConfig {
            window: Duration::from_secs(20),
            byte_budget: 2 * 1024 * 1024,
        }
    }
}

/// Controls how many stops per route are selected for live polling.
#[derive(Debug, Clone)]
pub struct CoverageConfig {
    /// Prediction requests we are willing to spend per poll cycle.
    pub requests_per_cycle: usize,
    /// Stops packed into a single predictionsForMultiStops request.
    pub stops_per_request: usize,
    /// Never poll more than this share of a route's segments.
    pub max_ratio: f64,
    /// Local wall-clock hour at which coverage and matching refresh daily.
    pub refresh_hour: u32,
}

impl Default for CoverageConfig {
    fn default() -> Self {
        CoverageConfig {
            requests_per_cycle: 30,
            stops_per_request: 100,
            max_ratio: 0.5,
            refresh_hour: 4,
        }
    }
}

/// Scoring constants for the stop, trip, and live matchers. The penalty
/// values are empirical; they are kept as configuration rather than
/// re-derived.
#[derive(Debug, Clone)]
pub struct MatchingConfig {
    /// Half-width of the box used to find canonical stops near an upstream
    /// stop, in meters.
    pub stop_match_distance: f64,
    /// Charged when an upstream stop-time's stop never occurs in the
    /// canonical trip being scored.
    pub miss_penalty: f64,
    /// Charged when a matched occurrence lands out of order.
    pub order_penalty: f64,
    /// Score for a trip pairing in which every stop-time missed.
    pub all_miss_score: f64,
    /// Per-trip minimum scores above this are discarded instead of matched.
    pub trip_match_threshold: f64,
    /// Multiplier applied to negative (early-running) deviations when the
    /// live inferencer ranks candidate schedule slots.
    pub early_deviation_factor: f64,
    /// Service class name -> seven-character weekday activity mask,
    /// Monday first.
    pub service_class_masks: AHashMap<String, String>,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        let mut service_class_masks = AHashMap::new();
        for (class, mask) in [
            ("mtwth", "1111000"),
            ("MoTuWeTh", "1111000"),
            ("f", "0000100"),
            ("Friday", "0000100"),
            ("sat", "0000010"),
            ("Saturday", "0000010"),
            ("sun", "0000001"),
            ("Sunday", "0000001"),
        ] {
            service_class_masks.insert(class.to_string(), mask.to_string());
        }
        MatchingConfig {
            stop_match_distance: 75.0,
            miss_penalty: 15.0,
            order_penalty: 15.0,
            all_miss_score: (4 * 60 * 60) as f64,
            trip_match_threshold: (2 * 60) as f64,
            early_deviation_factor: 2.0,
            service_class_masks,
        }
    }
}

/// Per-feed poll pacing.
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Minimum time between the start of two consecutive requests for the
    /// same route (and between poll cycles generally).
    pub minimum_time_between_requests: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig {
            minimum_time_between_requests: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_day_masks_cover_the_week() {
        let config = MatchingConfig::default();
        let mut days = [false; 7];
        for mask in config.service_class_masks.values() {
            assert_eq!(mask.len(), 7);
            for (i, c) in mask.chars().enumerate() {
                if c == '1' {
                    days[i] = true;
                }
            }
        }
        assert_eq!(days, [true; 7]);
    }
}
