//! Typed records for the upstream publicXMLFeed responses, plus the
//! flattened forms the matchers and feed builders work with.

use serde::{Deserialize, Serialize};

/// One route as returned by routeList / routeConfig.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NbRoute {
    pub tag: String,
    pub title: Option<String>,
    /// All stops on the route with coordinates (routeConfig only).
    pub stops: Vec<NbStop>,
    /// Ordered stop tags per direction (routeConfig only).
    pub directions: Vec<NbDirection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NbStop {
    pub tag: String,
    pub title: Option<String>,
    pub lat: f64,
    pub lon: f64,
    /// Agency-global numeric stop id, distinct from the per-route tag.
    pub stop_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NbDirection {
    pub tag: String,
    pub title: Option<String>,
    /// Stop tags in travel order.
    pub stops: Vec<String>,
}

/// One schedule table from the schedule command: a route serviced on one
/// day-of-week pattern in one direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NbSchedule {
    pub route_tag: String,
    pub schedule_class: Option<String>,
    pub service_class: String,
    pub direction_tag: String,
    pub trips: Vec<NbScheduledTrip>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NbScheduledTrip {
    pub block_id: String,
    pub stop_times: Vec<NbStopTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NbStopTime {
    pub tag: String,
    /// Milliseconds after midnight; negative when the trip skips the stop.
    pub epoch_time: i64,
}

/// Predictions for one (route, stop) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NbPredictions {
    pub route_tag: String,
    pub stop_tag: String,
    pub directions: Vec<NbPredictionDirection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NbPredictionDirection {
    pub title: Option<String>,
    pub predictions: Vec<NbPrediction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NbPrediction {
    /// Unix milliseconds of the predicted arrival/departure.
    pub epoch_time: i64,
    pub dir_tag: Option<String>,
    pub vehicle: Option<String>,
    pub block: Option<String>,
    pub trip_tag: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NbVehicle {
    pub id: String,
    pub route_tag: Option<String>,
    pub dir_tag: Option<String>,
    pub lat: f64,
    pub lon: f64,
    pub secs_since_report: i64,
    pub predictable: bool,
    pub heading: f32,
}

/// A service message (alert) with the routes and stops it applies to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NbMessage {
    pub id: String,
    pub text: String,
    pub priority: Option<String>,
    pub send_to_buses: Option<bool>,
    /// Unix milliseconds; present only for time-bounded messages.
    pub start_boundary: Option<i64>,
    pub end_boundary: Option<i64>,
    pub routes: Vec<NbAffectedRoute>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NbAffectedRoute {
    pub tag: String,
    pub stops: Vec<NbMessageStop>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NbMessageStop {
    pub tag: String,
    pub stop_id: Option<String>,
}

/// One prediction row after flattening the predictions tree, carrying the
/// (route, stop) context of its enclosing elements. Tags are rewritten in
/// place to GTFS ids as the mapping stages run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlatPrediction {
    pub route_tag: String,
    pub stop_tag: String,
    pub epoch_time: i64,
    pub dir_tag: Option<String>,
    pub vehicle: Option<String>,
    pub block: Option<String>,
    pub trip_tag: Option<String>,
}

/// One schedule row after flattening the per-route timetable tables,
/// carrying the context of its enclosing elements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlatStopTime {
    pub schedule_class: Option<String>,
    pub service_class: String,
    pub route_tag: String,
    pub direction_tag: String,
    pub block_tag: String,
    pub stop_tag: String,
    pub gtfs_stop_id: Option<String>,
    /// Milliseconds after midnight.
    pub epoch_time: i64,
}

/// Identity of one outbound trip-update entity: the reporting vehicle, the
/// trip, or both when the prediction carries both.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TripUpdateId {
    pub vehicle_id: Option<String>,
    pub trip_id: Option<String>,
}

impl TripUpdateId {
    pub fn new(vehicle_id: Option<String>, trip_id: Option<String>) -> TripUpdateId {
        TripUpdateId {
            vehicle_id,
            trip_id,
        }
    }

    pub fn feed_entity_id(&self) -> String {
        match (&self.vehicle_id, &self.trip_id) {
            (Some(vehicle_id), Some(trip_id)) => format!("v={},t={}", vehicle_id, trip_id),
            (Some(vehicle_id), None) => format!("v={}", vehicle_id),
            (None, Some(trip_id)) => trip_id.clone(),
            (None, None) => String::new(),
        }
    }
}

/// Key for the per-direction stop mapping: stop tags are only unique within
/// a route, and the same physical stop can map differently per direction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteDirectionStopKey {
    pub route_tag: String,
    pub direction_tag: String,
    pub stop_tag: String,
}

impl RouteDirectionStopKey {
    pub fn new(
        route_tag: impl Into<String>,
        direction_tag: impl Into<String>,
        stop_tag: impl Into<String>,
    ) -> RouteDirectionStopKey {
        RouteDirectionStopKey {
            route_tag: route_tag.into(),
            direction_tag: direction_tag.into(),
            stop_tag: stop_tag.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_entity_id_covers_every_identity_shape() {
        let vehicle_only = TripUpdateId::new(Some("5764".to_string()), None);
        assert_eq!(vehicle_only.feed_entity_id(), "v=5764");
        let both = TripUpdateId::new(Some("5764".to_string()), Some("t_801".to_string()));
        assert_eq!(both.feed_entity_id(), "v=5764,t=t_801");
        let trip_only = TripUpdateId::new(None, Some("t_801".to_string()));
        assert_eq!(trip_only.feed_entity_id(), "t_801");
    }
}
