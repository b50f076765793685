//! Outbound GTFS-realtime state: entity construction from mapped upstream
//! records, the store the pollers write into, and the HTTP surface that
//! serves the encoded feeds.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use ahash::{AHashMap, AHashSet};
use gtfs_realtime::translated_string::Translation;
use gtfs_realtime::trip_update::{StopTimeEvent, StopTimeUpdate};
use gtfs_realtime::{
    Alert, EntitySelector, FeedEntity, FeedHeader, FeedMessage, Position, TimeRange,
    TranslatedString, TripDescriptor, TripUpdate, VehicleDescriptor, VehiclePosition,
};
use prost::Message;
use tracing::{debug, info};

use crate::duration_since_unix_epoch;
use crate::matching::MappingSnapshot;
use crate::nextbus::models::{FlatPrediction, NbMessage, NbVehicle, TripUpdateId};

/// The three outbound feeds. Each has its own poller and its own update
/// discipline in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedKind {
    TripUpdates,
    VehiclePositions,
    Alerts,
}

impl FeedKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FeedKind::TripUpdates => "trip-updates",
            FeedKind::VehiclePositions => "vehicle-positions",
            FeedKind::Alerts => "alerts",
        }
    }
}

/// Latest entities per feed, keyed by entity id so a repeat sighting of the
/// same vehicle or message replaces its previous version in place.
pub struct FeedStore {
    feeds: scc::HashMap<FeedKind, BTreeMap<String, FeedEntity>>,
}

impl FeedStore {
    pub fn new() -> FeedStore {
        FeedStore {
            feeds: scc::HashMap::new(),
        }
    }

    /// Merge one poll cycle's entities in, keeping entities the cycle did
    /// not mention. Vehicle location polls only return vehicles that moved
    /// since the previous request time, so absence means no change, not
    /// disappearance.
    pub fn apply(&self, kind: FeedKind, entities: Vec<FeedEntity>) {
        match self.feeds.entry(kind) {
            scc::hash_map::Entry::Occupied(mut occupied) => {
                let feed = occupied.get_mut();
                for entity in entities {
                    feed.insert(entity.id.clone(), entity);
                }
            }
            scc::hash_map::Entry::Vacant(vacant) => {
                vacant.insert_entry(
                    entities
                        .into_iter()
                        .map(|entity| (entity.id.clone(), entity))
                        .collect(),
                );
            }
        }
    }

    /// Replace a feed wholesale. Used for alerts, where a message absent
    /// from the latest response has been withdrawn upstream and must drop
    /// out of the feed.
    pub fn replace_all(&self, kind: FeedKind, entities: Vec<FeedEntity>) {
        let feed: BTreeMap<String, FeedEntity> = entities
            .into_iter()
            .map(|entity| (entity.id.clone(), entity))
            .collect();
        match self.feeds.entry(kind) {
            scc::hash_map::Entry::Occupied(mut occupied) => {
                *occupied.get_mut() = feed;
            }
            scc::hash_map::Entry::Vacant(vacant) => {
                vacant.insert_entry(feed);
            }
        }
    }

    /// Encode the current state of one feed as a full-dataset message.
    /// Entities come out ordered by id, so identical state always encodes
    /// to identical bytes.
    pub fn encode(&self, kind: FeedKind, now: Duration) -> Vec<u8> {
        let entity: Vec<FeedEntity> = self
            .feeds
            .read(&kind, |_, feed| feed.values().cloned().collect())
            .unwrap_or_default();
        let message = FeedMessage {
            header: FeedHeader {
                gtfs_realtime_version: "2.0".to_string(),
                incrementality: Some(0),
                timestamp: Some(now.as_secs()),
                feed_version: None,
            },
            entity,
        };
        message.encode_to_vec()
    }
}

/// Builds one trip-update entity per prediction identity.
///
/// Rows are grouped by the (vehicle, trip) pair they carry; a row with
/// neither has nothing stable to key an entity on and is dropped. Stop
/// calls within a group are ordered by predicted time.
pub fn trip_update_entities(predictions: &[FlatPrediction], now: Duration) -> Vec<FeedEntity> {
    let mut groups: AHashMap<TripUpdateId, Vec<&FlatPrediction>> = AHashMap::new();
    for prediction in predictions {
        if prediction.vehicle.is_none() && prediction.trip_tag.is_none() {
            debug!(
                "dropping prediction at stop {} with neither vehicle nor trip",
                prediction.stop_tag
            );
            continue;
        }
        let id = TripUpdateId::new(prediction.vehicle.clone(), prediction.trip_tag.clone());
        groups.entry(id).or_default().push(prediction);
    }

    let mut entities: Vec<FeedEntity> = groups
        .into_iter()
        .map(|(id, mut rows)| {
            rows.sort_by_key(|row| row.epoch_time);
            trip_update_entity(&id, &rows, now)
        })
        .collect();
    entities.sort_by(|a, b| a.id.cmp(&b.id));
    entities
}

fn trip_update_entity(id: &TripUpdateId, rows: &[&FlatPrediction], now: Duration) -> FeedEntity {
    let stop_time_update: Vec<StopTimeUpdate> = rows
        .iter()
        .map(|row| StopTimeUpdate {
            stop_id: Some(row.stop_tag.clone()),
            departure: Some(StopTimeEvent {
                time: Some(row.epoch_time / 1000),
                ..Default::default()
            }),
            ..Default::default()
        })
        .collect();
    FeedEntity {
        id: id.feed_entity_id(),
        trip_update: Some(TripUpdate {
            trip: TripDescriptor {
                trip_id: id.trip_id.clone(),
                route_id: rows.first().map(|row| row.route_tag.clone()),
                ..Default::default()
            },
            vehicle: id.vehicle_id.as_ref().map(|vehicle_id| VehicleDescriptor {
                id: Some(vehicle_id.clone()),
                ..Default::default()
            }),
            stop_time_update,
            timestamp: Some(now.as_secs()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Builds one vehicle-position entity per reported vehicle, id'd by the
/// vehicle itself. The report timestamp backdates `now` by the upstream
/// report age.
pub fn vehicle_position_entities(vehicles: &[NbVehicle], now: Duration) -> Vec<FeedEntity> {
    let mut entities: Vec<FeedEntity> = vehicles
        .iter()
        .map(|vehicle| vehicle_position_entity(vehicle, now))
        .collect();
    entities.sort_by(|a, b| a.id.cmp(&b.id));
    entities
}

fn vehicle_position_entity(vehicle: &NbVehicle, now: Duration) -> FeedEntity {
    let reported = (now.as_secs() as i64 - vehicle.secs_since_report).max(0) as u64;
    FeedEntity {
        id: vehicle.id.clone(),
        vehicle: Some(VehiclePosition {
            position: Some(Position {
                latitude: vehicle.lat as f32,
                longitude: vehicle.lon as f32,
                // A negative heading means the heading is unknown upstream.
                bearing: (vehicle.heading >= 0.0).then_some(vehicle.heading),
                odometer: None,
                speed: None,
            }),
            vehicle: Some(VehicleDescriptor {
                id: Some(vehicle.id.clone()),
                ..Default::default()
            }),
            timestamp: Some(reported),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Builds one alert entity per distinct upstream message.
///
/// A system-wide message is repeated under every route wrapper it applies
/// to and every copy carries the full affected-route list, so repeats of
/// an id are collapsed to the first copy. Route and stop references are
/// translated through the mapping snapshot where a mapping exists and
/// passed through raw otherwise.
pub fn alert_entities(messages: &[NbMessage], snapshot: &MappingSnapshot) -> Vec<FeedEntity> {
    let mut seen: AHashSet<&str> = AHashSet::new();
    let mut entities: Vec<FeedEntity> = Vec::new();
    for message in messages {
        if !seen.insert(message.id.as_str()) {
            continue;
        }
        entities.push(alert_entity(message, snapshot));
    }
    entities.sort_by(|a, b| a.id.cmp(&b.id));
    entities
}

fn alert_entity(message: &NbMessage, snapshot: &MappingSnapshot) -> FeedEntity {
    let start = message.start_boundary.filter(|ms| *ms > 0);
    let end = message.end_boundary.filter(|ms| *ms > 0);
    let active_period = if start.is_some() || end.is_some() {
        vec![TimeRange {
            start: start.map(|ms| (ms / 1000) as u64),
            end: end.map(|ms| (ms / 1000) as u64),
        }]
    } else {
        Vec::new()
    };

    let mut informed_entity = Vec::new();
    for route in &message.routes {
        let route_id = snapshot
            .route_ids
            .get(&route.tag)
            .cloned()
            .unwrap_or_else(|| route.tag.clone());
        informed_entity.push(EntitySelector {
            route_id: Some(route_id.clone()),
            ..Default::default()
        });
        for stop in &route.stops {
            let stop_id = stop
                .stop_id
                .clone()
                .or_else(|| mapped_stop_id(snapshot, &route.tag, &stop.tag))
                .unwrap_or_else(|| stop.tag.clone());
            informed_entity.push(EntitySelector {
                route_id: Some(route_id.clone()),
                stop_id: Some(stop_id),
                ..Default::default()
            });
        }
    }

    FeedEntity {
        id: message.id.clone(),
        alert: Some(Alert {
            active_period,
            informed_entity,
            header_text: Some(en_translated_string(&message.text)),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Any-direction stop lookup for message stops, which carry no direction
/// context. Ties across directions take the lexicographically first
/// direction tag so reruns stay deterministic.
fn mapped_stop_id(snapshot: &MappingSnapshot, route_tag: &str, stop_tag: &str) -> Option<String> {
    snapshot
        .stop_ids
        .iter()
        .filter(|(key, _)| key.route_tag == route_tag && key.stop_tag == stop_tag)
        .min_by(|(a, _), (b, _)| a.direction_tag.cmp(&b.direction_tag))
        .map(|(_, stop_id)| stop_id.clone())
}

fn en_translated_string(text: &str) -> TranslatedString {
    TranslatedString {
        translation: vec![Translation {
            text: text.to_string(),
            language: Some("en".to_string()),
        }],
    }
}

/// Serves the encoded feeds over HTTP. Blocks its thread forever inside
/// the accept loop.
pub fn serve(store: Arc<FeedStore>, port: u16) -> ! {
    info!("serving feeds on port {port}");
    rouille::start_server(("0.0.0.0", port), move |request| {
        if request.method() != "GET" {
            return rouille::Response::empty_404();
        }
        let kind = match request.url().as_str() {
            "/trip-updates" => FeedKind::TripUpdates,
            "/vehicle-positions" => FeedKind::VehiclePositions,
            "/alerts" => FeedKind::Alerts,
            _ => return rouille::Response::empty_404(),
        };
        rouille::Response::from_data(
            "application/x-protobuf",
            store.encode(kind, duration_since_unix_epoch()),
        )
    })
}
