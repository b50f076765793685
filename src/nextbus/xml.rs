//! Structural decoding of publicXMLFeed responses, one function per
//! command. Every element walk is explicit; required attributes raise
//! decode errors, optional ones land in `Option` fields.

use crate::NextBusError;
use crate::nextbus::models::{
    NbAffectedRoute, NbDirection, NbMessage, NbMessageStop, NbPrediction, NbPredictionDirection,
    NbPredictions, NbRoute, NbSchedule, NbScheduledTrip, NbStop, NbStopTime, NbVehicle,
};
use roxmltree::{Document, Node};

fn req_attr<'a>(node: Node<'a, '_>, name: &'static str) -> Result<&'a str, NextBusError> {
    node.attribute(name)
        .ok_or_else(|| NextBusError::MissingAttribute {
            element: node.tag_name().name().to_string(),
            attribute: name,
        })
}

fn req_parse<T: std::str::FromStr>(
    node: Node<'_, '_>,
    name: &'static str,
) -> Result<T, NextBusError> {
    let raw = req_attr(node, name)?;
    raw.parse().map_err(|_| NextBusError::InvalidAttribute {
        element: node.tag_name().name().to_string(),
        attribute: name,
        value: raw.to_string(),
    })
}

fn opt_attr(node: Node<'_, '_>, name: &str) -> Option<String> {
    node.attribute(name).map(|s| s.to_string())
}

fn opt_parse<T: std::str::FromStr>(
    node: Node<'_, '_>,
    name: &'static str,
) -> Result<Option<T>, NextBusError> {
    match node.attribute(name) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| NextBusError::InvalidAttribute {
                element: node.tag_name().name().to_string(),
                attribute: name,
                value: raw.to_string(),
            }),
    }
}

/// The feed wraps every response in `<body>`; errors come back in-band as
/// an `<Error>` child rather than an HTTP status.
fn checked_body<'a, 'input>(doc: &'a Document<'input>) -> Result<Node<'a, 'input>, NextBusError> {
    let body = doc.root_element();
    if let Some(error) = body.children().find(|n| n.has_tag_name("Error")) {
        let text = error.text().unwrap_or("").trim().to_string();
        return Err(NextBusError::Upstream(text));
    }
    Ok(body)
}

pub fn decode_route_list(xml: &str) -> Result<Vec<NbRoute>, NextBusError> {
    let doc = Document::parse(xml)?;
    let body = checked_body(&doc)?;
    let mut routes = Vec::new();
    for route in body.children().filter(|n| n.has_tag_name("route")) {
        routes.push(NbRoute {
            tag: req_attr(route, "tag")?.to_string(),
            title: opt_attr(route, "title"),
            stops: Vec::new(),
            directions: Vec::new(),
        });
    }
    Ok(routes)
}

pub fn decode_route_configs(xml: &str) -> Result<Vec<NbRoute>, NextBusError> {
    let doc = Document::parse(xml)?;
    let body = checked_body(&doc)?;
    let mut routes = Vec::new();
    for route in body.children().filter(|n| n.has_tag_name("route")) {
        let mut stops = Vec::new();
        let mut directions = Vec::new();
        for child in route.children().filter(|n| n.is_element()) {
            match child.tag_name().name() {
                "stop" => stops.push(decode_config_stop(child)?),
                "direction" => {
                    let stop_tags = child
                        .children()
                        .filter(|n| n.has_tag_name("stop"))
                        .map(|stop| req_attr(stop, "tag").map(str::to_string))
                        .collect::<Result<Vec<_>, _>>()?;
                    directions.push(NbDirection {
                        tag: req_attr(child, "tag")?.to_string(),
                        title: opt_attr(child, "title"),
                        stops: stop_tags,
                    });
                }
                // <path> carries shape points which nothing here consumes
                _ => {}
            }
        }
        routes.push(NbRoute {
            tag: req_attr(route, "tag")?.to_string(),
            title: opt_attr(route, "title"),
            stops,
            directions,
        });
    }
    Ok(routes)
}

fn decode_config_stop(node: Node<'_, '_>) -> Result<NbStop, NextBusError> {
    Ok(NbStop {
        tag: req_attr(node, "tag")?.to_string(),
        title: opt_attr(node, "title"),
        lat: req_parse(node, "lat")?,
        lon: req_parse(node, "lon")?,
        stop_id: opt_attr(node, "stopId"),
    })
}

pub fn decode_schedules(xml: &str) -> Result<Vec<NbSchedule>, NextBusError> {
    let doc = Document::parse(xml)?;
    let body = checked_body(&doc)?;
    let mut schedules = Vec::new();
    for route in body.children().filter(|n| n.has_tag_name("route")) {
        let mut trips = Vec::new();
        for tr in route.children().filter(|n| n.has_tag_name("tr")) {
            let mut stop_times = Vec::new();
            for stop in tr.children().filter(|n| n.has_tag_name("stop")) {
                stop_times.push(NbStopTime {
                    tag: req_attr(stop, "tag")?.to_string(),
                    epoch_time: req_parse(stop, "epochTime")?,
                });
            }
            trips.push(NbScheduledTrip {
                block_id: req_attr(tr, "blockID")?.to_string(),
                stop_times,
            });
        }
        schedules.push(NbSchedule {
            route_tag: req_attr(route, "tag")?.to_string(),
            schedule_class: opt_attr(route, "scheduleClass"),
            service_class: req_attr(route, "serviceClass")?.to_string(),
            direction_tag: req_attr(route, "direction")?.to_string(),
            trips,
        });
    }
    Ok(schedules)
}

pub fn decode_predictions(xml: &str) -> Result<Vec<NbPredictions>, NextBusError> {
    let doc = Document::parse(xml)?;
    let body = checked_body(&doc)?;
    let mut all = Vec::new();
    for predictions in body.children().filter(|n| n.has_tag_name("predictions")) {
        let mut directions = Vec::new();
        for direction in predictions
            .children()
            .filter(|n| n.has_tag_name("direction"))
        {
            let decoded = direction
                .children()
                .filter(|n| n.has_tag_name("prediction"))
                .map(decode_prediction)
                .collect::<Result<Vec<_>, _>>()?;
            directions.push(NbPredictionDirection {
                title: opt_attr(direction, "title"),
                predictions: decoded,
            });
        }
        all.push(NbPredictions {
            route_tag: req_attr(predictions, "routeTag")?.to_string(),
            stop_tag: req_attr(predictions, "stopTag")?.to_string(),
            directions,
        });
    }
    Ok(all)
}

fn decode_prediction(node: Node<'_, '_>) -> Result<NbPrediction, NextBusError> {
    Ok(NbPrediction {
        epoch_time: req_parse(node, "epochTime")?,
        dir_tag: opt_attr(node, "dirTag"),
        vehicle: opt_attr(node, "vehicle"),
        block: opt_attr(node, "block"),
        trip_tag: opt_attr(node, "tripTag"),
    })
}

pub fn decode_vehicle_locations(xml: &str) -> Result<Vec<NbVehicle>, NextBusError> {
    let doc = Document::parse(xml)?;
    let body = checked_body(&doc)?;
    let mut vehicles = Vec::new();
    for vehicle in body.children().filter(|n| n.has_tag_name("vehicle")) {
        vehicles.push(NbVehicle {
            id: req_attr(vehicle, "id")?.to_string(),
            route_tag: opt_attr(vehicle, "routeTag"),
            dir_tag: opt_attr(vehicle, "dirTag"),
            lat: req_parse(vehicle, "lat")?,
            lon: req_parse(vehicle, "lon")?,
            secs_since_report: req_parse(vehicle, "secsSinceReport")?,
            predictable: req_parse(vehicle, "predictable")?,
            heading: req_parse(vehicle, "heading")?,
        });
    }
    Ok(vehicles)
}

/// Messages arrive grouped under `<route>` wrappers and a system-wide
/// message is repeated under every route it applies to, so the result is
/// flattened here and deduplicated by id downstream.
pub fn decode_messages(xml: &str) -> Result<Vec<NbMessage>, NextBusError> {
    let doc = Document::parse(xml)?;
    let body = checked_body(&doc)?;
    let mut messages = Vec::new();
    for route in body.children().filter(|n| n.has_tag_name("route")) {
        for message in route.children().filter(|n| n.has_tag_name("message")) {
            messages.push(decode_message(message)?);
        }
    }
    Ok(messages)
}

fn decode_message(node: Node<'_, '_>) -> Result<NbMessage, NextBusError> {
    let text = node
        .children()
        .find(|n| n.has_tag_name("text"))
        .and_then(|n| n.text())
        .map(|t| t.trim().to_string())
        .unwrap_or_default();
    let mut routes = Vec::new();
    for affected in node
        .children()
        .filter(|n| n.has_tag_name("routeConfiguredForMessage"))
    {
        let stops = affected
            .children()
            .filter(|n| n.has_tag_name("stop"))
            .map(|stop| {
                Ok(NbMessageStop {
                    tag: req_attr(stop, "tag")?.to_string(),
                    stop_id: opt_attr(stop, "stopId"),
                })
            })
            .collect::<Result<Vec<_>, NextBusError>>()?;
        routes.push(NbAffectedRoute {
            tag: req_attr(affected, "tag")?.to_string(),
            stops,
        });
    }
    Ok(NbMessage {
        id: req_attr(node, "id")?.to_string(),
        text,
        priority: opt_attr(node, "priority"),
        send_to_buses: opt_parse(node, "sendToBuses")?,
        start_boundary: opt_parse(node, "startBoundary")?,
        end_boundary: opt_parse(node, "endBoundary")?,
        routes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_route_list() {
        let xml = r#"<body copyright="All data copyright agency 2026.">
            <route tag="E" title="E-Embarcadero"/>
            <route tag="F" title="F-Market &amp; Wharves"/>
        </body>"#;
        let routes = decode_route_list(xml).unwrap();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].tag, "E");
        assert_eq!(routes[1].title.as_deref(), Some("F-Market & Wharves"));
    }

    #[test]
    fn decodes_route_config_with_directions() {
        let xml = r#"<body>
          <route tag="N" title="N-Judah" color="003399">
            <stop tag="5240" title="King St" lat="37.7766" lon="-122.3946" stopId="15240"/>
            <stop tag="5237" title="2nd St" lat="37.7793" lon="-122.3885"/>
            <direction tag="N__OB1" title="Outbound" name="Outbound" useForUI="true">
              <stop tag="5240"/>
              <stop tag="5237"/>
            </direction>
            <path><point lat="37.7766" lon="-122.3946"/></path>
          </route>
        </body>"#;
        let routes = decode_route_configs(xml).unwrap();
        assert_eq!(routes.len(), 1);
        let route = &routes[0];
        assert_eq!(route.stops.len(), 2);
        assert_eq!(route.stops[0].stop_id.as_deref(), Some("15240"));
        assert!(route.stops[1].stop_id.is_none());
        assert_eq!(route.directions.len(), 1);
        assert_eq!(route.directions[0].stops, vec!["5240", "5237"]);
    }

    #[test]
    fn decodes_schedule_tables() {
        let xml = r#"<body>
          <route tag="N" title="N-Judah" scheduleClass="2026T" serviceClass="wkd" direction="Inbound">
            <header><stop tag="5240">King St</stop></header>
            <tr blockID="9702">
              <stop tag="5240" epochTime="18000000">05:00:00</stop>
              <stop tag="5237" epochTime="-1">--</stop>
            </tr>
          </route>
        </body>"#;
        let schedules = decode_schedules(xml).unwrap();
        assert_eq!(schedules.len(), 1);
        let schedule = &schedules[0];
        assert_eq!(schedule.service_class, "wkd");
        assert_eq!(schedule.direction_tag, "Inbound");
        assert_eq!(schedule.trips.len(), 1);
        assert_eq!(schedule.trips[0].block_id, "9702");
        assert_eq!(schedule.trips[0].stop_times[0].epoch_time, 18_000_000);
        assert_eq!(schedule.trips[0].stop_times[1].epoch_time, -1);
    }

    #[test]
    fn decodes_predictions_with_optional_trip_tag() {
        let xml = r#"<body>
          <predictions agencyTitle="Agency" routeTag="N" stopTag="5240" stopTitle="King St">
            <direction title="Outbound">
              <prediction epochTime="1756000000000" seconds="120" minutes="2" dirTag="N__OB1" vehicle="2009" block="9702"/>
              <prediction epochTime="1756000600000" seconds="720" minutes="12" dirTag="N__OB1" vehicle="2011" block="9704" tripTag="t_404"/>
            </direction>
          </predictions>
        </body>"#;
        let all = decode_predictions(xml).unwrap();
        assert_eq!(all.len(), 1);
        let predictions = &all[0];
        assert_eq!(predictions.route_tag, "N");
        let direction = &predictions.directions[0];
        assert_eq!(direction.predictions[0].trip_tag, None);
        assert_eq!(direction.predictions[1].trip_tag.as_deref(), Some("t_404"));
        assert_eq!(direction.predictions[0].epoch_time, 1_756_000_000_000);
    }

    #[test]
    fn decodes_vehicle_locations() {
        let xml = r#"<body>
          <vehicle id="2009" routeTag="N" dirTag="N__OB1" lat="37.7766" lon="-122.3946" secsSinceReport="9" predictable="true" heading="225" speedKmHr="29"/>
          <lastTime time="1756000000000"/>
        </body>"#;
        let vehicles = decode_vehicle_locations(xml).unwrap();
        assert_eq!(vehicles.len(), 1);
        assert_eq!(vehicles[0].id, "2009");
        assert!(vehicles[0].predictable);
        assert_eq!(vehicles[0].heading, 225.0);
    }

    #[test]
    fn decodes_messages_and_affected_routes() {
        let xml = r#"<body>
          <route tag="N">
            <message id="1234" creator="agency" startBoundary="1756000000000" startBoundaryStr="Aug 23" endBoundary="1756100000000" endBoundaryStr="Aug 24" sendToBuses="false" priority="Normal">
              <routeConfiguredForMessage tag="N">
                <stop tag="5240" stopId="15240"/>
              </routeConfiguredForMessage>
              <text>N-Judah switching to bus shuttles this weekend.</text>
            </message>
          </route>
        </body>"#;
        let messages = decode_messages(xml).unwrap();
        assert_eq!(messages.len(), 1);
        let message = &messages[0];
        assert_eq!(message.id, "1234");
        assert_eq!(message.start_boundary, Some(1_756_000_000_000));
        assert_eq!(message.routes[0].stops[0].stop_id.as_deref(), Some("15240"));
        assert!(message.text.starts_with("N-Judah"));
    }

    #[test]
    fn missing_required_attribute_is_an_error() {
        let xml = r#"<body><route title="unnamed"/></body>"#;
        let err = decode_route_list(xml).unwrap_err();
        match err {
            NextBusError::MissingAttribute { element, attribute } => {
                assert_eq!(element, "route");
                assert_eq!(attribute, "tag");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn in_band_error_element_is_surfaced() {
        let xml = r#"<body>
          <Error shouldRetry="false">Agency parameter "a=nope" is not valid.</Error>
        </body>"#;
        let err = decode_route_list(xml).unwrap_err();
        match err {
            NextBusError::Upstream(text) => assert!(text.contains("not valid")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
