//! Typed access to the upstream xml api.
//!
//! Every method builds a command url, fetches it through the shared
//! byte-budget downloader and decodes the response body. Configuration
//! commands (route list, route config, schedule) can additionally be
//! served from an on-disk cache of the raw xml keyed by url hash, so a
//! restart does not have to re-pull the whole network.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use crate::NextBusError;
use crate::coverage::RouteStopCoverage;
use crate::fast_hash;
use crate::nextbus::models::{NbMessage, NbPredictions, NbRoute, NbSchedule, NbVehicle};
use crate::nextbus::xml;
use crate::throttle::MeteredDownloader;

pub const DEFAULT_BASE_URL: &str = "http://webservices.nextbus.com";

pub struct NextBusApi {
    downloader: Arc<MeteredDownloader>,
    agency_id: String,
    base_url: String,
    cache_dir: Option<PathBuf>,
}

impl NextBusApi {
    pub fn new(
        downloader: Arc<MeteredDownloader>,
        agency_id: impl Into<String>,
        base_url: impl Into<String>,
        cache_dir: Option<PathBuf>,
    ) -> NextBusApi {
        NextBusApi {
            downloader,
            agency_id: agency_id.into(),
            base_url: base_url.into(),
            cache_dir,
        }
    }

    /// `routeList`: every route tag the agency publishes.
    pub async fn route_list(&self, use_cache: bool) -> Result<Vec<NbRoute>, NextBusError> {
        let url = self.command_url("routeList");
        let body = self.fetch_config(&url, use_cache).await?;
        xml::decode_route_list(&body)
    }

    /// `routeConfig`: the stops and direction orderings of one route.
    pub async fn route_config(
        &self,
        route_tag: &str,
        use_cache: bool,
    ) -> Result<Vec<NbRoute>, NextBusError> {
        let url = format!(
            "{}&r={}",
            self.command_url("routeConfig"),
            urlencoding::encode(route_tag)
        );
        let body = self.fetch_config(&url, use_cache).await?;
        xml::decode_route_configs(&body)
    }

    /// `schedule`: the timetable blocks of one route.
    pub async fn schedule(
        &self,
        route_tag: &str,
        use_cache: bool,
    ) -> Result<Vec<NbSchedule>, NextBusError> {
        let url = format!(
            "{}&r={}",
            self.command_url("schedule"),
            urlencoding::encode(route_tag)
        );
        let body = self.fetch_config(&url, use_cache).await?;
        xml::decode_schedules(&body)
    }

    /// `predictionsForMultiStops`: arrival predictions for all covered
    /// stops of one route in a single request.
    pub async fn predictions_for_multi_stops(
        &self,
        coverage: &RouteStopCoverage,
    ) -> Result<Vec<NbPredictions>, NextBusError> {
        let body = self.fetch(&self.predictions_url(coverage)).await?;
        xml::decode_predictions(&body)
    }

    /// `vehicleLocations`: positions reported since the previous request
    /// for this route. Pass zero on the first request to get everything
    /// the upstream still considers fresh.
    pub async fn vehicle_locations(
        &self,
        route_tag: &str,
        last_request_ms: i64,
    ) -> Result<Vec<NbVehicle>, NextBusError> {
        let body = self
            .fetch(&self.vehicle_locations_url(route_tag, last_request_ms))
            .await?;
        xml::decode_vehicle_locations(&body)
    }

    /// `messages`: every active rider message for the agency.
    pub async fn messages(&self) -> Result<Vec<NbMessage>, NextBusError> {
        let body = self.fetch(&self.command_url("messages")).await?;
        xml::decode_messages(&body)
    }

    fn command_url(&self, command: &str) -> String {
        format!(
            "{}/service/publicXMLFeed?command={}&a={}",
            self.base_url,
            command,
            urlencoding::encode(&self.agency_id)
        )
    }

    fn predictions_url(&self, coverage: &RouteStopCoverage) -> String {
        let mut url = self.command_url("predictionsForMultiStops");
        for stop_tag in &coverage.stop_tags {
            url.push_str("&stops=");
            url.push_str(&urlencoding::encode(&coverage.route_tag));
            url.push_str("%7c");
            url.push_str(&urlencoding::encode(stop_tag));
        }
        url
    }

    fn vehicle_locations_url(&self, route_tag: &str, last_request_ms: i64) -> String {
        let mut url = format!(
            "{}&r={}",
            self.command_url("vehicleLocations"),
            urlencoding::encode(route_tag)
        );
        if last_request_ms != 0 {
            url.push_str("&t=");
            url.push_str(&last_request_ms.to_string());
        }
        url
    }

    async fn fetch(&self, url: &str) -> Result<String, NextBusError> {
        let bytes = self.downloader.fetch(url).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Configuration responses are big and change rarely. `use_cache`
    /// controls whether an existing cache entry is read back; fresh
    /// downloads always rewrite the entry, so a cache-bypassing refresh
    /// leaves an up-to-date copy behind for the next restart.
    async fn fetch_config(&self, url: &str, use_cache: bool) -> Result<String, NextBusError> {
        let cache_path = self.cache_path(url);
        if use_cache {
            if let Some(path) = &cache_path {
                if let Ok(body) = tokio::fs::read_to_string(path).await {
                    debug!("serving {url} from {}", path.display());
                    return Ok(body);
                }
            }
        }
        let body = self.fetch(url).await?;
        if let Some(path) = &cache_path {
            tokio::fs::write(path, &body).await?;
        }
        Ok(body)
    }

    // Cache names have to survive restarts, which is why this hashes with
    // a fixed-seed hasher rather than the per-process keyed maps we use
    // everywhere else.
    fn cache_path(&self, url: &str) -> Option<PathBuf> {
        let dir = self.cache_dir.as_ref()?;
        Some(dir.join(format!("{:016x}.xml", fast_hash(&url))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ThrottleConfig;

    fn api(cache_dir: Option<PathBuf>) -> NextBusApi {
        let downloader = Arc::new(MeteredDownloader::new(ThrottleConfig::default()).unwrap());
        NextBusApi::new(downloader, "sf-muni", DEFAULT_BASE_URL, cache_dir)
    }

    #[test]
    fn command_urls_identify_the_agency() {
        assert_eq!(
            api(None).command_url("routeList"),
            "http://webservices.nextbus.com/service/publicXMLFeed?command=routeList&a=sf-muni"
        );
    }

    #[test]
    fn predictions_url_packs_route_stop_pairs() {
        let coverage = RouteStopCoverage {
            route_tag: "N".to_string(),
            stop_tags: vec!["5240".to_string(), "6997".to_string()],
        };
        assert_eq!(
            api(None).predictions_url(&coverage),
            "http://webservices.nextbus.com/service/publicXMLFeed?command=predictionsForMultiStops\
             &a=sf-muni&stops=N%7c5240&stops=N%7c6997"
        );
    }

    #[test]
    fn vehicle_locations_url_omits_time_on_first_request() {
        let api = api(None);
        assert!(!api.vehicle_locations_url("N", 0).contains("&t="));
        assert!(
            api.vehicle_locations_url("N", 1_700_000_000_000)
                .ends_with("&t=1700000000000")
        );
    }

    #[test]
    fn cache_paths_are_stable_across_instances() {
        let dir = Some(PathBuf::from("/var/cache/nextbus"));
        let url = "http://webservices.nextbus.com/service/publicXMLFeed?command=routeConfig&a=sf-muni&r=N";
        let first = api(dir.clone()).cache_path(url);
        let second = api(dir).cache_path(url);
        assert_eq!(first, second);
        assert!(first.is_some());
    }

    #[test]
    fn cache_paths_distinguish_urls() {
        let api = api(Some(PathBuf::from("/var/cache/nextbus")));
        let a = api.cache_path(&api.command_url("routeList"));
        let b = api.cache_path(&api.command_url("messages"));
        assert_ne!(a, b);
    }
}
