//! # nextbus-gtfs-rt
//! Polls a NextBus-style `publicXMLFeed` endpoint for one agency, reconciles
//! the feed against the agency's GTFS schedule, and maintains GTFS-realtime
//! trip update, vehicle position, and alert feeds.
//!
//! The interesting part is identity reconciliation: the upstream feed tags
//! routes, stops, and blocks with its own ids and usually omits trip ids
//! entirely, so trip identity has to be recovered by matching the upstream
//! schedule against GTFS and then chasing live predictions through the
//! matched block schedules.

#![deny(
    clippy::mutable_key_type,
    clippy::map_entry,
    clippy::boxed_local,
    clippy::let_unit_value,
    clippy::redundant_allocation,
    clippy::bool_comparison,
    clippy::bind_instead_of_map,
    clippy::vec_box,
    clippy::while_let_loop,
    clippy::useless_asref,
    clippy::repeat_once,
    clippy::deref_addrof,
    clippy::suspicious_map,
    clippy::arc_with_non_send_sync,
    clippy::single_char_pattern,
    clippy::for_kv_map,
    clippy::let_and_return,
    clippy::iter_nth,
    clippy::iter_cloned_collect,
    clippy::bytes_nth,
    clippy::deprecated_clippy_cfg_attr,
    clippy::match_result_ok,
    clippy::cmp_owned,
    clippy::cmp_null,
    clippy::op_ref
)]

pub mod config;
pub mod coverage;
pub mod feed;
pub mod live;
pub mod matching;
pub mod nextbus;
pub mod runner;
pub mod throttle;

use chrono::NaiveDate;
use chrono_tz::Tz;
use seahash::SeaHasher;
use std::hash::Hash;
use std::hash::Hasher;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NextBusError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("xml parse error: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("element <{element}> is missing required attribute \"{attribute}\"")]
    MissingAttribute {
        element: String,
        attribute: &'static str,
    },
    #[error("element <{element}> attribute \"{attribute}\" has unparseable value {value:?}")]
    InvalidAttribute {
        element: String,
        attribute: &'static str,
        value: String,
    },
    #[error("upstream feed returned an error: {0}")]
    Upstream(String),
    #[error("no day mask configured for service class {0:?}")]
    UnknownServiceClass(String),
}

pub fn fast_hash<T: Hash>(t: &T) -> u64 {
    let mut s = SeaHasher::default();
    t.hash(&mut s);
    s.finish()
}

pub fn duration_since_unix_epoch() -> Duration {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap()
}

/// Unix timestamp of the start of a GTFS service date in the given zone.
///
/// Computed as local noon minus twelve hours, which stays correct on days
/// where a DST transition makes local midnight ambiguous or nonexistent.
pub fn service_date_start_epoch(date: NaiveDate, tz: Tz) -> Option<i64> {
    use chrono::TimeZone;
    let noon = date.and_hms_opt(12, 0, 0)?;
    let noon_local = tz.from_local_datetime(&noon).earliest()?;
    Some(noon_local.timestamp() - 12 * 3600)
}
