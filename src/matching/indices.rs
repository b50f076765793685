//! Compact lookup structures for a vehicle block's matched schedule.
//!
//! After trip matching, each external block owns an assembled list of
//! canonical stop calls ordered by time. Live inference needs two cheap
//! operations on it: nearest-scheduled-time lookup per stop, and a forward
//! scan to the next call at a given stop. Both are served from here.

use ahash::AHashMap;
use chrono::NaiveDate;

/// One canonical stop call inside a block's assembled schedule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockStopTime {
    pub trip_id: String,
    pub stop_id: String,
    /// Seconds after the service date start, midpoint of arrival and
    /// departure.
    pub mid_time: i64,
}

/// Key for a block's schedule on one service date.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServiceDateBlockKey {
    pub route_id: String,
    pub block_tag: String,
    pub service_date: NaiveDate,
}

impl ServiceDateBlockKey {
    pub fn new(
        route_id: impl Into<String>,
        block_tag: impl Into<String>,
        service_date: NaiveDate,
    ) -> ServiceDateBlockKey {
        ServiceDateBlockKey {
            route_id: route_id.into(),
            block_tag: block_tag.into(),
            service_date,
        }
    }
}

/// Sorted mid-times of one stop's calls within a block, with back
/// references into the block's full ordered list. A loop route can call
/// at the same stop several times per block, hence the parallel arrays.
#[derive(Clone, Debug, Default)]
pub struct StopTimeIndex {
    mid_times: Vec<i64>,
    positions: Vec<usize>,
}

impl StopTimeIndex {
    pub fn mid_times(&self) -> &[i64] {
        &self.mid_times
    }

    /// Position in the block's ordered list of the `i`-th call here.
    pub fn position(&self, i: usize) -> usize {
        self.positions[i]
    }

    /// Index of the first call at or after `time`.
    pub fn insertion_point(&self, time: i64) -> usize {
        self.mid_times.partition_point(|&t| t < time)
    }
}

/// A block's matched schedule: every stop call ordered by time, plus a
/// per-stop index for nearest-time lookups.
#[derive(Clone, Debug, Default)]
pub struct StopTimeIndices {
    stop_times: Vec<BlockStopTime>,
    by_stop: AHashMap<String, StopTimeIndex>,
}

impl StopTimeIndices {
    pub fn build(mut stop_times: Vec<BlockStopTime>) -> StopTimeIndices {
        // Stable sort: calls sharing a mid-time keep their insertion order.
        stop_times.sort_by_key(|stop_time| stop_time.mid_time);
        let mut by_stop: AHashMap<String, StopTimeIndex> = AHashMap::new();
        for (position, stop_time) in stop_times.iter().enumerate() {
            let index = by_stop.entry(stop_time.stop_id.clone()).or_default();
            index.mid_times.push(stop_time.mid_time);
            index.positions.push(position);
        }
        StopTimeIndices {
            stop_times,
            by_stop,
        }
    }

    pub fn index_for_stop(&self, stop_id: &str) -> Option<&StopTimeIndex> {
        self.by_stop.get(stop_id)
    }

    pub fn stop_times(&self) -> &[BlockStopTime] {
        &self.stop_times
    }

    /// Position of the next call at `stop_id` at or after position `from`,
    /// scanning the block's ordered list.
    pub fn next_call_at_stop(&self, from: usize, stop_id: &str) -> Option<usize> {
        (from..self.stop_times.len()).find(|&i| self.stop_times[i].stop_id == stop_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(trip_id: &str, stop_id: &str, mid_time: i64) -> BlockStopTime {
        BlockStopTime {
            trip_id: trip_id.to_string(),
            stop_id: stop_id.to_string(),
            mid_time,
        }
    }

    #[test]
    fn build_orders_calls_by_time() {
        let indices = StopTimeIndices::build(vec![
            call("t2", "c", 900),
            call("t1", "a", 0),
            call("t1", "b", 300),
        ]);
        let times: Vec<i64> = indices.stop_times().iter().map(|st| st.mid_time).collect();
        assert_eq!(times, vec![0, 300, 900]);
    }

    #[test]
    fn per_stop_index_handles_repeated_calls() {
        // A loop block calls at "a" twice.
        let indices = StopTimeIndices::build(vec![
            call("t1", "a", 0),
            call("t1", "b", 300),
            call("t2", "a", 600),
        ]);
        let index = indices.index_for_stop("a").unwrap();
        assert_eq!(index.mid_times(), &[0, 600]);
        assert_eq!(index.position(0), 0);
        assert_eq!(index.position(1), 2);
        assert!(indices.index_for_stop("z").is_none());
    }

    #[test]
    fn insertion_point_is_first_call_at_or_after() {
        let indices = StopTimeIndices::build(vec![
            call("t1", "a", 0),
            call("t2", "a", 600),
        ]);
        let index = indices.index_for_stop("a").unwrap();
        assert_eq!(index.insertion_point(-5), 0);
        assert_eq!(index.insertion_point(0), 0);
        assert_eq!(index.insertion_point(1), 1);
        assert_eq!(index.insertion_point(600), 1);
        assert_eq!(index.insertion_point(601), 2);
    }

    #[test]
    fn next_call_scans_forward_only() {
        let indices = StopTimeIndices::build(vec![
            call("t1", "a", 0),
            call("t1", "b", 300),
            call("t2", "a", 600),
            call("t2", "b", 900),
        ]);
        assert_eq!(indices.next_call_at_stop(0, "b"), Some(1));
        assert_eq!(indices.next_call_at_stop(2, "b"), Some(3));
        assert_eq!(indices.next_call_at_stop(4, "b"), None);
        assert_eq!(indices.next_call_at_stop(1, "a"), Some(2));
    }
}
