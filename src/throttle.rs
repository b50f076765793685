//! Byte-budgeted pacing for every upstream request. The public feed sets a
//! bandwidth cap per client, so all fetches funnel through one gate that
//! keeps a sliding-window tab of wire bytes and stalls callers when the
//! next download is projected to blow the budget.

use crate::NextBusError;
use crate::config::ThrottleConfig;
use flate2::read::GzDecoder;
use reqwest::header::{ACCEPT_ENCODING, CONTENT_ENCODING};
use std::collections::VecDeque;
use std::io::Read;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::info;

pub struct MeteredDownloader {
    client: reqwest::Client,
    config: ThrottleConfig,
    state: Mutex<ThrottleState>,
}

#[derive(Default)]
struct ThrottleState {
    window: VecDeque<(Instant, u64)>,
    window_bytes: u64,
}

impl ThrottleState {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&(at, size)) = self.window.front() {
            if now.duration_since(at) > window {
                self.window_bytes -= size;
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn note(&mut self, at: Instant, size: u64) {
        self.window.push_back((at, size));
        self.window_bytes += size;
    }

    /// Stall required before the next download may start, if any. The
    /// projection assumes the next download is average-sized, doubled as a
    /// safety margin.
    fn required_stall(&self, config: &ThrottleConfig) -> Option<Duration> {
        if self.window.is_empty() {
            return None;
        }
        let projected = self.window_bytes + 2 * (self.window_bytes / self.window.len() as u64);
        if projected <= config.byte_budget {
            return None;
        }
        let over = (projected - config.byte_budget) as f64;
        Some(config.window.mul_f64(config.byte_budget as f64 / over))
    }
}

impl MeteredDownloader {
    pub fn new(config: ThrottleConfig) -> Result<MeteredDownloader, NextBusError> {
        let client = reqwest::ClientBuilder::new()
            .use_rustls_tls()
            .user_agent("nextbus-gtfs-rt")
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(20))
            // decompression is handled here so the throttle window counts
            // wire bytes, not inflated bytes
            .gzip(false)
            .build()?;
        Ok(MeteredDownloader {
            client,
            config,
            state: Mutex::new(ThrottleState::default()),
        })
    }

    /// Fetches a URL through the gate, inflating a gzip body if the server
    /// used one. Holding the state lock across the request is what makes
    /// the gate mutually exclusive.
    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>, NextBusError> {
        let mut state = self.state.lock().await;
        state.prune(Instant::now(), self.config.window);
        if let Some(stall) = state.required_stall(&self.config) {
            info!(stall_ms = stall.as_millis() as u64, "throttling");
            tokio::time::sleep(stall).await;
        }

        let response = self
            .client
            .get(url)
            .header(ACCEPT_ENCODING, "gzip")
            .send()
            .await?
            .error_for_status()?;
        let gzipped = response
            .headers()
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("gzip"));
        let raw = response.bytes().await?;
        state.note(Instant::now(), raw.len() as u64);
        drop(state);

        if gzipped {
            let mut inflated = Vec::new();
            GzDecoder::new(&raw[..]).read_to_end(&mut inflated)?;
            Ok(inflated)
        } else {
            Ok(raw.to_vec())
        }
    }
}
