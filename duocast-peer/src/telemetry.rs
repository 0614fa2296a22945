//! Telemetry derivation from raw transport counters.
//!
//! The transport reports cumulative counters; quality decisions need interval
//! rates. [`StatsTracker`] keeps per-role deltas plus a rolling RTT window
//! and derives jitter from RTT variance when the transport does not report
//! one directly.

use chrono::Utc;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use duocast_core::models::StreamStats;

use crate::transport::TransportStats;

/// Rolling window for RTT samples.
const RTT_WINDOW: Duration = Duration::from_secs(30);

/// Derives per-interval [`StreamStats`] from cumulative transport counters.
/// One tracker per role; trackers share nothing.
pub struct StatsTracker {
    prev_bytes_sent: u64,
    prev_packets_sent: u64,
    prev_packets_lost: i64,
    rtt_samples: VecDeque<(Instant, f64)>,
    primed: bool,
}

impl StatsTracker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            prev_bytes_sent: 0,
            prev_packets_sent: 0,
            prev_packets_lost: 0,
            rtt_samples: VecDeque::new(),
            primed: false,
        }
    }

    /// Fold one raw sample into the tracker and produce the derived stats.
    pub fn sample(&mut self, raw: &TransportStats, now: Instant) -> StreamStats {
        let interval_bytes = raw.bytes_sent.saturating_sub(self.prev_bytes_sent);
        let interval_sent = raw.packets_sent.saturating_sub(self.prev_packets_sent);
        let interval_lost = (raw.packets_lost - self.prev_packets_lost).max(0) as u64;

        // The first sample has no previous counters to delta against.
        let (bitrate, packet_loss) = if self.primed {
            let loss = if interval_sent > 0 {
                (interval_lost as f64 / interval_sent as f64).clamp(0.0, 1.0)
            } else {
                0.0
            };
            (interval_bytes * 8, loss)
        } else {
            (0, 0.0)
        };

        self.prev_bytes_sent = raw.bytes_sent;
        self.prev_packets_sent = raw.packets_sent;
        self.prev_packets_lost = raw.packets_lost;
        self.primed = true;

        if let Some(rtt) = raw.round_trip_ms {
            self.rtt_samples.push_back((now, rtt));
        }
        let cutoff = now.checked_sub(RTT_WINDOW).unwrap_or(now);
        while let Some(&(t, _)) = self.rtt_samples.front() {
            if t < cutoff {
                self.rtt_samples.pop_front();
            } else {
                break;
            }
        }

        let rtt = self.rtt_samples.back().map_or(0.0, |&(_, v)| v);
        let jitter = self.jitter();

        let resolution = match (raw.frame_width, raw.frame_height) {
            (Some(w), Some(h)) => format!("{w}x{h}"),
            _ => "---".to_string(),
        };

        StreamStats {
            resolution,
            fps: raw.frames_per_second.unwrap_or(0.0),
            bitrate,
            rtt,
            packet_loss,
            jitter,
            timestamp: Utc::now(),
        }
    }

    /// Jitter as the standard deviation of the RTT window.
    fn jitter(&self) -> f64 {
        if self.rtt_samples.len() < 2 {
            return 0.0;
        }
        let mean =
            self.rtt_samples.iter().map(|&(_, v)| v).sum::<f64>() / self.rtt_samples.len() as f64;
        let variance = self
            .rtt_samples
            .iter()
            .map(|&(_, v)| {
                let diff = v - mean;
                diff * diff
            })
            .sum::<f64>()
            / self.rtt_samples.len() as f64;
        variance.sqrt()
    }
}

impl Default for StatsTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(bytes: u64, sent: u64, lost: i64, rtt: Option<f64>) -> TransportStats {
        TransportStats {
            bytes_sent: bytes,
            packets_sent: sent,
            packets_lost: lost,
            round_trip_ms: rtt,
            ..TransportStats::default()
        }
    }

    #[test]
    fn test_first_sample_reports_zero_rates() {
        let mut tracker = StatsTracker::new();
        let stats = tracker.sample(&raw(500_000, 400, 0, Some(20.0)), Instant::now());
        assert_eq!(stats.bitrate, 0);
        assert_eq!(stats.packet_loss, 0.0);
        assert_eq!(stats.rtt, 20.0);
    }

    #[test]
    fn test_interval_deltas() {
        let mut tracker = StatsTracker::new();
        let now = Instant::now();
        tracker.sample(&raw(500_000, 1_000, 0, None), now);
        let stats = tracker.sample(&raw(750_000, 1_100, 5, Some(30.0)), now);

        assert_eq!(stats.bitrate, 250_000 * 8);
        assert!((stats.packet_loss - 0.05).abs() < 1e-9);
        assert_eq!(stats.rtt, 30.0);
    }

    #[test]
    fn test_counter_reset_does_not_underflow() {
        let mut tracker = StatsTracker::new();
        let now = Instant::now();
        tracker.sample(&raw(500_000, 1_000, 10, None), now);
        // A fresh transport restarts counters from zero.
        let stats = tracker.sample(&raw(1_000, 10, 0, None), now);
        assert_eq!(stats.bitrate, 0);
        assert_eq!(stats.packet_loss, 0.0);
    }

    #[test]
    fn test_jitter_from_rtt_variance() {
        let mut tracker = StatsTracker::new();
        let now = Instant::now();
        tracker.sample(&raw(0, 0, 0, Some(20.0)), now);
        tracker.sample(&raw(0, 0, 0, Some(40.0)), now);
        let stats = tracker.sample(&raw(0, 0, 0, Some(60.0)), now);

        // stddev of {20, 40, 60} ≈ 16.33
        assert!((stats.jitter - 16.329_931).abs() < 1e-3);
    }

    #[test]
    fn test_resolution_formatting() {
        let mut tracker = StatsTracker::new();
        let mut sample = raw(0, 0, 0, None);
        sample.frame_width = Some(1920);
        sample.frame_height = Some(1080);
        sample.frames_per_second = Some(58.5);

        let stats = tracker.sample(&sample, Instant::now());
        assert_eq!(stats.resolution, "1920x1080");
        assert!((stats.fps - 58.5).abs() < f64::EPSILON);
    }
}
