//! Per-substream RTP counters
//!
//! This module provides:
//! - The immutable [`SubstreamCounters`] snapshot reported in track stats
//! - The [`CounterSource`] capability the forwarding engine exposes per substream
//! - [`RtpStreamCounters`], an in-memory source backed by atomic counters
//! - [`BitrateWindow`], the sliding-window accumulator behind instantaneous bitrate

use crate::config::TrackConfig;
use crate::types::Ssrc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Counters of one RTP substream at the moment it was read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubstreamCounters {
    /// RTP packets sent
    pub num_packets: u64,

    /// RTCP packets sent
    #[serde(rename = "numRTCPPackets")]
    pub num_rtcp_packets: u64,

    /// RTP bytes sent
    pub total_bytes: u64,

    /// RTCP bytes sent
    #[serde(rename = "totalRTCPBytes")]
    pub total_rtcp_bytes: u64,

    /// Instantaneous bitrate in bits per second
    pub bitrate: u64,
}

/// A readable RTP substream (media, retransmission or FEC)
pub trait CounterSource: Send + Sync {
    /// SSRC carried by this substream
    fn ssrc(&self) -> Ssrc;

    /// Read the counters now. Must not cache: bitrate is evaluated at call time.
    fn snapshot(&self) -> SubstreamCounters;
}

/// Sliding window of byte samples used to derive an instantaneous bitrate
#[derive(Debug)]
pub struct BitrateWindow {
    /// Recent data samples: (timestamp, bytes)
    samples: VecDeque<(Instant, u64)>,

    /// Window length
    window: Duration,

    /// Upper bound on retained samples
    max_samples: usize,
}

impl BitrateWindow {
    #[must_use]
    pub fn new(window: Duration, max_samples: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            window,
            max_samples: max_samples.max(1),
        }
    }

    /// Record `bytes` observed at `now`
    pub fn accumulate(&mut self, now: Instant, bytes: u64) {
        if self.samples.len() >= self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back((now, bytes));
        self.expire(now);
    }

    /// Bits per second over the window ending at `now`
    pub fn bitrate_at(&mut self, now: Instant) -> u64 {
        self.expire(now);
        let total_bytes: u64 = self.samples.iter().map(|(_, bytes)| bytes).sum();
        let window_ms = u64::try_from(self.window.as_millis()).unwrap_or(u64::MAX).max(1);
        total_bytes.saturating_mul(8).saturating_mul(1000) / window_ms
    }

    fn expire(&mut self, now: Instant) {
        let Some(cutoff) = now.checked_sub(self.window) else {
            return;
        };
        while let Some(&(timestamp, _)) = self.samples.front() {
            if timestamp <= cutoff {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// In-memory counter source fed by the packet path
pub struct RtpStreamCounters {
    ssrc: Ssrc,
    packets: AtomicU64,
    rtcp_packets: AtomicU64,
    bytes: AtomicU64,
    rtcp_bytes: AtomicU64,
    window: Mutex<BitrateWindow>,
}

impl RtpStreamCounters {
    #[must_use]
    pub fn new(ssrc: Ssrc, config: &TrackConfig) -> Self {
        Self {
            ssrc,
            packets: AtomicU64::new(0),
            rtcp_packets: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            rtcp_bytes: AtomicU64::new(0),
            window: Mutex::new(BitrateWindow::new(
                config.bitrate_window(),
                config.max_window_samples,
            )),
        }
    }

    /// Record one RTP packet of `size` bytes
    pub fn record_rtp(&self, size: usize) {
        self.record_rtp_at(Instant::now(), size);
    }

    pub fn record_rtp_at(&self, now: Instant, size: usize) {
        let size = size as u64;
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(size, Ordering::Relaxed);
        self.window.lock().accumulate(now, size);
    }

    /// Record one RTCP packet of `size` bytes
    pub fn record_rtcp(&self, size: usize) {
        self.rtcp_packets.fetch_add(1, Ordering::Relaxed);
        self.rtcp_bytes.fetch_add(size as u64, Ordering::Relaxed);
    }

    /// Snapshot evaluated at an explicit instant
    pub fn snapshot_at(&self, now: Instant) -> SubstreamCounters {
        SubstreamCounters {
            num_packets: self.packets.load(Ordering::Relaxed),
            num_rtcp_packets: self.rtcp_packets.load(Ordering::Relaxed),
            total_bytes: self.bytes.load(Ordering::Relaxed),
            total_rtcp_bytes: self.rtcp_bytes.load(Ordering::Relaxed),
            bitrate: self.window.lock().bitrate_at(now),
        }
    }
}

impl CounterSource for RtpStreamCounters {
    fn ssrc(&self) -> Ssrc {
        self.ssrc
    }

    fn snapshot(&self) -> SubstreamCounters {
        self.snapshot_at(Instant::now())
    }
}
