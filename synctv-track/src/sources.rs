//! Substream sources of an outgoing track and their aggregated views

use crate::counters::{CounterSource, SubstreamCounters};
use crate::types::{Ssrc, SubstreamRole};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Up to three substream sources (media, rtx, fec) of one outgoing track.
///
/// Owned by the enclosing session; cloning only clones the `Arc`s.
#[derive(Clone, Default)]
pub struct SourceTriple {
    media: Option<Arc<dyn CounterSource>>,
    rtx: Option<Arc<dyn CounterSource>>,
    fec: Option<Arc<dyn CounterSource>>,
}

impl SourceTriple {
    /// Triple with only the primary media substream
    #[must_use]
    pub fn new(media: Arc<dyn CounterSource>) -> Self {
        Self {
            media: Some(media),
            rtx: None,
            fec: None,
        }
    }

    #[must_use]
    pub fn with_rtx(mut self, rtx: Arc<dyn CounterSource>) -> Self {
        self.rtx = Some(rtx);
        self
    }

    #[must_use]
    pub fn with_fec(mut self, fec: Arc<dyn CounterSource>) -> Self {
        self.fec = Some(fec);
        self
    }

    #[must_use]
    pub fn get(&self, role: SubstreamRole) -> Option<&Arc<dyn CounterSource>> {
        match role {
            SubstreamRole::Media => self.media.as_ref(),
            SubstreamRole::Rtx => self.rtx.as_ref(),
            SubstreamRole::Fec => self.fec.as_ref(),
        }
    }

    /// Read every present substream now
    #[must_use]
    pub fn stats(&self) -> TrackStats {
        TrackStats {
            media: self.media.as_ref().map(|s| s.snapshot()),
            rtx: self.rtx.as_ref().map(|s| s.snapshot()),
            fec: self.fec.as_ref().map(|s| s.snapshot()),
            timestamp: Utc::now(),
        }
    }

    /// SSRC of every present substream
    #[must_use]
    pub fn ssrcs(&self) -> TrackSsrcs {
        TrackSsrcs {
            media: self.media.as_ref().map(|s| s.ssrc()),
            rtx: self.rtx.as_ref().map(|s| s.ssrc()),
            fec: self.fec.as_ref().map(|s| s.ssrc()),
        }
    }
}

impl fmt::Debug for SourceTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceTriple")
            .field("ssrcs", &self.ssrcs())
            .finish()
    }
}

/// Per-role counters of an outgoing track
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackStats {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media: Option<SubstreamCounters>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtx: Option<SubstreamCounters>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fec: Option<SubstreamCounters>,
    /// When the counters were read
    pub timestamp: DateTime<Utc>,
}

impl TrackStats {
    /// Stats of a track without sources
    #[must_use]
    pub fn empty() -> Self {
        Self {
            media: None,
            rtx: None,
            fec: None,
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn get(&self, role: SubstreamRole) -> Option<&SubstreamCounters> {
        match role {
            SubstreamRole::Media => self.media.as_ref(),
            SubstreamRole::Rtx => self.rtx.as_ref(),
            SubstreamRole::Fec => self.fec.as_ref(),
        }
    }

    /// Sum of the bitrates of all present substreams
    #[must_use]
    pub fn total_bitrate(&self) -> u64 {
        SubstreamRole::ALL
            .iter()
            .filter_map(|role| self.get(*role))
            .map(|c| c.bitrate)
            .sum()
    }
}

/// Per-role SSRCs of an outgoing track, used for signaling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TrackSsrcs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media: Option<Ssrc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtx: Option<Ssrc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fec: Option<Ssrc>,
}
