//! Collaborator boundary of an outgoing track
//!
//! The forwarding engine owns packet processing. The track only sees it
//! through the traits below: the outbound sender, the incoming source to
//! forward, and the forwarding link ("transponder") binding the two.

use crate::error::LinkError;
use crate::events::{EventChannel, LinkEvent};
use crate::sources::SourceTriple;
use crate::types::{LinkId, MediaKind, TrackId};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

/// Notification delivered from the forwarding engine to the track's mailbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeEvent {
    /// Receiver estimated bitrate feedback (bps)
    Remb { bitrate: u64 },
    /// A forwarding link terminated
    LinkStopped { link: LinkId },
}

/// Write side of a track's mailbox handed to the forwarding engine
#[derive(Clone)]
pub struct FeedbackSink {
    track_id: TrackId,
    tx: mpsc::UnboundedSender<NativeEvent>,
}

impl FeedbackSink {
    pub(crate) fn new(track_id: TrackId, tx: mpsc::UnboundedSender<NativeEvent>) -> Self {
        Self { track_id, tx }
    }

    /// Relay a bandwidth estimate for this track
    pub fn remb(&self, bitrate: u64) {
        self.deliver(NativeEvent::Remb { bitrate });
    }

    pub(crate) fn deliver(&self, event: NativeEvent) {
        if self.tx.send(event).is_err() {
            trace!(track_id = %self.track_id, ?event, "Track gone, dropping native event");
        }
    }

    #[must_use]
    pub fn track_id(&self) -> &TrackId {
        &self.track_id
    }
}

impl fmt::Debug for FeedbackSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedbackSink")
            .field("track_id", &self.track_id)
            .finish()
    }
}

/// Outbound transport endpoint a track sends through
pub trait OutboundSender: Send + Sync {
    /// Identifier used in logs
    fn id(&self) -> &str;

    /// Called once when a track is created on this sender. Bandwidth
    /// estimates for that track should be pushed into `sink`.
    fn register_feedback(&self, _track: &TrackId, _sink: FeedbackSink) {}
}

/// Incoming media source a link forwards from
pub trait IncomingSource: Send + Sync {
    fn id(&self) -> &str;
}

/// Reference to the owning track handed to a new link
#[derive(Debug, Clone)]
pub struct TrackHandle {
    pub id: TrackId,
    pub media: MediaKind,
    pub link_id: LinkId,
    pub feedback: FeedbackSink,
}

/// Everything a factory needs to build a link for one track
#[derive(Clone)]
pub struct LinkContext {
    pub sources: SourceTriple,
    pub sender: Arc<dyn OutboundSender>,
    pub owner: TrackHandle,
}

impl fmt::Debug for LinkContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkContext")
            .field("sources", &self.sources)
            .field("sender", &self.sender.id())
            .field("owner", &self.owner)
            .finish()
    }
}

/// Active binding from one incoming source to a track's outbound sources
pub trait ForwardingLink: Send + Sync {
    /// Apply the mute state immediately, regardless of previous calls
    fn mute(&self, muted: bool) -> Result<(), LinkError>;

    /// Bind the incoming source. Called once per link.
    fn set_incoming_source(&self, source: Arc<dyn IncomingSource>) -> Result<(), LinkError>;

    /// Terminate the link. The owning track never calls this twice.
    fn stop(&self);

    /// Channel on which the link publishes [`LinkEvent::Stopped`] exactly once
    fn events(&self) -> &EventChannel<LinkEvent>;
}

/// Builds forwarding links
#[cfg_attr(test, mockall::automock)]
pub trait LinkFactory: Send + Sync {
    fn create(&self, ctx: LinkContext) -> Result<Arc<dyn ForwardingLink>, LinkError>;
}
