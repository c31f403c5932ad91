//! `SyncTV` outgoing track control plane
//!
//! This crate governs one outbound media track of the SFU: how an incoming
//! media source is attached to, detached from, and forwarded through the
//! sending pipeline of a remote peer, and how that pipeline's statistics and
//! lifecycle events are surfaced to callers.
//!
//! ## Architecture
//!
//! - **`OutgoingTrack`**: the lifecycle state machine (fresh, attached, stopped)
//! - **`ForwardingLink`**: the engine-side binding of an incoming source to the track
//! - **`SourceTriple`**: media / rtx / fec substream counters of the track
//! - **`EventChannel`**: typed in-process publish/subscribe
//!
//! Packet forwarding, RTCP, and bandwidth estimation live in the forwarding
//! engine and are reached only through the traits in [`link`] and [`counters`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! use synctv_track::{handler, MediaKind, OutgoingTrack, TrackConfig, TrackEventKind};
//!
//! let track = OutgoingTrack::new(id, MediaKind::Video, sender, sources, factory, &TrackConfig::default());
//! track.on(TrackEventKind::Remb, handler(|event| tracing::info!(?event, "remb")));
//!
//! let link = track.attach_to(incoming)?;
//! track.mute(true)?;
//! track.stop();
//! ```

pub mod config;
pub mod counters;
pub mod error;
pub mod events;
pub mod link;
pub mod logging;
pub mod sources;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;
mod track;
mod types;

pub use config::{LoggingConfig, TrackConfig};
pub use counters::{BitrateWindow, CounterSource, RtpStreamCounters, SubstreamCounters};
pub use error::{LinkError, Result, TrackError};
pub use events::{
    handler, Event, EventChannel, Handler, LinkEvent, LinkEventKind, ListenerId, TrackEvent,
    TrackEventKind,
};
pub use link::{
    FeedbackSink, ForwardingLink, IncomingSource, LinkContext, LinkFactory, NativeEvent,
    OutboundSender, TrackHandle,
};
pub use logging::init_logging;
pub use sources::{SourceTriple, TrackSsrcs, TrackStats};
pub use track::{OutgoingTrack, TrackInfo, TrackState};
pub use types::{LinkId, MediaKind, Ssrc, SubstreamRole, TrackId};
