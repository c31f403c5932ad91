//! Test helpers and fakes for code built on outgoing tracks
//!
//! The fakes record every call made by a track so tests can assert on
//! ordering and counts without a forwarding engine.

use crate::config::TrackConfig;
use crate::counters::{CounterSource, SubstreamCounters};
use crate::error::LinkError;
use crate::events::{handler, EventChannel, Handler, LinkEvent, TrackEvent};
use crate::link::{
    FeedbackSink, ForwardingLink, IncomingSource, LinkContext, LinkFactory, OutboundSender,
};
use crate::sources::SourceTriple;
use crate::track::OutgoingTrack;
use crate::types::{MediaKind, Ssrc, TrackId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Counter source reporting fixed values
pub struct FixedCounters {
    ssrc: Ssrc,
    counters: SubstreamCounters,
}

impl FixedCounters {
    #[must_use]
    pub const fn new(ssrc: u32, counters: SubstreamCounters) -> Self {
        Self {
            ssrc: Ssrc::new(ssrc),
            counters,
        }
    }
}

impl CounterSource for FixedCounters {
    fn ssrc(&self) -> Ssrc {
        self.ssrc
    }

    fn snapshot(&self) -> SubstreamCounters {
        self.counters
    }
}

/// Incoming source identified by a fixed name
pub struct StaticIncoming {
    id: String,
}

impl StaticIncoming {
    #[must_use]
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self { id: id.to_string() })
    }
}

impl IncomingSource for StaticIncoming {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Sender that keeps the feedback sinks registered on it
pub struct RecordingSender {
    id: String,
    sinks: Mutex<Vec<FeedbackSink>>,
}

impl RecordingSender {
    #[must_use]
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            sinks: Mutex::new(Vec::new()),
        }
    }

    /// Most recently registered feedback sink
    #[must_use]
    pub fn sink(&self) -> Option<FeedbackSink> {
        self.sinks.lock().last().cloned()
    }

    #[must_use]
    pub fn registrations(&self) -> usize {
        self.sinks.lock().len()
    }
}

impl OutboundSender for RecordingSender {
    fn id(&self) -> &str {
        &self.id
    }

    fn register_feedback(&self, _track: &TrackId, sink: FeedbackSink) {
        self.sinks.lock().push(sink);
    }
}

/// Forwarding link that records what the track asks of it
pub struct RecordingLink {
    events: EventChannel<LinkEvent>,
    muted: AtomicBool,
    mute_calls: Mutex<Vec<bool>>,
    mute_error: Mutex<Option<LinkError>>,
    bind_error: Mutex<Option<LinkError>>,
    incoming: Mutex<Option<String>>,
    stop_count: AtomicUsize,
    terminated: AtomicBool,
}

impl Default for RecordingLink {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingLink {
    #[must_use]
    pub fn new() -> Self {
        Self {
            events: EventChannel::new(),
            muted: AtomicBool::new(false),
            mute_calls: Mutex::new(Vec::new()),
            mute_error: Mutex::new(None),
            bind_error: Mutex::new(None),
            incoming: Mutex::new(None),
            stop_count: AtomicUsize::new(0),
            terminated: AtomicBool::new(false),
        }
    }

    /// Make every following `mute` call fail with `error`
    pub fn fail_mute(&self, error: LinkError) {
        *self.mute_error.lock() = Some(error);
    }

    /// Make the `set_incoming_source` call fail with `error`
    pub fn fail_bind(&self, error: LinkError) {
        *self.bind_error.lock() = Some(error);
    }

    #[must_use]
    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn mute_calls(&self) -> Vec<bool> {
        self.mute_calls.lock().clone()
    }

    #[must_use]
    pub fn incoming(&self) -> Option<String> {
        self.incoming.lock().clone()
    }

    /// Number of times the owner called `stop`
    #[must_use]
    pub fn stop_count(&self) -> usize {
        self.stop_count.load(Ordering::SeqCst)
    }

    /// End the link on its own, as when the incoming source disappears
    pub fn terminate(&self) {
        self.publish_stopped();
    }

    fn publish_stopped(&self) {
        if !self.terminated.swap(true, Ordering::SeqCst) {
            self.events.publish(&LinkEvent::Stopped);
        }
    }
}

impl ForwardingLink for RecordingLink {
    fn mute(&self, muted: bool) -> Result<(), LinkError> {
        self.mute_calls.lock().push(muted);
        if let Some(error) = self.mute_error.lock().clone() {
            return Err(error);
        }
        self.muted.store(muted, Ordering::SeqCst);
        Ok(())
    }

    fn set_incoming_source(&self, source: Arc<dyn IncomingSource>) -> Result<(), LinkError> {
        if let Some(error) = self.bind_error.lock().take() {
            return Err(error);
        }
        *self.incoming.lock() = Some(source.id().to_string());
        Ok(())
    }

    fn stop(&self) {
        self.stop_count.fetch_add(1, Ordering::SeqCst);
        self.publish_stopped();
    }

    fn events(&self) -> &EventChannel<LinkEvent> {
        &self.events
    }
}

/// Factory handing out [`RecordingLink`]s and keeping them for inspection
#[derive(Default)]
pub struct RecordingLinkFactory {
    links: Mutex<Vec<Arc<RecordingLink>>>,
    contexts: Mutex<Vec<LinkContext>>,
    next_mute_error: Mutex<Option<LinkError>>,
    next_bind_error: Mutex<Option<LinkError>>,
}

impl RecordingLinkFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The next created link fails its `mute` calls
    pub fn fail_next_mute(&self, error: LinkError) {
        *self.next_mute_error.lock() = Some(error);
    }

    /// The next created link fails to bind its incoming source
    pub fn fail_next_bind(&self, error: LinkError) {
        *self.next_bind_error.lock() = Some(error);
    }

    /// Link created by the `index`-th call to `create`.
    ///
    /// # Panics
    ///
    /// Panics if fewer links were created.
    #[must_use]
    pub fn link(&self, index: usize) -> Arc<RecordingLink> {
        let links = self.links.lock();
        match links.get(index) {
            Some(link) => Arc::clone(link),
            None => panic!("only {} links created, asked for #{index}", links.len()),
        }
    }

    #[must_use]
    pub fn created(&self) -> usize {
        self.links.lock().len()
    }

    #[must_use]
    pub fn contexts(&self) -> Vec<LinkContext> {
        self.contexts.lock().clone()
    }
}

impl LinkFactory for RecordingLinkFactory {
    fn create(&self, ctx: LinkContext) -> Result<Arc<dyn ForwardingLink>, LinkError> {
        let link = Arc::new(RecordingLink::new());
        if let Some(error) = self.next_mute_error.lock().take() {
            link.fail_mute(error);
        }
        if let Some(error) = self.next_bind_error.lock().take() {
            link.fail_bind(error);
        }
        self.contexts.lock().push(ctx);
        self.links.lock().push(Arc::clone(&link));
        Ok(link as Arc<dyn ForwardingLink>)
    }
}

/// Builder for a track wired to recording fakes
pub struct OutgoingTrackFixture {
    pub id: TrackId,
    pub media: MediaKind,
    pub sender: Arc<RecordingSender>,
    pub factory: Arc<RecordingLinkFactory>,
    pub sources: SourceTriple,
}

impl OutgoingTrackFixture {
    /// Fixture whose media substream reports fixed counters under SSRC 1000
    #[must_use]
    pub fn new(id: &str, media: MediaKind) -> Self {
        Self {
            id: TrackId::from(id),
            media,
            sender: Arc::new(RecordingSender::new("sender-1")),
            factory: Arc::new(RecordingLinkFactory::new()),
            sources: SourceTriple::new(Arc::new(FixedCounters::new(
                1000,
                SubstreamCounters::default(),
            ))),
        }
    }

    #[must_use]
    pub fn with_sources(mut self, sources: SourceTriple) -> Self {
        self.sources = sources;
        self
    }

    #[must_use]
    pub fn build(&self) -> OutgoingTrack {
        self.build_with_config(&TrackConfig::default())
    }

    #[must_use]
    pub fn build_with_config(&self, config: &TrackConfig) -> OutgoingTrack {
        OutgoingTrack::new(
            self.id.clone(),
            self.media,
            Arc::clone(&self.sender) as Arc<dyn OutboundSender>,
            self.sources.clone(),
            Arc::clone(&self.factory) as Arc<dyn LinkFactory>,
            config,
        )
    }

    #[must_use]
    pub fn build_with_factory(&self, factory: Arc<dyn LinkFactory>) -> OutgoingTrack {
        OutgoingTrack::new(
            self.id.clone(),
            self.media,
            Arc::clone(&self.sender) as Arc<dyn OutboundSender>,
            self.sources.clone(),
            factory,
            &TrackConfig::default(),
        )
    }
}

/// Handler that appends every event it sees to the returned list
#[must_use]
pub fn event_recorder() -> (Arc<Mutex<Vec<TrackEvent>>>, Handler<TrackEvent>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let recorder = handler(move |event: &TrackEvent| sink.lock().push(event.clone()));
    (events, recorder)
}
