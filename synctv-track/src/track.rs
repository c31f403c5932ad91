//! Outgoing track control plane
//!
//! This module handles the lifecycle of one outbound track:
//! - Attaching an incoming source through a forwarding link (at most one at a time)
//! - Mute state that survives re-attachment
//! - Stats and SSRC views over the track's substreams
//! - `remb`, `muted` and `stopped` notifications
//!
//! Native notifications (bandwidth feedback, link termination) are queued on
//! the track's mailbox and consumed in order by [`OutgoingTrack::process_pending`]
//! or [`OutgoingTrack::run`]. A link never calls back into the track directly.
//!
//! Mutating operations are serialized by a re-entrant operation lock held for
//! the whole operation, publication included. The state lock is only held for
//! short reads and writes, never while a link, factory or handler runs.

use crate::config::TrackConfig;
use crate::error::{Result, TrackError};
use crate::events::{
    handler, EventChannel, Handler, LinkEvent, LinkEventKind, ListenerId, TrackEvent,
    TrackEventKind,
};
use crate::link::{
    FeedbackSink, ForwardingLink, IncomingSource, LinkContext, LinkFactory, NativeEvent,
    OutboundSender, TrackHandle,
};
use crate::sources::{SourceTriple, TrackSsrcs, TrackStats};
use crate::types::{LinkId, MediaKind, TrackId};
use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Observable lifecycle state of an outgoing track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackState {
    /// No forwarding link
    Fresh,
    /// Forwarding through a link
    Attached,
    /// Terminal
    Stopped,
}

/// Signaling view of an outgoing track
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub id: TrackId,
    pub media: MediaKind,
    pub muted: bool,
    pub state: TrackState,
    pub ssrcs: TrackSsrcs,
}

/// Resources held (not owned) while the track is alive
struct Binding {
    sender: Arc<dyn OutboundSender>,
    sources: SourceTriple,
}

struct AttachedLink {
    id: LinkId,
    link: Arc<dyn ForwardingLink>,
    stopped_listener: ListenerId,
    /// Set by the link's own `Stopped` notice, before the mailbox sees it
    terminated: Arc<AtomicBool>,
}

impl AttachedLink {
    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }
}

enum Lifecycle {
    Fresh(Binding),
    Attached(Binding, AttachedLink),
    Stopped,
}

impl Lifecycle {
    /// A link that already ended on its own counts as gone.
    fn state(&self) -> TrackState {
        match self {
            Self::Attached(_, attached) if !attached.is_terminated() => TrackState::Attached,
            Self::Fresh(_) | Self::Attached(..) => TrackState::Fresh,
            Self::Stopped => TrackState::Stopped,
        }
    }

    const fn binding(&self) -> Option<&Binding> {
        match self {
            Self::Fresh(binding) | Self::Attached(binding, _) => Some(binding),
            Self::Stopped => None,
        }
    }

    /// Current link, unless it already ended on its own
    fn link(&self) -> Option<&AttachedLink> {
        match self {
            Self::Attached(_, attached) if !attached.is_terminated() => Some(attached),
            _ => None,
        }
    }

    const fn link_id(&self) -> Option<LinkId> {
        match self {
            Self::Attached(_, attached) => Some(attached.id),
            _ => None,
        }
    }

    /// Attached -> Fresh, handing back the link. Other states are left as is.
    fn take_link(&mut self) -> Option<AttachedLink> {
        match std::mem::replace(self, Self::Stopped) {
            Self::Attached(binding, attached) => {
                *self = Self::Fresh(binding);
                Some(attached)
            }
            other => {
                *self = other;
                None
            }
        }
    }

    /// Fresh -> Attached. Gives the link back if the track is not fresh.
    fn attach(&mut self, attached: AttachedLink) -> std::result::Result<(), AttachedLink> {
        match std::mem::replace(self, Self::Stopped) {
            Self::Fresh(binding) => {
                *self = Self::Attached(binding, attached);
                Ok(())
            }
            other => {
                *self = other;
                Err(attached)
            }
        }
    }
}

struct TrackInner {
    lifecycle: Lifecycle,
    muted: bool,
    next_link: u64,
}

/// Unsubscribe from the link's termination, then stop it unless it already ended.
///
/// Must be called without the state lock: stopping publishes on the link's channel.
fn release_link(track_id: &TrackId, attached: AttachedLink) {
    attached.link.events().unsubscribe(attached.stopped_listener);
    if attached.is_terminated() {
        debug!(track_id = %track_id, link_id = %attached.id, "Forwarding link already terminated");
        return;
    }
    attached.link.stop();
    debug!(track_id = %track_id, link_id = %attached.id, "Forwarding link released");
}

/// One outbound audio or video track sent to a remote peer
pub struct OutgoingTrack {
    id: TrackId,
    media: MediaKind,
    factory: Arc<dyn LinkFactory>,
    ops: ReentrantMutex<()>,
    inner: Mutex<TrackInner>,
    events: EventChannel<TrackEvent>,
    feedback: FeedbackSink,
    mailbox: Mutex<Option<mpsc::UnboundedReceiver<NativeEvent>>>,
    shutdown: CancellationToken,
}

impl OutgoingTrack {
    /// Create a track bound to `sender` and `sources`.
    ///
    /// Registers the track's feedback sink on the sender, so bandwidth
    /// estimates start flowing into the mailbox right away.
    pub fn new(
        id: TrackId,
        media: MediaKind,
        sender: Arc<dyn OutboundSender>,
        sources: SourceTriple,
        factory: Arc<dyn LinkFactory>,
        config: &TrackConfig,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let feedback = FeedbackSink::new(id.clone(), tx);
        sender.register_feedback(&id, feedback.clone());

        info!(
            track_id = %id,
            media = %media,
            sender = sender.id(),
            muted = config.start_muted,
            "Creating outgoing track"
        );

        Self {
            id,
            media,
            factory,
            ops: ReentrantMutex::new(()),
            inner: Mutex::new(TrackInner {
                lifecycle: Lifecycle::Fresh(Binding { sender, sources }),
                muted: config.start_muted,
                next_link: 1,
            }),
            events: EventChannel::new(),
            feedback,
            mailbox: Mutex::new(Some(rx)),
            shutdown: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &TrackId {
        &self.id
    }

    #[must_use]
    pub fn media(&self) -> MediaKind {
        self.media
    }

    #[must_use]
    pub fn is_muted(&self) -> bool {
        self.inner.lock().muted
    }

    #[must_use]
    pub fn state(&self) -> TrackState {
        self.inner.lock().lifecycle.state()
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.state() == TrackState::Attached
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.state() == TrackState::Stopped
    }

    /// Current forwarding link, if any
    #[must_use]
    pub fn transponder(&self) -> Option<Arc<dyn ForwardingLink>> {
        self.inner
            .lock()
            .lifecycle
            .link()
            .map(|attached| Arc::clone(&attached.link))
    }

    /// Counters of every present substream. Empty once stopped.
    #[must_use]
    pub fn stats(&self) -> TrackStats {
        let sources = self
            .inner
            .lock()
            .lifecycle
            .binding()
            .map(|binding| binding.sources.clone());
        sources.map_or_else(TrackStats::empty, |sources| sources.stats())
    }

    /// SSRCs of every present substream. Empty once stopped.
    #[must_use]
    pub fn ssrcs(&self) -> TrackSsrcs {
        self.inner
            .lock()
            .lifecycle
            .binding()
            .map(|binding| binding.sources.ssrcs())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn info(&self) -> TrackInfo {
        let inner = self.inner.lock();
        TrackInfo {
            id: self.id.clone(),
            media: self.media,
            muted: inner.muted,
            state: inner.lifecycle.state(),
            ssrcs: inner
                .lifecycle
                .binding()
                .map(|binding| binding.sources.ssrcs())
                .unwrap_or_default(),
        }
    }

    /// Mute or unmute the track.
    ///
    /// The request always reaches the current link, even when the flag does
    /// not change. `muted` is published only on an actual change, in the
    /// order the changes happened.
    pub fn mute(&self, muted: bool) -> Result<()> {
        let _op = self.ops.lock();
        let link = {
            let inner = self.inner.lock();
            if matches!(inner.lifecycle, Lifecycle::Stopped) {
                debug!(track_id = %self.id, muted, "Ignoring mute on stopped track");
                return Ok(());
            }
            inner
                .lifecycle
                .link()
                .map(|attached| (attached.id, Arc::clone(&attached.link)))
        };

        if let Some((link_id, link)) = link {
            link.mute(muted).map_err(|e| {
                warn!(
                    track_id = %self.id,
                    link_id = %link_id,
                    error = %e,
                    "Forwarding link rejected mute"
                );
                TrackError::Mute(e)
            })?;
        }

        let changed = {
            let mut inner = self.inner.lock();
            if matches!(inner.lifecycle, Lifecycle::Stopped) || inner.muted == muted {
                false
            } else {
                inner.muted = muted;
                true
            }
        };

        if changed {
            debug!(track_id = %self.id, muted, "Track mute changed");
            self.events.publish(&TrackEvent::Muted { muted });
        }
        Ok(())
    }

    /// Start forwarding `incoming` through a new link, replacing any current one.
    ///
    /// Returns `Ok(None)` on a stopped track. A link that fails to take the
    /// mute state or the source is stopped before the error is returned.
    pub fn attach_to(
        &self,
        incoming: Arc<dyn IncomingSource>,
    ) -> Result<Option<Arc<dyn ForwardingLink>>> {
        let _op = self.ops.lock();
        let (previous, ctx, link_id, muted) = {
            let mut inner = self.inner.lock();
            let link_id = LinkId::new(inner.next_link);
            let Some(binding) = inner.lifecycle.binding() else {
                debug!(track_id = %self.id, "Ignoring attach on stopped track");
                return Ok(None);
            };
            let ctx = LinkContext {
                sources: binding.sources.clone(),
                sender: Arc::clone(&binding.sender),
                owner: TrackHandle {
                    id: self.id.clone(),
                    media: self.media,
                    link_id,
                    feedback: self.feedback.clone(),
                },
            };
            inner.next_link += 1;
            (inner.lifecycle.take_link(), ctx, link_id, inner.muted)
        };

        if let Some(previous) = previous {
            release_link(&self.id, previous);
        }

        let link = self.factory.create(ctx).map_err(|e| {
            warn!(track_id = %self.id, error = %e, "Failed to create forwarding link");
            TrackError::LinkCreation(e)
        })?;

        if muted {
            if let Err(e) = link.mute(true) {
                warn!(track_id = %self.id, link_id = %link_id, error = %e, "New link rejected mute");
                link.stop();
                return Err(TrackError::Mute(e));
            }
        }

        let source_id = incoming.id().to_string();
        if let Err(e) = link.set_incoming_source(incoming) {
            warn!(
                track_id = %self.id,
                link_id = %link_id,
                source = %source_id,
                error = %e,
                "Failed to bind incoming source"
            );
            link.stop();
            return Err(TrackError::Bind(e));
        }

        let terminated = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&terminated);
        let sink = self.feedback.clone();
        let stopped_listener = link.events().subscribe_once(
            LinkEventKind::Stopped,
            handler(move |_: &LinkEvent| {
                flag.store(true, Ordering::Release);
                sink.deliver(NativeEvent::LinkStopped { link: link_id });
            }),
        );

        let attached = AttachedLink {
            id: link_id,
            link: Arc::clone(&link),
            stopped_listener,
            terminated,
        };
        let outcome = self.inner.lock().lifecycle.attach(attached);
        if let Err(attached) = outcome {
            release_link(&self.id, attached);
            return Ok(None);
        }

        info!(
            track_id = %self.id,
            link_id = %link_id,
            source = %source_id,
            muted,
            "Track attached"
        );
        Ok(Some(link))
    }

    /// Stop and forget the current link. No-op without one.
    pub fn detach(&self) {
        let _op = self.ops.lock();
        let attached = self.inner.lock().lifecycle.take_link();
        if let Some(attached) = attached {
            release_link(&self.id, attached);
        }
    }

    /// Tear the track down. Only the first call has any effect.
    pub fn stop(&self) {
        let _op = self.ops.lock();
        let attached = {
            let mut inner = self.inner.lock();
            if matches!(inner.lifecycle, Lifecycle::Stopped) {
                debug!(track_id = %self.id, "Track already stopped");
                return;
            }
            let attached = inner.lifecycle.take_link();
            // Drops the binding: sender and sources are forgotten, not destroyed
            inner.lifecycle = Lifecycle::Stopped;
            attached
        };
        if let Some(attached) = attached {
            release_link(&self.id, attached);
        }

        self.shutdown.cancel();
        info!(track_id = %self.id, "Track stopped");

        self.events.publish(&TrackEvent::Stopped {
            track: self.id.clone(),
        });
        self.events.clear();
    }

    /// Subscribe to every event of `kind`
    pub fn on(&self, kind: TrackEventKind, handler: Handler<TrackEvent>) -> &Self {
        self.events.subscribe(kind, handler);
        self
    }

    /// Subscribe to the next event of `kind`
    pub fn once(&self, kind: TrackEventKind, handler: Handler<TrackEvent>) -> &Self {
        self.events.subscribe_once(kind, handler);
        self
    }

    /// Remove exactly `handler`, previously passed to [`on`](Self::on) or [`once`](Self::once)
    pub fn off(&self, kind: TrackEventKind, handler: &Handler<TrackEvent>) -> &Self {
        self.events.remove_handler(kind, handler);
        self
    }

    pub fn subscribe(&self, kind: TrackEventKind, handler: Handler<TrackEvent>) -> ListenerId {
        self.events.subscribe(kind, handler)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Handle every queued native notification. Returns how many were handled.
    pub fn process_pending(&self) -> usize {
        let mut handled = 0;
        loop {
            let event = {
                let mut mailbox = self.mailbox.lock();
                match mailbox.as_mut().map(|rx| rx.try_recv()) {
                    Some(Ok(event)) => event,
                    _ => break,
                }
            };
            self.handle_native(event);
            handled += 1;
        }
        handled
    }

    /// Consume native notifications until the track stops.
    ///
    /// While running, [`process_pending`](Self::process_pending) has nothing to drain.
    pub async fn run(&self) {
        let receiver = self.mailbox.lock().take();
        let Some(mut rx) = receiver else {
            warn!(track_id = %self.id, "Track mailbox already in use");
            return;
        };

        debug!(track_id = %self.id, "Track event loop started");
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => self.handle_native(event),
                    None => break,
                },
            }
        }

        *self.mailbox.lock() = Some(rx);
        debug!(track_id = %self.id, "Track event loop finished");
    }

    fn handle_native(&self, event: NativeEvent) {
        match event {
            NativeEvent::Remb { bitrate } => {
                if self.is_stopped() {
                    trace!(track_id = %self.id, bitrate, "Dropping REMB for stopped track");
                    return;
                }
                self.events.publish(&TrackEvent::Remb {
                    track: self.id.clone(),
                    bitrate,
                });
            }
            NativeEvent::LinkStopped { link } => self.on_link_stopped(link),
        }
    }

    /// The link ended on its own: forget it without stopping it again.
    fn on_link_stopped(&self, link: LinkId) {
        let _op = self.ops.lock();
        let mut inner = self.inner.lock();
        if inner.lifecycle.link_id() != Some(link) {
            debug!(track_id = %self.id, link_id = %link, "Ignoring stop of stale link");
            return;
        }

        inner.lifecycle.take_link();
        info!(track_id = %self.id, link_id = %link, "Forwarding link terminated");
    }
}

impl Drop for OutgoingTrack {
    fn drop(&mut self) {
        if let Some(attached) = self.inner.get_mut().lifecycle.take_link() {
            debug!(track_id = %self.id, "Dropping attached track");
            release_link(&self.id, attached);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LinkError;
    use crate::link::MockLinkFactory;
    use crate::test_helpers::{
        event_recorder, OutgoingTrackFixture, RecordingLink, RecordingLinkFactory, StaticIncoming,
    };

    #[test]
    fn test_new_track_is_fresh() {
        let fixture = OutgoingTrackFixture::new("t1", MediaKind::Video);
        let track = fixture.build();

        assert_eq!(track.id().as_str(), "t1");
        assert_eq!(track.media(), MediaKind::Video);
        assert_eq!(track.state(), TrackState::Fresh);
        assert!(!track.is_muted());
        assert!(track.transponder().is_none());
    }

    #[test]
    fn test_start_muted_from_config() {
        let config = TrackConfig {
            start_muted: true,
            ..Default::default()
        };
        let fixture = OutgoingTrackFixture::new("t1", MediaKind::Audio);
        let track = fixture.build_with_config(&config);
        assert!(track.is_muted());

        track.attach_to(StaticIncoming::new("src")).unwrap();
        assert!(fixture.factory.link(0).is_muted());
    }

    #[test]
    fn test_mute_unattached_updates_flag_once() {
        let fixture = OutgoingTrackFixture::new("t1", MediaKind::Audio);
        let track = fixture.build();
        let (events, recorder) = event_recorder();
        track.on(TrackEventKind::Muted, recorder);

        track.mute(true).unwrap();
        track.mute(true).unwrap();
        track.mute(false).unwrap();

        assert_eq!(
            *events.lock(),
            vec![
                TrackEvent::Muted { muted: true },
                TrackEvent::Muted { muted: false }
            ]
        );
    }

    #[test]
    fn test_mute_forwards_even_without_change() {
        let fixture = OutgoingTrackFixture::new("t1", MediaKind::Video);
        let track = fixture.build();
        track.attach_to(StaticIncoming::new("src")).unwrap();

        track.mute(false).unwrap();
        track.mute(false).unwrap();

        assert_eq!(fixture.factory.link(0).mute_calls(), vec![false, false]);
    }

    #[test]
    fn test_mute_failure_propagates_and_keeps_flag() {
        let fixture = OutgoingTrackFixture::new("t1", MediaKind::Video);
        let track = fixture.build();
        track.attach_to(StaticIncoming::new("src")).unwrap();
        fixture.factory.link(0).fail_mute(LinkError::Closed);

        let err = track.mute(true).unwrap_err();
        assert!(matches!(err, TrackError::Mute(LinkError::Closed)));
        assert!(!track.is_muted());
    }

    #[test]
    fn test_factory_failure_propagates() {
        let mut factory = MockLinkFactory::new();
        factory
            .expect_create()
            .times(1)
            .returning(|_| Err(LinkError::Rejected("no capacity".to_string())));

        let fixture = OutgoingTrackFixture::new("t1", MediaKind::Video);
        let track = fixture.build_with_factory(Arc::new(factory));

        let err = track.attach_to(StaticIncoming::new("src")).err().unwrap();
        assert!(matches!(err, TrackError::LinkCreation(LinkError::Rejected(_))));
        assert_eq!(track.state(), TrackState::Fresh);
    }

    #[test]
    fn test_factory_receives_track_context() {
        let mut factory = MockLinkFactory::new();
        factory
            .expect_create()
            .withf(|ctx| {
                ctx.owner.id.as_str() == "t1"
                    && ctx.owner.media == MediaKind::Audio
                    && ctx.sender.id() == "sender-1"
                    && ctx.sources.ssrcs().media.is_some()
            })
            .times(1)
            .returning(|_| Ok(Arc::new(RecordingLink::new()) as Arc<dyn ForwardingLink>));

        let fixture = OutgoingTrackFixture::new("t1", MediaKind::Audio);
        let track = fixture.build_with_factory(Arc::new(factory));
        assert!(track.attach_to(StaticIncoming::new("src")).unwrap().is_some());
    }

    #[test]
    fn test_bind_failure_stops_new_link() {
        let fixture = OutgoingTrackFixture::new("t1", MediaKind::Video);
        fixture
            .factory
            .fail_next_bind(LinkError::Rejected("gone".to_string()));
        let track = fixture.build();

        let err = track.attach_to(StaticIncoming::new("src")).err().unwrap();
        assert!(matches!(err, TrackError::Bind(_)));
        assert_eq!(fixture.factory.link(0).stop_count(), 1);
        assert!(track.transponder().is_none());
    }

    #[test]
    fn test_muted_attach_with_failing_mute_stops_new_link() {
        let fixture = OutgoingTrackFixture::new("t1", MediaKind::Video);
        let track = fixture.build();
        track.mute(true).unwrap();
        fixture.factory.fail_next_mute(LinkError::Closed);

        let err = track.attach_to(StaticIncoming::new("src")).err().unwrap();
        assert!(matches!(err, TrackError::Mute(LinkError::Closed)));
        assert_eq!(fixture.factory.link(0).stop_count(), 1);
        assert!(fixture.factory.link(0).incoming().is_none());
        assert_eq!(track.state(), TrackState::Fresh);
    }

    #[test]
    fn test_detach_releases_link_and_listener() {
        let fixture = OutgoingTrackFixture::new("t1", MediaKind::Video);
        let track = fixture.build();
        track.attach_to(StaticIncoming::new("src")).unwrap();
        let link = fixture.factory.link(0);
        assert_eq!(link.events().listener_count(LinkEventKind::Stopped), 1);

        track.detach();

        assert_eq!(link.stop_count(), 1);
        assert_eq!(link.events().listener_count(LinkEventKind::Stopped), 0);
        assert!(track.transponder().is_none());
        assert_eq!(track.state(), TrackState::Fresh);
        // Link's own stop notification never reached the mailbox
        assert_eq!(track.process_pending(), 0);

        track.detach();
        assert_eq!(link.stop_count(), 1);
    }

    #[test]
    fn test_link_self_termination_clears_reference() {
        let fixture = OutgoingTrackFixture::new("t1", MediaKind::Video);
        let track = fixture.build();
        track.attach_to(StaticIncoming::new("src")).unwrap();
        let link = fixture.factory.link(0);

        link.terminate();
        // Seen as gone at once, the notice itself waits in the mailbox
        assert!(!track.is_attached());
        assert!(track.transponder().is_none());
        assert_eq!(track.process_pending(), 1);

        assert_eq!(track.state(), TrackState::Fresh);
        assert_eq!(link.stop_count(), 0);

        track.stop();
        assert_eq!(link.stop_count(), 0);
    }

    #[test]
    fn test_undrained_termination_is_never_stopped_again() {
        let fixture = OutgoingTrackFixture::new("t1", MediaKind::Video);
        let track = fixture.build();
        track.attach_to(StaticIncoming::new("src")).unwrap();
        let link = fixture.factory.link(0);

        link.terminate();
        track.detach();
        assert_eq!(link.stop_count(), 0);

        // The queued notice names a link that is no longer held
        assert_eq!(track.process_pending(), 1);
        assert_eq!(track.state(), TrackState::Fresh);
    }

    #[test]
    fn test_drop_after_undrained_termination() {
        let fixture = OutgoingTrackFixture::new("t1", MediaKind::Video);
        let track = fixture.build();
        track.attach_to(StaticIncoming::new("src")).unwrap();

        fixture.factory.link(0).terminate();
        drop(track);
        assert_eq!(fixture.factory.link(0).stop_count(), 0);
    }

    #[test]
    fn test_link_subscriber_may_query_track_during_detach() {
        let fixture = OutgoingTrackFixture::new("t1", MediaKind::Video);
        let track = Arc::new(fixture.build());
        track.attach_to(StaticIncoming::new("src")).unwrap();
        let seen = Arc::new(Mutex::new(None));

        let weak = Arc::downgrade(&track);
        let seen_in_handler = Arc::clone(&seen);
        fixture.factory.link(0).events().subscribe(
            LinkEventKind::Stopped,
            handler(move |_: &LinkEvent| {
                if let Some(track) = weak.upgrade() {
                    *seen_in_handler.lock() = Some((track.state(), track.is_muted()));
                }
            }),
        );
        track.detach();

        assert_eq!(*seen.lock(), Some((TrackState::Fresh, false)));
        assert_eq!(fixture.factory.link(0).stop_count(), 1);
    }

    #[test]
    fn test_link_subscriber_may_mutate_track_during_stop() {
        let fixture = OutgoingTrackFixture::new("t1", MediaKind::Video);
        let track = Arc::new(fixture.build());
        track.attach_to(StaticIncoming::new("src")).unwrap();
        let (events, recorder) = event_recorder();
        track.on(TrackEventKind::Stopped, recorder);

        let weak = Arc::downgrade(&track);
        fixture.factory.link(0).events().subscribe(
            LinkEventKind::Stopped,
            handler(move |_: &LinkEvent| {
                if let Some(track) = weak.upgrade() {
                    assert!(track.is_stopped());
                    track.stop();
                    track.detach();
                }
            }),
        );
        track.stop();

        assert_eq!(events.lock().len(), 1);
        assert_eq!(fixture.factory.link(0).stop_count(), 1);
    }

    #[test]
    fn test_concurrent_mutes_publish_in_flag_order() {
        let fixture = OutgoingTrackFixture::new("t1", MediaKind::Audio);
        let track = fixture.build();
        track.attach_to(StaticIncoming::new("src")).unwrap();
        let (events, recorder) = event_recorder();
        track.on(TrackEventKind::Muted, recorder);

        std::thread::scope(|scope| {
            for worker in 0..4 {
                let track = &track;
                scope.spawn(move || {
                    for i in 0..200 {
                        track.mute((i + worker) % 2 == 0).unwrap();
                    }
                });
            }
        });

        let flags: Vec<bool> = events
            .lock()
            .iter()
            .map(|e| matches!(e, TrackEvent::Muted { muted: true }))
            .collect();
        assert!(!flags.is_empty());
        assert!(flags[0]);
        assert!(flags.windows(2).all(|pair| pair[0] != pair[1]));
        assert_eq!(flags.last().copied(), Some(track.is_muted()));
    }

    #[test]
    fn test_stale_link_stop_is_ignored() {
        let fixture = OutgoingTrackFixture::new("t1", MediaKind::Video);
        let track = fixture.build();
        track.attach_to(StaticIncoming::new("a")).unwrap();
        track.attach_to(StaticIncoming::new("b")).unwrap();

        fixture
            .sender
            .sink()
            .unwrap()
            .deliver(NativeEvent::LinkStopped { link: LinkId::new(1) });
        track.process_pending();

        assert!(track.is_attached());
        assert_eq!(fixture.factory.link(1).incoming().as_deref(), Some("b"));
    }

    #[test]
    fn test_remb_is_relayed_for_every_signal() {
        let fixture = OutgoingTrackFixture::new("t1", MediaKind::Video);
        let track = fixture.build();
        let (events, recorder) = event_recorder();
        track.on(TrackEventKind::Remb, recorder);

        let sink = fixture.sender.sink().unwrap();
        sink.remb(500_000);
        sink.remb(500_000);
        sink.remb(300_000);
        assert_eq!(track.process_pending(), 3);

        let bitrates: Vec<u64> = events
            .lock()
            .iter()
            .map(|e| match e {
                TrackEvent::Remb { bitrate, .. } => *bitrate,
                _ => 0,
            })
            .collect();
        assert_eq!(bitrates, vec![500_000, 500_000, 300_000]);
    }

    #[test]
    fn test_stop_releases_resources_and_ignores_later_calls() {
        let fixture = OutgoingTrackFixture::new("t1", MediaKind::Video);
        let track = fixture.build();
        track.attach_to(StaticIncoming::new("src")).unwrap();
        let (events, recorder) = event_recorder();
        track.on(TrackEventKind::Stopped, recorder);

        track.stop();
        track.stop();

        assert_eq!(events.lock().len(), 1);
        assert_eq!(fixture.factory.link(0).stop_count(), 1);
        assert!(track.stats().media.is_none());
        assert_eq!(track.ssrcs(), TrackSsrcs::default());

        assert!(track.attach_to(StaticIncoming::new("src")).unwrap().is_none());
        track.mute(true).unwrap();
        assert!(!track.is_muted());
        assert_eq!(fixture.factory.created(), 1);
    }

    #[test]
    fn test_off_and_chaining() {
        let fixture = OutgoingTrackFixture::new("t1", MediaKind::Audio);
        let track = fixture.build();
        let (first, h1) = event_recorder();
        let (second, h2) = event_recorder();

        track
            .on(TrackEventKind::Muted, Arc::clone(&h1))
            .on(TrackEventKind::Muted, h2)
            .off(TrackEventKind::Muted, &h1);
        track.mute(true).unwrap();

        assert!(first.lock().is_empty());
        assert_eq!(second.lock().len(), 1);
    }

    #[test]
    fn test_handler_may_query_track() {
        let fixture = OutgoingTrackFixture::new("t1", MediaKind::Audio);
        let track = Arc::new(fixture.build());
        let seen = Arc::new(Mutex::new(None));

        let weak = Arc::downgrade(&track);
        let seen_in_handler = Arc::clone(&seen);
        track.once(
            TrackEventKind::Muted,
            handler(move |_: &TrackEvent| {
                if let Some(track) = weak.upgrade() {
                    *seen_in_handler.lock() = Some(track.is_muted());
                }
            }),
        );
        track.mute(true).unwrap();

        assert_eq!(*seen.lock(), Some(true));
    }

    #[test]
    fn test_drop_stops_attached_link() {
        let fixture = OutgoingTrackFixture::new("t1", MediaKind::Video);
        let track = fixture.build();
        track.attach_to(StaticIncoming::new("src")).unwrap();
        drop(track);
        assert_eq!(fixture.factory.link(0).stop_count(), 1);
    }

    #[test]
    fn test_info_serializes_state() {
        let fixture = OutgoingTrackFixture::new("t1", MediaKind::Audio);
        let track = fixture.build();
        track.attach_to(StaticIncoming::new("src")).unwrap();

        let json = serde_json::to_value(track.info()).unwrap();
        assert_eq!(json["id"], "t1");
        assert_eq!(json["media"], "audio");
        assert_eq!(json["state"], "attached");
        assert_eq!(json["muted"], false);
        assert!(json["ssrcs"]["media"].is_number());
    }

    #[tokio::test]
    async fn test_run_loop_processes_until_stop() {
        let fixture = OutgoingTrackFixture::new("t1", MediaKind::Video);
        let track = Arc::new(fixture.build());
        let (events, recorder) = event_recorder();
        track.on(TrackEventKind::Remb, recorder);
        track.attach_to(StaticIncoming::new("src")).unwrap();

        let runner = Arc::clone(&track);
        let handle = tokio::spawn(async move { runner.run().await });

        fixture.sender.sink().unwrap().remb(64_000);
        fixture.factory.link(0).terminate();

        for _ in 0..100 {
            if !track.is_attached() && !events.lock().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!track.is_attached());
        assert_eq!(events.lock().len(), 1);

        track.stop();
        handle.await.unwrap();
    }
}
