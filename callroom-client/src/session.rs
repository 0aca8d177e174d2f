//! Session lifecycle
//!
//! [`CallSession`] drives one call attempt at a time through the handshake
//!
//! ```text
//! connect → getRouterRtpCapabilities → load negotiator → recv transport
//!         → join → capture → send transport → produce → active
//! ```
//!
//! while a background task routes server-pushed requests and notifications
//! into the transport manager and the room reducer. Everything the
//! presentation layer reads is published as a [`SessionSnapshot`] on a
//! `watch` channel; room changes are applied only through
//! [`reconcile::reduce`](crate::reconcile::reduce).
//!
//! Teardown ([`CallSession::end`]) never fails and never waits. Work still in
//! flight for a torn-down attempt may complete later, but its results are
//! dropped and whatever it created is released.

use indexmap::IndexMap;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::Config;
use crate::device::{Device, DeviceFactory, LocalMedia, MediaCapture};
use crate::error::{Error, Result};
use crate::protocol::{JoinRequest, NewConsumer, ServerNotification, ServerRequest};
use crate::reconcile::{reduce, RemotePeerStream, RemoteTrack, RoomEvent, RoomState};
use crate::signaling::{
    connection_url, IncomingRequest, SignalingClient, SignalingConnector, SignalingEvent,
};
use crate::state::{ConnectionStatus, SessionPhase};
use crate::transport::TransportManager;
use crate::types::{PeerId, PeerInfo, RoomId};

/// External collaborators the session drives
#[derive(Clone)]
pub struct Collaborators {
    pub connector: Arc<dyn SignalingConnector>,
    pub devices: Arc<dyn DeviceFactory>,
    pub capture: Arc<dyn MediaCapture>,
}

/// Everything the presentation layer observes
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub phase: SessionPhase,
    pub participant_id: Option<PeerId>,
    pub room_id: Option<RoomId>,
    pub local_media: Option<LocalMedia>,
    pub room: RoomState,
    pub last_error: Option<String>,
}

impl SessionSnapshot {
    fn new(max_displayed_peers: usize) -> Self {
        Self {
            phase: SessionPhase::Disconnected,
            participant_id: None,
            room_id: None,
            local_media: None,
            room: RoomState::new(max_displayed_peers),
            last_error: None,
        }
    }

    #[must_use]
    pub const fn status(&self) -> ConnectionStatus {
        self.phase.status()
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.phase.is_active()
    }

    /// Remote streams to render, capped
    #[must_use]
    pub fn displayed_peers(&self) -> &[RemotePeerStream] {
        self.room.displayed()
    }

    /// Stream for the main tile
    #[must_use]
    pub fn primary_remote(&self) -> Option<&RemotePeerStream> {
        self.room.primary()
    }

    #[must_use]
    pub const fn peers(&self) -> &IndexMap<PeerId, PeerInfo> {
        self.room.peers()
    }

    fn apply(&mut self, event: RoomEvent) {
        let max_displayed = self.room.max_displayed();
        let previous = std::mem::replace(&mut self.room, RoomState::new(max_displayed));
        self.room = reduce(previous, event);
    }
}

/// Resources of one `start()` call
struct Attempt {
    generation: u64,
    participant_id: PeerId,
    room_id: RoomId,
    signaling: SignalingClient,
    device: Arc<dyn Device>,
    transports: TransportManager,
    local_media: Mutex<Option<LocalMedia>>,
    shutdown: CancellationToken,
}

impl Attempt {
    fn ensure_live(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }
}

struct SessionInner {
    config: Config,
    collaborators: Collaborators,
    state: watch::Sender<SessionSnapshot>,
    attempt: Mutex<Option<Arc<Attempt>>>,
    generation: AtomicU64,
}

/// A participant's membership in one SFU room
#[derive(Clone)]
pub struct CallSession {
    inner: Arc<SessionInner>,
}

impl CallSession {
    pub fn new(config: Config, collaborators: Collaborators) -> Self {
        let (state, _) = watch::channel(SessionSnapshot::new(config.session.max_displayed_peers));
        Self {
            inner: Arc::new(SessionInner {
                config,
                collaborators,
                state,
                attempt: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Join `room_id` and publish local media.
    ///
    /// Resolves once the session is active. On failure the session is left in
    /// the error phase with every resource already released; call `start`
    /// again to retry.
    pub async fn start(&self, room_id: RoomId) -> Result<()> {
        self.inner.start(room_id).await
    }

    /// Leave the room and release everything. Idempotent and infallible.
    pub fn end(&self) {
        self.inner.end();
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.state.borrow().clone()
    }

    /// Receiver that observes every snapshot change
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.state.subscribe()
    }

    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.inner.state.borrow().phase.clone()
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.inner.state.borrow().status()
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.state.borrow().is_active()
    }

    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.inner.state.borrow().last_error.clone()
    }

    #[must_use]
    pub fn local_media(&self) -> Option<LocalMedia> {
        self.inner.state.borrow().local_media.clone()
    }

    #[must_use]
    pub fn displayed_peers(&self) -> Vec<RemotePeerStream> {
        self.inner.state.borrow().displayed_peers().to_vec()
    }

    #[must_use]
    pub fn peers(&self) -> IndexMap<PeerId, PeerInfo> {
        self.inner.state.borrow().peers().clone()
    }

    #[must_use]
    pub fn participant_id(&self) -> Option<PeerId> {
        self.inner.state.borrow().participant_id.clone()
    }
}

impl SessionInner {
    async fn start(self: &Arc<Self>, room_id: RoomId) -> Result<()> {
        let participant_id = PeerId::generate();

        let mut outcome = Ok(());
        self.state.send_if_modified(|snap| match snap.phase.transition(SessionPhase::Connecting) {
            Ok(next) => {
                *snap = SessionSnapshot::new(self.config.session.max_displayed_peers);
                snap.phase = next;
                snap.participant_id = Some(participant_id.clone());
                snap.room_id = Some(room_id.clone());
                true
            }
            Err(e) => {
                outcome = Err(e);
                false
            }
        });
        outcome?;

        // Drop whatever a previous, disconnected attempt left behind
        let (generation, stale) = {
            let mut slot = self.attempt.lock();
            (self.generation.fetch_add(1, Ordering::SeqCst) + 1, slot.take())
        };
        if let Some(stale) = stale {
            self.teardown(&stale);
        }

        let span = info_span!("session", room_id = %room_id, peer_id = %participant_id);
        async {
            info!("Connecting to room");
            match self.connect(generation, participant_id, room_id).await {
                Ok(attempt) => match self.handshake(&attempt).await {
                    Ok(()) => {
                        info!("Session active");
                        Ok(())
                    }
                    Err(e) if e.is_session_fatal() => {
                        self.fail(&attempt, &e);
                        Err(e)
                    }
                    Err(_) => Err(self.closed_reason()),
                },
                Err(e) if e.is_session_fatal() => {
                    self.fail_connecting(generation, &e);
                    Err(e)
                }
                Err(_) => Err(self.closed_reason()),
            }
        }
        .instrument(span)
        .await
    }

    /// Open the channel and register the attempt, unless `end()` raced us
    async fn connect(
        self: &Arc<Self>,
        generation: u64,
        participant_id: PeerId,
        room_id: RoomId,
    ) -> Result<Arc<Attempt>> {
        let url = connection_url(&self.config.signaling.url, &room_id, &participant_id)?;
        let timeout = self.config.signaling.request_timeout();

        let connection = with_deadline(
            timeout,
            "opening signaling channel",
            self.collaborators.connector.connect(&url),
        )
        .await
        .map_err(|e| match e {
            Error::Timeout(_) | Error::Config(_) | Error::Connection(_) => e,
            other => Error::Connection(other.to_string()),
        })?;

        let device = self.collaborators.devices.create();
        let signaling = SignalingClient::new(connection.channel, timeout);
        let attempt = Arc::new(Attempt {
            generation,
            participant_id,
            room_id,
            transports: TransportManager::new(signaling.clone(), Arc::clone(&device)),
            signaling,
            device,
            local_media: Mutex::new(None),
            shutdown: CancellationToken::new(),
        });

        {
            let mut slot = self.attempt.lock();
            if self.generation.load(Ordering::SeqCst) != generation {
                drop(slot);
                attempt.signaling.close();
                debug!("Signaling channel opened after teardown, closed");
                return Err(Error::Closed);
            }
            *slot = Some(Arc::clone(&attempt));
        }

        let router = Arc::clone(self);
        let events_attempt = Arc::clone(&attempt);
        tokio::spawn(
            async move {
                router.route_events(events_attempt, connection.events).await;
            }
            .instrument(tracing::Span::current()),
        );

        Ok(attempt)
    }

    async fn handshake(&self, attempt: &Attempt) -> Result<()> {
        self.advance(attempt, SessionPhase::Negotiating)?;
        let router_capabilities = attempt.signaling.get_router_rtp_capabilities().await?;
        attempt.ensure_live()?;
        attempt
            .device
            .load(router_capabilities)
            .await
            .map_err(|e| match e {
                Error::Capability(_) => e,
                other => Error::Capability(other.to_string()),
            })?;
        attempt.ensure_live()?;

        attempt.transports.create_receive_transport().await?;

        self.advance(attempt, SessionPhase::JoiningRoom)?;
        let join = JoinRequest {
            display_name: self.config.session.display_name.clone(),
            device: self.config.session.device.clone(),
            rtp_capabilities: attempt.device.rtp_capabilities()?,
        };
        let response = attempt.signaling.join(&join).await?;
        info!(peers = response.peers.len(), "Joined room");
        self.dispatch(attempt, RoomEvent::RosterSnapshot(response.peers))?;

        self.advance(attempt, SessionPhase::Publishing)?;
        let media = with_deadline(
            self.config.session.capture_timeout(),
            "acquiring local media",
            self.collaborators.capture.acquire(),
        )
        .await
        .map_err(|e| match e {
            Error::Resource(_) | Error::Timeout(_) => e,
            other => Error::Resource(other.to_string()),
        })?;
        self.install_local_media(attempt, media.clone())?;

        attempt.transports.create_send_transport().await?;
        attempt.transports.publish(&media).await?;

        self.advance(attempt, SessionPhase::Active)
    }

    fn install_local_media(&self, attempt: &Attempt, media: LocalMedia) -> Result<()> {
        *attempt.local_media.lock() = Some(media.clone());

        let installed = self.state.send_if_modified(|snap| {
            if attempt.shutdown.is_cancelled() {
                return false;
            }
            snap.local_media = Some(media);
            true
        });

        if !installed {
            // Teardown ran while capture was pending
            let late = attempt.local_media.lock().take();
            if let Some(late) = late {
                late.stop_all();
            }
            return Err(Error::Closed);
        }
        Ok(())
    }

    async fn route_events(
        self: Arc<Self>,
        attempt: Arc<Attempt>,
        mut events: mpsc::UnboundedReceiver<SignalingEvent>,
    ) {
        // Requests run alongside the loop; notifications and channel state
        // are applied in arrival order
        let mut requests = JoinSet::new();
        loop {
            let event = tokio::select! {
                () = attempt.shutdown.cancelled() => break,
                Some(_) = requests.join_next(), if !requests.is_empty() => continue,
                event = events.recv() => event,
            };

            match event {
                Some(SignalingEvent::Request(request)) => {
                    let inner = Arc::clone(&self);
                    let attempt = Arc::clone(&attempt);
                    requests.spawn(
                        async move { inner.handle_request(&attempt, request).await }
                            .instrument(tracing::Span::current()),
                    );
                }
                Some(SignalingEvent::Notification { method, data }) => {
                    self.handle_notification(&attempt, &method, data);
                }
                Some(SignalingEvent::Failed) => {
                    self.channel_lost(&attempt, "WebSocket connection failed", true);
                }
                Some(SignalingEvent::Disconnected) => {
                    self.channel_lost(&attempt, "signaling channel disconnected", false);
                }
                Some(SignalingEvent::Closed) | None => {
                    self.channel_lost(&attempt, "signaling channel closed", false);
                    break;
                }
            }
        }

        if attempt.shutdown.is_cancelled() {
            // Each pending request sees the cancellation and rejects itself
            while requests.join_next().await.is_some() {}
        } else {
            requests.shutdown().await;
        }
        debug!("Signaling event loop stopped");
    }

    async fn handle_request(&self, attempt: &Attempt, request: IncomingRequest) {
        let IncomingRequest {
            method,
            data,
            responder,
        } = request;

        match ServerRequest::parse(&method, data) {
            Ok(ServerRequest::NewConsumer(consumer)) => {
                let outcome = tokio::select! {
                    biased;
                    () = attempt.shutdown.cancelled() => Err(Error::Closed),
                    result = self.accept_consumer(attempt, &consumer) => result,
                };
                match outcome {
                    Ok(()) => responder.accept(),
                    Err(e) => {
                        warn!(
                            consumer_id = %consumer.id,
                            peer_id = %consumer.peer_id,
                            error = %e,
                            "Rejecting consumer"
                        );
                        responder.reject(e.to_string());
                        if e.is_session_fatal() {
                            self.fail(attempt, &e);
                        }
                    }
                }
            }
            Ok(ServerRequest::Unknown { method }) => {
                debug!(method = %method, "Rejecting unknown server request");
                responder.reject(format!("unknown method '{method}'"));
            }
            Err(e) => {
                warn!(method = %method, error = %e, "Malformed server request");
                responder.reject(e.to_string());
            }
        }
    }

    async fn accept_consumer(&self, attempt: &Attempt, consumer: &NewConsumer) -> Result<()> {
        let limit = self.config.session.max_subscribed_peers;
        if limit > 0 {
            let state = self.state.borrow();
            let room = &state.room;
            if !room.has_media_for(&consumer.peer_id) && room.subscribed_peer_count() >= limit {
                return Err(Error::Subscription(format!(
                    "already receiving media from {limit} peers"
                )));
            }
        }

        let subscription = attempt
            .transports
            .subscribe(consumer)
            .await
            .map_err(|e| match e {
                // Only this subscription is lost
                Error::ProtocolOrder(_) => Error::Subscription(e.to_string()),
                other => other,
            })?;
        let event = RoomEvent::SubscriptionAdded {
            peer_id: subscription.peer_id.clone(),
            track: RemoteTrack {
                consumer_id: subscription.consumer_id.clone(),
                kind: subscription.kind,
                tag: subscription.tag,
                track: Arc::clone(&subscription.track),
            },
        };
        if let Err(e) = self.dispatch(attempt, event) {
            subscription.track.stop();
            return Err(e);
        }
        Ok(())
    }

    fn handle_notification(&self, attempt: &Attempt, method: &str, data: serde_json::Value) {
        match ServerNotification::parse(method, data) {
            Ok(ServerNotification::PeerClosed(closed)) => {
                let released = attempt.transports.release_peer(&closed.peer_id);
                info!(peer_id = %closed.peer_id, released, "Peer left");
                let _ = self.dispatch(attempt, RoomEvent::PeerClosed(closed.peer_id));
            }
            Ok(ServerNotification::NewPeer(peer)) => {
                info!(peer_id = %peer.id, display_name = %peer.display_name, "Peer joined");
                let _ = self.dispatch(attempt, RoomEvent::PeerJoined(peer));
            }
            Ok(ServerNotification::Unknown { method }) => {
                debug!(method = %method, "Ignoring notification");
            }
            Err(e) => warn!(method, error = %e, "Malformed notification"),
        }
    }

    fn channel_lost(&self, attempt: &Attempt, reason: &str, failed: bool) {
        if attempt.shutdown.is_cancelled() {
            return;
        }
        let phase = self.state.borrow().phase.clone();
        if failed || phase.is_handshaking() {
            self.fail(attempt, &Error::Connection(reason.to_string()));
        } else if phase.is_active() {
            warn!(reason, "Signaling channel lost");
            let _ = self.advance(attempt, SessionPhase::Disconnected);
        }
    }

    /// Apply a room event unless the attempt has been torn down
    fn dispatch(&self, attempt: &Attempt, event: RoomEvent) -> Result<()> {
        let applied = self.state.send_if_modified(|snap| {
            if attempt.shutdown.is_cancelled() {
                return false;
            }
            snap.apply(event);
            true
        });
        if applied {
            Ok(())
        } else {
            Err(Error::Closed)
        }
    }

    fn advance(&self, attempt: &Attempt, next: SessionPhase) -> Result<()> {
        let mut outcome = Ok(());
        self.state.send_if_modified(|snap| {
            if attempt.shutdown.is_cancelled() {
                outcome = Err(Error::Closed);
                return false;
            }
            match snap.phase.transition(next) {
                Ok(phase) => {
                    debug!(from = %snap.phase, to = %phase, "Session phase changed");
                    snap.phase = phase;
                    true
                }
                Err(e) => {
                    outcome = Err(e);
                    false
                }
            }
        });
        outcome
    }

    /// Record a fatal error and release the attempt
    fn fail(&self, attempt: &Attempt, err: &Error) {
        if attempt.shutdown.is_cancelled() {
            return;
        }
        let reason = err.to_string();
        error!(error = %reason, "Session failed");
        self.state.send_if_modified(|snap| {
            if attempt.shutdown.is_cancelled() {
                return false;
            }
            if let Ok(phase) = snap.phase.transition(SessionPhase::Error(reason.clone())) {
                snap.phase = phase;
            }
            snap.last_error = Some(reason);
            true
        });
        self.teardown(attempt);
    }

    /// Fatal error before an attempt existed (channel never opened)
    fn fail_connecting(&self, generation: u64, err: &Error) {
        let reason = err.to_string();
        let _slot = self.attempt.lock();
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        error!(error = %reason, "Could not open signaling channel");
        self.state.send_if_modified(|snap| {
            match snap.phase.transition(SessionPhase::Error(reason.clone())) {
                Ok(phase) => {
                    snap.phase = phase;
                    snap.last_error = Some(reason);
                    true
                }
                Err(_) => false,
            }
        });
    }

    /// Error to report from `start()` when the attempt was torn down under it
    fn closed_reason(&self) -> Error {
        match &self.state.borrow().phase {
            SessionPhase::Error(reason) => Error::Connection(reason.clone()),
            _ => Error::Closed,
        }
    }

    fn end(&self) {
        let attempt = {
            let mut slot = self.attempt.lock();
            self.generation.fetch_add(1, Ordering::SeqCst);
            slot.take()
        };
        let had_attempt = attempt.is_some();
        if let Some(attempt) = attempt {
            self.teardown(&attempt);
        }

        self.state.send_if_modified(|snap| {
            if !had_attempt && snap.phase == SessionPhase::Disconnected {
                return false;
            }
            match snap.phase.transition(SessionPhase::Closed) {
                Ok(phase) => {
                    snap.phase = phase;
                    true
                }
                Err(_) => false,
            }
        });
        info!("Session ended");
    }

    /// Close signaling, send transport, receive transport, then stop capture.
    /// Each step runs regardless of the previous ones.
    fn teardown(&self, attempt: &Attempt) {
        attempt.shutdown.cancel();
        {
            let mut slot = self.attempt.lock();
            if slot
                .as_ref()
                .is_some_and(|current| current.generation == attempt.generation)
            {
                *slot = None;
            }
        }

        attempt.signaling.close();
        attempt.transports.close_all();
        let local_media = attempt.local_media.lock().take();
        if let Some(media) = local_media {
            media.stop_all();
        }

        self.state.send_modify(|snap| {
            snap.apply(RoomEvent::Reset);
            snap.local_media = None;
        });
        debug!(
            room_id = %attempt.room_id,
            peer_id = %attempt.participant_id,
            "Session resources released"
        );
    }
}

/// Run `fut` under an optional deadline
async fn with_deadline<T>(
    deadline: Option<Duration>,
    what: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match deadline {
        Some(deadline) => tokio::time::timeout(deadline, fut)
            .await
            .map_err(|_| Error::Timeout(format!("{what} took longer than {}s", deadline.as_secs())))?,
        None => fut.await,
    }
}
