//! Transport lifecycle
//!
//! Owns the send and receive transports of one session attempt, forwards
//! their connect/produce callbacks to the SFU, and records the publications
//! and subscriptions bound on them.
//!
//! Once [`TransportManager::close_all`] has run the manager is closed for
//! good: operations still in flight finish against the media layer, but their
//! results are discarded and anything they created is released immediately.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::device::{
    ConsumeOptions, Device, LocalMedia, MediaTransport, TrackRef, TransportListener,
};
use crate::error::{Error, Result};
use crate::protocol::{
    CreateTransportRequest, DtlsParameters, NewConsumer, ProduceRequest, RtpParameters,
};
use crate::signaling::SignalingClient;
use crate::types::{ConsumerId, MediaKind, PeerId, ProducerId, StreamTag, TransportId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Recv,
}

impl Direction {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Recv => "recv",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Created,
    Connecting,
    Connected,
    Closed,
}

/// A local track bound to the send transport
#[derive(Debug, Clone)]
pub struct Publication {
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub track: TrackRef,
}

/// A remote track bound to the receive transport
#[derive(Debug, Clone)]
pub struct Subscription {
    pub consumer_id: ConsumerId,
    pub producer_id: ProducerId,
    pub peer_id: PeerId,
    pub kind: MediaKind,
    pub tag: StreamTag,
    pub track: TrackRef,
}

/// Forwards a transport's callbacks to the SFU
struct TransportBridge {
    direction: Direction,
    transport_id: TransportId,
    signaling: SignalingClient,
    state: Arc<Mutex<TransportState>>,
}

impl TransportBridge {
    fn ensure_open(&self) -> Result<()> {
        if *self.state.lock() == TransportState::Closed {
            debug!(
                transport_id = %self.transport_id,
                direction = self.direction.as_str(),
                "Ignoring callback on closed transport"
            );
            return Err(Error::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl TransportListener for TransportBridge {
    async fn on_connect(&self, dtls_parameters: DtlsParameters) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state == TransportState::Closed {
                return Err(Error::Closed);
            }
            *state = TransportState::Connecting;
        }

        let result = self
            .signaling
            .connect_webrtc_transport(&self.transport_id, dtls_parameters)
            .await;

        let mut state = self.state.lock();
        if *state == TransportState::Closed {
            debug!(transport_id = %self.transport_id, "Late connect response ignored");
            return Err(Error::Closed);
        }
        match result {
            Ok(()) => {
                *state = TransportState::Connected;
                info!(
                    transport_id = %self.transport_id,
                    direction = self.direction.as_str(),
                    "Transport connected"
                );
                Ok(())
            }
            Err(e) => {
                *state = TransportState::Created;
                warn!(transport_id = %self.transport_id, error = %e, "Transport connect failed");
                Err(e)
            }
        }
    }

    async fn on_produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId> {
        if self.direction != Direction::Send {
            return Err(Error::ProtocolOrder(format!(
                "produce requested on receive transport {}",
                self.transport_id
            )));
        }
        self.ensure_open()?;

        let producer_id = self
            .signaling
            .produce(&ProduceRequest {
                transport_id: self.transport_id.clone(),
                kind,
                rtp_parameters,
            })
            .await?;

        self.ensure_open()?;
        Ok(producer_id)
    }
}

struct ManagedTransport {
    handle: Arc<dyn MediaTransport>,
    state: Arc<Mutex<TransportState>>,
}

impl ManagedTransport {
    fn close(&self, direction: Direction) {
        *self.state.lock() = TransportState::Closed;
        self.handle.close();
        info!(
            transport_id = %self.handle.id(),
            direction = direction.as_str(),
            "Transport closed"
        );
    }
}

#[derive(Default)]
struct Slots {
    send: Option<ManagedTransport>,
    recv: Option<ManagedTransport>,
    publications: Vec<Publication>,
    subscriptions: Vec<Subscription>,
    closed: bool,
}

pub struct TransportManager {
    signaling: SignalingClient,
    device: Arc<dyn Device>,
    slots: Mutex<Slots>,
}

impl TransportManager {
    pub fn new(signaling: SignalingClient, device: Arc<dyn Device>) -> Self {
        Self {
            signaling,
            device,
            slots: Mutex::new(Slots::default()),
        }
    }

    pub async fn create_receive_transport(&self) -> Result<TransportId> {
        self.create_transport(Direction::Recv).await
    }

    pub async fn create_send_transport(&self) -> Result<TransportId> {
        self.create_transport(Direction::Send).await
    }

    async fn create_transport(&self, direction: Direction) -> Result<TransportId> {
        {
            let slots = self.slots.lock();
            if slots.closed {
                return Err(Error::Closed);
            }
            if Self::slot(&slots, direction).is_some() {
                return Err(Error::ProtocolOrder(format!(
                    "{} transport already exists",
                    direction.as_str()
                )));
            }
        }

        // Transports may only be created once capabilities are negotiated
        self.device.rtp_capabilities()?;

        let request = match direction {
            Direction::Send => CreateTransportRequest::send(),
            Direction::Recv => CreateTransportRequest::recv(),
        };
        let info = self.signaling.create_webrtc_transport(request).await?;
        let transport_id = info.id.clone();

        let state = Arc::new(Mutex::new(TransportState::Created));
        let bridge = Arc::new(TransportBridge {
            direction,
            transport_id: transport_id.clone(),
            signaling: self.signaling.clone(),
            state: Arc::clone(&state),
        });

        let handle = match direction {
            Direction::Send => self.device.create_send_transport(info, bridge),
            Direction::Recv => self.device.create_recv_transport(info, bridge),
        }
        .map_err(|e| media_failure(e, format!("creating {} transport", direction.as_str())))?;

        let mut slots = self.slots.lock();
        if slots.closed {
            drop(slots);
            *state.lock() = TransportState::Closed;
            handle.close();
            debug!(transport_id = %transport_id, "Transport created after teardown, closed");
            return Err(Error::Closed);
        }
        let managed = Some(ManagedTransport { handle, state });
        match direction {
            Direction::Send => slots.send = managed,
            Direction::Recv => slots.recv = managed,
        }

        info!(
            transport_id = %transport_id,
            direction = direction.as_str(),
            "Transport created"
        );
        Ok(transport_id)
    }

    /// Bind every local track to the send transport, one after another.
    ///
    /// Stops at the first failure; tracks already bound stay bound and the
    /// caller is expected to tear the session down.
    pub async fn publish(&self, media: &LocalMedia) -> Result<Vec<Publication>> {
        let handle = {
            let slots = self.slots.lock();
            if slots.closed {
                return Err(Error::Closed);
            }
            slots
                .send
                .as_ref()
                .map(|t| Arc::clone(&t.handle))
                .ok_or_else(|| {
                    Error::ProtocolOrder("publish before send transport exists".to_string())
                })?
        };

        let mut published = Vec::with_capacity(media.tracks().len());
        for track in media.tracks() {
            let producer_id = handle
                .produce(Arc::clone(track))
                .await
                .map_err(|e| media_failure(e, format!("producing {} track", track.kind())))?;
            let publication = Publication {
                producer_id,
                kind: track.kind(),
                track: Arc::clone(track),
            };

            let mut slots = self.slots.lock();
            if slots.closed {
                return Err(Error::Closed);
            }
            slots.publications.push(publication.clone());
            drop(slots);

            info!(
                producer_id = %publication.producer_id,
                kind = %publication.kind,
                "Track published"
            );
            published.push(publication);
        }
        Ok(published)
    }

    /// Bind a track pushed by the SFU on the receive transport
    pub async fn subscribe(&self, consumer: &NewConsumer) -> Result<Subscription> {
        let handle = {
            let slots = self.slots.lock();
            if slots.closed {
                return Err(Error::Closed);
            }
            slots
                .recv
                .as_ref()
                .map(|t| Arc::clone(&t.handle))
                .ok_or_else(|| {
                    Error::ProtocolOrder(format!(
                        "consumer {} arrived before the receive transport exists",
                        consumer.id
                    ))
                })?
        };

        let tag = StreamTag::from_share_flag(consumer.app_data.share);
        let mut app_data = serde_json::to_value(&consumer.app_data)?;
        if let Value::Object(map) = &mut app_data {
            map.insert(
                "peerId".to_string(),
                Value::String(consumer.peer_id.to_string()),
            );
        }

        let track = handle
            .consume(ConsumeOptions {
                id: consumer.id.clone(),
                producer_id: consumer.producer_id.clone(),
                kind: consumer.kind,
                rtp_parameters: consumer.rtp_parameters.clone(),
                stream_id: tag.stream_id(&consumer.peer_id),
                app_data,
            })
            .await
            .map_err(|e| match e {
                Error::Closed | Error::Connection(_) | Error::Timeout(_) => e,
                other => Error::Subscription(format!("consume {} failed: {other}", consumer.id)),
            })?;

        let subscription = Subscription {
            consumer_id: consumer.id.clone(),
            producer_id: consumer.producer_id.clone(),
            peer_id: consumer.peer_id.clone(),
            kind: consumer.kind,
            tag,
            track,
        };

        let mut slots = self.slots.lock();
        if slots.closed {
            drop(slots);
            subscription.track.stop();
            return Err(Error::Closed);
        }
        slots.subscriptions.push(subscription.clone());
        drop(slots);

        info!(
            consumer_id = %subscription.consumer_id,
            peer_id = %subscription.peer_id,
            kind = %subscription.kind,
            "Track subscribed"
        );
        Ok(subscription)
    }

    /// Drop every subscription owned by `peer_id`, returning how many were released
    pub fn release_peer(&self, peer_id: &PeerId) -> usize {
        let released: Vec<Subscription> = {
            let mut slots = self.slots.lock();
            let (gone, kept) = std::mem::take(&mut slots.subscriptions)
                .into_iter()
                .partition(|s| &s.peer_id == peer_id);
            slots.subscriptions = kept;
            gone
        };
        for subscription in &released {
            subscription.track.stop();
        }
        if !released.is_empty() {
            debug!(peer_id = %peer_id, count = released.len(), "Released peer subscriptions");
        }
        released.len()
    }

    /// Close the send transport, then the receive transport. Idempotent.
    pub fn close_all(&self) {
        let (send, recv, subscriptions) = {
            let mut slots = self.slots.lock();
            if slots.closed {
                return;
            }
            slots.closed = true;
            slots.publications.clear();
            (
                slots.send.take(),
                slots.recv.take(),
                std::mem::take(&mut slots.subscriptions),
            )
        };

        if let Some(transport) = send {
            transport.close(Direction::Send);
        }
        if let Some(transport) = recv {
            transport.close(Direction::Recv);
        }
        for subscription in subscriptions {
            subscription.track.stop();
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.slots.lock().closed
    }

    #[must_use]
    pub fn transport_id(&self, direction: Direction) -> Option<TransportId> {
        let slots = self.slots.lock();
        Self::slot(&slots, direction).map(|t| t.handle.id().clone())
    }

    #[must_use]
    pub fn transport_state(&self, direction: Direction) -> Option<TransportState> {
        let slots = self.slots.lock();
        Self::slot(&slots, direction).map(|t| *t.state.lock())
    }

    #[must_use]
    pub fn publications(&self) -> Vec<Publication> {
        self.slots.lock().publications.clone()
    }

    #[must_use]
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.slots.lock().subscriptions.clone()
    }

    const fn slot(slots: &Slots, direction: Direction) -> Option<&ManagedTransport> {
        match direction {
            Direction::Send => slots.send.as_ref(),
            Direction::Recv => slots.recv.as_ref(),
        }
    }
}

/// Tag a media-layer failure as a transport error.
///
/// Signaling outcomes passed back through the transport callbacks keep
/// their own category.
fn media_failure(err: Error, context: String) -> Error {
    match err {
        Error::Closed
        | Error::Connection(_)
        | Error::Timeout(_)
        | Error::Rejected { .. }
        | Error::Transport(_) => err,
        other => Error::Transport(format!("{context}: {other}")),
    }
}
