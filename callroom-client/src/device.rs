//! Media-layer seams: capability negotiator, transports, tracks and capture
//!
//! These are implemented by the platform media stack. A transport does not
//! talk to the SFU itself; whenever it needs a signaling round trip it calls
//! back into the [`TransportListener`] it was created with and waits for the
//! answer before moving on.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::protocol::{DtlsParameters, RtpCapabilities, RtpParameters, TransportInfo};
use crate::types::{ConsumerId, MediaKind, ProducerId, TransportId};

/// A local or remote media track
pub trait MediaTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    /// Stop the track, releasing capture hardware for local tracks
    fn stop(&self);

    /// Whether `stop` has been called (the track has ended)
    fn is_stopped(&self) -> bool;
}

pub type TrackRef = Arc<dyn MediaTrack>;

/// Locally captured media (one audio and one video track in practice)
#[derive(Debug, Clone, Default)]
pub struct LocalMedia {
    tracks: Vec<TrackRef>,
}

impl LocalMedia {
    #[must_use]
    pub fn new(tracks: Vec<TrackRef>) -> Self {
        Self { tracks }
    }

    #[must_use]
    pub fn tracks(&self) -> &[TrackRef] {
        &self.tracks
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Acquires local capture devices
#[async_trait]
pub trait MediaCapture: Send + Sync {
    async fn acquire(&self) -> Result<LocalMedia>;
}

/// Callbacks a transport issues when it needs the SFU
#[async_trait]
pub trait TransportListener: Send + Sync {
    /// Local connection parameters are ready; resolves once the SFU confirmed them
    async fn on_connect(&self, dtls_parameters: DtlsParameters) -> Result<()>;

    /// The transport wants to start sending a track; resolves to the SFU-allocated producer id
    async fn on_produce(&self, kind: MediaKind, rtp_parameters: RtpParameters)
        -> Result<ProducerId>;
}

/// Parameters for binding an inbound track
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumeOptions {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub stream_id: String,
    pub app_data: Value,
}

/// A unidirectional transport created by a [`Device`]
#[async_trait]
pub trait MediaTransport: Send + Sync {
    fn id(&self) -> &TransportId;

    /// Start sending a local track
    async fn produce(&self, track: TrackRef) -> Result<ProducerId>;

    /// Bind an inbound track announced by the SFU
    async fn consume(&self, options: ConsumeOptions) -> Result<TrackRef>;

    /// Release network resources. Must be safe to call repeatedly.
    fn close(&self);
}

/// Local capability negotiator and transport factory
#[async_trait]
pub trait Device: Send + Sync {
    /// Negotiate against the router's capability description
    async fn load(&self, router_capabilities: RtpCapabilities) -> Result<()>;

    /// Local capabilities; fails until `load` succeeded
    fn rtp_capabilities(&self) -> Result<RtpCapabilities>;

    fn create_send_transport(
        &self,
        info: TransportInfo,
        listener: Arc<dyn TransportListener>,
    ) -> Result<Arc<dyn MediaTransport>>;

    fn create_recv_transport(
        &self,
        info: TransportInfo,
        listener: Arc<dyn TransportListener>,
    ) -> Result<Arc<dyn MediaTransport>>;
}

/// Creates a fresh negotiator for every session attempt
pub trait DeviceFactory: Send + Sync {
    fn create(&self) -> Arc<dyn Device>;
}
