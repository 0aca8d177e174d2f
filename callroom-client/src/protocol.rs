//! Signaling methods and payloads exchanged with the SFU
//!
//! Capability descriptions, transport parameters and RTP parameters are
//! opaque to the session logic; they are carried as JSON values between
//! the SFU and the capability negotiator.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::types::{ConsumerId, MediaKind, PeerDevice, PeerId, PeerInfo, ProducerId, TransportId};

pub mod method {
    pub const GET_ROUTER_RTP_CAPABILITIES: &str = "getRouterRtpCapabilities";
    pub const CREATE_WEBRTC_TRANSPORT: &str = "createWebRtcTransport";
    pub const CONNECT_WEBRTC_TRANSPORT: &str = "connectWebRtcTransport";
    pub const JOIN: &str = "join";
    pub const PRODUCE: &str = "produce";

    // Server initiated
    pub const NEW_CONSUMER: &str = "newConsumer";
    pub const PEER_CLOSED: &str = "peerClosed";
    pub const NEW_PEER: &str = "newPeer";
}

/// Router or local RTP capability description
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RtpCapabilities(pub Value);

/// DTLS parameters generated by the local media layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DtlsParameters(pub Value);

/// RTP send/receive parameters for one track
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RtpParameters(pub Value);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTransportRequest {
    pub producing: bool,
    pub consuming: bool,
}

impl CreateTransportRequest {
    #[must_use]
    pub const fn send() -> Self {
        Self {
            producing: true,
            consuming: false,
        }
    }

    #[must_use]
    pub const fn recv() -> Self {
        Self {
            producing: false,
            consuming: true,
        }
    }
}

/// Transport parameters returned by `createWebRtcTransport`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportInfo {
    pub id: TransportId,
    #[serde(default)]
    pub ice_parameters: Value,
    #[serde(default)]
    pub ice_candidates: Value,
    #[serde(default)]
    pub dtls_parameters: Value,
    #[serde(default)]
    pub sctp_parameters: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportRequest {
    pub transport_id: TransportId,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub display_name: String,
    pub device: PeerDevice,
    pub rtp_capabilities: RtpCapabilities,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinResponse {
    #[serde(default)]
    pub peers: Vec<PeerInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRequest {
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProduceResponse {
    pub id: ProducerId,
}

/// Application data attached to a pushed consumer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsumerAppData {
    /// Set when the track is a screen share rather than camera/microphone
    #[serde(default)]
    pub share: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Payload of a server-pushed `newConsumer` request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewConsumer {
    pub peer_id: PeerId,
    pub producer_id: ProducerId,
    pub id: ConsumerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    #[serde(default)]
    pub app_data: ConsumerAppData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerClosed {
    pub peer_id: PeerId,
}

/// Server-initiated request that needs an accept or reject
#[derive(Debug, Clone, PartialEq)]
pub enum ServerRequest {
    NewConsumer(NewConsumer),
    Unknown { method: String },
}

impl ServerRequest {
    pub fn parse(method: &str, data: Value) -> Result<Self> {
        match method {
            method::NEW_CONSUMER => Ok(Self::NewConsumer(serde_json::from_value(data)?)),
            other => Ok(Self::Unknown {
                method: other.to_string(),
            }),
        }
    }
}

/// Server-initiated notification, no reply expected
#[derive(Debug, Clone, PartialEq)]
pub enum ServerNotification {
    PeerClosed(PeerClosed),
    NewPeer(PeerInfo),
    Unknown { method: String },
}

impl ServerNotification {
    pub fn parse(method: &str, data: Value) -> Result<Self> {
        match method {
            method::PEER_CLOSED => Ok(Self::PeerClosed(serde_json::from_value(data)?)),
            method::NEW_PEER => Ok(Self::NewPeer(serde_json::from_value(data)?)),
            other => Ok(Self::Unknown {
                method: other.to_string(),
            }),
        }
    }
}

/// Serialize a request payload
pub(crate) fn to_payload<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(Error::from)
}

/// Deserialize a response payload, naming the method on failure
pub(crate) fn from_response<T: for<'de> Deserialize<'de>>(method: &str, data: Value) -> Result<T> {
    serde_json::from_value(data).map_err(|e| Error::Rejected {
        method: method.to_string(),
        reason: format!("malformed response: {e}"),
    })
}
