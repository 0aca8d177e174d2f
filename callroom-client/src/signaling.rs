//! Signaling seam
//!
//! The wire protocol lives behind [`SignalingConnector`] / [`SignalingChannel`].
//! This module adds what the session needs on top of it: typed requests for
//! each handshake method, per-request deadlines, and server-push events whose
//! requests must be answered exactly once.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::protocol::{
    self, method, ConnectTransportRequest, CreateTransportRequest, DtlsParameters, JoinRequest,
    JoinResponse, ProduceRequest, ProduceResponse, RtpCapabilities, TransportInfo,
};
use crate::types::{PeerId, ProducerId, RoomId, TransportId};

/// Request/response half of an open signaling channel
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Send a request and wait for the matching response payload
    async fn request(&self, method: &str, data: Value) -> Result<Value>;

    /// Close the channel. Must be safe to call repeatedly.
    fn close(&self);
}

/// Opens signaling channels
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    /// Open a channel to `url`, resolving once the channel is open
    async fn connect(&self, url: &Url) -> Result<SignalingConnection>;
}

/// An open channel plus the stream of server-initiated traffic
pub struct SignalingConnection {
    pub channel: Arc<dyn SignalingChannel>,
    pub events: mpsc::UnboundedReceiver<SignalingEvent>,
}

/// Server-initiated traffic and channel state changes
#[derive(Debug)]
pub enum SignalingEvent {
    Request(IncomingRequest),
    Notification { method: String, data: Value },
    /// The underlying connection failed
    Failed,
    /// The connection dropped
    Disconnected,
    /// The channel was closed
    Closed,
}

/// Answer to a server-initiated request
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Accept,
    Reject { reason: String },
}

/// Server-initiated request awaiting a reply
#[derive(Debug)]
pub struct IncomingRequest {
    pub method: String,
    pub data: Value,
    pub responder: Responder,
}

impl IncomingRequest {
    /// Build a request and the receiver its reply will arrive on
    pub fn new(method: impl Into<String>, data: Value) -> (Self, oneshot::Receiver<Reply>) {
        let (responder, rx) = Responder::new();
        (
            Self {
                method: method.into(),
                data,
                responder,
            },
            rx,
        )
    }
}

/// One-shot reply handle. Consumed by `accept`/`reject`; dropping it
/// unanswered rejects the request.
#[derive(Debug)]
pub struct Responder {
    tx: Option<oneshot::Sender<Reply>>,
}

impl Responder {
    #[must_use]
    pub fn new() -> (Self, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn accept(mut self) {
        self.send(Reply::Accept);
    }

    pub fn reject(mut self, reason: impl Into<String>) {
        self.send(Reply::Reject {
            reason: reason.into(),
        });
    }

    fn send(&mut self, reply: Reply) {
        if let Some(tx) = self.tx.take() {
            if tx.send(reply).is_err() {
                debug!("Reply receiver gone, channel already closed");
            }
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if self.tx.is_some() {
            warn!("Server request dropped without a reply, rejecting");
            self.send(Reply::Reject {
                reason: "request not handled".to_string(),
            });
        }
    }
}

/// Build the connection target `{base}/?roomId={room}&peerId={peer}`
pub fn connection_url(base: &str, room_id: &RoomId, peer_id: &PeerId) -> Result<Url> {
    let mut url = Url::parse(base)?;
    if url.path().is_empty() {
        url.set_path("/");
    }
    url.query_pairs_mut()
        .clear()
        .append_pair("roomId", room_id.as_str())
        .append_pair("peerId", peer_id.as_str());
    Ok(url)
}

/// Typed request client over an open channel
#[derive(Clone)]
pub struct SignalingClient {
    channel: Arc<dyn SignalingChannel>,
    timeout: Option<Duration>,
}

impl SignalingClient {
    pub fn new(channel: Arc<dyn SignalingChannel>, timeout: Option<Duration>) -> Self {
        Self { channel, timeout }
    }

    /// Issue a raw request under the configured deadline
    pub async fn request(&self, method: &str, data: Value) -> Result<Value> {
        debug!(method, "Signaling request");
        let fut = self.channel.request(method, data);
        match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, fut).await.map_err(|_| {
                Error::Timeout(format!(
                    "'{method}' got no response within {}s",
                    timeout.as_secs()
                ))
            })?,
            None => fut.await,
        }
    }

    pub async fn get_router_rtp_capabilities(&self) -> Result<RtpCapabilities> {
        let data = self
            .request(method::GET_ROUTER_RTP_CAPABILITIES, Value::Null)
            .await?;
        protocol::from_response(method::GET_ROUTER_RTP_CAPABILITIES, data)
    }

    pub async fn create_webrtc_transport(
        &self,
        request: CreateTransportRequest,
    ) -> Result<TransportInfo> {
        let data = self
            .request(method::CREATE_WEBRTC_TRANSPORT, protocol::to_payload(&request)?)
            .await?;
        protocol::from_response(method::CREATE_WEBRTC_TRANSPORT, data)
    }

    pub async fn connect_webrtc_transport(
        &self,
        transport_id: &TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<()> {
        let request = ConnectTransportRequest {
            transport_id: transport_id.clone(),
            dtls_parameters,
        };
        self.request(method::CONNECT_WEBRTC_TRANSPORT, protocol::to_payload(&request)?)
            .await?;
        Ok(())
    }

    pub async fn join(&self, request: &JoinRequest) -> Result<JoinResponse> {
        let data = self
            .request(method::JOIN, protocol::to_payload(request)?)
            .await?;
        protocol::from_response(method::JOIN, data)
    }

    pub async fn produce(&self, request: &ProduceRequest) -> Result<ProducerId> {
        let data = self
            .request(method::PRODUCE, protocol::to_payload(request)?)
            .await?;
        let response: ProduceResponse = protocol::from_response(method::PRODUCE, data)?;
        Ok(response.id)
    }

    pub fn close(&self) {
        self.channel.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::FakeSfu;
    use serde_json::json;

    #[test]
    fn test_connection_url() {
        let url = connection_url(
            "wss://sfu.example.com:4443",
            &RoomId::from("room42"),
            &PeerId::from("peer_abc123"),
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "wss://sfu.example.com:4443/?roomId=room42&peerId=peer_abc123"
        );
    }

    #[test]
    fn test_connection_url_rejects_garbage() {
        let result = connection_url("not a url", &RoomId::from("r"), &PeerId::from("p"));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_responder_replies_once() {
        let (responder, mut rx) = Responder::new();
        responder.accept();
        assert_eq!(rx.try_recv().unwrap(), Reply::Accept);
    }

    #[test]
    fn test_dropped_responder_rejects() {
        let (request, mut rx) = IncomingRequest::new("newConsumer", json!({}));
        drop(request);
        assert!(matches!(rx.try_recv().unwrap(), Reply::Reject { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_deadline() {
        let sfu = FakeSfu::new();
        sfu.hang_method(method::JOIN);
        let client = SignalingClient::new(sfu.channel(), Some(Duration::from_secs(5)));

        let request = JoinRequest {
            display_name: "x".into(),
            device: Default::default(),
            rtp_capabilities: RtpCapabilities::default(),
        };
        let result = client.join(&request).await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn test_typed_produce() {
        let sfu = FakeSfu::new();
        let client = SignalingClient::new(sfu.channel(), None);
        let id = client
            .produce(&ProduceRequest {
                transport_id: TransportId::from("send-1"),
                kind: crate::types::MediaKind::Audio,
                rtp_parameters: Default::default(),
            })
            .await
            .unwrap();
        assert!(id.as_str().starts_with("producer-"));
        assert_eq!(sfu.requests_for(method::PRODUCE), 1);
    }
}
