//! Test doubles for the signaling channel, negotiator, transports and capture
//!
//! `FakeSfu` answers every handshake method the way a mediasoup room does and
//! lets a test push server-initiated requests and notifications.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use url::Url;

use crate::device::{
    ConsumeOptions, Device, DeviceFactory, LocalMedia, MediaCapture, MediaTrack, MediaTransport,
    TrackRef, TransportListener,
};
use crate::error::{Error, Result};
use crate::protocol::{method, DtlsParameters, RtpCapabilities, RtpParameters, TransportInfo};
use crate::signaling::{
    IncomingRequest, Reply, SignalingChannel, SignalingConnection, SignalingConnector,
    SignalingEvent,
};
use crate::types::{ConsumerId, MediaKind, PeerInfo, ProducerId, TransportId};

/// Ordered record of release steps across the fakes
#[derive(Debug, Clone, Default)]
pub struct CloseLog(Arc<Mutex<Vec<String>>>);

impl CloseLog {
    pub fn record(&self, step: impl Into<String>) {
        self.0.lock().push(step.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }
}

#[derive(Debug)]
pub struct FakeTrack {
    id: String,
    kind: MediaKind,
    stopped: AtomicBool,
    log: Option<CloseLog>,
}

impl FakeTrack {
    pub fn new(id: &str, kind: MediaKind) -> Arc<Self> {
        Self::build(id, kind, None)
    }

    /// Track that records `stop <id>` in `log`
    pub fn logged(id: &str, kind: MediaKind, log: CloseLog) -> Arc<Self> {
        Self::build(id, kind, Some(log))
    }

    fn build(id: &str, kind: MediaKind, log: Option<CloseLog>) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            kind,
            stopped: AtomicBool::new(false),
            log,
        })
    }
}

impl MediaTrack for FakeTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn stop(&self) {
        let was_stopped = self.stopped.swap(true, Ordering::SeqCst);
        if let (false, Some(log)) = (was_stopped, &self.log) {
            log.record(format!("stop {}", self.id));
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct SfuInner {
    requests: Mutex<Vec<(String, Value)>>,
    hang: Mutex<HashSet<String>>,
    delays: Mutex<HashMap<String, Duration>>,
    fail_after: Mutex<HashMap<String, usize>>,
    roster: Mutex<Vec<PeerInfo>>,
    events: Mutex<Option<mpsc::UnboundedSender<SignalingEvent>>>,
    connect_urls: Mutex<Vec<Url>>,
    refuse_connect: AtomicBool,
    closed: AtomicBool,
    next_id: AtomicU64,
    close_log: CloseLog,
}

/// In-memory SFU room: connector, channel and push side in one
#[derive(Clone, Default)]
pub struct FakeSfu {
    inner: Arc<SfuInner>,
}

impl FakeSfu {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel(&self) -> Arc<dyn SignalingChannel> {
        Arc::new(FakeChannel {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Requests for `method` never get a response
    pub fn hang_method(&self, method: &str) {
        self.inner.hang.lock().insert(method.to_string());
    }

    pub fn delay_method(&self, method: &str, delay: Duration) {
        self.inner.delays.lock().insert(method.to_string(), delay);
    }

    pub fn fail_method(&self, method: &str) {
        self.fail_method_after(method, 0);
    }

    /// Answer the first `successes` requests for `method`, reject the rest
    pub fn fail_method_after(&self, method: &str, successes: usize) {
        self.inner
            .fail_after
            .lock()
            .insert(method.to_string(), successes);
    }

    pub fn set_roster(&self, peers: Vec<PeerInfo>) {
        *self.inner.roster.lock() = peers;
    }

    pub fn refuse_connections(&self) {
        self.inner.refuse_connect.store(true, Ordering::SeqCst);
    }

    pub fn requests_for(&self, method: &str) -> usize {
        self.inner
            .requests
            .lock()
            .iter()
            .filter(|(m, _)| m == method)
            .count()
    }

    /// Method names in the order they were requested
    pub fn request_log(&self) -> Vec<String> {
        self.inner
            .requests
            .lock()
            .iter()
            .map(|(m, _)| m.clone())
            .collect()
    }

    pub fn last_payload(&self, method: &str) -> Option<Value> {
        self.inner
            .requests
            .lock()
            .iter()
            .rev()
            .find(|(m, _)| m == method)
            .map(|(_, data)| data.clone())
    }

    pub fn connect_urls(&self) -> Vec<Url> {
        self.inner.connect_urls.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Log the channel records `close signaling` into; share it with the other fakes
    pub fn close_log(&self) -> CloseLog {
        self.inner.close_log.clone()
    }

    pub fn push_event(&self, event: SignalingEvent) {
        let events = self.inner.events.lock();
        let tx = events.as_ref().expect("no client connected");
        tx.send(event).expect("client event loop gone");
    }

    /// Push a server request; the receiver resolves with the client's reply
    pub fn push_request(&self, method: &str, data: Value) -> oneshot::Receiver<Reply> {
        let (request, reply) = IncomingRequest::new(method, data);
        self.push_event(SignalingEvent::Request(request));
        reply
    }

    pub fn push_notification(&self, method: &str, data: Value) {
        self.push_event(SignalingEvent::Notification {
            method: method.to_string(),
            data,
        });
    }

    /// Push a `newConsumer` request for `peer_id`
    pub fn push_consumer(&self, peer_id: &str, kind: MediaKind) -> oneshot::Receiver<Reply> {
        let n = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.push_request(
            method::NEW_CONSUMER,
            json!({
                "peerId": peer_id,
                "producerId": format!("remote-producer-{n}"),
                "id": format!("consumer-{n}"),
                "kind": kind.as_str(),
                "rtpParameters": { "codecs": [] },
                "appData": { "share": false }
            }),
        )
    }

    /// Resolves once every event pushed before it has been handled
    pub async fn barrier(&self) {
        let reply = self.push_request("barrier", Value::Null);
        reply.await.expect("client dropped barrier");
    }
}

#[async_trait]
impl SignalingConnector for FakeSfu {
    async fn connect(&self, url: &Url) -> Result<SignalingConnection> {
        self.inner.connect_urls.lock().push(url.clone());
        if self.inner.refuse_connect.load(Ordering::SeqCst) {
            return Err(Error::Connection("connection refused".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.events.lock() = Some(tx);
        self.inner.closed.store(false, Ordering::SeqCst);
        Ok(SignalingConnection {
            channel: self.channel(),
            events: rx,
        })
    }
}

struct FakeChannel {
    inner: Arc<SfuInner>,
}

impl FakeChannel {
    fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.inner.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl SignalingChannel for FakeChannel {
    async fn request(&self, method: &str, data: Value) -> Result<Value> {
        let previous = {
            let mut requests = self.inner.requests.lock();
            let previous = requests.iter().filter(|(m, _)| m == method).count();
            requests.push((method.to_string(), data));
            previous
        };

        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Connection("channel closed".to_string()));
        }
        let hang = self.inner.hang.lock().contains(method);
        if hang {
            std::future::pending::<()>().await;
        }
        let delay = self.inner.delays.lock().get(method).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let allowed = self.inner.fail_after.lock().get(method).copied();
        if allowed.is_some_and(|allowed| previous >= allowed) {
            return Err(Error::Rejected {
                method: method.to_string(),
                reason: "injected failure".to_string(),
            });
        }

        match method {
            method::GET_ROUTER_RTP_CAPABILITIES => {
                Ok(json!({ "codecs": [{ "mimeType": "audio/opus" }, { "mimeType": "video/VP8" }] }))
            }
            method::CREATE_WEBRTC_TRANSPORT => Ok(json!({
                "id": self.next_id("transport"),
                "iceParameters": {},
                "iceCandidates": [],
                "dtlsParameters": {}
            })),
            method::CONNECT_WEBRTC_TRANSPORT => Ok(json!({})),
            method::JOIN => Ok(json!({ "peers": *self.inner.roster.lock() })),
            method::PRODUCE => Ok(json!({ "id": self.next_id("producer") })),
            other => Err(Error::Rejected {
                method: other.to_string(),
                reason: "unknown method".to_string(),
            }),
        }
    }

    fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            self.inner.close_log.record("close signaling");
        }
    }
}

pub struct FakeTransport {
    id: TransportId,
    direction: &'static str,
    listener: Arc<dyn TransportListener>,
    connected: tokio::sync::Mutex<bool>,
    closed: AtomicBool,
    consumes: Arc<Mutex<Vec<ConsumeOptions>>>,
    failing_consumers: Arc<Mutex<HashSet<ConsumerId>>>,
    fail_produce: Arc<AtomicBool>,
    close_log: Option<CloseLog>,
}

impl FakeTransport {
    async fn ensure_connected(&self) -> Result<()> {
        let mut connected = self.connected.lock().await;
        if !*connected {
            self.listener
                .on_connect(DtlsParameters(json!({ "role": "auto" })))
                .await?;
            *connected = true;
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Transport(format!("transport {} closed", self.id)));
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaTransport for FakeTransport {
    fn id(&self) -> &TransportId {
        &self.id
    }

    async fn produce(&self, track: TrackRef) -> Result<ProducerId> {
        self.ensure_open()?;
        if self.fail_produce.load(Ordering::SeqCst) {
            return Err(Error::Capability("codec not supported".to_string()));
        }
        self.ensure_connected().await?;
        self.listener
            .on_produce(track.kind(), RtpParameters(json!({ "mid": track.id() })))
            .await
    }

    async fn consume(&self, options: ConsumeOptions) -> Result<TrackRef> {
        self.ensure_open()?;
        if self.failing_consumers.lock().contains(&options.id) {
            return Err(Error::Transport("unsupported rtp parameters".to_string()));
        }
        self.ensure_connected().await?;
        let track = FakeTrack::new(options.id.as_str(), options.kind);
        self.consumes.lock().push(options);
        Ok(track)
    }

    fn close(&self) {
        let was_closed = self.closed.swap(true, Ordering::SeqCst);
        if let (false, Some(log)) = (was_closed, &self.close_log) {
            log.record(format!("close {} transport", self.direction));
        }
    }
}

#[derive(Default)]
pub struct FakeDevice {
    loaded: Mutex<Option<RtpCapabilities>>,
    reject_load: AtomicBool,
    transports: Mutex<Vec<Arc<FakeTransport>>>,
    consumes: Arc<Mutex<Vec<ConsumeOptions>>>,
    failing_consumers: Arc<Mutex<HashSet<ConsumerId>>>,
    fail_produce: Arc<AtomicBool>,
    close_log: Option<CloseLog>,
}

impl FakeDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn rejecting() -> Arc<Self> {
        let device = Self::default();
        device.reject_load.store(true, Ordering::SeqCst);
        Arc::new(device)
    }

    /// Every later `produce` fails inside the media layer
    pub fn fail_produce(&self) {
        self.fail_produce.store(true, Ordering::SeqCst);
    }

    pub fn fail_consume_for(&self, consumer_id: &str) {
        self.failing_consumers
            .lock()
            .insert(ConsumerId::from(consumer_id));
    }

    pub fn last_consume(&self) -> Option<ConsumeOptions> {
        self.consumes.lock().last().cloned()
    }

    pub fn created_transports(&self) -> usize {
        self.transports.lock().len()
    }

    pub fn closed_transports(&self) -> usize {
        self.transports
            .lock()
            .iter()
            .filter(|t| t.is_closed())
            .count()
    }

    fn build(
        &self,
        direction: &'static str,
        info: TransportInfo,
        listener: Arc<dyn TransportListener>,
    ) -> Result<Arc<dyn MediaTransport>> {
        self.rtp_capabilities()?;
        let transport = Arc::new(FakeTransport {
            id: info.id,
            direction,
            listener,
            connected: tokio::sync::Mutex::new(false),
            closed: AtomicBool::new(false),
            consumes: Arc::clone(&self.consumes),
            failing_consumers: Arc::clone(&self.failing_consumers),
            fail_produce: Arc::clone(&self.fail_produce),
            close_log: self.close_log.clone(),
        });
        self.transports.lock().push(Arc::clone(&transport));
        Ok(transport)
    }
}

#[async_trait]
impl Device for FakeDevice {
    async fn load(&self, router_capabilities: RtpCapabilities) -> Result<()> {
        if self.reject_load.load(Ordering::SeqCst) {
            return Err(Error::Capability(
                "no codec in common with the router".to_string(),
            ));
        }
        *self.loaded.lock() = Some(router_capabilities);
        Ok(())
    }

    fn rtp_capabilities(&self) -> Result<RtpCapabilities> {
        self.loaded
            .lock()
            .clone()
            .ok_or_else(|| Error::Capability("device not loaded".to_string()))
    }

    fn create_send_transport(
        &self,
        info: TransportInfo,
        listener: Arc<dyn TransportListener>,
    ) -> Result<Arc<dyn MediaTransport>> {
        self.build("send", info, listener)
    }

    fn create_recv_transport(
        &self,
        info: TransportInfo,
        listener: Arc<dyn TransportListener>,
    ) -> Result<Arc<dyn MediaTransport>> {
        self.build("recv", info, listener)
    }
}

/// Hands out one shared `FakeDevice` per attempt and keeps them for inspection
#[derive(Default)]
pub struct FakeDeviceFactory {
    reject_load: bool,
    close_log: Option<CloseLog>,
    devices: Mutex<Vec<Arc<FakeDevice>>>,
}

impl FakeDeviceFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn rejecting() -> Arc<Self> {
        Arc::new(Self {
            reject_load: true,
            ..Self::default()
        })
    }

    /// Transports of every created device record their close in `log`
    pub fn logging(log: CloseLog) -> Arc<Self> {
        Arc::new(Self {
            close_log: Some(log),
            ..Self::default()
        })
    }

    pub fn last(&self) -> Arc<FakeDevice> {
        self.devices
            .lock()
            .last()
            .cloned()
            .expect("no device created yet")
    }
}

impl DeviceFactory for FakeDeviceFactory {
    fn create(&self) -> Arc<dyn Device> {
        let device = Arc::new(FakeDevice {
            close_log: self.close_log.clone(),
            ..FakeDevice::default()
        });
        device.reject_load.store(self.reject_load, Ordering::SeqCst);
        self.devices.lock().push(Arc::clone(&device));
        device
    }
}

/// Capture returning one microphone and one camera track
#[derive(Default)]
pub struct FakeCapture {
    deny: bool,
    close_log: Option<CloseLog>,
    acquired: Mutex<Vec<Arc<FakeTrack>>>,
}

impl FakeCapture {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn denied() -> Arc<Self> {
        Arc::new(Self {
            deny: true,
            ..Self::default()
        })
    }

    /// Captured tracks record their stop in `log`
    pub fn logging(log: CloseLog) -> Arc<Self> {
        Arc::new(Self {
            close_log: Some(log),
            ..Self::default()
        })
    }

    pub fn acquired(&self) -> Vec<Arc<FakeTrack>> {
        self.acquired.lock().clone()
    }
}

#[async_trait]
impl MediaCapture for FakeCapture {
    async fn acquire(&self) -> Result<LocalMedia> {
        if self.deny {
            return Err(Error::Resource("camera permission denied".to_string()));
        }
        let track = |id: &str, kind| match &self.close_log {
            Some(log) => FakeTrack::logged(id, kind, log.clone()),
            None => FakeTrack::new(id, kind),
        };
        let mic = track("local-mic", MediaKind::Audio);
        let cam = track("local-cam", MediaKind::Video);
        self.acquired
            .lock()
            .extend([Arc::clone(&mic), Arc::clone(&cam)]);
        Ok(LocalMedia::new(vec![mic as TrackRef, cam as TrackRef]))
    }
}
