//! Remote peer / track reconciliation
//!
//! The room view is a pure function of the events applied to it:
//! [`reduce`] takes the previous [`RoomState`] and one [`RoomEvent`] and
//! returns the next state. Peer metadata and media are kept on separate
//! axes; a metadata event never touches media and vice versa, except
//! `PeerClosed` which drops both.
//!
//! Every peer that has at least one subscription keeps an entry in insertion
//! order. Only the most recently inserted `max_displayed` entries are exposed
//! for rendering, so the oldest entry is the first one hidden when the room
//! grows and the first one shown again when a newer peer leaves.

use indexmap::IndexMap;

use crate::device::TrackRef;
use crate::types::{ConsumerId, MediaKind, PeerId, PeerInfo, StreamTag};

/// Default number of remote peers exposed for rendering
pub const DEFAULT_MAX_DISPLAYED_PEERS: usize = 4;

/// One inbound track bound on the receive transport
#[derive(Debug, Clone)]
pub struct RemoteTrack {
    pub consumer_id: ConsumerId,
    pub kind: MediaKind,
    pub tag: StreamTag,
    pub track: TrackRef,
}

/// All of one peer's active inbound tracks
#[derive(Debug, Clone, Default)]
pub struct AggregatedStream {
    tracks: Vec<RemoteTrack>,
}

impl AggregatedStream {
    #[must_use]
    pub fn tracks(&self) -> &[RemoteTrack] {
        &self.tracks
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    #[must_use]
    pub fn has_kind(&self, kind: MediaKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }

    fn contains(&self, consumer_id: &ConsumerId) -> bool {
        self.tracks.iter().any(|t| &t.consumer_id == consumer_id)
    }
}

#[derive(Debug, Clone)]
pub struct RemotePeerStream {
    pub peer_id: PeerId,
    pub stream: AggregatedStream,
}

/// Events that change the room view
#[derive(Debug, Clone)]
pub enum RoomEvent {
    /// A pushed track was bound for `peer_id`
    SubscriptionAdded { peer_id: PeerId, track: RemoteTrack },
    /// The peer left; drop its media and metadata
    PeerClosed(PeerId),
    /// A peer joined after us
    PeerJoined(PeerInfo),
    /// Roster returned by `join`
    RosterSnapshot(Vec<PeerInfo>),
    /// Forget everything (teardown)
    Reset,
}

#[derive(Debug, Clone)]
pub struct RoomState {
    peers: IndexMap<PeerId, PeerInfo>,
    streams: Vec<RemotePeerStream>,
    max_displayed: usize,
}

impl Default for RoomState {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DISPLAYED_PEERS)
    }
}

impl RoomState {
    #[must_use]
    pub fn new(max_displayed: usize) -> Self {
        Self {
            peers: IndexMap::new(),
            streams: Vec::new(),
            max_displayed,
        }
    }

    #[must_use]
    pub const fn max_displayed(&self) -> usize {
        self.max_displayed
    }

    /// Peer streams exposed for rendering, oldest first, at most `max_displayed`
    #[must_use]
    pub fn displayed(&self) -> &[RemotePeerStream] {
        let skip = self.streams.len().saturating_sub(self.max_displayed);
        self.streams.get(skip..).unwrap_or_default()
    }

    #[must_use]
    pub fn displayed_peer_ids(&self) -> Vec<PeerId> {
        self.displayed().iter().map(|p| p.peer_id.clone()).collect()
    }

    /// First displayed stream, the one shown in the main tile
    #[must_use]
    pub fn primary(&self) -> Option<&RemotePeerStream> {
        self.displayed().first()
    }

    /// Full peer metadata map, including peers without media
    #[must_use]
    pub const fn peers(&self) -> &IndexMap<PeerId, PeerInfo> {
        &self.peers
    }

    /// Aggregated stream of a peer, displayed or not
    #[must_use]
    pub fn stream(&self, peer_id: &PeerId) -> Option<&AggregatedStream> {
        self.streams
            .iter()
            .find(|p| &p.peer_id == peer_id)
            .map(|p| &p.stream)
    }

    /// Number of peers we currently hold media for
    #[must_use]
    pub fn subscribed_peer_count(&self) -> usize {
        self.streams.len()
    }

    #[must_use]
    pub fn has_media_for(&self, peer_id: &PeerId) -> bool {
        self.stream(peer_id).is_some()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty() && self.streams.is_empty()
    }
}

/// Apply one event to the room view
#[must_use]
pub fn reduce(mut state: RoomState, event: RoomEvent) -> RoomState {
    match event {
        RoomEvent::SubscriptionAdded { peer_id, track } => {
            match state.streams.iter_mut().find(|p| p.peer_id == peer_id) {
                Some(entry) => {
                    if !entry.stream.contains(&track.consumer_id) {
                        entry.stream.tracks.push(track);
                    }
                }
                None => state.streams.push(RemotePeerStream {
                    peer_id,
                    stream: AggregatedStream {
                        tracks: vec![track],
                    },
                }),
            }
        }
        RoomEvent::PeerClosed(peer_id) => {
            state.streams.retain(|p| p.peer_id != peer_id);
            state.peers.shift_remove(&peer_id);
        }
        RoomEvent::PeerJoined(info) => {
            state.peers.insert(info.id.clone(), info);
        }
        RoomEvent::RosterSnapshot(peers) => {
            for info in peers {
                state.peers.insert(info.id.clone(), info);
            }
        }
        RoomEvent::Reset => {
            state = RoomState::new(state.max_displayed);
        }
    }
    state
}
