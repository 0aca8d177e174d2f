//! `CallRoom` client
//!
//! Client side of a multi-party call on a mediasoup-style SFU. A participant
//! joins a room over a request/response signaling channel, negotiates media
//! capabilities, publishes its camera and microphone and subscribes to the
//! tracks the server pushes for every other participant.
//!
//! ## Architecture
//!
//! - **`CallSession`**: session lifecycle, handshake ordering and teardown
//! - **`SignalingClient`**: typed requests over a [`signaling::SignalingChannel`]
//! - **`TransportManager`**: send/receive transports, publications and subscriptions
//! - **`RoomState`**: pure reconciliation of remote peers and their tracks
//! - **`SessionPhase`**: explicit lifecycle state machine
//!
//! The media stack (capability negotiator, transports, capture) and the
//! socket are external; they plug in through the traits in [`device`] and
//! [`signaling`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! use callroom_client::{CallSession, Collaborators, Config, RoomId};
//!
//! let config = Config::load(None)?;
//! let session = CallSession::new(config, Collaborators { connector, devices, capture });
//! session.start(RoomId::parse("room42")?).await?;
//!
//! let mut updates = session.watch();
//! while updates.changed().await.is_ok() {
//!     render(updates.borrow().displayed_peers());
//! }
//! session.end();
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod reconcile;
pub mod session;
pub mod signaling;
pub mod state;
pub mod transport;
pub mod types;

#[cfg(test)]
pub mod test_helpers;

pub use config::Config;
pub use error::{Error, Result};
pub use logging::init_logging;
pub use reconcile::{reduce, AggregatedStream, RemotePeerStream, RoomEvent, RoomState};
pub use session::{CallSession, Collaborators, SessionSnapshot};
pub use signaling::{SignalingClient, SignalingEvent};
pub use state::{ConnectionStatus, SessionPhase};
pub use transport::TransportManager;
pub use types::{MediaKind, PeerId, PeerInfo, RoomId, StreamTag};
