//! Common types used throughout the session client

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of the random suffix in generated participant ids
const PARTICIPANT_SUFFIX_LEN: usize = 6;

const PARTICIPANT_ALPHABET: [char; 36] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h',
    'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z',
];

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Identifier of a participant in a room (local or remote)
    PeerId
);

string_id!(
    /// Identifier of a room hosted by the SFU
    RoomId
);

string_id!(
    /// Server-issued transport identifier
    TransportId
);

string_id!(
    /// Server-issued producer identifier (one per published track)
    ProducerId
);

string_id!(
    /// Server-issued consumer identifier (one per subscribed track)
    ConsumerId
);

impl PeerId {
    /// Generate a participant id of the form `peer_xxxxxx`
    #[must_use]
    pub fn generate() -> Self {
        Self(format!(
            "peer_{}",
            nanoid::nanoid!(PARTICIPANT_SUFFIX_LEN, &PARTICIPANT_ALPHABET)
        ))
    }
}

impl RoomId {
    /// Parse a user-supplied room id, rejecting blank input
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(Error::Config("room id must not be empty".to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

/// Media track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which of a peer's streams a track belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamTag {
    /// Camera and microphone
    MicWebcam,
    /// Screen share
    Share,
}

impl StreamTag {
    #[must_use]
    pub const fn from_share_flag(share: bool) -> Self {
        if share {
            Self::Share
        } else {
            Self::MicWebcam
        }
    }

    /// Stream id handed to the media layer, e.g. `peer_abc-mic-webcam`
    #[must_use]
    pub fn stream_id(&self, peer_id: &PeerId) -> String {
        match self {
            Self::MicWebcam => format!("{peer_id}-mic-webcam"),
            Self::Share => format!("{peer_id}-share"),
        }
    }
}

/// Device description a participant advertises when joining
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDevice {
    pub flag: String,
    pub name: String,
    pub version: String,
}

impl Default for PeerDevice {
    fn default() -> Self {
        Self {
            flag: "rust".to_string(),
            name: "callroom".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Metadata of a remote participant, as announced by the SFU
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub id: PeerId,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub device: Option<PeerDevice>,
}

impl PeerInfo {
    pub fn new(id: impl Into<PeerId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            device: None,
        }
    }
}
