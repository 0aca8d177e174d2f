//! Session phase machine
//!
//! The handshake is a strict sequence; every phase change goes through
//! [`SessionPhase::transition`], which refuses out-of-order moves.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "phase", content = "reason", rename_all = "snake_case")]
pub enum SessionPhase {
    #[default]
    Disconnected,
    /// Opening the signaling channel
    Connecting,
    /// Fetching router capabilities and loading the negotiator
    Negotiating,
    /// Receive transport exists, `join` in flight
    JoiningRoom,
    /// Capturing, creating the send transport and producing
    Publishing,
    Active,
    Closed,
    Error(String),
}

/// Coarse status exposed to the presentation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Active,
    Closed,
    Error,
}

impl SessionPhase {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Negotiating => "negotiating",
            Self::JoiningRoom => "joining_room",
            Self::Publishing => "publishing",
            Self::Active => "active",
            Self::Closed => "closed",
            Self::Error(_) => "error",
        }
    }

    #[must_use]
    pub const fn status(&self) -> ConnectionStatus {
        match self {
            Self::Disconnected => ConnectionStatus::Disconnected,
            Self::Connecting | Self::Negotiating | Self::JoiningRoom | Self::Publishing => {
                ConnectionStatus::Connecting
            }
            Self::Active => ConnectionStatus::Active,
            Self::Closed => ConnectionStatus::Closed,
            Self::Error(_) => ConnectionStatus::Error,
        }
    }

    /// Between opening the channel and becoming active
    #[must_use]
    pub const fn is_handshaking(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Negotiating | Self::JoiningRoom | Self::Publishing
        )
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    #[must_use]
    pub fn can_transition_to(&self, next: &Self) -> bool {
        match (self, next) {
            (Self::Disconnected | Self::Closed | Self::Error(_), Self::Connecting)
            | (Self::Connecting, Self::Negotiating)
            | (Self::Negotiating, Self::JoiningRoom)
            | (Self::JoiningRoom, Self::Publishing)
            | (Self::Publishing, Self::Active)
            | (Self::Active, Self::Disconnected) => true,
            (from, Self::Error(_)) => from.is_handshaking() || from.is_active(),
            (from, Self::Closed) => !matches!(from, Self::Closed),
            _ => false,
        }
    }

    /// Move to `next`, failing if `next` may not follow the current phase
    pub fn transition(&self, next: Self) -> Result<Self> {
        if self.can_transition_to(&next) {
            Ok(next)
        } else {
            Err(Error::InvalidTransition {
                from: self.name().to_string(),
                to: next.name().to_string(),
            })
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(reason) => write!(f, "error({reason})"),
            other => f.write_str(other.name()),
        }
    }
}
