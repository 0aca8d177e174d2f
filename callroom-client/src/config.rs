use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::types::PeerDevice;

/// Client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub signaling: SignalingConfig,
    pub session: SessionConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Base URL of the SFU signaling endpoint
    pub url: String,
    /// Deadline for each signaling round trip (0 = wait forever)
    pub request_timeout_seconds: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "wss://v3demo.mediasoup.org:4443".to_string(),
            request_timeout_seconds: 10,
        }
    }
}

impl SignalingConfig {
    #[must_use]
    pub const fn request_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.request_timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Display name announced when joining a room
    pub display_name: String,
    /// Device description announced when joining a room
    pub device: PeerDevice,
    /// Maximum number of remote peers exposed for rendering
    pub max_displayed_peers: usize,
    /// Maximum number of distinct remote peers we accept tracks from (0 = unlimited)
    pub max_subscribed_peers: usize,
    /// Deadline for acquiring local capture (0 = wait forever)
    pub capture_timeout_seconds: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            display_name: "WebRTCTest".to_string(),
            device: PeerDevice::default(),
            max_displayed_peers: 4,
            max_subscribed_peers: 0,
            capture_timeout_seconds: 30,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub const fn capture_timeout(&self) -> Option<Duration> {
        non_zero_secs(self.capture_timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

const fn non_zero_secs(secs: u64) -> Option<Duration> {
    if secs == 0 {
        None
    } else {
        Some(Duration::from_secs(secs))
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // CALLROOM_SIGNALING__URL, CALLROOM_SESSION__MAX_DISPLAYED_PEERS, ...
        builder = builder.add_source(
            Environment::with_prefix("CALLROOM")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check the configuration for values the session cannot run with
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        match url::Url::parse(&self.signaling.url) {
            Ok(url) if !matches!(url.scheme(), "ws" | "wss") => {
                errors.push(format!(
                    "signaling.url must use ws or wss, got '{}'",
                    url.scheme()
                ));
            }
            Ok(_) => {}
            Err(e) => errors.push(format!("signaling.url is invalid: {e}")),
        }

        if self.session.max_displayed_peers == 0 {
            errors.push("session.max_displayed_peers must be at least 1".to_string());
        }

        if self.session.display_name.trim().is_empty() {
            errors.push("session.display_name must not be empty".to_string());
        }

        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be 'json' or 'pretty', got '{}'",
                self.logging.format
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
