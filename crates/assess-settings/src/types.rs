//! Settings types.
//!
//! All structs use `#[serde(default)]` so a partial user file only needs to
//! name the keys it overrides.

use assess_core::ReconnectPolicy;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AssessSettings {
    /// Session channel settings.
    pub channel: ChannelSettings,
    /// Logging settings.
    pub logging: LoggingSettings,
}

impl AssessSettings {
    /// Check values that serde cannot constrain.
    pub fn validate(&self) -> Result<()> {
        let url = &self.channel.ws_base_url;
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(SettingsError::InvalidValue(format!(
                "wsBaseUrl must start with ws:// or wss://, got {url:?}"
            )));
        }
        if self.channel.outbound_buffer == 0 {
            return Err(SettingsError::InvalidValue(
                "outboundBuffer must be at least 1".into(),
            ));
        }
        if self.channel.event_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "eventCapacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Session channel settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelSettings {
    /// Base URL of the channel endpoint, without the `/ws/session/<id>` suffix.
    pub ws_base_url: String,
    /// Reconnect backoff.
    pub reconnect: ReconnectPolicy,
    /// Coalescing window for code updates, in ms.
    pub debounce_ms: u64,
    /// Outbound frames buffered per connection before sends are dropped.
    pub outbound_buffer: usize,
    /// Capacity of the session event broadcast.
    pub event_capacity: usize,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            ws_base_url: "ws://localhost:8000".to_string(),
            reconnect: ReconnectPolicy::default(),
            debounce_ms: 1000,
            outbound_buffer: 64,
            event_capacity: 256,
        }
    }
}

/// Logging settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level (an `EnvFilter` directive such as `"info"`).
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}
