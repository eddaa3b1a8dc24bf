//! Channel configuration.

use std::time::Duration;

use assess_core::{ReconnectPolicy, SessionId};
use assess_settings::ChannelSettings;

/// Runtime configuration for one session channel.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelConfig {
    /// Base URL, without the `/ws/session/<id>` suffix.
    pub ws_base_url: String,
    /// Reconnect backoff.
    pub reconnect: ReconnectPolicy,
    /// Coalescing window for code updates.
    pub debounce_window: Duration,
    /// Outbound frames buffered per connection.
    pub outbound_buffer: usize,
    /// Capacity of the session event broadcast.
    pub event_capacity: usize,
    /// Capacity of the command queue from the handle to the channel task.
    pub command_buffer: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::from(&ChannelSettings::default())
    }
}

impl From<&ChannelSettings> for ChannelConfig {
    fn from(settings: &ChannelSettings) -> Self {
        Self {
            ws_base_url: settings.ws_base_url.clone(),
            reconnect: settings.reconnect,
            debounce_window: Duration::from_millis(settings.debounce_ms),
            outbound_buffer: settings.outbound_buffer.max(1),
            event_capacity: settings.event_capacity.max(1),
            command_buffer: 256,
        }
    }
}

impl ChannelConfig {
    /// Endpoint URL for a session: `<base>/ws/session/<id>`.
    pub fn endpoint(&self, session_id: &SessionId) -> String {
        format!(
            "{}/ws/session/{}",
            self.ws_base_url.trim_end_matches('/'),
            session_id
        )
    }
}
