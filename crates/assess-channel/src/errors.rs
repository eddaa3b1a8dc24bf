//! Channel error type.

use assess_core::{IdError, TransportError};
use thiserror::Error;

/// Errors returned by the session channel API.
///
/// None of these are fatal to the host process; the same condition is also
/// surfaced to the UI through the session view's error text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// The session id cannot be used in an endpoint path.
    #[error("invalid session id: {0}")]
    InvalidSessionId(#[from] IdError),
    /// The user ended the session; no further connections are made.
    #[error("session is ending; the channel will not reconnect")]
    Ending,
    /// The connection is not open. The caller may retry once reconnected.
    #[error("connection is not active")]
    NotConnected,
    /// The command queue to the channel task is full.
    #[error("session channel is busy")]
    Busy,
    /// The channel task has shut down.
    #[error("session channel has shut down")]
    ChannelClosed,
    /// Dialing the endpoint failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}
