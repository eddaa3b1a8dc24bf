//! Connection status, session view snapshot, and UI-facing events.

use std::fmt;

use assess_core::protocol::{EvaluationResult, Interaction};

/// Error text when a debounced code update finds the connection closed.
pub const CODE_NOT_SAVED: &str = "Connection is not active. Code changes are not being saved.";
/// Error text when a response is submitted while the connection is closed.
pub const CANNOT_SUBMIT: &str = "Cannot submit response: Connection is not active.";
/// Error text for an inbound payload that could not be interpreted.
pub const PROCESS_FAILED: &str = "Failed to process message from server.";
/// Error text once reconnect attempts are exhausted.
pub const RECONNECT_EXHAUSTED: &str =
    "Connection failed after multiple attempts. Please refresh the page or check your connection.";

/// Lifecycle state of the session channel. Exactly one holds at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Created, no connection attempted yet.
    Initializing,
    /// A connection attempt is in flight.
    Connecting,
    /// The connection is open.
    Connected,
    /// The server reported an error; the connection is still open.
    Errored,
    /// The connection dropped and a retry is scheduled.
    Reconnecting {
        /// 1-based attempt that is scheduled.
        attempt: u32,
        /// Attempts allowed before giving up.
        max_attempts: u32,
    },
    /// Closed cleanly or on request.
    Closed {
        /// Close code.
        code: u16,
    },
    /// Reconnect attempts exhausted. Terminal until a manual reconnect.
    Failed,
}

impl ConnectionStatus {
    /// Whether the UI should accept edits and submissions.
    pub fn is_interactive(self) -> bool {
        self == Self::Connected
    }

    /// Whether the channel will not act again without a new connect.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed { .. } | Self::Failed)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => f.write_str("Initializing..."),
            Self::Connecting => f.write_str("Connecting..."),
            Self::Connected => f.write_str("Connected"),
            Self::Errored => f.write_str("Error"),
            Self::Reconnecting { .. } => f.write_str("Disconnected. Reconnecting..."),
            Self::Closed { code } => write!(f, "Closed ({code})"),
            Self::Failed => f.write_str("Failed to connect"),
        }
    }
}

/// Snapshot of everything the UI renders for a session.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionView {
    /// Current connection status.
    pub status: ConnectionStatus,
    /// Question awaiting a response.
    pub interaction: Option<Interaction>,
    /// Most recent evaluation.
    pub evaluation: Option<EvaluationResult>,
    /// User-visible error or warning text.
    pub error: Option<String>,
    /// Consecutive abnormal closures since the last successful open.
    pub reconnect_attempts: u32,
}

impl Default for SessionView {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Initializing,
            interaction: None,
            evaluation: None,
            error: None,
            reconnect_attempts: 0,
        }
    }
}

/// Change notification delivered to subscribers.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    /// Status transitioned.
    StatusChanged(ConnectionStatus),
    /// A new question arrived.
    Question(Interaction),
    /// The current question was answered and cleared.
    InteractionCleared,
    /// A new evaluation arrived.
    Evaluation(EvaluationResult),
    /// The previous evaluation was cleared by a new question.
    EvaluationCleared,
    /// User-visible error or warning text was set.
    Error(String),
    /// The error text was cleared.
    ErrorCleared,
}
