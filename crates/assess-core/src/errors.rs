//! Error types shared across the assessment client.
//!
//! - [`IdError`]: an identifier failed validation
//! - [`ProtocolError`]: an inbound channel payload could not be interpreted
//! - [`TransportError`]: the underlying connection could not be used

use thiserror::Error;

/// Identifier validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    /// The identifier was empty.
    #[error("identifier must not be empty")]
    Empty,
    /// The identifier contained a character that would change the endpoint path.
    #[error("identifier {id:?} contains invalid character {ch:?}")]
    InvalidChar {
        /// The rejected identifier.
        id: String,
        /// The offending character.
        ch: char,
    },
}

/// An inbound payload that could not be turned into a channel message.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The payload was not valid JSON.
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// The payload was valid JSON but not an object.
    #[error("payload is not a JSON object")]
    NotAnObject,
    /// The `message_type` discriminant was absent or not a string.
    #[error("payload has no string `message_type` field")]
    MissingDiscriminant,
    /// A field required by the given message type was absent or mistyped.
    #[error("`{message_type}` message is missing field `{field}`")]
    MissingField {
        /// The discriminant of the offending message.
        message_type: &'static str,
        /// The missing field.
        field: &'static str,
    },
}

/// Failure of the underlying bidirectional connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The connection could not be opened.
    #[error("failed to connect to {url}: {message}")]
    Connect {
        /// Endpoint that was dialed.
        url: String,
        /// Underlying failure description.
        message: String,
    },
    /// The outbound buffer is full; the frame was not queued.
    #[error("outbound buffer full")]
    Full,
    /// The connection is no longer accepting frames.
    #[error("connection closed")]
    Closed,
    /// The outbound message could not be serialized.
    #[error("failed to encode outbound frame: {message}")]
    Encode {
        /// Serializer failure description.
        message: String,
    },
}
