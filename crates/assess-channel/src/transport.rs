//! Transport seam between the channel task and the network.
//!
//! A [`Connector`] dials an endpoint and returns a [`Link`]: a bounded
//! outbound frame queue plus an inbound event stream. The channel task never
//! touches sockets directly, which lets tests drive it with in-memory links.

use assess_core::TransportError;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Frame written to the connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// A JSON text frame.
    Text(String),
    /// Close the connection with the given code and reason.
    Close {
        /// Close code.
        code: u16,
        /// Human-readable reason.
        reason: String,
    },
}

/// Event read from the connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    /// A text frame (or a UTF-8 binary frame).
    Text(String),
    /// The connection closed. Always the last event on a link.
    Closed {
        /// Close code as reported by the peer or the transport.
        code: u16,
        /// Close reason, possibly empty.
        reason: String,
    },
}

/// Channel-side end of one open connection.
#[derive(Debug)]
pub struct Link {
    /// Frames to write.
    pub outbound: mpsc::Sender<Frame>,
    /// Events read.
    pub inbound: mpsc::Receiver<LinkEvent>,
}

/// Transport-side end of a [`Link`].
#[derive(Debug)]
pub struct LinkPeer {
    /// Frames the channel asked to write.
    pub outbound: mpsc::Receiver<Frame>,
    /// Events to deliver to the channel.
    pub inbound: mpsc::Sender<LinkEvent>,
}

impl Link {
    /// Create a connected [`Link`] / [`LinkPeer`] pair with the given buffer.
    pub fn channel(buffer: usize) -> (Link, LinkPeer) {
        let (out_tx, out_rx) = mpsc::channel(buffer.max(1));
        let (in_tx, in_rx) = mpsc::channel(buffer.max(1));
        (
            Link {
                outbound: out_tx,
                inbound: in_rx,
            },
            LinkPeer {
                outbound: out_rx,
                inbound: in_tx,
            },
        )
    }

    /// Queue a frame without waiting.
    pub fn try_send(&self, frame: Frame) -> Result<(), TransportError> {
        self.outbound.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::Full,
            TrySendError::Closed(_) => TransportError::Closed,
        })
    }
}

/// Opens connections to a channel endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Dial `url` and return the open link.
    async fn connect(&self, url: &str) -> Result<Link, TransportError>;
}
