//! # assess-channel
//!
//! The session channel manager: owns one logical WebSocket connection to
//! `<ws-base>/ws/session/<id>`, dispatches inbound questions, evaluations
//! and errors, coalesces outbound code updates, and reconnects with bounded
//! exponential backoff after abnormal closures.
//!
//! - [`machine`]: sans-io state machine; every transition is a pure function
//!   of a [`ChannelEvent`] producing [`Effect`]s
//! - [`debounce`]: latest-value-wins coalescing slot
//! - [`transport`]: the [`Connector`] seam and its frame types
//! - [`ws`]: `tokio-tungstenite` implementation of [`Connector`]
//! - [`driver`]: tokio task running the machine, plus the [`SessionHandle`]

#![deny(unsafe_code)]

pub mod config;
pub mod debounce;
pub mod driver;
pub mod errors;
pub mod machine;
pub mod status;
pub mod transport;
pub mod ws;

pub use config::ChannelConfig;
pub use driver::{SessionChannel, SessionHandle};
pub use errors::ChannelError;
pub use machine::{ChannelEvent, ChannelMachine, ConnectionId, Effect};
pub use status::{ConnectionStatus, SessionEvent, SessionView};
pub use transport::{Connector, Frame, Link, LinkEvent, LinkPeer};
pub use ws::WsConnector;
