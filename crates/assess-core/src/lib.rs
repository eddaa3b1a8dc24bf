//! # assess-core
//!
//! Foundation types shared by the assessment client crates:
//!
//! - **Branded IDs**: [`SessionId`] and [`InteractionId`] newtypes
//! - **Protocol**: inbound/outbound message shapes of the session channel
//! - **Errors**: [`ProtocolError`] and [`TransportError`] via `thiserror`
//! - **Retry**: [`ReconnectPolicy`] with exponential backoff math
//! - **Logging**: `tracing` subscriber setup and test capture helpers

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod logging;
pub mod protocol;
pub mod retry;

pub use errors::{IdError, ProtocolError, TransportError};
pub use ids::{InteractionId, SessionId};
pub use retry::ReconnectPolicy;
